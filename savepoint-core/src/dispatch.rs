//! In-process domain event dispatch.
//!
//! Handlers are registered per concrete event type in a [`HandlerRegistry`]
//! and resolved at dispatch time by the event's runtime type. Registration
//! order is preserved: handlers for one event type run sequentially in the
//! order they were registered.

use std::{any::TypeId, collections::HashMap, marker::PhantomData, sync::Arc};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::{
    event::{DomainEvent, RaisedEvent},
    uow::SaveContext,
};

/// Boxed error type carried out of handlers unchanged.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// A handler for one domain event type.
///
/// Handlers run after the flush that queued the event and before the
/// enclosing transaction commits, so any work they do through the
/// [`SaveContext`] joins the same atomic unit. A handler may register further
/// changes and call [`SaveContext::save_entities`]; the nested save reuses
/// the ambient transaction.
///
/// The first handler failure aborts dispatch for the whole save and rolls the
/// transaction back; the error reaches the caller unchanged.
#[async_trait]
pub trait DomainEventHandler<E: DomainEvent>: Send + Sync {
    async fn handle(
        &self,
        event: &E,
        context: &mut SaveContext<'_>,
        cancellation: &CancellationToken,
    ) -> Result<(), BoxError>;
}

/// Object-safe wrapper that downcasts the erased event back to its type.
#[async_trait]
trait ErasedHandler: Send + Sync {
    async fn call(
        &self,
        event: &RaisedEvent,
        context: &mut SaveContext<'_>,
        cancellation: &CancellationToken,
    ) -> Result<(), BoxError>;
}

struct Typed<E, H> {
    handler: H,
    _event: PhantomData<fn() -> E>,
}

#[async_trait]
impl<E, H> ErasedHandler for Typed<E, H>
where
    E: DomainEvent,
    H: DomainEventHandler<E>,
{
    async fn call(
        &self,
        event: &RaisedEvent,
        context: &mut SaveContext<'_>,
        cancellation: &CancellationToken,
    ) -> Result<(), BoxError> {
        let event = event
            .downcast_ref::<E>()
            .unwrap_or_else(|| unreachable!("registry routed `{}` to a mismatched handler", event.kind()));
        self.handler.handle(event, context, cancellation).await
    }
}

/// Registry of domain-event handlers keyed by event type.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<TypeId, Vec<Arc<dyn ErasedHandler>>>,
}

impl HandlerRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for event type `E`.
    ///
    /// Handlers for the same event type are invoked in registration order.
    pub fn register<E, H>(&mut self, handler: H)
    where
        E: DomainEvent,
        H: DomainEventHandler<E> + 'static,
    {
        self.handlers
            .entry(TypeId::of::<E>())
            .or_default()
            .push(Arc::new(Typed {
                handler,
                _event: PhantomData,
            }));
    }

    #[must_use]
    pub fn has_handlers<E: DomainEvent>(&self) -> bool {
        self.handlers.contains_key(&TypeId::of::<E>())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.values().map(Vec::len).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Deliver one event to every handler registered for its exact type.
    ///
    /// Events with no registered handler are skipped silently.
    pub(crate) async fn dispatch(
        &self,
        event: &RaisedEvent,
        context: &mut SaveContext<'_>,
        cancellation: &CancellationToken,
    ) -> Result<(), BoxError> {
        let Some(handlers) = self.handlers.get(&event.type_id()) else {
            tracing::trace!(event_kind = %event.kind(), "no handlers registered for event");
            return Ok(());
        };
        tracing::trace!(
            event_kind = %event.kind(),
            handler_count = handlers.len(),
            "dispatching domain event"
        );
        for handler in handlers {
            handler.call(event, context, cancellation).await?;
        }
        Ok(())
    }
}
