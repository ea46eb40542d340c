//! Domain and integration event markers.
//!
//! `DomainEvent` is the lightweight trait every concrete in-process event
//! struct implements. `IntegrationEvent` marks facts intended for external
//! consumers, and [`IntegrationEventConvert`] is the declared conversion rule
//! between the two that `#[derive(EventConverter)]` binds to a handler.

use std::{
    any::{Any, TypeId},
    fmt,
    sync::Arc,
};

use serde::Serialize;

/// Marker trait for in-process facts raised by an entity during a mutation.
///
/// Each event carries a unique [`Self::KIND`] identifier used for logging and
/// error reporting. Events are immutable once raised; they are buffered on
/// the raising entity and detached when queued for dispatch.
pub trait DomainEvent: Send + Sync + 'static {
    const KIND: &'static str;
}

/// Extension trait for getting the event kind from an event instance.
///
/// This trait has a blanket implementation for all types that implement
/// [`DomainEvent`], so `kind()` always returns the same value as the `KIND`
/// constant. You never need to implement it yourself.
pub trait EventKind {
    fn kind(&self) -> &'static str;
}

impl<T: DomainEvent> EventKind for T {
    fn kind(&self) -> &'static str {
        T::KIND
    }
}

/// Marker trait for facts intended for external consumers.
///
/// Integration events are produced from exactly one domain event type by an
/// [`IntegrationEventConvert`] rule and handed to an
/// [`IntegrationEventPublisher`](crate::outbox::IntegrationEventPublisher).
/// They must serialize, since the publisher records them as an envelope.
pub trait IntegrationEvent: Serialize + Send + Sync + 'static {
    const KIND: &'static str;
}

/// Conversion rule from one domain event type to an integration event.
///
/// The declared source event type `E` is the binding `#[derive(EventConverter)]`
/// uses to synthesize a handler registration: the generated handler receives
/// `E`, invokes [`convert`](Self::convert), and publishes the result.
pub trait IntegrationEventConvert<E: DomainEvent>: Send + Sync {
    type Output: IntegrationEvent;

    fn convert(&self, event: &E) -> Self::Output;
}

/// A domain event detached from its raising entity, ready for dispatch.
///
/// The payload is type-erased so events of different types can travel through
/// one queue; the dispatcher routes each back to its typed handlers by
/// [`TypeId`].
#[derive(Clone)]
pub struct RaisedEvent {
    kind: &'static str,
    type_id: TypeId,
    payload: Arc<dyn Any + Send + Sync>,
}

impl RaisedEvent {
    #[must_use]
    pub fn new<E: DomainEvent>(event: E) -> Self {
        Self {
            kind: E::KIND,
            type_id: TypeId::of::<E>(),
            payload: Arc::new(event),
        }
    }

    #[must_use]
    pub fn kind(&self) -> &'static str {
        self.kind
    }

    #[must_use]
    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    /// Recover the typed event, if `E` matches the raised type.
    #[must_use]
    pub fn downcast_ref<E: DomainEvent>(&self) -> Option<&E> {
        self.payload.downcast_ref::<E>()
    }
}

impl fmt::Debug for RaisedEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RaisedEvent")
            .field("kind", &self.kind)
            .finish()
    }
}
