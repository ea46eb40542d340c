//! Integration event publication.
//!
//! A domain-event handler that needs external visibility converts its event
//! into an integration event and hands it to an
//! [`IntegrationEventPublisher`]. Two implementation families satisfy the
//! contract:
//!
//! - **Transactional** ([`TransactionalOutbox`]): the publish call records
//!   the event in a durable outbox using the *same* physical transaction as
//!   the entity flush, so the event exists if and only if the entity change
//!   commits. A separately scheduled relay delivers outbox rows to the
//!   broker; this crate only guarantees the durable record.
//! - **Direct**: publishes straight to the broker with no transactional
//!   coupling, acceptable for at-least-once/best-effort semantics. The
//!   recording publisher in the `test` module behaves this way.
//!
//! The unit of work does not choose between them; it only consults the
//! optional [`PublisherTransactionHandler`] to decide who opens the physical
//! transaction.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::{
    dispatch::BoxError,
    event::IntegrationEvent,
    storage::{inmemory, Storage, TransactionHandle},
};

/// Serialized integration event, ready to be recorded or transported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboxMessage {
    /// Integration event kind ([`IntegrationEvent::KIND`]).
    pub kind: String,
    /// Serialized event payload (JSON).
    pub payload: Vec<u8>,
}

impl OutboxMessage {
    #[must_use]
    pub fn new(kind: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            kind: kind.into(),
            payload,
        }
    }

    /// Serialize a typed integration event into its envelope.
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the event cannot be encoded.
    pub fn encode<I: IntegrationEvent>(event: &I) -> Result<Self, serde_json::Error> {
        Ok(Self {
            kind: I::KIND.to_string(),
            payload: serde_json::to_vec(event)?,
        })
    }

    /// Deserialize the payload back into a typed event.
    ///
    /// # Errors
    ///
    /// Returns a deserialization error if the payload does not match `I`.
    pub fn decode<I: DeserializeOwned>(&self) -> Result<I, serde_json::Error> {
        serde_json::from_slice(&self.payload)
    }
}

/// Error from publishing an integration event.
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("failed to encode integration event `{kind}`: {source}")]
    Encode {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },
    /// The outbox store or broker rejected the message.
    #[error("failed to record integration event: {0}")]
    Transport(#[source] BoxError),
    #[error("publish cancelled")]
    Cancelled,
}

/// Destination for integration events.
///
/// The contract is intentionally small: hand over one serialized event,
/// honouring the cancellation token. Durability and delivery semantics are
/// the implementation's concern (see the module docs).
#[async_trait]
pub trait IntegrationEventPublisher: Send + Sync {
    async fn publish(
        &self,
        message: OutboxMessage,
        cancellation: &CancellationToken,
    ) -> Result<(), PublishError>;
}

/// Typed convenience over [`IntegrationEventPublisher`].
#[async_trait]
pub trait IntegrationEventPublisherExt: IntegrationEventPublisher {
    /// Encode and publish a typed integration event.
    ///
    /// # Errors
    ///
    /// Returns [`PublishError::Encode`] if serialization fails, otherwise
    /// whatever the underlying publish returns.
    async fn publish_event<I: IntegrationEvent>(
        &self,
        event: &I,
        cancellation: &CancellationToken,
    ) -> Result<(), PublishError> {
        let message = OutboxMessage::encode(event).map_err(|source| PublishError::Encode {
            kind: I::KIND,
            source,
        })?;
        tracing::trace!(event_kind = I::KIND, "publishing integration event");
        self.publish(message, cancellation).await
    }
}

impl<P: IntegrationEventPublisher + ?Sized> IntegrationEventPublisherExt for P {}

/// Collaborator that co-owns the physical transaction.
///
/// When configured on the unit of work, transaction creation is delegated
/// here so the outbox write and the entity write share one physical
/// transaction. Absence means the unit of work opens a native storage
/// transaction instead.
#[async_trait]
pub trait PublisherTransactionHandler: Send + Sync {
    /// Open the shared transaction and enlist the publisher in it.
    async fn begin_transaction(&self) -> Result<TransactionHandle, BoxError>;
}

/// Transactional outbox backed by the in-memory store.
///
/// One instance serves one logical operation at a time: the transaction
/// opened through [`PublisherTransactionHandler::begin_transaction`] is
/// remembered and every subsequent publish stages its message under that
/// transaction. Messages published while no transaction is enlisted are
/// recorded immediately (direct semantics).
#[derive(Clone)]
pub struct TransactionalOutbox {
    store: inmemory::Store,
    current: Arc<Mutex<Option<TransactionHandle>>>,
}

impl TransactionalOutbox {
    #[must_use]
    pub fn new(store: inmemory::Store) -> Self {
        Self {
            store,
            current: Arc::new(Mutex::new(None)),
        }
    }

    /// The transaction this outbox is currently enlisted in, if any.
    #[must_use]
    pub fn current_transaction(&self) -> Option<TransactionHandle> {
        *self.current.lock().expect("outbox lock poisoned")
    }
}

#[async_trait]
impl PublisherTransactionHandler for TransactionalOutbox {
    async fn begin_transaction(&self) -> Result<TransactionHandle, BoxError> {
        let handle = self.store.begin().await.map_err(|e| Box::new(e) as BoxError)?;
        *self.current.lock().expect("outbox lock poisoned") = Some(handle);
        tracing::trace!(transaction_id = %handle.id(), "outbox enlisted in transaction");
        Ok(handle)
    }
}

#[async_trait]
impl IntegrationEventPublisher for TransactionalOutbox {
    async fn publish(
        &self,
        message: OutboxMessage,
        cancellation: &CancellationToken,
    ) -> Result<(), PublishError> {
        if cancellation.is_cancelled() {
            return Err(PublishError::Cancelled);
        }
        let current = self.current_transaction();
        match current {
            Some(transaction) => self
                .store
                .stage_outbox(transaction, message)
                .map_err(|e| PublishError::Transport(Box::new(e))),
            None => {
                tracing::trace!(
                    message_kind = %message.kind,
                    "no enlisted transaction, recording outbox message directly"
                );
                self.store.append_outbox(message);
                Ok(())
            }
        }
    }
}
