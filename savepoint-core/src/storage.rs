//! Persistence layer abstraction.
//!
//! The unit of work depends only on this contract: open/commit/roll back a
//! native transaction and flush a batch of staged entity rows. The reference
//! [`inmemory`] implementation backs the test suites; production backends
//! adapt their engine behind the same seam.

use std::{fmt, future::Future};

use thiserror::Error;
use uuid::Uuid;

use crate::{concurrency::ConcurrencyConflict, entity::EntityState};

pub mod inmemory;

/// Unique identifier of one storage transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransactionId(Uuid);

impl TransactionId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TransactionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Handle naming one active unit-of-work transaction.
///
/// Exactly one live handle exists per logical operation; it is owned by the
/// coordinator that opened it and destroyed on commit or rollback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionHandle {
    id: TransactionId,
}

impl TransactionHandle {
    #[must_use]
    pub const fn new(id: TransactionId) -> Self {
        Self { id }
    }

    #[must_use]
    pub const fn id(&self) -> TransactionId {
        self.id
    }
}

/// One staged entity write, with the typed fields already converted to their
/// primitive column representation.
#[derive(Debug, Clone)]
pub struct EntityRow {
    /// Entity type identifier ([`Entity::KIND`](crate::entity::Entity::KIND)).
    pub kind: &'static str,
    /// Entity identifier, rendered for the row key.
    pub id: String,
    pub state: EntityState,
    /// Serialized entity payload.
    pub data: serde_json::Value,
    /// Concurrency token the row is expected to hold in storage.
    ///
    /// `None` for added rows, or when the entity carries no version field
    /// (last-writer-wins).
    pub expected_version: Option<u64>,
    /// Concurrency token the row will hold after this write.
    pub version: Option<u64>,
}

/// Error from flushing staged rows.
#[derive(Debug, Error)]
pub enum FlushError<StoreError>
where
    StoreError: std::error::Error,
{
    /// A row reached storage with a stale concurrency token.
    #[error(transparent)]
    Conflict(#[from] ConcurrencyConflict),
    /// Underlying store error.
    #[error("store error: {0}")]
    Store(#[source] StoreError),
}

/// Abstraction over the persistence engine.
///
/// All operations are cooperative suspension points; none of them mutates a
/// transaction's state from more than one logical operation at a time.
pub trait Storage: Send + Sync {
    /// Store-specific error type.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Open a native storage transaction.
    ///
    /// # Errors
    ///
    /// Returns a store-specific error when the underlying store cannot open a
    /// transaction (e.g. connection failure).
    fn begin(&self) -> impl Future<Output = Result<TransactionHandle, Self::Error>> + Send;

    /// Commit the transaction, making its staged rows durable.
    ///
    /// # Errors
    ///
    /// Returns a store-specific error when the commit fails; the transaction
    /// is still open in that case and may be rolled back.
    fn commit(
        &self,
        transaction: TransactionHandle,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send;

    /// Discard the transaction and everything staged under it.
    ///
    /// # Errors
    ///
    /// Returns a store-specific error when the rollback fails.
    fn rollback(
        &self,
        transaction: TransactionHandle,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send;

    /// Write a batch of staged rows, returning the number of rows written.
    ///
    /// With a transaction, the rows become visible only on commit but are
    /// observed by later flushes in the same transaction. Without one, the
    /// rows are applied immediately.
    ///
    /// # Errors
    ///
    /// Returns [`FlushError::Conflict`] when a row's expected version does not
    /// match the stored one, or [`FlushError::Store`] when persistence fails.
    fn flush(
        &self,
        rows: Vec<EntityRow>,
        transaction: Option<TransactionHandle>,
    ) -> impl Future<Output = Result<usize, FlushError<Self::Error>>> + Send;
}
