//! In-memory storage implementation for testing.
//!
//! [`Store`] keeps committed rows in a hash map and stages per-transaction
//! writes (entity rows and outbox messages) until commit, which makes it a
//! faithful stand-in for a relational backend in unit and integration tests:
//! version checking, read-your-own-writes within a transaction, and atomic
//! commit/rollback of entity and outbox writes together.

use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use crate::{
    concurrency::ConcurrencyConflict,
    entity::EntityState,
    outbox::OutboxMessage,
    storage::{EntityRow, FlushError, Storage, TransactionHandle, TransactionId},
};

/// Error type for the in-memory store.
#[derive(Debug, thiserror::Error)]
pub enum InMemoryError {
    #[error("unknown transaction {0}")]
    UnknownTransaction(TransactionId),
    /// A staged row went stale between flush and commit.
    #[error(transparent)]
    Conflict(#[from] ConcurrencyConflict),
}

/// A committed row, as the storage engine sees it.
#[derive(Debug, Clone)]
pub struct PersistedRow {
    /// Primitive value of the version column, if the entity carries one.
    pub version: Option<u64>,
    /// Serialized entity payload.
    pub data: serde_json::Value,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct RowKey {
    kind: String,
    id: String,
}

impl RowKey {
    fn new(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            id: id.into(),
        }
    }
}

#[derive(Default)]
struct Staged {
    rows: Vec<EntityRow>,
    outbox: Vec<OutboxMessage>,
}

#[derive(Default)]
struct Inner {
    rows: HashMap<RowKey, PersistedRow>,
    outbox: Vec<OutboxMessage>,
    pending: HashMap<TransactionId, Staged>,
}

/// Thread-safe in-memory store with staged-per-transaction writes.
#[derive(Clone, Default)]
pub struct Store {
    inner: Arc<RwLock<Inner>>,
}

impl Store {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a committed row.
    #[must_use]
    pub fn row(&self, kind: &str, id: &str) -> Option<PersistedRow> {
        let inner = self.inner.read().expect("in-memory store lock poisoned");
        inner.rows.get(&RowKey::new(kind, id)).cloned()
    }

    /// All committed outbox messages, in commit order.
    #[must_use]
    pub fn outbox(&self) -> Vec<OutboxMessage> {
        let inner = self.inner.read().expect("in-memory store lock poisoned");
        inner.outbox.clone()
    }

    /// Whether the transaction is still open with staged work.
    #[must_use]
    pub fn is_pending(&self, transaction: TransactionHandle) -> bool {
        let inner = self.inner.read().expect("in-memory store lock poisoned");
        inner.pending.contains_key(&transaction.id())
    }

    /// Record an outbox message under an open transaction.
    ///
    /// The message becomes visible in [`outbox`](Self::outbox) if and only if
    /// the transaction commits.
    ///
    /// # Errors
    ///
    /// Returns [`InMemoryError::UnknownTransaction`] if the transaction is not
    /// open.
    pub fn stage_outbox(
        &self,
        transaction: TransactionHandle,
        message: OutboxMessage,
    ) -> Result<(), InMemoryError> {
        let mut inner = self.inner.write().expect("in-memory store lock poisoned");
        let staged = inner
            .pending
            .get_mut(&transaction.id())
            .ok_or(InMemoryError::UnknownTransaction(transaction.id()))?;
        staged.outbox.push(message);
        Ok(())
    }

    /// Record an outbox message immediately, outside any transaction.
    pub fn append_outbox(&self, message: OutboxMessage) {
        let mut inner = self.inner.write().expect("in-memory store lock poisoned");
        inner.outbox.push(message);
    }

    /// Effective row state for version checks: committed rows overlaid with
    /// rows already staged in the same transaction.
    ///
    /// `Some(version)` means the row exists with that version column;
    /// `None` means it does not exist.
    fn effective_version(
        inner: &Inner,
        transaction: Option<TransactionId>,
        key: &RowKey,
    ) -> Option<Option<u64>> {
        if let Some(id) = transaction {
            if let Some(staged) = inner.pending.get(&id) {
                let overlay = staged
                    .rows
                    .iter()
                    .rev()
                    .find(|row| row.kind == key.kind && row.id == key.id);
                if let Some(row) = overlay {
                    return match row.state {
                        EntityState::Deleted => None,
                        EntityState::Added | EntityState::Modified => Some(row.version),
                    };
                }
            }
        }
        inner.rows.get(key).map(|row| row.version)
    }

    fn check_row(
        row: &EntityRow,
        current: Option<Option<u64>>,
    ) -> Result<(), ConcurrencyConflict> {
        match row.state {
            EntityState::Added => match current {
                None => Ok(()),
                Some(actual) => Err(ConcurrencyConflict {
                    expected: None,
                    actual,
                }),
            },
            EntityState::Modified | EntityState::Deleted => match row.expected_version {
                // No concurrency token on this entity: last writer wins.
                None => Ok(()),
                Some(expected) => match current {
                    Some(Some(actual)) if actual == expected => Ok(()),
                    Some(actual) => Err(ConcurrencyConflict {
                        expected: Some(expected),
                        actual,
                    }),
                    None => Err(ConcurrencyConflict {
                        expected: Some(expected),
                        actual: None,
                    }),
                },
            },
        }
    }

    fn apply_row(inner: &mut Inner, row: EntityRow) {
        let key = RowKey::new(row.kind, row.id.clone());
        match row.state {
            EntityState::Added | EntityState::Modified => {
                inner.rows.insert(
                    key,
                    PersistedRow {
                        version: row.version,
                        data: row.data,
                    },
                );
            }
            EntityState::Deleted => {
                inner.rows.remove(&key);
            }
        }
    }
}

impl Storage for Store {
    type Error = InMemoryError;

    #[tracing::instrument(skip(self))]
    fn begin(&self) -> impl std::future::Future<Output = Result<TransactionHandle, Self::Error>> + Send {
        let id = TransactionId::new();
        let mut inner = self.inner.write().expect("in-memory store lock poisoned");
        inner.pending.insert(id, Staged::default());
        drop(inner);
        tracing::trace!(transaction_id = %id, "transaction opened");
        std::future::ready(Ok(TransactionHandle::new(id)))
    }

    #[tracing::instrument(skip(self, transaction), fields(transaction_id = %transaction.id()))]
    fn commit(
        &self,
        transaction: TransactionHandle,
    ) -> impl std::future::Future<Output = Result<(), Self::Error>> + Send {
        let result = (|| {
            let mut inner = self.inner.write().expect("in-memory store lock poisoned");
            let staged = inner
                .pending
                .remove(&transaction.id())
                .ok_or(InMemoryError::UnknownTransaction(transaction.id()))?;

            // Rows were validated at flush time; re-validate against writes
            // committed since, then apply in staging order.
            for row in &staged.rows {
                let key = RowKey::new(row.kind, row.id.clone());
                let current = inner.rows.get(&key).map(|r| r.version);
                Self::check_row(row, current)?;
                Self::apply_row(&mut inner, row.clone());
            }
            inner.outbox.extend(staged.outbox);
            tracing::debug!(rows = staged.rows.len(), "transaction committed");
            Ok(())
        })();
        std::future::ready(result)
    }

    #[tracing::instrument(skip(self, transaction), fields(transaction_id = %transaction.id()))]
    fn rollback(
        &self,
        transaction: TransactionHandle,
    ) -> impl std::future::Future<Output = Result<(), Self::Error>> + Send {
        let mut inner = self.inner.write().expect("in-memory store lock poisoned");
        let discarded = inner.pending.remove(&transaction.id());
        drop(inner);
        if let Some(staged) = discarded {
            tracing::debug!(
                rows = staged.rows.len(),
                outbox = staged.outbox.len(),
                "transaction rolled back, staged writes discarded"
            );
        }
        std::future::ready(Ok(()))
    }

    #[tracing::instrument(skip(self, rows, transaction), fields(row_count = rows.len()))]
    fn flush(
        &self,
        rows: Vec<EntityRow>,
        transaction: Option<TransactionHandle>,
    ) -> impl std::future::Future<Output = Result<usize, FlushError<Self::Error>>> + Send {
        let result = (|| {
            let mut inner = self.inner.write().expect("in-memory store lock poisoned");
            let transaction_id = transaction.map(|t| t.id());

            if let Some(id) = transaction_id {
                if !inner.pending.contains_key(&id) {
                    return Err(FlushError::Store(InMemoryError::UnknownTransaction(id)));
                }
            }

            // Validate the whole batch before staging any of it.
            for row in &rows {
                let key = RowKey::new(row.kind, row.id.clone());
                let current = Self::effective_version(&inner, transaction_id, &key);
                Self::check_row(row, current).map_err(FlushError::Conflict)?;
            }

            let count = rows.len();
            match transaction_id {
                Some(id) => {
                    let staged = inner
                        .pending
                        .get_mut(&id)
                        .expect("pending transaction checked above");
                    staged.rows.extend(rows);
                }
                None => {
                    for row in rows {
                        Self::apply_row(&mut inner, row);
                    }
                }
            }
            drop(inner);
            tracing::debug!(rows = count, "pending changes flushed");
            Ok(count)
        })();
        std::future::ready(result)
    }
}
