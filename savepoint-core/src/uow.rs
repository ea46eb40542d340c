//! Unit-of-work coordination.
//!
//! [`UnitOfWork`] owns the lifecycle of one logical operation's transaction:
//! begin (natively or through the configured publisher transaction handler),
//! stamp and flush the pending change set, dispatch the queued domain events
//! while the transaction is still open, and commit, or roll everything back
//! on the first failure, surfacing the original error unchanged.
//!
//! Only the outermost [`save_entities`](UnitOfWork::save_entities) call owns
//! commit and rollback. A save issued while a transaction is already open
//! (by a caller that began explicitly, or by a domain-event handler through
//! its [`SaveContext`]) flushes and dispatches into the ambient transaction
//! without committing it.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::{
    concurrency::{ConcurrencyConflict, UpdateTime},
    diagnostics::{
        DiagnosticRecord, DiagnosticSink, TracingSink, TransactionBegin, TransactionCommit,
        TransactionRollback,
    },
    dispatch::{BoxError, HandlerRegistry},
    outbox::PublisherTransactionHandler,
    storage::{FlushError, Storage, TransactionHandle, TransactionId},
    tracking::ChangeSet,
};

/// Error from opening, committing, or rolling back a transaction.
#[derive(Debug, Error)]
pub enum TransactionError {
    #[error("failed to open transaction: {0}")]
    Begin(#[source] BoxError),
    #[error("failed to commit transaction {id}: {source}")]
    Commit {
        id: TransactionId,
        #[source]
        source: BoxError,
    },
    #[error("failed to roll back transaction {id}: {source}")]
    Rollback {
        id: TransactionId,
        #[source]
        source: BoxError,
    },
}

/// Error from a `save_entities` call.
///
/// Every variant aborts the enclosing top-level save, triggers rollback, and
/// carries the original failure unchanged as its source.
#[derive(Debug, Error)]
pub enum SaveError {
    #[error(transparent)]
    Transaction(#[from] TransactionError),
    /// The storage backend detected a stale concurrency token.
    #[error(transparent)]
    Conflict(ConcurrencyConflict),
    #[error("failed to flush pending changes: {0}")]
    Flush(#[source] BoxError),
    #[error("failed to encode entity row: {0}")]
    Codec(#[source] serde_json::Error),
    /// A domain-event handler (or the conversion/publish path it invoked)
    /// failed.
    #[error("handler for `{kind}` failed: {source}")]
    Handler {
        kind: &'static str,
        #[source]
        source: BoxError,
    },
    #[error("save cancelled")]
    Cancelled,
}

/// Internal seam that lets handlers re-enter the coordinator that is
/// dispatching them, without knowing its storage type.
#[async_trait]
pub(crate) trait SaveScope: Send {
    fn changes(&mut self) -> &mut ChangeSet;

    async fn save_entities_scoped(
        &mut self,
        cancellation: &CancellationToken,
    ) -> Result<bool, SaveError>;
}

/// Handle a domain-event handler uses to contribute work to the ambient
/// transaction.
///
/// Changes registered here are flushed by a nested
/// [`save_entities`](Self::save_entities) call (or by a later save); the
/// nested save reuses the open transaction and never commits it.
pub struct SaveContext<'a> {
    scope: &'a mut (dyn SaveScope + 'a),
}

impl<'a> SaveContext<'a> {
    pub(crate) fn new(scope: &'a mut (dyn SaveScope + 'a)) -> Self {
        Self { scope }
    }

    /// The pending change set of the enclosing unit of work.
    pub fn changes(&mut self) -> &mut ChangeSet {
        self.scope.changes()
    }

    /// Nested save: flush pending changes and dispatch the events they
    /// raised, inside the ambient transaction.
    ///
    /// # Errors
    ///
    /// Returns the original failure; the outermost save will roll the whole
    /// transaction back.
    pub async fn save_entities(
        &mut self,
        cancellation: &CancellationToken,
    ) -> Result<bool, SaveError> {
        self.scope.save_entities_scoped(cancellation).await
    }
}

/// Coordinator for one logical operation's transactional save pipeline.
///
/// A `UnitOfWork` is exclusively owned by the operation it serves; it is
/// never shared across concurrent operations. Concurrent operations on
/// disjoint units of work proceed independently with no shared mutable
/// state.
pub struct UnitOfWork<S: Storage> {
    storage: S,
    handlers: Arc<HandlerRegistry>,
    publisher_transactions: Option<Arc<dyn PublisherTransactionHandler>>,
    diagnostics: Arc<dyn DiagnosticSink>,
    changes: ChangeSet,
    current: Option<TransactionHandle>,
}

impl<S: Storage> UnitOfWork<S> {
    #[must_use]
    pub fn new(storage: S) -> Self {
        Self {
            storage,
            handlers: Arc::new(HandlerRegistry::new()),
            publisher_transactions: None,
            diagnostics: Arc::new(TracingSink),
            changes: ChangeSet::new(),
            current: None,
        }
    }

    /// Use the given handler registry for domain-event dispatch.
    #[must_use]
    pub fn with_handlers(mut self, handlers: Arc<HandlerRegistry>) -> Self {
        self.handlers = handlers;
        self
    }

    /// Delegate transaction creation to a publisher transaction handler, so
    /// the outbox write and the entity write share one physical transaction.
    #[must_use]
    pub fn with_transactional_publisher(
        mut self,
        handler: Arc<dyn PublisherTransactionHandler>,
    ) -> Self {
        self.publisher_transactions = Some(handler);
        self
    }

    /// Replace the default tracing diagnostic sink.
    #[must_use]
    pub fn with_diagnostics(mut self, sink: Arc<dyn DiagnosticSink>) -> Self {
        self.diagnostics = sink;
        self
    }

    #[must_use]
    pub const fn storage(&self) -> &S {
        &self.storage
    }

    /// The pending change set. Register mutations here before saving.
    pub fn changes(&mut self) -> &mut ChangeSet {
        &mut self.changes
    }

    /// The currently open transaction, if any.
    #[must_use]
    pub const fn current_transaction(&self) -> Option<TransactionHandle> {
        self.current
    }

    /// Open the transaction for this unit of work.
    ///
    /// Delegates to the publisher transaction handler when one is configured,
    /// otherwise opens a native storage transaction. Emits a
    /// `TransactionBegin` diagnostic carrying the new handle's identifier.
    ///
    /// # Errors
    ///
    /// Returns [`TransactionError::Begin`] when the underlying store (or the
    /// publisher collaborator) cannot open a transaction.
    pub async fn begin_transaction(&mut self) -> Result<TransactionHandle, TransactionError> {
        let handle = match &self.publisher_transactions {
            Some(handler) => handler
                .begin_transaction()
                .await
                .map_err(TransactionError::Begin)?,
            None => self
                .storage
                .begin()
                .await
                .map_err(|e| TransactionError::Begin(Box::new(e)))?,
        };
        self.current = Some(handle);
        self.emit(DiagnosticRecord::Begin(TransactionBegin {
            transaction_id: handle.id(),
        }));
        Ok(handle)
    }

    /// Commit the current transaction, if one is open.
    ///
    /// The handle is cleared only after the commit succeeds; on failure it
    /// remains set so the caller may still attempt a rollback.
    ///
    /// # Errors
    ///
    /// Returns [`TransactionError::Commit`] when the storage commit fails.
    pub async fn commit(&mut self) -> Result<(), TransactionError> {
        if let Some(handle) = self.current {
            self.storage
                .commit(handle)
                .await
                .map_err(|source| TransactionError::Commit {
                    id: handle.id(),
                    source: Box::new(source),
                })?;
            self.emit(DiagnosticRecord::Commit(TransactionCommit {
                transaction_id: handle.id(),
            }));
            self.current = None;
        }
        Ok(())
    }

    /// Roll back the current transaction, if one is open. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns [`TransactionError::Rollback`] when the storage rollback
    /// fails; the handle remains set in that case.
    pub async fn rollback(&mut self) -> Result<(), TransactionError> {
        if let Some(handle) = self.current {
            self.storage
                .rollback(handle)
                .await
                .map_err(|source| TransactionError::Rollback {
                    id: handle.id(),
                    source: Box::new(source),
                })?;
            self.emit(DiagnosticRecord::Rollback(TransactionRollback {
                transaction_id: handle.id(),
            }));
            self.current = None;
        }
        Ok(())
    }

    /// Save the pending changes and dispatch the domain events they raised,
    /// as one atomic unit.
    ///
    /// With no transaction open this is a top-level save: a transaction is
    /// opened, pending changes are stamped and flushed, queued domain events
    /// are dispatched (still inside the transaction), and the transaction is
    /// committed. Any failure along the way rolls the transaction back and
    /// the original error is returned; the save never partially commits.
    ///
    /// With a transaction already open (the caller began explicitly, or this
    /// is a handler's nested save) only the flush and dispatch run; commit
    /// stays with the outermost owner.
    ///
    /// # Errors
    ///
    /// Returns [`SaveError`] carrying the original failure. Cancellation
    /// surfaces as [`SaveError::Cancelled`] and still routes through
    /// rollback, so a cancelled save never leaves a transaction open.
    pub async fn save_entities(
        &mut self,
        cancellation: &CancellationToken,
    ) -> Result<bool, SaveError> {
        if self.current.is_none() {
            self.begin_transaction().await?;

            let result = match self.flush_and_dispatch(cancellation).await {
                Ok(()) => self.commit().await.map_err(SaveError::from),
                Err(error) => Err(error),
            };

            match result {
                Ok(()) => {
                    self.changes.clear();
                    Ok(true)
                }
                Err(error) => {
                    self.changes.reset_flushed();
                    if let Err(rollback_error) = self.rollback().await {
                        tracing::warn!(
                            error = %rollback_error,
                            "rollback failed after save error"
                        );
                    }
                    Err(error)
                }
            }
        } else {
            self.flush_and_dispatch(cancellation).await?;
            Ok(true)
        }
    }

    /// Stamp and flush pending rows, then drain and dispatch queued domain
    /// events until handler side effects stop raising new ones.
    ///
    /// The redispatch loop is deliberately unbounded: an application that
    /// raises events in an endless cycle will not terminate here. That is the
    /// caller's contract, not a guarded condition.
    async fn flush_and_dispatch(
        &mut self,
        cancellation: &CancellationToken,
    ) -> Result<(), SaveError> {
        if cancellation.is_cancelled() {
            return Err(SaveError::Cancelled);
        }

        let rows = self
            .changes
            .stage(UpdateTime::now())
            .map_err(SaveError::Codec)?;
        if !rows.is_empty() {
            let count = self
                .storage
                .flush(rows, self.current)
                .await
                .map_err(|error| match error {
                    FlushError::Conflict(conflict) => SaveError::Conflict(conflict),
                    FlushError::Store(store) => SaveError::Flush(Box::new(store)),
                })?;
            tracing::debug!(rows = count, "pending changes flushed");
        }

        loop {
            let events = self.changes.drain_events();
            if events.is_empty() {
                break;
            }
            for event in events {
                if cancellation.is_cancelled() {
                    return Err(SaveError::Cancelled);
                }
                let handlers = Arc::clone(&self.handlers);
                let kind = event.kind();
                handlers
                    .dispatch(&event, &mut SaveContext::new(self), cancellation)
                    .await
                    .map_err(|source| SaveError::Handler { kind, source })?;
            }
        }
        Ok(())
    }

    fn emit(&self, record: DiagnosticRecord) {
        if self.diagnostics.enabled(record.name()) {
            self.diagnostics.write(record);
        }
    }
}

#[async_trait]
impl<S: Storage> SaveScope for UnitOfWork<S> {
    fn changes(&mut self) -> &mut ChangeSet {
        &mut self.changes
    }

    async fn save_entities_scoped(
        &mut self,
        cancellation: &CancellationToken,
    ) -> Result<bool, SaveError> {
        self.save_entities(cancellation).await
    }
}

impl<S: Storage> Drop for UnitOfWork<S> {
    fn drop(&mut self) {
        if let Some(handle) = self.current {
            tracing::warn!(
                transaction_id = %handle.id(),
                "unit of work dropped with an open transaction; staged writes are discarded by \
                 the storage backend"
            );
        }
    }
}
