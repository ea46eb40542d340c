//! Transaction lifecycle diagnostics.
//!
//! The unit of work emits one record per transaction phase through a
//! [`DiagnosticSink`]. Each record is a named channel that can be enabled
//! independently; the `enabled` guard is checked before writing, so a
//! disabled sink costs a single branch on the hot path.

use crate::storage::TransactionId;

/// Channel names for the three record shapes.
pub mod names {
    pub const TRANSACTION_BEGIN: &str = "savepoint.transaction.begin";
    pub const TRANSACTION_COMMIT: &str = "savepoint.transaction.commit";
    pub const TRANSACTION_ROLLBACK: &str = "savepoint.transaction.rollback";
}

/// A transaction was opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionBegin {
    pub transaction_id: TransactionId,
}

/// A transaction was committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionCommit {
    pub transaction_id: TransactionId,
}

/// A transaction was rolled back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionRollback {
    pub transaction_id: TransactionId,
}

/// One diagnostic record, purely observational.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagnosticRecord {
    Begin(TransactionBegin),
    Commit(TransactionCommit),
    Rollback(TransactionRollback),
}

impl DiagnosticRecord {
    /// The channel name this record is written to.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Begin(_) => names::TRANSACTION_BEGIN,
            Self::Commit(_) => names::TRANSACTION_COMMIT,
            Self::Rollback(_) => names::TRANSACTION_ROLLBACK,
        }
    }

    #[must_use]
    pub const fn transaction_id(&self) -> TransactionId {
        match self {
            Self::Begin(record) => record.transaction_id,
            Self::Commit(record) => record.transaction_id,
            Self::Rollback(record) => record.transaction_id,
        }
    }
}

/// Observer for transaction lifecycle records.
///
/// Implementations should keep `write` cheap; the unit of work checks
/// [`enabled`](Self::enabled) with the record's channel name before calling
/// it.
pub trait DiagnosticSink: Send + Sync {
    fn enabled(&self, name: &str) -> bool;
    fn write(&self, record: DiagnosticRecord);
}

/// Default sink that forwards records to `tracing` at debug level.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl DiagnosticSink for TracingSink {
    fn enabled(&self, _name: &str) -> bool {
        tracing::enabled!(tracing::Level::DEBUG)
    }

    fn write(&self, record: DiagnosticRecord) {
        match record {
            DiagnosticRecord::Begin(r) => {
                tracing::debug!(transaction_id = %r.transaction_id, "transaction begun");
            }
            DiagnosticRecord::Commit(r) => {
                tracing::debug!(transaction_id = %r.transaction_id, "transaction committed");
            }
            DiagnosticRecord::Rollback(r) => {
                tracing::debug!(transaction_id = %r.transaction_id, "transaction rolled back");
            }
        }
    }
}
