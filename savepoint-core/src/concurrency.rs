//! Typed concurrency and modification-time fields.
//!
//! This module provides the two field wrappers the unit of work stamps on
//! every save ([`RowVersion`], [`UpdateTime`]), the [`Stamped`] contract that
//! entities implement (normally via `#[derive(Entity)]`), and the
//! [`ConcurrencyConflict`] error surfaced by storage backends when a stale
//! version reaches a write.
//!
//! Both wrappers serialize transparently as their primitive representation
//! (an integer counter, an RFC 3339 timestamp), so storage backends see plain
//! columns and can enforce the version check without knowing the wrapper
//! types.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Optimistic-concurrency counter carried by a persisted entity.
///
/// On every modifying save the value presented to storage is exactly the
/// previously persisted value plus one; the storage backend rejects the write
/// with a [`ConcurrencyConflict`] when the expected value no longer matches
/// the stored column. The unit of work guarantees correct increment
/// semantics, not collision detection itself.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct RowVersion(u64);

impl RowVersion {
    #[must_use]
    pub const fn new(number: u64) -> Self {
        Self(number)
    }

    /// The primitive counter value stored in the version column.
    #[must_use]
    pub const fn number(self) -> u64 {
        self.0
    }

    /// The value a modifying save presents to storage.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl From<u64> for RowVersion {
    fn from(number: u64) -> Self {
        Self(number)
    }
}

impl From<RowVersion> for u64 {
    fn from(version: RowVersion) -> Self {
        version.0
    }
}

impl fmt::Display for RowVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Last-modified timestamp refreshed by the unit of work.
///
/// The value is always the current UTC instant at stamping time and is never
/// supplied by the caller; any value the caller writes into the field is
/// overwritten on the next save of a modified entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UpdateTime(DateTime<Utc>);

impl UpdateTime {
    /// The current instant, in UTC.
    #[must_use]
    pub fn now() -> Self {
        Self(Utc::now())
    }

    #[must_use]
    pub const fn instant(self) -> DateTime<Utc> {
        self.0
    }
}

impl Default for UpdateTime {
    fn default() -> Self {
        Self::now()
    }
}

impl From<DateTime<Utc>> for UpdateTime {
    fn from(instant: DateTime<Utc>) -> Self {
        Self(instant)
    }
}

impl From<UpdateTime> for DateTime<Utc> {
    fn from(time: UpdateTime) -> Self {
        time.0
    }
}

impl fmt::Display for UpdateTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Stamping contract applied to modified entities immediately before a flush.
///
/// `#[derive(Entity)]` generates this implementation from the declared field
/// types: every [`RowVersion`] field the caller has not explicitly modified
/// (its current value still equals the as-loaded original) advances by one,
/// and every [`UpdateTime`] field is unconditionally overwritten with `now`.
/// Fields the caller set in the same save are left untouched, so there is no
/// double increment.
pub trait Stamped {
    /// Advance untouched version fields and refresh modification timestamps.
    ///
    /// `original` is the as-loaded snapshot of the entity; `None` for entities
    /// that were never persisted (added in this save).
    fn stamp(&mut self, original: Option<&Self>, now: UpdateTime);

    /// The current concurrency token of this entity, if it carries one.
    fn row_version(&self) -> Option<RowVersion> {
        None
    }
}

/// Error indicating that a write reached storage with a stale version.
///
/// Returned by storage backends when the expected version (captured when the
/// entity was loaded) no longer matches the persisted column, meaning another
/// writer saved the row in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("{}", format_conflict(.expected, .actual))]
pub struct ConcurrencyConflict {
    /// The version the save expected to find. `None` means the row was
    /// expected to be new.
    pub expected: Option<u64>,
    /// The version actually persisted. `None` means the row does not exist.
    pub actual: Option<u64>,
}

/// Build a human-readable message for a [`ConcurrencyConflict`], including an
/// actionable hint for the caller.
fn format_conflict(expected: &Option<u64>, actual: &Option<u64>) -> String {
    match (expected, actual) {
        (None, Some(actual)) => format!(
            "concurrency conflict: expected new row, found version {actual} (hint: another \
             process created this entity; reload and retry)"
        ),
        (Some(expected), Some(actual)) => format!(
            "concurrency conflict: expected version {expected}, found {actual} (hint: the row \
             was modified; reload and retry)"
        ),
        (Some(expected), None) => format!(
            "concurrency conflict: expected version {expected}, row is gone (hint: the row was \
             deleted; reload and retry)"
        ),
        (None, None) => "concurrency conflict: unexpected empty state".to_string(),
    }
}
