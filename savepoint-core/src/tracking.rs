//! Pending change tracking.
//!
//! A [`ChangeSet`] holds the entities a logical operation intends to persist,
//! together with their pending state and (for modified entries) the as-loaded
//! original snapshot. At flush time the unit of work stamps modified entries
//! ([`Stamped`]), serializes each entry into an
//! [`EntityRow`](crate::storage::EntityRow), and hands the batch to storage;
//! after the flush it drains the domain events buffered on the tracked
//! entities, in entry order.

use serde::Serialize;

use crate::{
    concurrency::{Stamped, UpdateTime},
    entity::{Entity, EntityState},
    event::RaisedEvent,
    storage::EntityRow,
};

/// Object-safe view of one tracked entity.
trait PendingEntity: Send + Sync {
    fn state(&self) -> EntityState;
    fn is_flushed(&self) -> bool;
    fn set_flushed(&mut self, flushed: bool);
    fn stamp(&mut self, now: UpdateTime);
    fn to_row(&self) -> Result<EntityRow, serde_json::Error>;
    fn drain_events(&mut self) -> Vec<RaisedEvent>;
}

struct Pending<E> {
    state: EntityState,
    original: Option<E>,
    entity: E,
    flushed: bool,
}

impl<E> PendingEntity for Pending<E>
where
    E: Entity + Stamped + Serialize,
{
    fn state(&self) -> EntityState {
        self.state
    }

    fn is_flushed(&self) -> bool {
        self.flushed
    }

    fn set_flushed(&mut self, flushed: bool) {
        self.flushed = flushed;
    }

    fn stamp(&mut self, now: UpdateTime) {
        self.entity.stamp(self.original.as_ref(), now);
    }

    fn to_row(&self) -> Result<EntityRow, serde_json::Error> {
        let expected_version = match self.state {
            EntityState::Added => None,
            EntityState::Modified => self
                .original
                .as_ref()
                .and_then(Stamped::row_version)
                .map(u64::from),
            // Deletes check against the token held by the loaded instance.
            EntityState::Deleted => self.entity.row_version().map(u64::from),
        };
        Ok(EntityRow {
            kind: E::KIND,
            id: self.entity.id().to_string(),
            state: self.state,
            data: serde_json::to_value(&self.entity)?,
            expected_version,
            version: self.entity.row_version().map(u64::from),
        })
    }

    fn drain_events(&mut self) -> Vec<RaisedEvent> {
        self.entity
            .domain_events()
            .map(crate::entity::DomainEvents::drain)
            .unwrap_or_default()
    }
}

/// The set of entity mutations pending in one logical operation.
///
/// Entries keep their registration order; that order is the flush order and
/// therefore also the event dispatch order.
#[derive(Default)]
pub struct ChangeSet {
    entries: Vec<Box<dyn PendingEntity>>,
}

impl ChangeSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a new entity to be inserted.
    ///
    /// Added entities are not stamped: their version field keeps whatever the
    /// caller (or `Default`) initialized it to.
    pub fn add<E>(&mut self, entity: E)
    where
        E: Entity + Stamped + Serialize,
    {
        self.push(EntityState::Added, None, entity);
    }

    /// Track a modification of a previously loaded entity.
    ///
    /// `original` is the snapshot taken when the entity was loaded; the
    /// stamper compares it field by field against `entity` to decide which
    /// version tokens the caller left untouched.
    pub fn update<E>(&mut self, original: E, entity: E)
    where
        E: Entity + Stamped + Serialize,
    {
        self.push(EntityState::Modified, Some(original), entity);
    }

    /// Track a deletion of a previously loaded entity.
    pub fn remove<E>(&mut self, entity: E)
    where
        E: Entity + Stamped + Serialize,
    {
        self.push(EntityState::Deleted, None, entity);
    }

    fn push<E>(&mut self, state: EntityState, original: Option<E>, entity: E)
    where
        E: Entity + Stamped + Serialize,
    {
        tracing::trace!(entity_kind = E::KIND, %state, "entity tracked");
        self.entries.push(Box::new(Pending {
            state,
            original,
            entity,
            flushed: false,
        }));
    }

    /// Number of tracked entries, flushed or not.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Stamp and serialize every entry that has not been flushed yet.
    ///
    /// Modified entries are stamped first (untouched version fields advance,
    /// modification timestamps refresh to `now`), so the final values are part
    /// of the same write. Staged entries are marked flushed and skipped by
    /// later calls.
    pub(crate) fn stage(&mut self, now: UpdateTime) -> Result<Vec<EntityRow>, serde_json::Error> {
        let mut rows = Vec::new();
        for entry in &mut self.entries {
            if entry.is_flushed() {
                continue;
            }
            if entry.state() == EntityState::Modified {
                entry.stamp(now);
            }
            rows.push(entry.to_row()?);
            entry.set_flushed(true);
        }
        Ok(rows)
    }

    /// Detach and return every buffered domain event, in entry order.
    pub(crate) fn drain_events(&mut self) -> Vec<RaisedEvent> {
        self.entries
            .iter_mut()
            .flat_map(|entry| entry.drain_events())
            .collect()
    }

    /// Forget all entries. Called after a successful top-level commit.
    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }

    /// Allow every entry to be staged again. Called after a rollback so a
    /// retried save re-presents the same writes.
    pub(crate) fn reset_flushed(&mut self) {
        for entry in &mut self.entries {
            entry.set_flushed(false);
        }
    }
}

impl std::fmt::Debug for ChangeSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeSet")
            .field("entries", &self.entries.len())
            .finish()
    }
}
