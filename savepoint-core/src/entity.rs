//! Persisted entity primitives.
//!
//! This module defines the [`Entity`] trait (identity + kind, normally
//! implemented via `#[derive(Entity)]`), the [`DomainEvents`] buffer an
//! entity carries to raise events during mutations, and the [`EntityState`]
//! tracked per change-set entry.

use std::{collections::VecDeque, fmt};

use crate::event::{DomainEvent, RaisedEvent};

/// A persisted domain entity the unit of work can track.
///
/// `KIND` identifies the entity type in storage rows and diagnostics; use
/// lowercase kebab-case for consistency: `"order"`, `"user-account"`, etc.
/// The derive macro defaults it to the kebab-cased struct name.
pub trait Entity: Send + Sync + 'static {
    /// Entity type identifier used by the storage backend.
    const KIND: &'static str;

    type Id: Clone + fmt::Display + Send + Sync + 'static;

    fn id(&self) -> &Self::Id;

    /// The entity's domain-event buffer, if it raises events.
    ///
    /// The derive macro wires this to a field of type [`DomainEvents`] when
    /// the struct declares one; entities without such a field never raise
    /// events and keep the default.
    fn domain_events(&mut self) -> Option<&mut DomainEvents> {
        None
    }
}

/// The pending persistence state of a tracked entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityState {
    Added,
    Modified,
    Deleted,
}

impl fmt::Display for EntityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Added => "added",
            Self::Modified => "modified",
            Self::Deleted => "deleted",
        };
        f.write_str(name)
    }
}

/// Buffer of domain events raised by an entity since the last dispatch.
///
/// Declare a field of this type on an entity struct (skipped from
/// serialization) and call [`raise`](Self::raise) from mutation methods.
/// Events are drained in raised order when the unit of work queues them for
/// dispatch, so a later save of the same instance does not re-dispatch them.
///
/// ```ignore
/// #[derive(Entity, Serialize, Clone)]
/// struct Order {
///     id: String,
///     #[serde(skip)]
///     events: DomainEvents,
/// }
///
/// impl Order {
///     fn pay(&mut self) {
///         self.events.raise(OrderPaid { order_id: self.id.clone() });
///     }
/// }
/// ```
#[derive(Clone, Default)]
pub struct DomainEvents {
    queue: VecDeque<RaisedEvent>,
}

impl DomainEvents {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach an event to this entity, to be dispatched on the next save.
    pub fn raise<E: DomainEvent>(&mut self, event: E) {
        self.queue.push_back(RaisedEvent::new(event));
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Detach all buffered events, in raised order.
    pub fn drain(&mut self) -> Vec<RaisedEvent> {
        self.queue.drain(..).collect()
    }
}

impl fmt::Debug for DomainEvents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DomainEvents")
            .field("pending", &self.queue.len())
            .finish()
    }
}
