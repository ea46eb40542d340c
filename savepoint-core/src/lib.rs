//! Core traits and types for the Savepoint unit-of-work library.
//!
//! This crate provides the foundational abstractions for transactional
//! persistence coordination:
//!
//! - [`concurrency`] - Typed version/timestamp fields and stamping (`RowVersion`, `UpdateTime`, `Stamped`)
//! - [`entity`] - Persisted entity primitives (`Entity`, `DomainEvents`, `EntityState`)
//! - [`event`] - Event markers and conversion rules (`DomainEvent`, `IntegrationEvent`, `IntegrationEventConvert`)
//! - [`tracking`] - The pending change set (`ChangeSet`)
//! - [`dispatch`] - In-process event dispatch (`DomainEventHandler`, `HandlerRegistry`)
//! - [`storage`] - Persistence seam and in-memory backend (`Storage`)
//! - [`outbox`] - Integration event publication (`IntegrationEventPublisher`, `TransactionalOutbox`)
//! - [`diagnostics`] - Transaction lifecycle observation (`DiagnosticSink`)
//! - [`uow`] - The coordinator itself (`UnitOfWork`, `SaveContext`)
//!
//! # Example
//!
//! ```
//! use savepoint_core::{storage::inmemory, uow::UnitOfWork};
//!
//! // Create an in-memory store and a unit of work over it
//! let store = inmemory::Store::new();
//! let uow = UnitOfWork::new(store);
//! ```
//!
//! Most users should depend on the [`savepoint`](https://docs.rs/savepoint)
//! crate, which re-exports these types together with the derive macros.

pub mod concurrency;
pub mod diagnostics;
pub mod dispatch;
pub mod entity;
pub mod event;
pub mod outbox;
pub mod storage;
pub mod tracking;
pub mod uow;
