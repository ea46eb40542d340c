#![doc = include_str!("../README.md")]

pub use savepoint_core::{
    concurrency::{ConcurrencyConflict, RowVersion, Stamped, UpdateTime},
    dispatch::{BoxError, DomainEventHandler, HandlerRegistry},
    entity::{DomainEvents, Entity, EntityState},
    event::{DomainEvent, EventKind, IntegrationEvent, IntegrationEventConvert, RaisedEvent},
    outbox::{
        IntegrationEventPublisher, IntegrationEventPublisherExt, OutboxMessage, PublishError,
        PublisherTransactionHandler, TransactionalOutbox,
    },
    tracking::ChangeSet,
    uow::{SaveContext, SaveError, TransactionError, UnitOfWork},
};
// Re-export proc macro derives so consumers only depend on `savepoint`.
pub use savepoint_macros::{Entity, EventConverter};

// Generated handlers and hand-written ones share these.
pub use async_trait::async_trait;
pub use tokio_util::sync::CancellationToken;

pub mod storage {

    pub use savepoint_core::storage::{
        EntityRow, FlushError, Storage, TransactionHandle, TransactionId,
    };

    pub use savepoint_core::storage::inmemory;
}

pub mod diagnostics {

    pub use savepoint_core::diagnostics::{
        names, DiagnosticRecord, DiagnosticSink, TracingSink, TransactionBegin, TransactionCommit,
        TransactionRollback,
    };
}

#[cfg(feature = "test-util")]
pub use savepoint_core::test;
