//! Integration tests for the unit-of-work save pipeline.

use std::sync::Arc;

use savepoint::{
    async_trait, diagnostics::names, storage::inmemory, BoxError, CancellationToken, DomainEvent,
    DomainEventHandler, DomainEvents, Entity, RowVersion, SaveContext, SaveError, UnitOfWork,
    UpdateTime,
};
use savepoint_core::test::RecordingSink;
use serde::{Deserialize, Serialize};

// ============================================================================
// Test Domain: Order
// ============================================================================

#[derive(Entity, Serialize, Deserialize, Clone)]
struct Order {
    id: String,
    total: i64,
    version: RowVersion,
    updated_at: UpdateTime,
    #[serde(skip)]
    events: DomainEvents,
}

impl Order {
    fn new(id: &str, total: i64) -> Self {
        Self {
            id: id.to_string(),
            total,
            version: RowVersion::new(0),
            updated_at: UpdateTime::now(),
            events: DomainEvents::new(),
        }
    }

    fn touch(&mut self) {
        self.events.raise(OrderTouched);
    }
}

#[derive(Clone)]
struct OrderTouched;

impl DomainEvent for OrderTouched {
    const KIND: &'static str = "order-touched";
}

struct FailingHandler;

#[async_trait]
impl DomainEventHandler<OrderTouched> for FailingHandler {
    async fn handle(
        &self,
        _event: &OrderTouched,
        _context: &mut SaveContext<'_>,
        _cancellation: &CancellationToken,
    ) -> Result<(), BoxError> {
        Err("handler refused the event".into())
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn persisted_order(store: &inmemory::Store, id: &str) -> Option<Order> {
    let row = store.row("order", id)?;
    Some(serde_json::from_value(row.data).expect("persisted order should deserialize"))
}

async fn seed_order(store: &inmemory::Store, id: &str, total: i64) {
    let mut uow = UnitOfWork::new(store.clone());
    uow.changes().add(Order::new(id, total));
    uow.save_entities(&CancellationToken::new())
        .await
        .expect("seeding should succeed");
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn saving_a_modified_order_increments_version_and_refreshes_timestamp() {
    let store = inmemory::Store::new();
    seed_order(&store, "o1", 10).await;

    let loaded = persisted_order(&store, "o1").unwrap();
    assert_eq!(loaded.version, RowVersion::new(0));

    let original = loaded.clone();
    let mut updated = loaded;
    updated.total = 20;

    let sink = RecordingSink::new();
    let mut uow = UnitOfWork::new(store.clone()).with_diagnostics(Arc::new(sink.clone()));
    uow.changes().update(original, updated);

    let before = UpdateTime::now();
    assert!(uow.save_entities(&CancellationToken::new()).await.unwrap());
    let after = UpdateTime::now();

    let persisted = persisted_order(&store, "o1").unwrap();
    assert_eq!(persisted.total, 20);
    assert_eq!(persisted.version, RowVersion::new(1));
    assert!(persisted.updated_at >= before && persisted.updated_at <= after);

    assert_eq!(sink.count(names::TRANSACTION_BEGIN), 1);
    assert_eq!(sink.count(names::TRANSACTION_COMMIT), 1);
    assert_eq!(sink.count(names::TRANSACTION_ROLLBACK), 0);
}

#[tokio::test]
async fn caller_set_version_is_persisted_unchanged() {
    let store = inmemory::Store::new();
    seed_order(&store, "o1", 10).await;

    let loaded = persisted_order(&store, "o1").unwrap();
    let original = loaded.clone();
    let mut updated = loaded;
    updated.version = RowVersion::new(7);

    let mut uow = UnitOfWork::new(store.clone());
    uow.changes().update(original, updated);
    uow.save_entities(&CancellationToken::new()).await.unwrap();

    let persisted = persisted_order(&store, "o1").unwrap();
    assert_eq!(persisted.version, RowVersion::new(7));
}

#[tokio::test]
async fn stale_save_surfaces_a_concurrency_conflict() {
    let store = inmemory::Store::new();
    seed_order(&store, "o1", 10).await;

    // Two logical operations load the same version.
    let first_load = persisted_order(&store, "o1").unwrap();
    let second_load = first_load.clone();

    let mut first = UnitOfWork::new(store.clone());
    let mut winner = first_load.clone();
    winner.total = 20;
    first.changes().update(first_load, winner);
    first.save_entities(&CancellationToken::new()).await.unwrap();

    let mut second = UnitOfWork::new(store.clone());
    let mut loser = second_load.clone();
    loser.total = 30;
    second.changes().update(second_load, loser);
    let result = second.save_entities(&CancellationToken::new()).await;

    assert!(matches!(result, Err(SaveError::Conflict(_))));
    assert_eq!(persisted_order(&store, "o1").unwrap().total, 20);
}

#[tokio::test]
async fn failed_dispatch_rolls_back_the_flush() {
    let store = inmemory::Store::new();
    seed_order(&store, "o1", 10).await;

    let loaded = persisted_order(&store, "o1").unwrap();
    let original = loaded.clone();
    let mut updated = loaded;
    updated.total = 99;
    updated.touch();

    let mut handlers = savepoint::HandlerRegistry::new();
    handlers.register::<OrderTouched, _>(FailingHandler);

    let sink = RecordingSink::new();
    let mut uow = UnitOfWork::new(store.clone())
        .with_handlers(Arc::new(handlers))
        .with_diagnostics(Arc::new(sink.clone()));
    uow.changes().update(original, updated);

    let error = uow
        .save_entities(&CancellationToken::new())
        .await
        .unwrap_err();
    match error {
        SaveError::Handler { kind, source } => {
            assert_eq!(kind, "order-touched");
            assert_eq!(source.to_string(), "handler refused the event");
        }
        other => panic!("expected handler error, got {other}"),
    }

    // The flushed change was rolled back entirely: no partial commit.
    let persisted = persisted_order(&store, "o1").unwrap();
    assert_eq!(persisted.total, 10);
    assert_eq!(persisted.version, RowVersion::new(0));

    assert_eq!(sink.count(names::TRANSACTION_BEGIN), 1);
    assert_eq!(sink.count(names::TRANSACTION_COMMIT), 0);
    assert_eq!(sink.count(names::TRANSACTION_ROLLBACK), 1);
}

#[tokio::test]
async fn cancelled_save_never_leaves_a_transaction_open() {
    let store = inmemory::Store::new();
    let sink = RecordingSink::new();
    let mut uow = UnitOfWork::new(store.clone()).with_diagnostics(Arc::new(sink.clone()));
    uow.changes().add(Order::new("o1", 10));

    let cancellation = CancellationToken::new();
    cancellation.cancel();

    let result = uow.save_entities(&cancellation).await;
    assert!(matches!(result, Err(SaveError::Cancelled)));

    assert!(persisted_order(&store, "o1").is_none());
    assert_eq!(uow.current_transaction(), None);
    assert_eq!(sink.count(names::TRANSACTION_BEGIN), 1);
    assert_eq!(sink.count(names::TRANSACTION_ROLLBACK), 1);
    assert_eq!(sink.count(names::TRANSACTION_COMMIT), 0);
}

#[tokio::test]
async fn explicit_transaction_spans_multiple_saves() {
    let store = inmemory::Store::new();
    let sink = RecordingSink::new();
    let mut uow = UnitOfWork::new(store.clone()).with_diagnostics(Arc::new(sink.clone()));
    let cancellation = CancellationToken::new();

    uow.begin_transaction().await.unwrap();

    uow.changes().add(Order::new("o1", 10));
    uow.save_entities(&cancellation).await.unwrap();

    uow.changes().add(Order::new("o2", 20));
    uow.save_entities(&cancellation).await.unwrap();

    // Nothing is visible until the owner commits.
    assert!(persisted_order(&store, "o1").is_none());
    assert!(persisted_order(&store, "o2").is_none());

    uow.commit().await.unwrap();
    assert!(persisted_order(&store, "o1").is_some());
    assert!(persisted_order(&store, "o2").is_some());

    assert_eq!(sink.count(names::TRANSACTION_BEGIN), 1);
    assert_eq!(sink.count(names::TRANSACTION_COMMIT), 1);
}

#[tokio::test]
async fn deleting_an_order_removes_the_row() {
    let store = inmemory::Store::new();
    seed_order(&store, "o1", 10).await;

    let loaded = persisted_order(&store, "o1").unwrap();
    let mut uow = UnitOfWork::new(store.clone());
    uow.changes().remove(loaded);
    uow.save_entities(&CancellationToken::new()).await.unwrap();

    assert!(persisted_order(&store, "o1").is_none());
}

#[tokio::test]
async fn save_without_raised_events_dispatches_nothing() {
    let store = inmemory::Store::new();
    seed_order(&store, "o1", 10).await;

    let loaded = persisted_order(&store, "o1").unwrap();
    let original = loaded.clone();
    let mut updated = loaded;
    updated.total = 11;

    // A failing handler is registered, but no event is raised, so the save
    // must succeed.
    let mut handlers = savepoint::HandlerRegistry::new();
    handlers.register::<OrderTouched, _>(FailingHandler);

    let mut uow = UnitOfWork::new(store.clone()).with_handlers(Arc::new(handlers));
    uow.changes().update(original, updated);
    assert!(uow.save_entities(&CancellationToken::new()).await.unwrap());
    assert_eq!(persisted_order(&store, "o1").unwrap().total, 11);
}
