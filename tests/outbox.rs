//! Integration tests for integration-event conversion and outbox publication.

use std::sync::{Arc, Mutex};

use savepoint::{
    async_trait, diagnostics::names, storage::inmemory, BoxError, CancellationToken, DomainEvent,
    DomainEventHandler, DomainEvents, Entity, EventConverter, HandlerRegistry, IntegrationEvent,
    IntegrationEventConvert, IntegrationEventPublisher, OutboxMessage, PublishError, RowVersion,
    SaveContext, SaveError, TransactionalOutbox, UnitOfWork, UpdateTime,
};
use savepoint_core::test::{RecordingPublisher, RecordingSink};
use serde::{Deserialize, Serialize};

// ============================================================================
// Test Domain: Order
// ============================================================================

#[derive(Entity, Serialize, Deserialize, Clone)]
struct Order {
    id: String,
    paid: bool,
    version: RowVersion,
    updated_at: UpdateTime,
    #[serde(skip)]
    events: DomainEvents,
}

impl Order {
    fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            paid: false,
            version: RowVersion::new(0),
            updated_at: UpdateTime::now(),
            events: DomainEvents::new(),
        }
    }

    fn pay(&mut self) {
        self.paid = true;
        self.events.raise(OrderPaid {
            order_id: self.id.clone(),
        });
    }
}

#[derive(Clone)]
struct OrderPaid {
    order_id: String,
}

impl DomainEvent for OrderPaid {
    const KIND: &'static str = "order-paid";
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
struct OrderPaidIntegrationEvent {
    order_id: String,
}

impl IntegrationEvent for OrderPaidIntegrationEvent {
    const KIND: &'static str = "order-paid-integration";
}

#[derive(EventConverter)]
#[converter(event = OrderPaid)]
struct OrderPaidConverter;

impl IntegrationEventConvert<OrderPaid> for OrderPaidConverter {
    type Output = OrderPaidIntegrationEvent;

    fn convert(&self, event: &OrderPaid) -> Self::Output {
        OrderPaidIntegrationEvent {
            order_id: event.order_id.clone(),
        }
    }
}

// ============================================================================
// Helpers
// ============================================================================

async fn seed_order(store: &inmemory::Store, id: &str) {
    let mut uow = UnitOfWork::new(store.clone());
    uow.changes().add(Order::new(id));
    uow.save_entities(&CancellationToken::new())
        .await
        .expect("seeding should succeed");
}

fn paid_order_changes(uow: &mut UnitOfWork<inmemory::Store>, id: &str) {
    let mut order = Order::new(id);
    let original = order.clone();
    order.pay();
    uow.changes().update(original, order);
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn conversion_rule_publishes_exactly_once() {
    let store = inmemory::Store::new();
    seed_order(&store, "o1").await;

    let publisher = RecordingPublisher::new();
    let mut handlers = HandlerRegistry::new();
    handlers.register::<OrderPaid, _>(OrderPaidConverterHandler::new(
        OrderPaidConverter,
        publisher.clone(),
    ));

    let mut uow = UnitOfWork::new(store.clone()).with_handlers(Arc::new(handlers));
    paid_order_changes(&mut uow, "o1");

    assert!(uow.save_entities(&CancellationToken::new()).await.unwrap());

    let published = publisher.published();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].kind, "order-paid-integration");
    let event: OrderPaidIntegrationEvent = published[0].decode().unwrap();
    assert_eq!(
        event,
        OrderPaidIntegrationEvent {
            order_id: "o1".to_string()
        }
    );
}

/// Publisher that snapshots whether the entity row was already committed at
/// the moment of each publish.
#[derive(Clone)]
struct ProbePublisher {
    store: inmemory::Store,
    committed_at_publish: Arc<Mutex<Vec<bool>>>,
}

#[async_trait]
impl IntegrationEventPublisher for ProbePublisher {
    async fn publish(
        &self,
        _message: OutboxMessage,
        _cancellation: &CancellationToken,
    ) -> Result<(), PublishError> {
        let committed = self
            .store
            .row("order", "o1")
            .is_some_and(|row| row.version == Some(1));
        self.committed_at_publish.lock().unwrap().push(committed);
        Ok(())
    }
}

#[tokio::test]
async fn publish_happens_before_the_commit() {
    let store = inmemory::Store::new();
    seed_order(&store, "o1").await;

    let committed_at_publish = Arc::new(Mutex::new(Vec::new()));
    let probe = ProbePublisher {
        store: store.clone(),
        committed_at_publish: Arc::clone(&committed_at_publish),
    };
    let mut handlers = HandlerRegistry::new();
    handlers.register::<OrderPaid, _>(OrderPaidConverterHandler::new(OrderPaidConverter, probe));

    let mut uow = UnitOfWork::new(store.clone()).with_handlers(Arc::new(handlers));
    paid_order_changes(&mut uow, "o1");
    uow.save_entities(&CancellationToken::new()).await.unwrap();

    // The publish observed the pre-commit state; the commit happened after.
    assert_eq!(*committed_at_publish.lock().unwrap(), vec![false]);
    assert_eq!(store.row("order", "o1").unwrap().version, Some(1));
}

#[tokio::test]
async fn transactional_outbox_records_atomically_with_the_entity() {
    let store = inmemory::Store::new();
    seed_order(&store, "o1").await;

    let outbox = TransactionalOutbox::new(store.clone());
    let mut handlers = HandlerRegistry::new();
    handlers.register::<OrderPaid, _>(OrderPaidConverterHandler::new(
        OrderPaidConverter,
        outbox.clone(),
    ));

    let mut uow = UnitOfWork::new(store.clone())
        .with_handlers(Arc::new(handlers))
        .with_transactional_publisher(Arc::new(outbox.clone()));
    paid_order_changes(&mut uow, "o1");

    assert!(uow.save_entities(&CancellationToken::new()).await.unwrap());

    assert_eq!(store.row("order", "o1").unwrap().version, Some(1));
    let messages = store.outbox();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].kind, "order-paid-integration");
}

struct FailAfterConversion;

#[async_trait]
impl DomainEventHandler<OrderPaid> for FailAfterConversion {
    async fn handle(
        &self,
        _event: &OrderPaid,
        _context: &mut SaveContext<'_>,
        _cancellation: &CancellationToken,
    ) -> Result<(), BoxError> {
        Err("downstream handler failed".into())
    }
}

#[tokio::test]
async fn outbox_record_is_discarded_when_a_later_handler_fails() {
    let store = inmemory::Store::new();
    seed_order(&store, "o1").await;

    let outbox = TransactionalOutbox::new(store.clone());
    let mut handlers = HandlerRegistry::new();
    handlers.register::<OrderPaid, _>(OrderPaidConverterHandler::new(
        OrderPaidConverter,
        outbox.clone(),
    ));
    handlers.register::<OrderPaid, _>(FailAfterConversion);

    let mut uow = UnitOfWork::new(store.clone())
        .with_handlers(Arc::new(handlers))
        .with_transactional_publisher(Arc::new(outbox.clone()));
    paid_order_changes(&mut uow, "o1");

    let result = uow.save_entities(&CancellationToken::new()).await;
    assert!(matches!(result, Err(SaveError::Handler { .. })));

    // Neither the entity change nor the outbox record survived.
    assert_eq!(store.row("order", "o1").unwrap().version, Some(0));
    assert!(store.outbox().is_empty());
}

#[tokio::test]
async fn publish_failure_rolls_back_the_save_and_surfaces_the_original_error() {
    let store = inmemory::Store::new();
    seed_order(&store, "o1").await;

    let publisher = RecordingPublisher::new();
    publisher.fail_next_publish();

    let mut handlers = HandlerRegistry::new();
    handlers.register::<OrderPaid, _>(OrderPaidConverterHandler::new(
        OrderPaidConverter,
        publisher.clone(),
    ));

    let sink = RecordingSink::new();
    let mut uow = UnitOfWork::new(store.clone())
        .with_handlers(Arc::new(handlers))
        .with_diagnostics(Arc::new(sink.clone()));
    paid_order_changes(&mut uow, "o1");

    let error = uow
        .save_entities(&CancellationToken::new())
        .await
        .unwrap_err();
    match &error {
        SaveError::Handler { kind, source } => {
            assert_eq!(*kind, "order-paid");
            // The original publish failure is preserved in the source chain.
            let publish_error = source
                .downcast_ref::<PublishError>()
                .expect("source should be the publish error");
            assert!(matches!(publish_error, PublishError::Transport(_)));
        }
        other => panic!("expected handler error, got {other}"),
    }

    // The version remains at its pre-call value and nothing was published.
    assert_eq!(store.row("order", "o1").unwrap().version, Some(0));
    assert!(publisher.published().is_empty());
    assert_eq!(sink.count(names::TRANSACTION_ROLLBACK), 1);
    assert_eq!(sink.count(names::TRANSACTION_COMMIT), 0);
}
