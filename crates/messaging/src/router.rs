//! Typed dispatch of inbound bus messages.
//!
//! The router decodes each message into an [`EventEnvelope`] and calls the
//! handler method for the populated variant. Undecodable messages are logged
//! and committed past. Handler failures are retried within the router's
//! budget; a message that still fails is recorded as a dead letter so the
//! partition can keep moving.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::EventId;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::bus::{BrokerMessage, EventBus, PartitionStream};
use crate::events::{
    EventEnvelope, OrderCreated, PaymentFailed, PaymentSucceeded, ReservationFailed,
    ReservationSucceeded, SagaEvent,
};
use crate::retry::RetryPolicy;
use crate::BusError;

/// What a handler did with an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// State changed.
    Applied,
    /// The event had already been applied; nothing changed.
    Duplicate,
    /// The handler does not care about this event.
    Ignored,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HandlerError {
    /// Worth retrying (database hiccup, lock timeout, ...).
    #[error("Transient handler failure: {0}")]
    Transient(String),

    /// Retrying will not help.
    #[error("Permanent handler failure: {0}")]
    Permanent(String),
}

pub type HandlerResult = Result<Disposition, HandlerError>;

/// Metadata of the envelope being handled.
#[derive(Debug, Clone, Copy)]
pub struct EventContext {
    pub event_id: EventId,
    pub occurred_at: DateTime<Utc>,
}

/// Per-variant callbacks. Unimplemented variants are ignored.
///
/// Implementations must be idempotent: the bus delivers at least once.
#[async_trait]
pub trait SagaEventHandler: Send + Sync {
    async fn on_order_created(&self, _ctx: EventContext, _event: &OrderCreated) -> HandlerResult {
        Ok(Disposition::Ignored)
    }

    async fn on_reservation_succeeded(
        &self,
        _ctx: EventContext,
        _event: &ReservationSucceeded,
    ) -> HandlerResult {
        Ok(Disposition::Ignored)
    }

    async fn on_reservation_failed(
        &self,
        _ctx: EventContext,
        _event: &ReservationFailed,
    ) -> HandlerResult {
        Ok(Disposition::Ignored)
    }

    async fn on_payment_succeeded(
        &self,
        _ctx: EventContext,
        _event: &PaymentSucceeded,
    ) -> HandlerResult {
        Ok(Disposition::Ignored)
    }

    async fn on_payment_failed(&self, _ctx: EventContext, _event: &PaymentFailed) -> HandlerResult {
        Ok(Disposition::Ignored)
    }
}

/// Dead letters kept per router before the oldest are discarded.
pub const DEFAULT_DEAD_LETTER_CAPACITY: usize = 1024;

/// A message that could not be handled within the retry budget.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetter {
    pub topic: String,
    pub partition: u32,
    pub offset: u64,
    pub event_id: EventId,
    pub event_type: &'static str,
    pub error: HandlerError,
}

/// Result of routing a single message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    Handled(Disposition),
    /// The payload was not a decodable envelope with a known variant.
    Dropped,
    DeadLettered,
}

#[derive(Clone)]
pub struct EventRouter {
    name: &'static str,
    handler: Arc<dyn SagaEventHandler>,
    retry: RetryPolicy,
    dead_letters: Arc<Mutex<VecDeque<DeadLetter>>>,
    dead_letter_capacity: usize,
}

impl EventRouter {
    pub fn new(name: &'static str, handler: Arc<dyn SagaEventHandler>, retry: RetryPolicy) -> Self {
        Self {
            name,
            handler,
            retry,
            dead_letters: Arc::new(Mutex::new(VecDeque::new())),
            dead_letter_capacity: DEFAULT_DEAD_LETTER_CAPACITY,
        }
    }

    /// Keeps at most `capacity` dead letters, dropping the oldest first.
    pub fn with_dead_letter_capacity(mut self, capacity: usize) -> Self {
        self.dead_letter_capacity = capacity.max(1);
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Messages that exhausted the retry budget, oldest first.
    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.dead_letters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    fn record_dead_letter(&self, dead_letter: DeadLetter) {
        let mut dead_letters = self.dead_letters.lock().unwrap_or_else(|e| e.into_inner());
        while dead_letters.len() >= self.dead_letter_capacity {
            if let Some(evicted) = dead_letters.pop_front() {
                metrics::counter!("router_dead_letters_evicted_total", "router" => self.name)
                    .increment(1);
                tracing::warn!(
                    event_id = %evicted.event_id,
                    event_type = evicted.event_type,
                    "dead letter capacity reached, discarding oldest"
                );
            }
        }
        dead_letters.push_back(dead_letter);
    }

    /// Decodes and dispatches one message.
    #[tracing::instrument(
        skip(self, message),
        fields(router = self.name, topic = %message.topic, partition = message.partition, offset = message.offset)
    )]
    pub async fn route(&self, message: &BrokerMessage) -> RouteOutcome {
        let envelope = match EventEnvelope::decode(&message.payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(error = %e, "dropping undecodable message");
                metrics::counter!("router_dropped_total", "router" => self.name).increment(1);
                return RouteOutcome::Dropped;
            }
        };

        let event_type = envelope.event.event_type();
        let ctx = EventContext {
            event_id: envelope.event_id,
            occurred_at: envelope.occurred_at,
        };

        let result = self
            .retry
            .run(
                "handle_event",
                |e: &HandlerError| matches!(e, HandlerError::Transient(_)),
                || self.dispatch(ctx, &envelope.event),
            )
            .await;

        match result {
            Ok(disposition) => {
                metrics::counter!(
                    "router_events_total",
                    "router" => self.name,
                    "variant" => event_type
                )
                .increment(1);
                match disposition {
                    Disposition::Ignored => {
                        tracing::debug!(event_type, "event not handled by this router")
                    }
                    Disposition::Duplicate => {
                        tracing::info!(event_type, event_id = %ctx.event_id, "duplicate event, no-op")
                    }
                    Disposition::Applied => {
                        tracing::debug!(event_type, event_id = %ctx.event_id, "event applied")
                    }
                }
                RouteOutcome::Handled(disposition)
            }
            Err(error) => {
                metrics::counter!("router_dead_letters_total", "router" => self.name).increment(1);
                tracing::error!(
                    event_type,
                    event_id = %ctx.event_id,
                    order_id = %envelope.event.order_id(),
                    error = %error,
                    "handler failed after retries, dead-lettering event"
                );
                self.record_dead_letter(DeadLetter {
                    topic: message.topic.clone(),
                    partition: message.partition,
                    offset: message.offset,
                    event_id: ctx.event_id,
                    event_type,
                    error,
                });
                RouteOutcome::DeadLettered
            }
        }
    }

    async fn dispatch(&self, ctx: EventContext, event: &SagaEvent) -> HandlerResult {
        match event {
            SagaEvent::OrderCreated(e) => self.handler.on_order_created(ctx, e).await,
            SagaEvent::InventoryReservationSucceeded(e) => {
                self.handler.on_reservation_succeeded(ctx, e).await
            }
            SagaEvent::InventoryReservationFailed(e) => {
                self.handler.on_reservation_failed(ctx, e).await
            }
            SagaEvent::PaymentSucceeded(e) => self.handler.on_payment_succeeded(ctx, e).await,
            SagaEvent::PaymentFailed(e) => self.handler.on_payment_failed(ctx, e).await,
        }
    }

    /// Subscribes `group` to every topic and spawns one sequential worker per
    /// partition. Workers exit when the bus closes or `shutdown` flips.
    pub async fn start(
        &self,
        bus: &dyn EventBus,
        topics: &[&str],
        group: &str,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Vec<JoinHandle<()>>, BusError> {
        let mut workers = Vec::new();
        for topic in topics {
            for stream in bus.subscribe(topic, group).await? {
                let router = self.clone();
                let shutdown = shutdown.clone();
                workers.push(tokio::spawn(router.consume(stream, shutdown)));
            }
        }
        tracing::info!(router = self.name, group, ?topics, workers = workers.len(), "router started");
        Ok(workers)
    }

    async fn consume(self, mut stream: Box<dyn PartitionStream>, mut shutdown: watch::Receiver<bool>) {
        loop {
            let message = tokio::select! {
                message = stream.next() => message,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            };
            let Some(message) = message else { break };

            self.route(&message).await;
            if let Err(e) = stream.commit(message.offset).await {
                tracing::warn!(
                    router = self.name,
                    topic = stream.topic(),
                    partition = stream.partition(),
                    error = %e,
                    "offset commit failed"
                );
            }
        }
        tracing::debug!(router = self.name, topic = stream.topic(), partition = stream.partition(), "partition worker stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{InMemoryEventBus, OutgoingMessage};
    use crate::events::{INVENTORY_EVENTS, PAYMENT_EVENTS};
    use common::OrderId;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<String>>,
        transient_failures: AtomicU32,
    }

    #[async_trait]
    impl SagaEventHandler for Recorder {
        async fn on_payment_succeeded(
            &self,
            _ctx: EventContext,
            event: &PaymentSucceeded,
        ) -> HandlerResult {
            if self.transient_failures.load(Ordering::SeqCst) > 0 {
                self.transient_failures.fetch_sub(1, Ordering::SeqCst);
                return Err(HandlerError::Transient("db busy".into()));
            }
            let mut seen = self.seen.lock().unwrap();
            if seen.contains(&event.order_id.to_string()) {
                return Ok(Disposition::Duplicate);
            }
            seen.push(event.order_id.to_string());
            Ok(Disposition::Applied)
        }

        async fn on_payment_failed(&self, _ctx: EventContext, _event: &PaymentFailed) -> HandlerResult {
            Err(HandlerError::Permanent("cannot apply".into()))
        }
    }

    fn broker_message(event: SagaEvent) -> BrokerMessage {
        BrokerMessage {
            topic: event.topic().to_string(),
            partition: 0,
            offset: 0,
            key: event.order_id().to_string(),
            payload: EventEnvelope::new(event).encode().unwrap(),
            headers: HashMap::new(),
        }
    }

    fn router(handler: Arc<Recorder>) -> EventRouter {
        EventRouter::new("test", handler, RetryPolicy::new(3, Duration::from_millis(1)))
    }

    #[tokio::test]
    async fn dispatches_by_variant() {
        let handler = Arc::new(Recorder::default());
        let router = router(handler.clone());

        let outcome = router
            .route(&broker_message(SagaEvent::payment_succeeded(OrderId::new("o-1"))))
            .await;

        assert_eq!(outcome, RouteOutcome::Handled(Disposition::Applied));
        assert_eq!(*handler.seen.lock().unwrap(), vec!["o-1".to_string()]);
    }

    #[tokio::test]
    async fn variant_wins_over_topic() {
        let handler = Arc::new(Recorder::default());
        let router = router(handler.clone());
        let mut message = broker_message(SagaEvent::payment_succeeded(OrderId::new("o-1")));
        message.topic = INVENTORY_EVENTS.to_string();

        assert_eq!(
            router.route(&message).await,
            RouteOutcome::Handled(Disposition::Applied)
        );
    }

    #[tokio::test]
    async fn unhandled_variant_is_ignored() {
        let router = router(Arc::new(Recorder::default()));
        let outcome = router
            .route(&broker_message(SagaEvent::reservation_succeeded(OrderId::new("o-1"))))
            .await;
        assert_eq!(outcome, RouteOutcome::Handled(Disposition::Ignored));
    }

    #[tokio::test]
    async fn redelivery_is_reported_as_duplicate() {
        let router = router(Arc::new(Recorder::default()));
        let message = broker_message(SagaEvent::payment_succeeded(OrderId::new("o-1")));

        router.route(&message).await;
        assert_eq!(
            router.route(&message).await,
            RouteOutcome::Handled(Disposition::Duplicate)
        );
    }

    #[tokio::test]
    async fn garbage_is_dropped() {
        let router = router(Arc::new(Recorder::default()));
        let mut message = broker_message(SagaEvent::payment_succeeded(OrderId::new("o-1")));
        message.payload = b"{}".to_vec();

        assert_eq!(router.route(&message).await, RouteOutcome::Dropped);
        assert!(router.dead_letters().is_empty());
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let handler = Arc::new(Recorder::default());
        handler.transient_failures.store(2, Ordering::SeqCst);
        let router = router(handler.clone());

        let outcome = router
            .route(&broker_message(SagaEvent::payment_succeeded(OrderId::new("o-1"))))
            .await;

        assert_eq!(outcome, RouteOutcome::Handled(Disposition::Applied));
    }

    #[tokio::test]
    async fn permanent_failure_is_dead_lettered() {
        let router = router(Arc::new(Recorder::default()));
        let outcome = router
            .route(&broker_message(SagaEvent::payment_failed(OrderId::new("o-1"))))
            .await;

        assert_eq!(outcome, RouteOutcome::DeadLettered);
        let dead = router.dead_letters();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].event_type, "PaymentFailed");
    }

    #[tokio::test]
    async fn dead_letters_keep_the_newest() {
        let router = router(Arc::new(Recorder::default())).with_dead_letter_capacity(2);
        for (offset, id) in ["o-1", "o-2", "o-3"].into_iter().enumerate() {
            let mut message = broker_message(SagaEvent::payment_failed(OrderId::new(id)));
            message.offset = offset as u64;
            assert_eq!(router.route(&message).await, RouteOutcome::DeadLettered);
        }

        let offsets: Vec<u64> = router.dead_letters().iter().map(|d| d.offset).collect();
        assert_eq!(offsets, vec![1, 2]);
    }

    #[tokio::test]
    async fn workers_consume_from_the_bus() {
        let bus = InMemoryEventBus::new(2);
        let handler = Arc::new(Recorder::default());
        let router = router(handler.clone());
        let (tx, rx) = watch::channel(false);

        let workers = router
            .start(&bus, &[PAYMENT_EVENTS], "order-service", rx)
            .await
            .unwrap();
        assert_eq!(workers.len(), 2);

        for id in ["o-1", "o-2", "o-3"] {
            let event = SagaEvent::payment_succeeded(OrderId::new(id));
            bus.publish(OutgoingMessage {
                topic: PAYMENT_EVENTS.to_string(),
                key: id.to_string(),
                payload: EventEnvelope::new(event).encode().unwrap(),
                headers: HashMap::new(),
            })
            .await
            .unwrap();
        }

        tokio::time::timeout(Duration::from_secs(1), async {
            while handler.seen.lock().unwrap().len() < 3 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("all events should be handled");

        tx.send(true).unwrap();
        for worker in workers {
            worker.await.unwrap();
        }
    }
}
