//! In-process pub/sub for usage events and the async recording consumers.
//!
//! The hot path publishes exactly one event per request and never waits:
//! publish is a bounded `try_send`, and overflow drops the event with a
//! counted metric. A pool of consumer workers drains the topic and performs
//! the slow work (spend recording, token debit, persistence, telemetry).
//! Nothing a consumer does can fail a client response.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::core::database::{EventEntity, Store};
use crate::core::metrics::get_metrics;
use crate::core::redis_store::CounterStore;
use crate::core::telemetry;
use crate::services::validator::{cost_key, token_key, window_bucket};

/// Topic the request pipeline publishes to.
pub const EVENT_TOPIC: &str = "event";

/// Full accounting state of one finished request.
#[derive(Debug, Clone)]
pub struct UsageEvent {
    pub correlation_id: String,
    pub key_id: String,
    pub path: String,
    pub provider: String,
    pub model: String,
    pub status_code: u16,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub cost_micro_usd: Option<i64>,
    pub unknown_model_price: bool,
    pub latency_ms: i64,
    /// Error tag for rejected/cancelled/failed outcomes.
    pub error_tag: Option<String>,
    /// Token window to debit, carried from the key's rate-limit spec.
    pub token_window_secs: Option<u64>,
    /// Spend window to accumulate into, carried from the key's cost limit.
    pub cost_window_secs: Option<u64>,
    pub created_at: DateTime<Utc>,
}

impl UsageEvent {
    pub fn into_entity(self) -> EventEntity {
        EventEntity {
            event_id: uuid::Uuid::new_v4().to_string(),
            correlation_id: self.correlation_id,
            key_id: self.key_id,
            path: self.path,
            provider: self.provider,
            model: self.model,
            status_code: self.status_code as i32,
            prompt_tokens: self.prompt_tokens,
            completion_tokens: self.completion_tokens,
            cost_micro_usd: self.cost_micro_usd,
            unknown_model_price: self.unknown_model_price,
            latency_ms: self.latency_ms,
            error_tag: self.error_tag,
            created_at: self.created_at,
        }
    }
}

/// Persistence seam for handled events.
#[async_trait]
pub trait EventStore: Send + Sync {
    async fn persist(&self, event: EventEntity) -> anyhow::Result<()>;
}

#[async_trait]
impl EventStore for Store {
    async fn persist(&self, event: EventEntity) -> anyhow::Result<()> {
        self.insert_event(&event).await?;
        Ok(())
    }
}

/// Collects events in memory; used by tests and dry-run deployments.
#[derive(Default)]
pub struct MemoryEventStore {
    events: Mutex<Vec<EventEntity>>,
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn drain(&self) -> Vec<EventEntity> {
        std::mem::take(&mut self.events.lock().expect("event store lock poisoned"))
    }

    pub fn len(&self) -> usize {
        self.events.lock().expect("event store lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn persist(&self, event: EventEntity) -> anyhow::Result<()> {
        self.events
            .lock()
            .expect("event store lock poisoned")
            .push(event);
        Ok(())
    }
}

/// Named-topic bus with bounded buffers.
pub struct EventBus {
    topics: DashMap<String, mpsc::Sender<UsageEvent>>,
    buffer: usize,
}

impl EventBus {
    pub fn new(buffer: usize) -> Self {
        Self {
            topics: DashMap::new(),
            buffer: buffer.max(1),
        }
    }

    /// Create the receiving side of a topic. One receiver per topic; a
    /// second subscribe replaces the sender and orphans the old receiver.
    pub fn subscribe(&self, topic: &str) -> mpsc::Receiver<UsageEvent> {
        let (tx, rx) = mpsc::channel(self.buffer);
        self.topics.insert(topic.to_string(), tx);
        rx
    }

    /// Non-blocking publish. Overflow and missing subscribers drop the
    /// event and bump the drop counter.
    pub fn publish(&self, topic: &str, event: UsageEvent) {
        let delivered = match self.topics.get(topic) {
            Some(sender) => sender.try_send(event).is_ok(),
            None => false,
        };
        if !delivered {
            get_metrics().events_dropped.with_label_values(&[topic]).inc();
            debug!(topic, "event dropped: bus full or no consumer");
        }
    }
}

/// What the consumers do with each event.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: UsageEvent) -> anyhow::Result<()>;
}

/// Production handler: spend recording, token debit, persistence,
/// telemetry.
pub struct RecordingHandler {
    cost_store: Arc<dyn CounterStore>,
    rate_store: Arc<dyn CounterStore>,
    /// Durable spend accumulation, independent of any cost limit.
    ledger_store: Option<Arc<dyn CounterStore>>,
    events: Arc<dyn EventStore>,
}

/// Retention for ledger keys. Reporting reads them well after the request.
const LEDGER_TTL: Duration = Duration::from_secs(30 * 24 * 3600);

impl RecordingHandler {
    pub fn new(
        cost_store: Arc<dyn CounterStore>,
        rate_store: Arc<dyn CounterStore>,
        events: Arc<dyn EventStore>,
    ) -> Self {
        Self {
            cost_store,
            rate_store,
            ledger_store: None,
            events,
        }
    }

    pub fn with_ledger(mut self, ledger_store: Arc<dyn CounterStore>) -> Self {
        self.ledger_store = Some(ledger_store);
        self
    }
}

#[async_trait]
impl EventHandler for RecordingHandler {
    async fn handle(&self, event: UsageEvent) -> anyhow::Result<()> {
        let now_unix = event.created_at.timestamp();

        // Spend accumulates into the key's cost window bucket. This is the
        // only place spend is recorded; admission reads it.
        if let Some(cost) = event.cost_micro_usd.filter(|c| *c > 0) {
            if let Some(window_secs) = event.cost_window_secs {
                let bucket = window_bucket(now_unix, window_secs);
                let key = cost_key(&event.key_id, window_secs, bucket);
                if let Err(e) = self
                    .cost_store
                    .increment_by(&key, cost, Duration::from_secs(window_secs.max(1)))
                    .await
                {
                    warn!(error = %e, "failed to record spend");
                }
            }
            if let Some(ledger) = &self.ledger_store {
                let key = format!("spend:{}", event.key_id);
                if let Err(e) = ledger.increment_by(&key, cost, LEDGER_TTL).await {
                    warn!(error = %e, "failed to record spend ledger");
                }
            }
        }

        // Token windows debit after the fact; admission sees this on the
        // next request (documented one-request lag).
        if let Some(window_secs) = event.token_window_secs {
            let total_tokens = event.prompt_tokens + event.completion_tokens;
            if total_tokens > 0 {
                let bucket = window_bucket(now_unix, window_secs);
                let key = token_key(&event.key_id, window_secs, bucket);
                if let Err(e) = self
                    .rate_store
                    .increment_by(&key, total_tokens, Duration::from_secs(window_secs.max(1)))
                    .await
                {
                    warn!(error = %e, "failed to debit token window");
                }
            }
        }

        let metrics = get_metrics();
        metrics
            .token_usage
            .with_label_values(&[event.provider.as_str(), event.model.as_str(), "prompt"])
            .inc_by(event.prompt_tokens.max(0) as u64);
        metrics
            .token_usage
            .with_label_values(&[event.provider.as_str(), event.model.as_str(), "completion"])
            .inc_by(event.completion_tokens.max(0) as u64);
        telemetry::incr("gateway.events.handled", 1);
        telemetry::timing(
            "gateway.request.latency",
            Duration::from_millis(event.latency_ms.max(0) as u64),
        );

        self.events.persist(event.into_entity()).await
    }
}

/// Pool of workers draining one topic.
pub struct EventConsumer {
    receiver: Arc<tokio::sync::Mutex<mpsc::Receiver<UsageEvent>>>,
    handler: Arc<dyn EventHandler>,
    workers: usize,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl EventConsumer {
    pub fn new(
        receiver: mpsc::Receiver<UsageEvent>,
        handler: Arc<dyn EventHandler>,
        workers: usize,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            receiver: Arc::new(tokio::sync::Mutex::new(receiver)),
            handler,
            workers: workers.max(1),
            shutdown_tx,
            shutdown_rx,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Spawn the worker pool. Events are handled concurrently; ordering
    /// between events is not guaranteed.
    pub fn start(&self) {
        let mut tasks = self.tasks.lock().expect("consumer task lock poisoned");
        if !tasks.is_empty() {
            return;
        }
        for worker_id in 0..self.workers {
            let receiver = self.receiver.clone();
            let handler = self.handler.clone();
            let mut shutdown = self.shutdown_rx.clone();
            tasks.push(tokio::spawn(async move {
                loop {
                    let event = tokio::select! {
                        _ = shutdown.changed() => break,
                        event = async { receiver.lock().await.recv().await } => event,
                    };
                    match event {
                        Some(event) => {
                            if let Err(e) = handler.handle(event).await {
                                warn!(worker_id, error = %e, "event handler failed");
                            }
                        }
                        None => break,
                    }
                }
                // Shutdown: drain whatever is still queued.
                loop {
                    let next = receiver.lock().await.try_recv();
                    match next {
                        Ok(event) => {
                            if let Err(e) = handler.handle(event).await {
                                warn!(worker_id, error = %e, "event handler failed during drain");
                            }
                        }
                        Err(_) => break,
                    }
                }
            }));
        }
    }

    /// Signal shutdown and wait for the drain, bounded by `deadline`.
    pub async fn stop(&self, deadline: Duration) {
        let _ = self.shutdown_tx.send(true);
        let tasks = std::mem::take(&mut *self.tasks.lock().expect("consumer task lock poisoned"));
        for task in tasks {
            if tokio::time::timeout(deadline, task).await.is_err() {
                warn!("event consumer did not drain within the deadline");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_event(correlation_id: &str) -> UsageEvent {
        UsageEvent {
            correlation_id: correlation_id.to_string(),
            key_id: "k1".to_string(),
            path: "/v1/chat/completions".to_string(),
            provider: "openai".to_string(),
            model: "gpt-4".to_string(),
            status_code: 200,
            prompt_tokens: 2,
            completion_tokens: 1,
            cost_micro_usd: Some(120),
            unknown_model_price: false,
            latency_ms: 42,
            error_tag: None,
            token_window_secs: Some(60),
            cost_window_secs: Some(3600),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_publish_and_consume_one_event() {
        let bus = EventBus::new(16);
        let receiver = bus.subscribe(EVENT_TOPIC);

        let cost_store = Arc::new(crate::core::redis_store::MemoryCounterStore::new());
        let rate_store = Arc::new(crate::core::redis_store::MemoryCounterStore::new());
        let events = Arc::new(MemoryEventStore::new());
        let handler = Arc::new(RecordingHandler::new(
            cost_store.clone(),
            rate_store.clone(),
            events.clone(),
        ));
        let consumer = EventConsumer::new(receiver, handler, 4);
        consumer.start();

        bus.publish(EVENT_TOPIC, sample_event("c1"));

        tokio::time::sleep(Duration::from_millis(100)).await;
        consumer.stop(Duration::from_secs(1)).await;

        let persisted = events.drain();
        assert_eq!(persisted.len(), 1);
        assert_eq!(persisted[0].correlation_id, "c1");
        assert_eq!(persisted[0].cost_micro_usd, Some(120));

        // Spend landed in the cost bucket and tokens were debited.
        let now = Utc::now().timestamp();
        let spend = cost_store
            .get(&cost_key("k1", 3600, window_bucket(now, 3600)))
            .await
            .unwrap();
        assert_eq!(spend, 120);
        let tokens = rate_store
            .get(&token_key("k1", 60, window_bucket(now, 60)))
            .await
            .unwrap();
        assert_eq!(tokens, 3);
    }

    #[tokio::test]
    async fn test_publish_without_subscriber_drops() {
        let bus = EventBus::new(4);
        // No subscribe call: publish must not block or panic.
        bus.publish(EVENT_TOPIC, sample_event("c1"));
    }

    #[tokio::test]
    async fn test_overflow_drops_and_counts() {
        let bus = EventBus::new(2);
        let _receiver = bus.subscribe(EVENT_TOPIC);
        let before = get_metrics()
            .events_dropped
            .with_label_values(&[EVENT_TOPIC])
            .get();
        // No consumer running: the third publish overflows the buffer.
        bus.publish(EVENT_TOPIC, sample_event("c1"));
        bus.publish(EVENT_TOPIC, sample_event("c2"));
        bus.publish(EVENT_TOPIC, sample_event("c3"));
        let after = get_metrics()
            .events_dropped
            .with_label_values(&[EVENT_TOPIC])
            .get();
        assert_eq!(after - before, 1);
    }

    #[tokio::test]
    async fn test_stop_drains_queued_events() {
        let bus = EventBus::new(64);
        let receiver = bus.subscribe(EVENT_TOPIC);
        let events = Arc::new(MemoryEventStore::new());
        let handler = Arc::new(RecordingHandler::new(
            Arc::new(crate::core::redis_store::MemoryCounterStore::new()),
            Arc::new(crate::core::redis_store::MemoryCounterStore::new()),
            events.clone(),
        ));
        let consumer = EventConsumer::new(receiver, handler, 2);

        for i in 0..10 {
            bus.publish(EVENT_TOPIC, sample_event(&format!("c{}", i)));
        }
        // Start after publishing so stop() must drain the backlog.
        consumer.start();
        consumer.stop(Duration::from_secs(2)).await;
        assert_eq!(events.len(), 10);
    }

    #[tokio::test]
    async fn test_unknown_price_event_persists_null_cost() {
        let events = Arc::new(MemoryEventStore::new());
        let handler = RecordingHandler::new(
            Arc::new(crate::core::redis_store::MemoryCounterStore::new()),
            Arc::new(crate::core::redis_store::MemoryCounterStore::new()),
            events.clone(),
        );
        let mut event = sample_event("c1");
        event.cost_micro_usd = None;
        event.unknown_model_price = true;
        handler.handle(event).await.unwrap();

        let persisted = events.drain();
        assert_eq!(persisted[0].cost_micro_usd, None);
        assert!(persisted[0].unknown_model_price);
    }
}
