//! Queue delivery tests
//!
//! Full consume / fail / retry cycles over the in-memory broker and an
//! in-memory SQLite retry store driven by a manual clock:
//! - Success leaves no retry record
//! - Failures are retried with the task name and an increasing retry count
//! - Exhausted retries become dead letters
//! - Several tasks share one topic

mod common;

use common::{memory_pool, wait_for, FlakyHandler, Mail};
use relayq::broker::{Broker, MemoryBroker};
use relayq::retry::{ManualClock, SqlRetryStore};
use relayq::{Envelope, Json, Queue, Serializer, Shutdown, TaskOptions};
use std::time::Duration;
use tokio::task::JoinHandle;

const WAIT: Duration = Duration::from_secs(5);

struct Harness {
    broker: MemoryBroker,
    clock: ManualClock,
    store: SqlRetryStore,
    shutdown: Shutdown,
    consumers: Vec<JoinHandle<relayq::Result<()>>>,
}

impl Harness {
    async fn new() -> Self {
        let clock = ManualClock::default();
        Self {
            broker: MemoryBroker::new(),
            store: SqlRetryStore::new(memory_pool().await).with_clock(clock.clone()),
            clock,
            shutdown: Shutdown::new(),
            consumers: Vec::new(),
        }
    }

    fn consume(&mut self, queue: &Queue<Mail>, task: &str) {
        let queue = queue.clone();
        let task = task.to_string();
        let shutdown = self.shutdown.clone();
        self.consumers
            .push(tokio::spawn(async move { queue.run_task(&task, &shutdown).await }));
    }

    async fn acked(&self, topic: &str, group: &str, count: usize) {
        let broker = self.broker.clone();
        wait_for(|| broker.acked(topic, group) >= count, WAIT)
            .await
            .unwrap();
    }

    async fn stop(self) {
        self.shutdown.trigger();
        for consumer in self.consumers {
            consumer.await.unwrap().unwrap();
        }
    }
}

fn stored(message: &[u8]) -> Envelope<serde_json::Value> {
    Json.decode(message).unwrap()
}

#[tokio::test]
async fn test_success_creates_no_retry_record() {
    let mut h = Harness::new().await;
    let handler = FlakyHandler::failing(0);
    let queue = Queue::<Mail>::define("email")
        .broker(h.broker.clone())
        .retry_store(h.store.clone())
        .add_task("send", handler.clone(), TaskOptions::new(2, 1))
        .build()
        .unwrap();

    h.consume(&queue, "send");
    queue.send(&Mail::to("a@b.com")).await.unwrap();
    h.acked("email", "send", 1).await;

    assert_eq!(handler.calls(), 1);
    assert!(queue.retries("send").await.unwrap().is_empty());
    assert_eq!(h.broker.pending("email", "send"), 0);
    h.stop().await;
}

#[tokio::test]
async fn test_two_failures_then_success() {
    let mut h = Harness::new().await;
    let handler = FlakyHandler::failing(2);
    let queue = Queue::<Mail>::define("email")
        .broker(h.broker.clone())
        .retry_store(h.store.clone())
        .add_task("send", handler.clone(), TaskOptions::new(2, 1))
        .build()
        .unwrap();

    h.consume(&queue, "send");
    queue.send(&Mail::to("a@b.com")).await.unwrap();

    // First failure
    h.acked("email", "send", 1).await;
    let records = queue.retries("send").await.unwrap();
    assert_eq!(records.len(), 1);
    assert!(!records[0].is_failed);
    assert_eq!(records[0].error, "Handler error: attempt 1 failed");
    let envelope = stored(&records[0].message);
    assert_eq!(envelope.task, "send");
    assert_eq!(envelope.retry_count, 1);

    // Not due yet
    assert_eq!(queue.run_retry_task("send").await.unwrap(), 0);

    // Second failure
    h.clock.advance(Duration::from_secs(2));
    assert_eq!(queue.run_retry_task("send").await.unwrap(), 1);
    h.acked("email", "send", 2).await;
    let records = queue.retries("send").await.unwrap();
    assert_eq!(records.len(), 1);
    assert!(!records[0].is_failed);
    assert_eq!(stored(&records[0].message).retry_count, 2);

    // Success
    h.clock.advance(Duration::from_secs(2));
    assert_eq!(queue.run_retry_task("send").await.unwrap(), 1);
    h.acked("email", "send", 3).await;
    assert!(queue.retries("send").await.unwrap().is_empty());

    let expected: Vec<(String, u32)> = (0..3).map(|n| ("a@b.com".to_string(), n)).collect();
    assert_eq!(handler.seen(), expected);
    assert_eq!(h.broker.len("email"), 3);
    h.stop().await;
}

#[tokio::test]
async fn test_exhausted_retries_become_dead_letter() {
    let mut h = Harness::new().await;
    let handler = FlakyHandler::always_failing();
    let queue = Queue::<Mail>::define("email")
        .broker(h.broker.clone())
        .retry_store(h.store.clone())
        .add_task("send", handler.clone(), TaskOptions::new(2, 1))
        .build()
        .unwrap();

    h.consume(&queue, "send");
    queue.send(&Mail::to("a@b.com")).await.unwrap();

    for attempt in 1..=3 {
        h.acked("email", "send", attempt).await;
        h.clock.advance(Duration::from_secs(2));
        queue.run_retry_task("send").await.unwrap();
    }

    let records = queue.retries("send").await.unwrap();
    assert_eq!(records.len(), 1);
    assert!(records[0].is_failed);
    assert_eq!(stored(&records[0].message).retry_count, 2);

    h.clock.advance(Duration::from_secs(3600));
    assert_eq!(queue.run_retry_task("send").await.unwrap(), 0);
    assert_eq!(handler.calls(), 3);
    assert_eq!(queue.retries("send").await.unwrap().len(), 1);
    h.stop().await;
}

#[tokio::test]
async fn test_unlimited_retries_never_escalate() {
    let mut h = Harness::new().await;
    let handler = FlakyHandler::always_failing();
    let queue = Queue::<Mail>::define("email")
        .broker(h.broker.clone())
        .retry_store(h.store.clone())
        .add_task("send", handler.clone(), TaskOptions::new(0, 1))
        .build()
        .unwrap();

    h.consume(&queue, "send");
    queue.send(&Mail::to("a@b.com")).await.unwrap();

    for attempt in 1..=5 {
        h.acked("email", "send", attempt).await;
        h.clock.advance(Duration::from_secs(2));
        queue.run_retry_task("send").await.unwrap();
    }
    h.acked("email", "send", 6).await;

    let records = queue.retries("send").await.unwrap();
    assert_eq!(records.len(), 1);
    assert!(!records[0].is_failed);
    assert_eq!(stored(&records[0].message).retry_count, 6);
    h.stop().await;
}

#[tokio::test]
async fn test_undecodable_message_goes_to_retry_store() {
    let mut h = Harness::new().await;
    let handler = FlakyHandler::failing(0);
    let queue = Queue::<Mail>::define("email")
        .broker(h.broker.clone())
        .retry_store(h.store.clone())
        .add_task("send", handler.clone(), TaskOptions::new(3, 1))
        .build()
        .unwrap();

    h.consume(&queue, "send");
    h.broker.produce("email", br#"{"data":42}"#).await.unwrap();
    h.acked("email", "send", 1).await;

    assert_eq!(handler.calls(), 0);
    let records = queue.retries("send").await.unwrap();
    assert_eq!(records.len(), 1);
    assert!(records[0].error.starts_with("Serialization error"));
    let envelope = stored(&records[0].message);
    assert_eq!(envelope.task, "send");
    assert_eq!(envelope.retry_count, 1);
    assert_eq!(envelope.data, 42);
    h.stop().await;
}

#[tokio::test]
async fn test_tasks_share_a_topic() {
    let mut h = Harness::new().await;
    let welcome = FlakyHandler::failing(1);
    let audit = FlakyHandler::failing(0);
    let queue = Queue::<Mail>::define("users")
        .broker(h.broker.clone())
        .retry_store(h.store.clone())
        .add_task("welcome", welcome.clone(), TaskOptions::new(3, 1))
        .add_task("audit", audit.clone(), TaskOptions::new(3, 1))
        .build()
        .unwrap();

    h.consume(&queue, "welcome");
    h.consume(&queue, "audit");

    // Unaddressed: both tasks handle it
    queue.send(&Mail::to("a@b.com")).await.unwrap();
    h.acked("users", "welcome", 1).await;
    h.acked("users", "audit", 1).await;
    assert_eq!(welcome.calls(), 1);
    assert_eq!(audit.calls(), 1);
    assert_eq!(queue.retries("welcome").await.unwrap().len(), 1);
    assert!(queue.retries("audit").await.unwrap().is_empty());

    // The retry is addressed to welcome only
    h.clock.advance(Duration::from_secs(2));
    assert_eq!(queue.run_retry_task("welcome").await.unwrap(), 1);
    h.acked("users", "welcome", 2).await;
    h.acked("users", "audit", 2).await;
    assert_eq!(welcome.calls(), 2);
    assert_eq!(audit.calls(), 1);

    // Addressed send
    queue.send_task("audit", &Mail::to("c@d.com")).await.unwrap();
    h.acked("users", "welcome", 3).await;
    h.acked("users", "audit", 3).await;
    assert_eq!(welcome.calls(), 2);
    assert_eq!(audit.calls(), 2);

    assert!(queue.retries("welcome").await.unwrap().is_empty());
    h.stop().await;
}

#[tokio::test]
async fn test_send_round_trip() {
    let broker = MemoryBroker::new();
    let queue = Queue::<Mail>::define("email")
        .broker(broker.clone())
        .retry_store(SqlRetryStore::new(memory_pool().await))
        .add_task("send", FlakyHandler::default(), TaskOptions::default())
        .build()
        .unwrap();

    queue.send(&Mail::to("a@b.com")).await.unwrap();

    let envelope: Envelope<Mail> = Json.decode(&broker.messages("email")[0]).unwrap();
    assert_eq!(envelope.task, "");
    assert_eq!(envelope.retry_count, 0);
    assert_eq!(envelope.data, Mail::to("a@b.com"));
}

#[tokio::test]
async fn test_consumer_stops_on_shutdown() {
    let mut h = Harness::new().await;
    let queue = Queue::<Mail>::define("email")
        .broker(h.broker.clone())
        .retry_store(h.store.clone())
        .add_task("send", FlakyHandler::default(), TaskOptions::default())
        .build()
        .unwrap();

    h.consume(&queue, "send");
    tokio::time::sleep(Duration::from_millis(20)).await;
    tokio::time::timeout(WAIT, h.stop()).await.unwrap();
}
