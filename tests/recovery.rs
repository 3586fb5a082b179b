use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio_topicq::{
    BrokerEngine, DeadLetterPublisher, DeliveryError, EntryQueue, EntryState, FailureReport,
    MessageUnit, QueueProperties, QueuedEntry, SessionHook,
};

struct MockQueue {
    name: String,
    on_failure_dead_message: bool,
    entries: Mutex<Vec<QueuedEntry>>,
}

impl MockQueue {
    fn new(name: &str, on_failure_dead_message: bool, entries: Vec<QueuedEntry>) -> Arc<Self> {
        Arc::new(MockQueue {
            name: name.to_string(),
            on_failure_dead_message,
            entries: Mutex::new(entries),
        })
    }

    fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }
}

#[async_trait]
impl EntryQueue for MockQueue {
    async fn peek(&self, max_entries: usize, _max_bytes: usize) -> anyhow::Result<Vec<QueuedEntry>> {
        Ok(self
            .entries
            .lock()
            .unwrap()
            .iter()
            .take(max_entries)
            .cloned()
            .collect())
    }

    async fn remove_random(&self, entries: &[QueuedEntry]) -> anyhow::Result<Vec<bool>> {
        let mut stored = self.entries.lock().unwrap();
        let mut results = Vec::with_capacity(entries.len());
        for wanted in entries {
            let before = stored.len();
            stored.retain(|e| e.unique_id != wanted.unique_id);
            results.push(stored.len() != before);
        }
        Ok(results)
    }

    async fn num_entries(&self) -> usize {
        self.len()
    }

    fn properties(&self) -> QueueProperties {
        QueueProperties {
            name: self.name.clone(),
            on_failure_dead_message: self.on_failure_dead_message,
        }
    }
}

#[derive(Default)]
struct MockDeadLetters {
    next_id: AtomicU64,
    // (receiver, reason) for every raw publication
    raws: Mutex<Vec<(String, String)>>,
    // (oid, reason, dedup, receiver) for every single-unit publication
    units: Mutex<Vec<(String, String, Option<String>, String)>>,
    // (oid, reason) for every batch-converted entry
    batched: Mutex<Vec<(String, String)>>,
}

#[async_trait]
impl DeadLetterPublisher for MockDeadLetters {
    async fn publish_dead_message_raw(
        &self,
        receiver: &str,
        _raw: &[u8],
        reason: &str,
    ) -> anyhow::Result<()> {
        self.raws
            .lock()
            .unwrap()
            .push((receiver.to_string(), reason.to_string()));
        Ok(())
    }

    async fn publish_dead_message(
        &self,
        unit: &MessageUnit,
        reason: &str,
        dedup_key: Option<&str>,
        receiver: &str,
    ) -> anyhow::Result<u64> {
        self.units.lock().unwrap().push((
            unit.oid().to_string(),
            reason.to_string(),
            dedup_key.map(str::to_string),
            receiver.to_string(),
        ));
        Ok(self.next_id.fetch_add(1, Ordering::SeqCst) + 1)
    }

    async fn dead_message(
        &self,
        entries: &[QueuedEntry],
        _queue: Option<&dyn EntryQueue>,
        reason: &str,
    ) -> anyhow::Result<()> {
        let mut batched = self.batched.lock().unwrap();
        for entry in entries {
            batched.push((entry.oid().to_string(), reason.to_string()));
        }
        Ok(())
    }
}

struct MockSession {
    dead: bool,
    callback: bool,
    shutdown_called: AtomicBool,
    disconnected: AtomicBool,
}

impl MockSession {
    fn new(dead: bool, callback: bool) -> Arc<Self> {
        Arc::new(MockSession {
            dead,
            callback,
            shutdown_called: AtomicBool::new(false),
            disconnected: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl SessionHook for MockSession {
    fn name(&self) -> String {
        "client/joe/session/1".to_string()
    }

    fn is_dead(&self) -> bool {
        self.dead
    }

    fn has_callback(&self) -> bool {
        self.callback
    }

    async fn shutdown(&self) {
        self.shutdown_called.store(true, Ordering::SeqCst);
    }

    async fn disconnect(&self) -> anyhow::Result<()> {
        self.disconnected.store(true, Ordering::SeqCst);
        Ok(())
    }
}

// Publish `count` entries, each held by one callback reference, and return
// them in queued form.
async fn publish_queued(engine: &BrokerEngine, oid: &str, count: usize) -> Vec<QueuedEntry> {
    let mut queued = Vec::with_capacity(count);
    for i in 0..count {
        let unit = MessageUnit::new(oid, format!("payload-{i}").into_bytes());
        let entry = engine.publish(unit, 1, 0).await.unwrap();
        queued.push(QueuedEntry::new(entry.unique_id(), entry.unit()));
    }
    queued
}

#[tokio::test]
async fn test_communication_failure_drains_queue_to_dead_letters() -> anyhow::Result<()> {
    let engine = BrokerEngine::new();
    let dead_letters = Arc::new(MockDeadLetters::default());
    let handler = engine.recovery_handler(dead_letters.clone());

    let queued = publish_queued(&engine, "cb-queue", 3).await;
    let queue = MockQueue::new("callback:joe", true, queued.clone());
    let session = MockSession::new(true, true);

    // One entry directly implicated, the rest drained per queue policy
    let report = FailureReport::new(DeliveryError::Communication {
        reason: "connection refused".to_string(),
        cause: Some("tcp reset".to_string()),
    })
    .with_entries(vec![queued[0].clone()])
    .with_queue(queue.clone())
    .with_session(session.clone());
    handler.handle_error(report).await;

    // All three ended up dead-lettered and the queue is empty
    let batched = dead_letters.batched.lock().unwrap().clone();
    assert_eq!(batched.len(), 3);
    assert!(batched.iter().all(|(_, reason)| reason.contains("tcp reset")));
    assert_eq!(queue.len(), 0);

    // Their callback holds were released, destroying the registry entries
    for entry in &queued {
        assert!(engine
            .registry()
            .lookup_dirty_read("cb-queue", entry.unique_id)
            .await
            .is_none());
    }

    // The dead dispatcher forced a full logout
    assert!(session.shutdown_called.load(Ordering::SeqCst));
    assert!(session.disconnected.load(Ordering::SeqCst));
    Ok(())
}

#[tokio::test]
async fn test_queue_without_dead_letter_policy_is_left_intact() -> anyhow::Result<()> {
    let engine = BrokerEngine::new();
    let dead_letters = Arc::new(MockDeadLetters::default());
    let handler = engine.recovery_handler(dead_letters.clone());

    let queued = publish_queued(&engine, "no-policy", 2).await;
    let queue = MockQueue::new("callback:jane", false, queued);

    let report = FailureReport::new(DeliveryError::Internal {
        reason: "plugin crashed".to_string(),
        cause: None,
    })
    .with_queue(queue.clone());
    handler.handle_error(report).await;

    // No implicated entries, no drain permission: nothing converted
    assert_eq!(dead_letters.batched.lock().unwrap().len(), 0);
    assert_eq!(queue.len(), 2);
    Ok(())
}

#[tokio::test]
async fn test_user_rejection_discards_without_dead_letters() -> anyhow::Result<()> {
    let engine = BrokerEngine::new();
    let dead_letters = Arc::new(MockDeadLetters::default());
    let handler = engine.recovery_handler(dead_letters.clone());

    let queued = publish_queued(&engine, "rejected", 2).await;
    let queue = MockQueue::new("callback:joe", true, queued.clone());

    let report = FailureReport::new(DeliveryError::UserRejected {
        reason: "not interested".to_string(),
    })
    .with_entries(vec![queued[0].clone()])
    .with_queue(queue.clone());
    handler.handle_error(report).await;

    // Only the implicated entry is gone, and no dead letter was produced
    assert_eq!(dead_letters.batched.lock().unwrap().len(), 0);
    assert_eq!(queue.len(), 1);
    assert!(engine
        .registry()
        .lookup_dirty_read("rejected", queued[0].unique_id)
        .await
        .is_none());
    let survivor = engine
        .registry()
        .lookup_dirty_read("rejected", queued[1].unique_id)
        .await
        .unwrap();
    assert_eq!(survivor.state(), EntryState::Alive);
    Ok(())
}

#[tokio::test]
async fn test_unparseable_raw_message_becomes_raw_dead_letter() -> anyhow::Result<()> {
    let engine = BrokerEngine::new();
    let dead_letters = Arc::new(MockDeadLetters::default());
    let handler = engine.recovery_handler(dead_letters.clone());

    let report = FailureReport::new(DeliveryError::Internal {
        reason: "unparseable message".to_string(),
        cause: None,
    })
    .with_raw_message(b"\x00garbage".to_vec());
    handler.handle_error(report).await;

    let raws = dead_letters.raws.lock().unwrap().clone();
    assert_eq!(raws.len(), 1);
    assert_eq!(raws[0].0, "unknown");
    assert!(raws[0].1.contains("unparseable message"));
    Ok(())
}

#[tokio::test]
async fn test_sync_failure_redirects_to_dead_letter() -> anyhow::Result<()> {
    let engine = BrokerEngine::new();
    let dead_letters = Arc::new(MockDeadLetters::default());
    let handler = engine.recovery_handler(dead_letters.clone());

    let unit = MessageUnit::new("sync-pub", b"hello".to_vec()).with_destination("client/joe");
    let report = FailureReport::new(DeliveryError::Internal {
        reason: "authorization denied".to_string(),
        cause: Some("no publish permission".to_string()),
    })
    .with_message_unit(unit);
    let id = handler.handle_error_sync(report).await?;
    assert!(id.is_some());

    let units = dead_letters.units.lock().unwrap().clone();
    assert_eq!(units.len(), 1);
    let (oid, reason, dedup, receiver) = &units[0];
    assert_eq!(oid, "sync-pub");
    assert!(reason.contains("no publish permission"));
    // The receive timestamp was stamped and doubles as the dedup key
    assert!(dedup.is_some());
    assert_eq!(receiver, "client/joe");
    Ok(())
}

#[tokio::test]
async fn test_sync_failure_without_unit_degrades_to_async_path() -> anyhow::Result<()> {
    let engine = BrokerEngine::new();
    let dead_letters = Arc::new(MockDeadLetters::default());
    let handler = engine.recovery_handler(dead_letters.clone());

    let queued = publish_queued(&engine, "degraded", 1).await;
    let queue = MockQueue::new("callback:joe", true, queued.clone());

    let report = FailureReport::new(DeliveryError::Communication {
        reason: "socket closed".to_string(),
        cause: None,
    })
    .with_entries(queued)
    .with_queue(queue.clone());
    let id = handler.handle_error_sync(report).await?;

    assert!(id.is_none());
    assert_eq!(dead_letters.batched.lock().unwrap().len(), 1);
    assert_eq!(queue.len(), 0);
    Ok(())
}

#[tokio::test]
async fn test_live_session_is_not_shut_down() -> anyhow::Result<()> {
    let engine = BrokerEngine::new();
    let dead_letters = Arc::new(MockDeadLetters::default());
    let handler = engine.recovery_handler(dead_letters.clone());

    let session = MockSession::new(false, true);
    let report = FailureReport::new(DeliveryError::Communication {
        reason: "transient glitch".to_string(),
        cause: None,
    })
    .with_session(session.clone());
    handler.handle_error(report).await;

    assert!(!session.shutdown_called.load(Ordering::SeqCst));
    assert!(!session.disconnected.load(Ordering::SeqCst));
    Ok(())
}
