//! Asynchronous batching writer for audit records.
//!
//! Records are resolved against the ambient context at enqueue time and
//! held in a bounded FIFO. Two triggers start a flush: the queue reaching
//! `batch_size`, and a periodic ticker firing every `flush_interval`. At
//! most one flush is in flight at a time; triggers arriving during a flush
//! set a flush-again bit instead of starting a concurrent write, and the
//! flush loop keeps draining batches while the queue is non-empty, so
//! records enqueued mid-flush are picked up without a second trigger.
//!
//! Failure policy: strict mode re-prepends the failed batch and propagates
//! the error; lenient mode drops the batch and reports it through the
//! configured error sink. Background flushes never escape their task.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, Weak};

use chrono::Utc;
use serde_json::Value;
use tokio::sync::{Notify, mpsc};
use tokio::time::MissedTickBehavior;
use tracing::debug;
use uuid::Uuid;

use crate::config::AuditConfig;
use crate::context::{AuditContext, merge_metadata};
use crate::error::AuditError;
use crate::record::{AuditLogEntry, AuditRecord};
use crate::sink::AuditSink;

const POISONED: &str = "audit queue mutex poisoned";

/// Point-in-time writer health, exposed for tests and monitoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriterStats {
    pub queue_size: usize,
    pub in_flight: bool,
}

struct QueueState {
    queue: VecDeque<AuditLogEntry>,
    in_flight: bool,
    flush_again: bool,
    closed: bool,
    /// Message of the last strict-mode write failure, so coalesced waiters
    /// observe the failure instead of silently retrying the batch.
    last_write_error: Option<String>,
}

struct Shared {
    state: Mutex<QueueState>,
    sink: Arc<dyn AuditSink>,
    config: Arc<AuditConfig>,
    flush_done: Notify,
}

/// Bounded queue of audit rows with size- and time-triggered flushes.
pub struct BatchWriter {
    shared: Arc<Shared>,
    shutdown_tx: mpsc::Sender<()>,
}

impl BatchWriter {
    /// Create a writer and start its periodic flusher.
    ///
    /// Must be called from within a Tokio runtime. The flusher holds only a
    /// weak reference and exits when the writer is dropped or shut down.
    pub fn new(sink: Arc<dyn AuditSink>, config: Arc<AuditConfig>) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(QueueState {
                queue: VecDeque::new(),
                in_flight: false,
                flush_again: false,
                closed: false,
                last_write_error: None,
            }),
            sink,
            config,
            flush_done: Notify::new(),
        });
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        tokio::spawn(run_ticker(Arc::downgrade(&shared), shutdown_rx));
        Self {
            shared,
            shutdown_tx,
        }
    }

    /// Resolve `records` against the ambient context and append them to the
    /// queue.
    ///
    /// When the append reaches `batch_size` a flush is triggered: with
    /// `wait_for_write` the call awaits that flush (success or failure),
    /// otherwise the flush runs in the background and failures go to the
    /// error sink. A full queue fails the call in strict mode and drops the
    /// excess with a logged error in lenient mode.
    pub async fn enqueue(
        &self,
        records: Vec<AuditRecord>,
        scope: Option<&AuditContext>,
    ) -> Result<(), AuditError> {
        if records.is_empty() {
            return Ok(());
        }
        let config = &self.shared.config;
        let entries: Vec<AuditLogEntry> = records
            .into_iter()
            .map(|record| resolve_entry(record, scope, config))
            .collect();

        let mut overflow: Option<(usize, AuditError)> = None;
        let trigger = {
            let mut state = self.shared.state.lock().expect(POISONED);
            if state.closed {
                return Err(AuditError::Closed);
            }
            let capacity = config.max_queue_size;
            if state.queue.len() + entries.len() > capacity {
                let err = AuditError::QueueFull {
                    queued: state.queue.len(),
                    capacity,
                };
                if config.strict_mode {
                    return Err(err);
                }
                let room = capacity.saturating_sub(state.queue.len());
                let dropped = entries.len() - room;
                state.queue.extend(entries.into_iter().take(room));
                overflow = Some((dropped, err));
            } else {
                state.queue.extend(entries);
            }
            state.queue.len() >= config.batch_size
        };

        if let Some((dropped, err)) = overflow {
            (config.log_error)(
                &format!("[AUDIT] queue full, dropped {dropped} audit records"),
                &err,
            );
        }

        if trigger {
            if config.wait_for_write {
                flush_shared(&self.shared).await?;
            } else {
                let shared = Arc::clone(&self.shared);
                tokio::spawn(async move {
                    if let Err(err) = flush_shared(&shared).await {
                        (shared.config.log_error)("[AUDIT] background flush failed", &err);
                    }
                });
            }
        }
        Ok(())
    }

    /// Drain the queue through the sink. Coalesces with an in-flight flush
    /// and settles when the queue has been drained (or a strict-mode write
    /// failed).
    pub async fn flush(&self) -> Result<(), AuditError> {
        flush_shared(&self.shared).await
    }

    /// Stop the periodic flusher, drain the queue, and reject further
    /// enqueues. Idempotent; a strict-mode write failure aborts the drain
    /// and propagates.
    pub async fn shutdown(&self) -> Result<(), AuditError> {
        {
            let mut state = self.shared.state.lock().expect(POISONED);
            if state.closed {
                return Ok(());
            }
            state.closed = true;
        }
        let _ = self.shutdown_tx.send(()).await;
        self.flush().await
    }

    pub fn stats(&self) -> WriterStats {
        let state = self.shared.state.lock().expect(POISONED);
        WriterStats {
            queue_size: state.queue.len(),
            in_flight: state.in_flight,
        }
    }
}

/// Attach the effective context to a record: extractor output, overridden
/// by the scope snapshot, with per-record metadata outranking both.
fn resolve_entry(
    record: AuditRecord,
    scope: Option<&AuditContext>,
    config: &AuditConfig,
) -> AuditLogEntry {
    let extracted_user = config.get_user_id.as_ref().and_then(|get| get());
    let extracted_metadata = config.get_metadata.as_ref().and_then(|get| get());
    let metadata = merge_metadata([
        extracted_metadata.as_ref(),
        scope.and_then(|ctx| ctx.metadata.as_ref()),
        record.metadata.as_ref(),
    ]);
    AuditLogEntry {
        id: Uuid::new_v4(),
        user_id: scope
            .and_then(|ctx| ctx.user_id.clone())
            .or(extracted_user),
        ip_address: scope.and_then(|ctx| ctx.ip_address.clone()),
        user_agent: scope.and_then(|ctx| ctx.user_agent.clone()),
        action: record.action,
        table_name: record.table_name,
        record_id: record.record_id,
        values: record
            .values
            .filter(|values| !values.is_empty())
            .map(Value::Object),
        metadata: metadata.map(Value::Object),
        transaction_id: scope.and_then(|ctx| ctx.transaction_id.clone()),
        created_at: Utc::now(),
    }
}

async fn run_ticker(shared: Weak<Shared>, mut shutdown_rx: mpsc::Receiver<()>) {
    let Some(flush_interval) = shared.upgrade().map(|s| s.config.flush_interval) else {
        return;
    };
    let mut ticker = tokio::time::interval(flush_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            _ = ticker.tick() => {
                let Some(shared) = shared.upgrade() else { break };
                if let Err(err) = flush_shared(&shared).await {
                    (shared.config.log_error)("[AUDIT] periodic flush failed", &err);
                }
            }
        }
    }
    debug!("audit flush ticker stopped");
}

/// Become the flusher, or coalesce with the in-flight one and settle with
/// its outcome.
async fn flush_shared(shared: &Arc<Shared>) -> Result<(), AuditError> {
    loop {
        let notified = shared.flush_done.notified();
        tokio::pin!(notified);
        // Register for the completion notification before inspecting the
        // flag; an in-flight flush cannot finish unobserved.
        notified.as_mut().enable();
        let become_flusher = {
            let mut state = shared.state.lock().expect(POISONED);
            if state.in_flight {
                state.flush_again = true;
                false
            } else {
                state.in_flight = true;
                state.last_write_error = None;
                true
            }
        };
        if become_flusher {
            return run_flush(shared).await;
        }
        notified.await;
        {
            let state = shared.state.lock().expect(POISONED);
            if let Some(message) = state.last_write_error.clone() {
                return Err(AuditError::Write(message));
            }
            if state.queue.is_empty() {
                return Ok(());
            }
        }
        // Records landed after the previous flush finished; go again.
    }
}

/// The single in-flight flush loop: detach up to `batch_size` records,
/// write, repeat until the queue is empty.
async fn run_flush(shared: &Arc<Shared>) -> Result<(), AuditError> {
    let result = loop {
        let batch: Vec<AuditLogEntry> = {
            let mut state = shared.state.lock().expect(POISONED);
            state.flush_again = false;
            let take = state.queue.len().min(shared.config.batch_size);
            state.queue.drain(..take).collect()
        };
        if batch.is_empty() {
            break Ok(());
        }
        let count = batch.len();
        match shared.sink.write(&batch).await {
            Ok(()) => {
                debug!(count, table = %shared.config.audit_table, "audit batch persisted");
            }
            Err(err) => {
                if shared.config.strict_mode {
                    let mut state = shared.state.lock().expect(POISONED);
                    for entry in batch.into_iter().rev() {
                        state.queue.push_front(entry);
                    }
                    state.last_write_error = Some(err.to_string());
                    break Err(err);
                }
                (shared.config.log_error)(
                    &format!("[AUDIT] failed to persist {count} audit records"),
                    &err,
                );
            }
        }
    };
    {
        let mut state = shared.state.lock().expect(POISONED);
        state.in_flight = false;
        state.flush_again = false;
    }
    shared.flush_done.notify_waiters();
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UpdateValuesMode;
    use crate::record::{AuditAction, Row};
    use crate::sink::MemorySink;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;
    use tokio::sync::Semaphore;

    fn record(id: u32) -> AuditRecord {
        let mut values = Row::new();
        values.insert("email".to_owned(), json!(format!("user{id}@x")));
        AuditRecord::new(AuditAction::Insert, "users", id.to_string()).with_values(values)
    }

    fn config_with(
        batch_size: usize,
        configure: impl FnOnce(crate::config::AuditConfigBuilder) -> crate::config::AuditConfigBuilder,
    ) -> Arc<AuditConfig> {
        let builder = AuditConfig::builder()
            .table("users", "id")
            .update_values_mode(UpdateValuesMode::Changed)
            .batch_size(batch_size)
            .flush_interval(Duration::from_secs(3600));
        Arc::new(configure(builder).build().unwrap())
    }

    /// Sink whose writes block until a permit is released; records batch
    /// sizes in completion order.
    struct GatedSink {
        gate: Semaphore,
        batches: StdMutex<Vec<usize>>,
    }

    impl GatedSink {
        fn new() -> Self {
            Self {
                gate: Semaphore::new(0),
                batches: StdMutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl AuditSink for GatedSink {
        async fn write(&self, entries: &[AuditLogEntry]) -> Result<(), AuditError> {
            self.gate.acquire().await.expect("gate closed").forget();
            self.batches.lock().unwrap().push(entries.len());
            Ok(())
        }
    }

    struct FailingSink;

    #[async_trait]
    impl AuditSink for FailingSink {
        async fn write(&self, _entries: &[AuditLogEntry]) -> Result<(), AuditError> {
            Err(AuditError::Write("connection reset".to_owned()))
        }
    }

    async fn wait_until(mut done: impl FnMut() -> bool) {
        for _ in 0..200 {
            if done() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached within timeout");
    }

    #[tokio::test]
    async fn size_trigger_flushes_a_full_batch() {
        let sink = Arc::new(MemorySink::new());
        let writer = BatchWriter::new(Arc::clone(&sink) as Arc<dyn AuditSink>, config_with(3, |b| b));

        writer
            .enqueue(vec![record(1), record(2), record(3)], None)
            .await
            .unwrap();

        wait_until(|| sink.len() == 3).await;
        let entries = sink.entries();
        let ids: Vec<&str> = entries.iter().map(|e| e.record_id.as_str()).collect();
        assert_eq!(ids, ["1", "2", "3"]);
    }

    #[tokio::test]
    async fn below_batch_size_waits_for_the_ticker() {
        let sink = Arc::new(MemorySink::new());
        let config = config_with(100, |b| b.flush_interval(Duration::from_millis(50)));
        let writer = BatchWriter::new(Arc::clone(&sink) as Arc<dyn AuditSink>, config);

        writer.enqueue(vec![record(1)], None).await.unwrap();
        assert_eq!(sink.len(), 0);

        wait_until(|| sink.len() == 1).await;
    }

    #[tokio::test]
    async fn concurrent_enqueue_during_flush_coalesces_into_two_writes() {
        let sink = Arc::new(GatedSink::new());
        let config = config_with(5, |b| b);
        let writer = BatchWriter::new(Arc::clone(&sink) as Arc<dyn AuditSink>, config);

        writer
            .enqueue((1..=5).map(record).collect(), None)
            .await
            .unwrap();
        wait_until(|| writer.stats().in_flight).await;

        // The first flush is blocked on the gate; these three land in the
        // queue behind it.
        writer
            .enqueue((6..=8).map(record).collect(), None)
            .await
            .unwrap();
        wait_until(|| writer.stats().queue_size == 3).await;

        sink.gate.add_permits(2);
        wait_until(|| sink.batches.lock().unwrap().len() == 2).await;

        let batches = sink.batches.lock().unwrap().clone();
        assert_eq!(batches, [5, 3]);
        assert_eq!(writer.stats().queue_size, 0);
        assert!(!writer.stats().in_flight);
    }

    #[tokio::test]
    async fn strict_overflow_fails_the_enqueue() {
        let sink = Arc::new(MemorySink::new());
        let config = config_with(100, |b| b.max_queue_size(2).strict_mode(true));
        let writer = BatchWriter::new(Arc::clone(&sink) as Arc<dyn AuditSink>, config);

        let err = writer
            .enqueue(vec![record(1), record(2), record(3)], None)
            .await
            .unwrap_err();
        assert!(matches!(err, AuditError::QueueFull { .. }));
        assert_eq!(writer.stats().queue_size, 0);
    }

    #[tokio::test]
    async fn lenient_overflow_drops_the_excess_and_logs() {
        let reported: Arc<StdMutex<Vec<String>>> = Arc::new(StdMutex::new(Vec::new()));
        let seen = Arc::clone(&reported);
        let sink = Arc::new(MemorySink::new());
        let config = config_with(100, move |b| {
            b.max_queue_size(2)
                .log_error(move |message, _| seen.lock().unwrap().push(message.to_owned()))
        });
        let writer = BatchWriter::new(Arc::clone(&sink) as Arc<dyn AuditSink>, config);

        writer
            .enqueue(vec![record(1), record(2), record(3)], None)
            .await
            .unwrap();
        assert_eq!(writer.stats().queue_size, 2);

        let messages = reported.lock().unwrap();
        assert_eq!(messages.len(), 1);
        assert!(messages[0].starts_with("[AUDIT]"));
        assert!(messages[0].contains("dropped 1"));
    }

    #[tokio::test]
    async fn strict_write_failure_restores_the_batch_and_propagates() {
        let config = config_with(2, |b| b.strict_mode(true).wait_for_write(true));
        let writer = BatchWriter::new(Arc::new(FailingSink), config);

        let err = writer
            .enqueue(vec![record(1), record(2)], None)
            .await
            .unwrap_err();
        assert!(matches!(err, AuditError::Write(_)));
        assert_eq!(writer.stats().queue_size, 2);
        assert!(!writer.stats().in_flight);
    }

    #[tokio::test]
    async fn lenient_write_failure_drops_the_batch_and_logs() {
        let reported: Arc<StdMutex<Vec<String>>> = Arc::new(StdMutex::new(Vec::new()));
        let seen = Arc::clone(&reported);
        let config = config_with(2, move |b| {
            b.wait_for_write(true)
                .log_error(move |message, _| seen.lock().unwrap().push(message.to_owned()))
        });
        let writer = BatchWriter::new(Arc::new(FailingSink), config);

        // Lenient mode: the enqueue itself succeeds, the loss is logged.
        writer
            .enqueue(vec![record(1), record(2)], None)
            .await
            .unwrap();
        assert_eq!(writer.stats().queue_size, 0);

        let messages = reported.lock().unwrap();
        assert_eq!(messages.len(), 1);
        assert!(messages[0].starts_with("[AUDIT]"));
    }

    #[tokio::test]
    async fn shutdown_drains_then_rejects_enqueues() {
        let sink = Arc::new(MemorySink::new());
        let writer = BatchWriter::new(Arc::clone(&sink) as Arc<dyn AuditSink>, config_with(100, |b| b));

        writer.enqueue(vec![record(1)], None).await.unwrap();
        writer.shutdown().await.unwrap();
        assert_eq!(sink.len(), 1);

        let err = writer.enqueue(vec![record(2)], None).await.unwrap_err();
        assert!(matches!(err, AuditError::Closed));

        // Idempotent.
        writer.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn scope_context_overrides_extractors() {
        let sink = Arc::new(MemorySink::new());
        let config = config_with(100, |b| {
            b.get_user_id(|| Some("system".to_owned())).get_metadata(|| {
                let mut ambient = Row::new();
                ambient.insert("source".to_owned(), json!("extractor"));
                ambient.insert("env".to_owned(), json!("test"));
                Some(ambient)
            })
        });
        let writer = BatchWriter::new(Arc::clone(&sink) as Arc<dyn AuditSink>, config);

        let mut scope_meta = Row::new();
        scope_meta.insert("source".to_owned(), json!("scope"));
        let scope = AuditContext::new()
            .with_ip_address("10.0.0.9")
            .with_transaction_id("txn-1")
            .with_metadata(scope_meta);

        writer
            .enqueue(vec![record(1)], Some(&scope))
            .await
            .unwrap();
        writer.flush().await.unwrap();

        let entries = sink.entries();
        let entry = &entries[0];
        // No scoped user id, so the extractor supplies it.
        assert_eq!(entry.user_id.as_deref(), Some("system"));
        assert_eq!(entry.ip_address.as_deref(), Some("10.0.0.9"));
        assert_eq!(entry.transaction_id.as_deref(), Some("txn-1"));
        let metadata = entry.metadata.as_ref().unwrap();
        assert_eq!(metadata["source"], json!("scope"));
        assert_eq!(metadata["env"], json!("test"));
    }

    #[tokio::test]
    async fn empty_metadata_resolves_to_null() {
        let sink = Arc::new(MemorySink::new());
        let config = config_with(100, |b| b.get_metadata(|| Some(Row::new())));
        let writer = BatchWriter::new(Arc::clone(&sink) as Arc<dyn AuditSink>, config);

        let scope = AuditContext::new().with_metadata(Row::new());
        writer
            .enqueue(vec![record(1)], Some(&scope))
            .await
            .unwrap();
        writer.flush().await.unwrap();

        assert!(sink.entries()[0].metadata.is_none());
    }

    #[tokio::test]
    async fn entries_persist_in_enqueue_order_across_batches() {
        let sink = Arc::new(MemorySink::new());
        let writer = BatchWriter::new(Arc::clone(&sink) as Arc<dyn AuditSink>, config_with(4, |b| b));

        for chunk in (1..=10).collect::<Vec<u32>>().chunks(2) {
            writer
                .enqueue(chunk.iter().map(|id| record(*id)).collect(), None)
                .await
                .unwrap();
        }
        writer.flush().await.unwrap();

        wait_until(|| sink.len() == 10).await;
        let ids: Vec<String> = sink
            .entries()
            .iter()
            .map(|e| e.record_id.clone())
            .collect();
        let expected: Vec<String> = (1..=10).map(|id| id.to_string()).collect();
        assert_eq!(ids, expected);
    }
}
