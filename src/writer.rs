// Durable Writer
//
// Buffers finished records and drains them to a RecordSink on a timer, when the queue
// fills up, and once more at shutdown. At most one flush runs at a time; a failed batch
// goes back to the front of the queue in its original order.

use crate::config::WriterConfig;
use crate::error::{LoggerError, Result};
use crate::record::LogRecord;
use crate::storage::RecordSink;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// What `close` managed to do with the records still queued
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CloseSummary {
    pub persisted: usize,
    pub unpersisted: usize,
}

struct WriterInner {
    config: WriterConfig,
    sink: Arc<dyn RecordSink>,
    queue: Mutex<VecDeque<LogRecord>>,
    /// Held for the duration of a flush
    flush_gate: tokio::sync::Mutex<()>,
    closed: AtomicBool,
    runtime: Handle,
}

pub struct DurableWriter {
    inner: Arc<WriterInner>,
    shutdown: watch::Sender<bool>,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

impl DurableWriter {
    /// Start a writer and its periodic flush task. Must be called inside a Tokio runtime.
    pub fn open(config: WriterConfig, sink: Arc<dyn RecordSink>) -> Result<Self> {
        let runtime = Handle::try_current()
            .map_err(|e| LoggerError::Task(format!("writer needs a Tokio runtime: {}", e)))?;

        let inner = Arc::new(WriterInner {
            config,
            sink,
            queue: Mutex::new(VecDeque::new()),
            flush_gate: tokio::sync::Mutex::new(()),
            closed: AtomicBool::new(false),
            runtime: runtime.clone(),
        });

        let (shutdown, shutdown_rx) = watch::channel(false);
        let ticker = runtime.spawn(run_periodic_flush(inner.clone(), shutdown_rx));

        tracing::info!(
            "durable writer open: {} (queue {}, every {} ms)",
            inner.sink.path().display(),
            inner.config.max_queue_size,
            inner.config.flush_interval_ms
        );

        Ok(Self {
            inner,
            shutdown,
            ticker: Mutex::new(Some(ticker)),
        })
    }

    /// Queue a finished record. Reaching `max_queue_size` starts a flush in the background.
    pub fn enqueue(&self, record: LogRecord) -> Result<()> {
        let len = {
            let mut queue = self.inner.queue.lock();
            // checked under the queue lock so close() cannot drain between check and push
            if self.inner.closed.load(Ordering::SeqCst) {
                return Err(LoggerError::Closed {
                    request_id: record.request_id,
                });
            }
            queue.push_back(record);
            queue.len()
        };

        if len >= self.inner.config.max_queue_size {
            tracing::debug!("queue reached {} records, flushing", len);
            let inner = self.inner.clone();
            self.inner.runtime.spawn(async move {
                if let Err(e) = inner.flush().await {
                    tracing::warn!("backpressure flush failed: {}", e);
                }
            });
        }
        Ok(())
    }

    /// Drain the queue now. Returns how many records were persisted; 0 when another
    /// flush is already running.
    pub async fn flush(&self) -> Result<usize> {
        self.inner.flush().await
    }

    /// Stop the timer and make one last attempt to persist everything. Never fails;
    /// calling it again only reports what is still queued.
    pub async fn close(&self) -> CloseSummary {
        {
            let queue = self.inner.queue.lock();
            if self.inner.closed.swap(true, Ordering::SeqCst) {
                return CloseSummary {
                    persisted: 0,
                    unpersisted: queue.len(),
                };
            }
        }

        let _ = self.shutdown.send(true);
        let ticker = self.ticker.lock().take();
        if let Some(ticker) = ticker {
            if let Err(e) = ticker.await {
                tracing::warn!("periodic flush task ended abnormally: {}", e);
            }
        }

        let persisted = {
            let _gate = self.inner.flush_gate.lock().await;
            match self.inner.drain().await {
                Ok(count) => count,
                Err(e) => {
                    tracing::error!("final flush failed: {}", e);
                    0
                }
            }
        };

        let summary = CloseSummary {
            persisted,
            unpersisted: self.inner.queue.lock().len(),
        };
        if summary.unpersisted > 0 {
            tracing::error!(
                "writer closed with {} records not persisted to {}",
                summary.unpersisted,
                self.inner.sink.path().display()
            );
        } else {
            tracing::info!("writer closed, {} records flushed at shutdown", persisted);
        }
        summary
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    pub fn queued_len(&self) -> usize {
        self.inner.queue.lock().len()
    }

    /// Copy of the records still waiting to be persisted, oldest first
    pub fn queued(&self) -> Vec<LogRecord> {
        self.inner.queue.lock().iter().cloned().collect()
    }
}

impl WriterInner {
    async fn flush(&self) -> Result<usize> {
        let Ok(_gate) = self.flush_gate.try_lock() else {
            tracing::trace!("flush already in progress");
            return Ok(0);
        };
        self.drain().await
    }

    /// Caller holds the flush gate
    async fn drain(&self) -> Result<usize> {
        let mut persisted = 0;
        loop {
            let batch: Vec<LogRecord> = self.queue.lock().drain(..).collect();
            if batch.is_empty() {
                return Ok(persisted);
            }
            let batch = Arc::new(batch);

            if let Err(e) = self.persist(batch.clone()).await {
                let mut queue = self.queue.lock();
                for record in batch.iter().rev() {
                    queue.push_front(record.clone());
                }
                return Err(e);
            }
            persisted += batch.len();

            // producers may have refilled the queue while the batch was on disk
            if self.queue.lock().len() < self.config.max_queue_size {
                return Ok(persisted);
            }
        }
    }

    async fn persist(&self, batch: Arc<Vec<LogRecord>>) -> Result<()> {
        let attempts = self.config.max_retries.max(1);
        let mut last_error = None;

        for attempt in 1..=attempts {
            let sink = self.sink.clone();
            let records = batch.clone();
            let result = tokio::task::spawn_blocking(move || sink.append(&records))
                .await
                .map_err(|e| LoggerError::Task(e.to_string()))
                .and_then(|r| r);

            match result {
                Ok(()) => {
                    tracing::debug!("persisted {} records", batch.len());
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!(
                        "write attempt {}/{} for {} records failed: {}",
                        attempt,
                        attempts,
                        batch.len(),
                        e
                    );
                    last_error = Some(e);
                    if attempt < attempts {
                        tokio::time::sleep(self.config.retry_delay()).await;
                    }
                }
            }
        }

        Err(LoggerError::PersistFailed {
            records: batch.len(),
            attempts,
            source: Box::new(
                last_error.unwrap_or_else(|| LoggerError::Task("no write attempted".to_string())),
            ),
        })
    }
}

async fn run_periodic_flush(inner: Arc<WriterInner>, mut shutdown: watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(inner.config.flush_interval());
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // the first tick completes immediately
    interval.tick().await;

    loop {
        tokio::select! {
            _ = interval.tick() => {
                if let Err(e) = inner.flush().await {
                    tracing::error!("periodic flush failed, records stay queued: {}", e);
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::tests::record;
    use crate::storage::JsonlSink;
    use std::path::{Path, PathBuf};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[derive(Default)]
    struct MemorySink {
        records: Mutex<Vec<LogRecord>>,
        path: PathBuf,
    }

    impl RecordSink for MemorySink {
        fn append(&self, records: &[LogRecord]) -> Result<()> {
            self.records.lock().extend_from_slice(records);
            Ok(())
        }

        fn path(&self) -> &Path {
            &self.path
        }
    }

    #[derive(Default)]
    struct FailingSink {
        attempts: AtomicUsize,
        path: PathBuf,
    }

    impl RecordSink for FailingSink {
        fn append(&self, _records: &[LogRecord]) -> Result<()> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(LoggerError::io(
                "writing log file",
                "/dev/full",
                std::io::Error::new(std::io::ErrorKind::Other, "disk full"),
            ))
        }

        fn path(&self) -> &Path {
            &self.path
        }
    }

    fn config(max_queue_size: usize) -> WriterConfig {
        WriterConfig {
            max_queue_size,
            flush_interval_ms: 60_000,
            max_retries: 3,
            retry_delay_ms: 1,
            ..Default::default()
        }
    }

    fn ids(records: &[LogRecord]) -> Vec<String> {
        records.iter().map(|r| r.request_id.clone()).collect()
    }

    #[tokio::test]
    async fn test_full_queue_triggers_flush() {
        let sink = Arc::new(MemorySink::default());
        let writer = DurableWriter::open(config(3), sink.clone()).unwrap();

        for id in ["a", "b", "c"] {
            writer.enqueue(record(id)).unwrap();
        }

        for _ in 0..200 {
            if sink.records.lock().len() == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(ids(&sink.records.lock()), vec!["a", "b", "c"]);
        assert_eq!(writer.queued_len(), 0);
        writer.close().await;
    }

    #[tokio::test]
    async fn test_close_persists_everything_enqueued() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.jsonl");
        let writer = DurableWriter::open(config(100), Arc::new(JsonlSink::new(&path))).unwrap();

        for i in 0..5 {
            writer.enqueue(record(&format!("r{}", i))).unwrap();
        }
        let summary = writer.close().await;
        assert_eq!(summary, CloseSummary { persisted: 5, unpersisted: 0 });

        let lines = std::fs::read_to_string(&path).unwrap();
        assert_eq!(lines.lines().count(), 5);
    }

    #[tokio::test]
    async fn test_enqueue_after_close_fails() {
        let writer = DurableWriter::open(config(10), Arc::new(MemorySink::default())).unwrap();
        writer.close().await;
        assert!(writer.is_closed());
        assert!(matches!(
            writer.enqueue(record("late")),
            Err(LoggerError::Closed { .. })
        ));
        // second close is a no-op
        assert_eq!(writer.close().await, CloseSummary::default());
    }

    #[tokio::test]
    async fn test_failed_batch_stays_queued_in_order() {
        let sink = Arc::new(FailingSink::default());
        let writer = DurableWriter::open(config(100), sink.clone()).unwrap();

        writer.enqueue(record("first")).unwrap();
        writer.enqueue(record("second")).unwrap();

        let err = writer.flush().await.unwrap_err();
        assert!(matches!(err, LoggerError::PersistFailed { records: 2, attempts: 3, .. }));
        assert_eq!(sink.attempts.load(Ordering::SeqCst), 3);
        assert_eq!(writer.queued_len(), 2);

        writer.enqueue(record("third")).unwrap();
        assert_eq!(ids(&writer.queued()), vec!["first", "second", "third"]);

        let summary = writer.close().await;
        assert_eq!(summary.unpersisted, 3);
    }

    #[tokio::test]
    async fn test_concurrent_flush_is_noop() {
        let sink = Arc::new(MemorySink::default());
        let writer = DurableWriter::open(config(100), sink.clone()).unwrap();
        writer.enqueue(record("a")).unwrap();

        let gate = writer.inner.flush_gate.lock().await;
        assert_eq!(writer.flush().await.unwrap(), 0);
        assert_eq!(writer.queued_len(), 1);
        drop(gate);

        assert_eq!(writer.flush().await.unwrap(), 1);
        assert_eq!(ids(&sink.records.lock()), vec!["a"]);
        writer.close().await;
    }

    #[tokio::test]
    async fn test_periodic_flush() {
        let sink = Arc::new(MemorySink::default());
        let mut cfg = config(100);
        cfg.flush_interval_ms = 20;
        let writer = DurableWriter::open(cfg, sink.clone()).unwrap();

        writer.enqueue(record("tick")).unwrap();
        for _ in 0..200 {
            if !sink.records.lock().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(ids(&sink.records.lock()), vec!["tick"]);
        writer.close().await;
    }
}
