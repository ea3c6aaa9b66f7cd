//! Bounded ingestion queue and the worker pool draining it.
//!
//! Producers hand over `NewUsageEvent`s and return immediately; a fixed set
//! of workers pulls jobs from one shared receiver and runs them through a
//! [`JobHandler`]. Failures on the worker side never reach the producer.
//! They are logged, counted in [`IngestStats`] and reported to the optional
//! [`JobFailureObserver`]. Delivery is at-most-once.

use crate::{MeterConfig, NewUsageEvent, OverflowPolicy, Result, Subject, UsageError};
use async_trait::async_trait;
use futures::future::join_all;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct IngestJob {
    pub event: NewUsageEvent,
    pub enqueued_at: Instant,
}

/// Work performed for every dequeued job.
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    async fn handle(&self, event: &NewUsageEvent) -> Result<()>;
}

/// Hook for making lost metering data observable.
pub trait JobFailureObserver: Send + Sync {
    /// The job was dequeued but processing it failed.
    fn job_failed(&self, event: &NewUsageEvent, error: &UsageError);
    /// The job never made it into the queue, or was discarded at shutdown.
    fn job_dropped(&self, event: &NewUsageEvent);
    /// Usage was recorded but raising its alerts failed.
    fn alerts_failed(&self, _subject: &Subject, _error: &UsageError) {}
}

#[derive(Debug, Default)]
pub struct IngestStats {
    enqueued: AtomicU64,
    processed: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
    rejected: AtomicU64,
    discarded: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IngestStatsSnapshot {
    pub enqueued: u64,
    pub processed: u64,
    pub failed: u64,
    pub dropped: u64,
    pub rejected: u64,
    pub discarded: u64,
}

impl IngestStats {
    pub fn snapshot(&self) -> IngestStatsSnapshot {
        IngestStatsSnapshot {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            processed: self.processed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
    /// Workers did not finish the backlog within the shutdown timeout and
    /// were aborted.
    pub timed_out: bool,
    /// Queued jobs thrown away without being processed.
    pub discarded: u64,
}

pub struct IngestPool {
    sender: std::sync::Mutex<Option<mpsc::Sender<IngestJob>>>,
    receiver: Arc<Mutex<mpsc::Receiver<IngestJob>>>,
    workers: std::sync::Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
    handler: Arc<dyn JobHandler>,
    observer: Option<Arc<dyn JobFailureObserver>>,
    stats: Arc<IngestStats>,
    worker_count: usize,
    overflow_policy: OverflowPolicy,
    enqueue_timeout: Duration,
    shutdown_timeout: Duration,
}

impl IngestPool {
    /// Creates the queue. Jobs submitted before [`IngestPool::start`] wait in
    /// the queue.
    pub fn new(config: &MeterConfig, handler: Arc<dyn JobHandler>) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        Self {
            sender: std::sync::Mutex::new(Some(tx)),
            receiver: Arc::new(Mutex::new(rx)),
            workers: std::sync::Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            handler,
            observer: None,
            stats: Arc::new(IngestStats::default()),
            worker_count: config.worker_count.max(1),
            overflow_policy: config.overflow_policy,
            enqueue_timeout: config.enqueue_timeout(),
            shutdown_timeout: config.shutdown_timeout(),
        }
    }

    pub fn with_failure_observer(mut self, observer: Arc<dyn JobFailureObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Spawns the workers on the current Tokio runtime. Calling it again is
    /// a no-op.
    pub fn start(&self) -> Result<()> {
        if self.sender_handle().is_none() {
            return Err(UsageError::ShuttingDown);
        }
        if self.started.swap(true, Ordering::SeqCst) {
            warn!("Ingest pool already started");
            return Ok(());
        }

        let mut workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
        for worker_id in 0..self.worker_count {
            workers.push(tokio::spawn(run_worker(
                worker_id,
                self.receiver.clone(),
                self.handler.clone(),
                self.stats.clone(),
                self.observer.clone(),
            )));
        }
        info!(workers = self.worker_count, "Ingest pool started");
        Ok(())
    }

    /// Queues one event according to the overflow policy. Only enqueue-time
    /// conditions are reported; processing errors are not.
    pub async fn submit(&self, event: NewUsageEvent) -> Result<()> {
        self.submit_all(vec![event]).await
    }

    /// Queues the events as one unit: either all of them are accepted, in
    /// order, or none is. The overflow policy applies to the whole batch.
    pub async fn submit_all(&self, events: Vec<NewUsageEvent>) -> Result<()> {
        if events.is_empty() {
            return Ok(());
        }
        let sender = self.sender_handle().ok_or(UsageError::ShuttingDown)?;
        let count = events.len();

        let permits = match self.overflow_policy {
            OverflowPolicy::Drop => match sender.try_reserve_many(count) {
                Ok(permits) => permits,
                Err(TrySendError::Full(())) => return self.drop_jobs(&events, "queue full"),
                Err(TrySendError::Closed(())) => return Err(UsageError::ShuttingDown),
            },
            OverflowPolicy::Reject => match sender.try_reserve_many(count) {
                Ok(permits) => permits,
                Err(TrySendError::Full(())) => {
                    self.stats.rejected.fetch_add(count as u64, Ordering::Relaxed);
                    warn!(
                        jobs = count,
                        event_type = %events[0].event_type,
                        "Ingest queue full, rejecting jobs"
                    );
                    return Err(UsageError::QueueFull);
                }
                Err(TrySendError::Closed(())) => return Err(UsageError::ShuttingDown),
            },
            OverflowPolicy::Block => {
                match tokio::time::timeout(self.enqueue_timeout, sender.reserve_many(count)).await {
                    Ok(Ok(permits)) => permits,
                    Ok(Err(_)) => return Err(UsageError::ShuttingDown),
                    Err(_) => {
                        return self.drop_jobs(&events, "timed out waiting for queue space")
                    }
                }
            }
        };

        let enqueued_at = Instant::now();
        for (permit, event) in permits.zip(events) {
            permit.send(IngestJob { event, enqueued_at });
        }
        self.stats.enqueued.fetch_add(count as u64, Ordering::Relaxed);
        Ok(())
    }

    /// Stops accepting jobs, lets the workers drain the backlog for up to
    /// the shutdown timeout, then aborts them and discards what is left.
    /// Returns once every worker has exited. Safe to call more than once.
    pub async fn shutdown(&self) -> ShutdownReport {
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let mut workers =
            std::mem::take(&mut *self.workers.lock().unwrap_or_else(PoisonError::into_inner));

        if sender.is_some() {
            info!(pending = self.pending(&sender), "Ingest pool shutting down");
        }
        drop(sender);

        let joined =
            tokio::time::timeout(self.shutdown_timeout, join_all(workers.iter_mut())).await;
        let timed_out = joined.is_err();
        for result in joined.into_iter().flatten() {
            if let Err(e) = result {
                error!(error = %e, "Ingest worker exited abnormally");
            }
        }
        if timed_out {
            warn!(
                timeout_ms = self.shutdown_timeout.as_millis() as u64,
                "Ingest workers did not drain in time, aborting"
            );
            for worker in &workers {
                worker.abort();
            }
            for worker in workers {
                match worker.await {
                    Err(e) if !e.is_cancelled() => {
                        error!(error = %e, "Ingest worker exited abnormally")
                    }
                    _ => {}
                }
            }
        }

        let discarded = self.discard_backlog().await;
        if discarded > 0 {
            warn!(discarded, "Discarded queued usage events at shutdown");
        }
        ShutdownReport {
            timed_out,
            discarded,
        }
    }

    pub fn stats(&self) -> IngestStatsSnapshot {
        self.stats.snapshot()
    }

    /// Jobs currently waiting in the queue.
    pub fn pending_jobs(&self) -> usize {
        self.pending(&self.sender_handle())
    }

    fn pending(&self, sender: &Option<mpsc::Sender<IngestJob>>) -> usize {
        sender
            .as_ref()
            .map(|tx| tx.max_capacity() - tx.capacity())
            .unwrap_or(0)
    }

    fn sender_handle(&self) -> Option<mpsc::Sender<IngestJob>> {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn drop_jobs(&self, events: &[NewUsageEvent], reason: &str) -> Result<()> {
        self.stats
            .dropped
            .fetch_add(events.len() as u64, Ordering::Relaxed);
        for event in events {
            warn!(
                subject = %event.subject,
                event_type = %event.event_type,
                reason,
                "Dropping usage event"
            );
            if let Some(observer) = &self.observer {
                observer.job_dropped(event);
            }
        }
        Ok(())
    }

    async fn discard_backlog(&self) -> u64 {
        let mut receiver = self.receiver.lock().await;
        receiver.close();
        let mut discarded = 0;
        while let Ok(job) = receiver.try_recv() {
            discarded += 1;
            if let Some(observer) = &self.observer {
                observer.job_dropped(&job.event);
            }
        }
        self.stats.discarded.fetch_add(discarded, Ordering::Relaxed);
        discarded
    }
}

async fn run_worker(
    worker_id: usize,
    receiver: Arc<Mutex<mpsc::Receiver<IngestJob>>>,
    handler: Arc<dyn JobHandler>,
    stats: Arc<IngestStats>,
    observer: Option<Arc<dyn JobFailureObserver>>,
) {
    debug!(worker_id, "Ingest worker started");
    loop {
        let job = receiver.lock().await.recv().await;
        let Some(job) = job else {
            break;
        };

        match handler.handle(&job.event).await {
            Ok(()) => {
                stats.processed.fetch_add(1, Ordering::Relaxed);
                debug!(
                    worker_id,
                    event_type = %job.event.event_type,
                    queued_ms = job.enqueued_at.elapsed().as_millis() as u64,
                    "Usage event processed"
                );
            }
            Err(e) => {
                stats.failed.fetch_add(1, Ordering::Relaxed);
                error!(
                    worker_id,
                    subject = %job.event.subject,
                    event_type = %job.event.event_type,
                    error = %e,
                    "Failed to record usage event"
                );
                if let Some(observer) = &observer {
                    observer.job_failed(&job.event, &e);
                }
            }
        }
    }
    debug!(worker_id, "Ingest worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Subject, UsageEventType};
    use uuid::Uuid;

    #[derive(Default)]
    struct RecordingHandler {
        seen: Mutex<Vec<NewUsageEvent>>,
        delay: Option<Duration>,
        fail: bool,
    }

    #[async_trait]
    impl JobHandler for RecordingHandler {
        async fn handle(&self, event: &NewUsageEvent) -> Result<()> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if self.fail {
                return Err(UsageError::Validation("boom".to_string()));
            }
            self.seen.lock().await.push(event.clone());
            Ok(())
        }
    }

    #[derive(Default)]
    struct CountingObserver {
        failed: AtomicU64,
        dropped: AtomicU64,
    }

    impl JobFailureObserver for CountingObserver {
        fn job_failed(&self, _event: &NewUsageEvent, _error: &UsageError) {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }

        fn job_dropped(&self, _event: &NewUsageEvent) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn config(capacity: usize, workers: usize, policy: OverflowPolicy) -> MeterConfig {
        MeterConfig {
            queue_capacity: capacity,
            worker_count: workers,
            overflow_policy: policy,
            enqueue_timeout_ms: 20,
            shutdown_timeout_ms: 5_000,
            ..Default::default()
        }
    }

    fn api_call(n: usize) -> NewUsageEvent {
        NewUsageEvent::new(
            Subject::User(Uuid::new_v4()),
            UsageEventType::ApiCall,
            format!("/v1/resource/{n}"),
        )
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_all_jobs_processed_by_multiple_workers() {
        let handler = Arc::new(RecordingHandler::default());
        let pool = IngestPool::new(&config(1000, 4, OverflowPolicy::Drop), handler.clone());
        pool.start().unwrap();

        for n in 0..200 {
            pool.submit(api_call(n)).await.unwrap();
        }
        let report = pool.shutdown().await;

        assert!(!report.timed_out);
        assert_eq!(report.discarded, 0);
        assert_eq!(handler.seen.lock().await.len(), 200);
        let stats = pool.stats();
        assert_eq!(stats.enqueued, 200);
        assert_eq!(stats.processed, 200);
    }

    #[tokio::test]
    async fn test_single_worker_preserves_order() {
        let handler = Arc::new(RecordingHandler::default());
        let pool = IngestPool::new(&config(100, 1, OverflowPolicy::Drop), handler.clone());
        pool.start().unwrap();

        for n in 0..10 {
            pool.submit(api_call(n)).await.unwrap();
        }
        pool.shutdown().await;

        let resources: Vec<String> = handler
            .seen
            .lock()
            .await
            .iter()
            .map(|e| e.resource.clone())
            .collect();
        let expected: Vec<String> = (0..10).map(|n| format!("/v1/resource/{n}")).collect();
        assert_eq!(resources, expected);
    }

    #[tokio::test]
    async fn test_drop_policy_when_full() {
        let observer = Arc::new(CountingObserver::default());
        let pool = IngestPool::new(
            &config(100, 1, OverflowPolicy::Drop),
            Arc::new(RecordingHandler::default()),
        )
        .with_failure_observer(observer.clone());

        // Not started, so nothing drains the queue.
        for n in 0..105 {
            pool.submit(api_call(n)).await.unwrap();
        }

        assert_eq!(pool.pending_jobs(), 100);
        assert_eq!(pool.stats().dropped, 5);
        assert_eq!(observer.dropped.load(Ordering::Relaxed), 5);
    }

    #[tokio::test]
    async fn test_reject_policy_when_full() {
        let pool = IngestPool::new(
            &config(100, 1, OverflowPolicy::Reject),
            Arc::new(RecordingHandler::default()),
        );
        for n in 0..100 {
            pool.submit(api_call(n)).await.unwrap();
        }

        let result = pool.submit(api_call(100)).await;
        assert!(matches!(result, Err(UsageError::QueueFull)));
        assert_eq!(pool.stats().rejected, 1);
    }

    #[tokio::test]
    async fn test_block_policy_gives_up_after_timeout() {
        let pool = IngestPool::new(
            &config(100, 1, OverflowPolicy::Block),
            Arc::new(RecordingHandler::default()),
        );
        for n in 0..100 {
            pool.submit(api_call(n)).await.unwrap();
        }

        let started = Instant::now();
        pool.submit(api_call(100)).await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(20));
        assert_eq!(pool.stats().dropped, 1);
    }

    #[tokio::test]
    async fn test_batch_needs_room_for_every_job() {
        let observer = Arc::new(CountingObserver::default());
        let pool = IngestPool::new(
            &config(100, 1, OverflowPolicy::Block),
            Arc::new(RecordingHandler::default()),
        )
        .with_failure_observer(observer.clone());
        for n in 0..99 {
            pool.submit(api_call(n)).await.unwrap();
        }

        pool.submit_all(vec![api_call(99), api_call(100)]).await.unwrap();
        assert_eq!(pool.pending_jobs(), 99);
        assert_eq!(pool.stats().dropped, 2);
        assert_eq!(observer.dropped.load(Ordering::Relaxed), 2);

        pool.submit_all(vec![api_call(101)]).await.unwrap();
        assert_eq!(pool.pending_jobs(), 100);
    }

    struct PanickingHandler;

    #[async_trait]
    impl JobHandler for PanickingHandler {
        async fn handle(&self, _event: &NewUsageEvent) -> Result<()> {
            panic!("handler bug");
        }
    }

    #[tokio::test]
    async fn test_shutdown_survives_panicked_worker() {
        let pool = IngestPool::new(
            &config(100, 1, OverflowPolicy::Drop),
            Arc::new(PanickingHandler),
        );
        for n in 0..3 {
            pool.submit(api_call(n)).await.unwrap();
        }
        pool.start().unwrap();

        let report = pool.shutdown().await;
        assert!(!report.timed_out);
        assert_eq!(report.discarded, 2);
        assert_eq!(pool.stats().processed, 0);
    }

    #[tokio::test]
    async fn test_failures_are_counted_not_propagated() {
        let observer = Arc::new(CountingObserver::default());
        let handler = Arc::new(RecordingHandler {
            fail: true,
            ..Default::default()
        });
        let pool = IngestPool::new(&config(100, 2, OverflowPolicy::Drop), handler)
            .with_failure_observer(observer.clone());
        pool.start().unwrap();

        for n in 0..3 {
            assert!(pool.submit(api_call(n)).await.is_ok());
        }
        pool.shutdown().await;

        assert_eq!(pool.stats().failed, 3);
        assert_eq!(observer.failed.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn test_shutdown_timeout_discards_backlog() {
        let handler = Arc::new(RecordingHandler {
            delay: Some(Duration::from_secs(30)),
            ..Default::default()
        });
        let mut cfg = config(100, 1, OverflowPolicy::Drop);
        cfg.shutdown_timeout_ms = 50;
        let pool = IngestPool::new(&cfg, handler.clone());
        pool.start().unwrap();

        for n in 0..5 {
            pool.submit(api_call(n)).await.unwrap();
        }
        let report = pool.shutdown().await;

        assert!(report.timed_out);
        assert!(report.discarded >= 4);
        assert!(handler.seen.lock().await.is_empty());
        assert_eq!(pool.stats().processed, 0);
    }

    #[tokio::test]
    async fn test_shutdown_without_start_and_twice() {
        let pool = IngestPool::new(
            &config(100, 3, OverflowPolicy::Drop),
            Arc::new(RecordingHandler::default()),
        );
        for n in 0..7 {
            pool.submit(api_call(n)).await.unwrap();
        }

        let first = pool.shutdown().await;
        assert!(!first.timed_out);
        assert_eq!(first.discarded, 7);

        let second = pool.shutdown().await;
        assert_eq!(second, ShutdownReport::default());
    }

    #[tokio::test]
    async fn test_submit_and_start_after_shutdown() {
        let pool = IngestPool::new(
            &config(100, 1, OverflowPolicy::Drop),
            Arc::new(RecordingHandler::default()),
        );
        pool.start().unwrap();
        pool.shutdown().await;

        assert!(matches!(
            pool.submit(api_call(0)).await,
            Err(UsageError::ShuttingDown)
        ));
        assert!(matches!(pool.start(), Err(UsageError::ShuttingDown)));
    }
}
