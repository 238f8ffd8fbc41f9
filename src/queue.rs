/// Background analysis queue: a bounded channel of session ids drained by a
/// pool of tokio worker tasks.
///
/// Lifecycle: `start_workers` once at startup, `stop_workers` once at
/// shutdown. Stopping refuses new jobs, lets the workers drain what is
/// already queued, and aborts any worker still busy after the grace period.
use crate::config::QueueConfig;
use crate::retry::{RetryDecision, RetryPolicy};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("analysis queue is full (capacity {capacity})")]
    Full { capacity: usize },
    #[error("analysis queue is shutting down")]
    ShuttingDown,
    #[error("analysis workers already started")]
    AlreadyStarted,
}

/// Failure reported by a `SessionProcessor` for one job.
pub trait JobFailure: std::fmt::Display {
    /// Whether trying again later could succeed.
    fn is_retryable(&self) -> bool;
}

/// Work performed for each dequeued session id.
#[async_trait]
pub trait SessionProcessor: Send + Sync {
    type Error: JobFailure + Send;

    async fn process(&self, session_id: &str) -> Result<(), Self::Error>;
}

/// The enqueue side of the queue, as seen by request handlers.
#[async_trait]
pub trait AnalysisQueue: Send + Sync {
    async fn enqueue_session_analysis(&self, session_id: &str) -> Result<(), QueueError>;

    /// Jobs waiting for a worker.
    fn queue_size(&self) -> usize;
}

#[derive(Debug)]
struct Job {
    session_id: String,
    enqueued_at: Instant,
}

pub struct QueueManager<P: SessionProcessor + 'static> {
    config: QueueConfig,
    processor: Arc<P>,
    tx: mpsc::Sender<Job>,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Job>>>,
    depth: Arc<AtomicUsize>,
    accepting: AtomicBool,
    started: AtomicBool,
    shutdown: watch::Sender<bool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl<P: SessionProcessor + 'static> QueueManager<P> {
    pub fn new(config: QueueConfig, processor: Arc<P>) -> Self {
        let (tx, rx) = mpsc::channel(config.capacity.max(1));
        let (shutdown, _) = watch::channel(false);
        Self {
            config,
            processor,
            tx,
            rx: Arc::new(tokio::sync::Mutex::new(rx)),
            depth: Arc::new(AtomicUsize::new(0)),
            accepting: AtomicBool::new(true),
            started: AtomicBool::new(false),
            shutdown,
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Spawn the worker pool. Jobs enqueued earlier are buffered and picked
    /// up as soon as the workers run.
    pub fn start_workers(&self) -> Result<(), QueueError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(QueueError::AlreadyStarted);
        }

        let policy = RetryPolicy::new(
            self.config.max_attempts,
            Duration::from_millis(self.config.initial_backoff_ms),
            Duration::from_millis(self.config.max_backoff_ms),
        );

        let mut handles = self.workers.lock().unwrap_or_else(|e| e.into_inner());
        for id in 0..self.config.workers {
            let worker = Worker {
                id,
                rx: Arc::clone(&self.rx),
                depth: Arc::clone(&self.depth),
                processor: Arc::clone(&self.processor),
                policy: policy.clone(),
                shutdown: self.shutdown.subscribe(),
            };
            handles.push(tokio::spawn(worker.run()));
        }

        tracing::info!(workers = self.config.workers, "analysis workers started");
        Ok(())
    }

    /// Stop accepting jobs, drain the queue, and wait for the workers.
    pub async fn stop_workers(&self) {
        self.accepting.store(false, Ordering::SeqCst);
        self.shutdown.send_replace(true);

        let handles = std::mem::take(&mut *self.workers.lock().unwrap_or_else(|e| e.into_inner()));
        let deadline = tokio::time::Instant::now()
            + Duration::from_secs(self.config.shutdown_grace_secs);

        for mut handle in handles {
            if tokio::time::timeout_at(deadline, &mut handle).await.is_err() {
                tracing::warn!("analysis worker did not finish within grace period, aborting");
                handle.abort();
            }
        }

        tracing::info!(
            abandoned = self.depth.load(Ordering::SeqCst),
            "analysis workers stopped"
        );
    }
}

#[async_trait]
impl<P: SessionProcessor + 'static> AnalysisQueue for QueueManager<P> {
    async fn enqueue_session_analysis(&self, session_id: &str) -> Result<(), QueueError> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(QueueError::ShuttingDown);
        }

        let job = Job {
            session_id: session_id.to_string(),
            enqueued_at: Instant::now(),
        };
        let timeout = Duration::from_millis(self.config.enqueue_timeout_ms);

        // Count before sending so a fast worker never decrements below zero.
        self.depth.fetch_add(1, Ordering::SeqCst);
        match tokio::time::timeout(timeout, self.tx.send(job)).await {
            Ok(Ok(())) => {
                tracing::debug!(session_id, "session queued for analysis");
                Ok(())
            }
            Ok(Err(_)) => {
                self.depth.fetch_sub(1, Ordering::SeqCst);
                Err(QueueError::ShuttingDown)
            }
            Err(_) => {
                self.depth.fetch_sub(1, Ordering::SeqCst);
                Err(QueueError::Full {
                    capacity: self.config.capacity,
                })
            }
        }
    }

    fn queue_size(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }
}

struct Worker<P: SessionProcessor> {
    id: usize,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Job>>>,
    depth: Arc<AtomicUsize>,
    processor: Arc<P>,
    policy: RetryPolicy,
    shutdown: watch::Receiver<bool>,
}

impl<P: SessionProcessor> Worker<P> {
    async fn run(mut self) {
        tracing::debug!(worker = self.id, "analysis worker running");

        loop {
            if *self.shutdown.borrow() {
                break;
            }
            let job = {
                let mut rx = self.rx.lock().await;
                tokio::select! {
                    biased;
                    _ = self.shutdown.changed() => None,
                    job = rx.recv() => job,
                }
            };
            match job {
                Some(job) => self.handle(job).await,
                None => break,
            }
        }

        // Drain whatever was accepted before shutdown.
        loop {
            let job = self.rx.lock().await.try_recv().ok();
            match job {
                Some(job) => self.handle(job).await,
                None => break,
            }
        }

        tracing::debug!(worker = self.id, "analysis worker exiting");
    }

    async fn handle(&self, job: Job) {
        self.depth.fetch_sub(1, Ordering::SeqCst);
        let waited_ms = job.enqueued_at.elapsed().as_millis() as u64;
        let mut attempts = 0;

        loop {
            attempts += 1;
            match self.processor.process(&job.session_id).await {
                Ok(()) => {
                    tracing::debug!(
                        worker = self.id,
                        session_id = %job.session_id,
                        attempts,
                        waited_ms,
                        "session analysis complete"
                    );
                    return;
                }
                Err(e) => {
                    match self
                        .policy
                        .evaluate(&job.session_id, attempts, e.is_retryable())
                    {
                        RetryDecision::Retry { delay, .. } => {
                            tracing::debug!(error = %e, "analysis attempt failed");
                            tokio::time::sleep(delay).await;
                        }
                        RetryDecision::GiveUp => {
                            tracing::error!(
                                worker = self.id,
                                session_id = %job.session_id,
                                attempts,
                                error = %e,
                                "session analysis failed"
                            );
                            return;
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[derive(Debug)]
    struct TestFailure {
        retryable: bool,
    }

    impl std::fmt::Display for TestFailure {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "test failure (retryable: {})", self.retryable)
        }
    }

    impl JobFailure for TestFailure {
        fn is_retryable(&self) -> bool {
            self.retryable
        }
    }

    /// Records every call; fails the first `failures[id]` calls for an id.
    #[derive(Default)]
    struct RecordingProcessor {
        calls: tokio::sync::Mutex<Vec<String>>,
        failures: Mutex<HashMap<String, (u32, bool)>>,
    }

    impl RecordingProcessor {
        fn failing(id: &str, times: u32, retryable: bool) -> Self {
            let p = Self::default();
            p.failures
                .lock()
                .unwrap()
                .insert(id.to_string(), (times, retryable));
            p
        }

        async fn calls(&self) -> Vec<String> {
            self.calls.lock().await.clone()
        }
    }

    #[async_trait]
    impl SessionProcessor for RecordingProcessor {
        type Error = TestFailure;

        async fn process(&self, session_id: &str) -> Result<(), TestFailure> {
            self.calls.lock().await.push(session_id.to_string());
            let mut failures = self.failures.lock().unwrap();
            if let Some((remaining, retryable)) = failures.get_mut(session_id) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(TestFailure {
                        retryable: *retryable,
                    });
                }
            }
            Ok(())
        }
    }

    fn config(workers: usize, capacity: usize) -> QueueConfig {
        QueueConfig {
            workers,
            capacity,
            enqueue_timeout_ms: 20,
            max_attempts: 3,
            initial_backoff_ms: 1,
            max_backoff_ms: 5,
            shutdown_grace_secs: 5,
        }
    }

    #[tokio::test]
    async fn single_worker_processes_in_order() {
        let processor = Arc::new(RecordingProcessor::default());
        let queue = QueueManager::new(config(1, 16), Arc::clone(&processor));

        for id in ["a", "b", "c"] {
            queue.enqueue_session_analysis(id).await.unwrap();
        }
        assert_eq!(queue.queue_size(), 3);

        queue.start_workers().unwrap();
        queue.stop_workers().await;

        assert_eq!(processor.calls().await, vec!["a", "b", "c"]);
        assert_eq!(queue.queue_size(), 0);
    }

    #[tokio::test]
    async fn worker_pool_processes_every_job() {
        let processor = Arc::new(RecordingProcessor::default());
        let queue = QueueManager::new(config(4, 64), Arc::clone(&processor));
        queue.start_workers().unwrap();

        for i in 0..20 {
            queue
                .enqueue_session_analysis(&format!("s{i}"))
                .await
                .unwrap();
        }
        queue.stop_workers().await;

        let mut calls = processor.calls().await;
        calls.sort();
        let mut expected: Vec<String> = (0..20).map(|i| format!("s{i}")).collect();
        expected.sort();
        assert_eq!(calls, expected);
    }

    #[tokio::test]
    async fn enqueue_after_stop_is_refused() {
        let processor = Arc::new(RecordingProcessor::default());
        let queue = QueueManager::new(config(1, 4), processor);
        queue.start_workers().unwrap();
        queue.stop_workers().await;

        let err = queue.enqueue_session_analysis("late").await.unwrap_err();
        assert_eq!(err, QueueError::ShuttingDown);
    }

    #[tokio::test]
    async fn full_queue_times_out() {
        let processor = Arc::new(RecordingProcessor::default());
        let queue = QueueManager::new(config(1, 1), processor);

        queue.enqueue_session_analysis("first").await.unwrap();
        let err = queue.enqueue_session_analysis("second").await.unwrap_err();

        assert_eq!(err, QueueError::Full { capacity: 1 });
        assert_eq!(queue.queue_size(), 1);
    }

    #[tokio::test]
    async fn start_twice_rejected() {
        let processor = Arc::new(RecordingProcessor::default());
        let queue = QueueManager::new(config(1, 4), processor);
        queue.start_workers().unwrap();
        assert_eq!(queue.start_workers(), Err(QueueError::AlreadyStarted));
        queue.stop_workers().await;
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let processor = Arc::new(RecordingProcessor::failing("flaky", 2, true));
        let queue = QueueManager::new(config(1, 4), Arc::clone(&processor));

        queue.enqueue_session_analysis("flaky").await.unwrap();
        queue.start_workers().unwrap();
        queue.stop_workers().await;

        assert_eq!(processor.calls().await, vec!["flaky", "flaky", "flaky"]);
    }

    #[tokio::test]
    async fn retries_stop_at_max_attempts() {
        let processor = Arc::new(RecordingProcessor::failing("broken", 10, true));
        let queue = QueueManager::new(config(1, 4), Arc::clone(&processor));

        queue.enqueue_session_analysis("broken").await.unwrap();
        queue.enqueue_session_analysis("fine").await.unwrap();
        queue.start_workers().unwrap();
        queue.stop_workers().await;

        assert_eq!(
            processor.calls().await,
            vec!["broken", "broken", "broken", "fine"]
        );
    }

    #[tokio::test]
    async fn permanent_failure_not_retried() {
        let processor = Arc::new(RecordingProcessor::failing("gone", 1, false));
        let queue = QueueManager::new(config(1, 4), Arc::clone(&processor));

        queue.enqueue_session_analysis("gone").await.unwrap();
        queue.start_workers().unwrap();
        queue.stop_workers().await;

        assert_eq!(processor.calls().await, vec!["gone"]);
    }
}
