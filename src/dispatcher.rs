//! Priority Dispatcher - the lookup job queue
//!
//! Owns two FIFO lanes (`high`, `low`) and a fixed pool of worker loops.
//! Each worker: (1) waits for a rate-limiter token, (2) pops the head of
//! `high`, else `low`, blocking when both are empty, (3) calls the upstream
//! client, (4) classifies the outcome into a job state transition.
//!
//! ```text
//! enqueue ──▶ [high lane] ──┐
//!                           ├──▶ worker ──▶ token ──▶ upstream fetch
//! enqueue ──▶ [low lane] ───┘                │
//!                ▲                           ▼
//!                └──── Retrying (backoff) ◀─ classify ──▶ resolve registry
//! ```
//!
//! Ordering: FIFO within a lane; strict high-over-low across lanes.
//! Starvation of `low` is accepted: interactive traffic is human-paced and
//! inherently small.
//!
//! # Error Handling
//!
//! Workers never let a failure escape the loop. Every outcome becomes a
//! state transition: permanent failures resolve terminally on the first
//! attempt, transient ones re-enqueue with exponential backoff until the
//! attempt budget is spent, and shutdown resolves everything still queued
//! with `ShuttingDown` so no caller hangs.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::config::LookupConfig;
use crate::domain::ports::UpstreamClient;
use crate::domain::{LookupKey, Priority};
use crate::error::{Error, Result};
use crate::limiter::{RateLimiter, RateLimiterStats};
use crate::registry::InFlightRegistry;

// =============================================================================
// Job
// =============================================================================

/// Lifecycle state of a lookup job.
///
/// `Succeeded` and `Failed` are terminal; `Retrying` goes back to `Queued`
/// after its backoff delay, preserving the attempt count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Queued,
    InFlight,
    Retrying,
    Succeeded,
    Failed,
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobState::Queued => write!(f, "Queued"),
            JobState::InFlight => write!(f, "InFlight"),
            JobState::Retrying => write!(f, "Retrying"),
            JobState::Succeeded => write!(f, "Succeeded"),
            JobState::Failed => write!(f, "Failed"),
        }
    }
}

/// One queued lookup. Never persisted; lives only for the upstream round
/// trip plus retries.
#[derive(Debug, Clone)]
pub struct Job {
    pub key: LookupKey,
    pub priority: Priority,
    pub enqueued_at: Instant,
    pub attempts: u32,
    pub state: JobState,
}

impl Job {
    fn new(key: LookupKey, priority: Priority) -> Self {
        Self {
            key,
            priority,
            enqueued_at: Instant::now(),
            attempts: 0,
            state: JobState::Queued,
        }
    }
}

// =============================================================================
// Statistics
// =============================================================================

/// Counters for the dispatcher, updated by workers.
#[derive(Debug, Default)]
pub struct DispatcherStats {
    /// Jobs resolved successfully
    pub succeeded_total: AtomicU64,

    /// Jobs resolved with a terminal error
    pub failed_total: AtomicU64,

    /// Transient failures that were re-enqueued
    pub retries_total: AtomicU64,

    /// Jobs currently executing an upstream call
    pub in_flight: AtomicUsize,
}

/// Queue depth per lane.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct LaneDepths {
    pub high: usize,
    pub low: usize,
}

/// Snapshot for the `/queue/status`-style endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    pub queued: LaneDepths,
    pub in_flight: usize,
    pub succeeded_total: u64,
    pub failed_total: u64,
    pub retries_total: u64,
    pub rate_limiter: RateLimiterStats,
}

// =============================================================================
// Priority Dispatcher
// =============================================================================

#[derive(Default)]
struct Lanes {
    high: VecDeque<Job>,
    low: VecDeque<Job>,
}

/// The lookup job queue: two priority lanes served by a bounded worker
/// pool, gated by the shared [`RateLimiter`].
///
/// Constructed once at process start with injected config; `drain()`ed at
/// shutdown.
pub struct PriorityDispatcher {
    config: LookupConfig,
    lanes: Mutex<Lanes>,
    job_ready: Notify,
    limiter: Arc<RateLimiter>,
    registry: Arc<InFlightRegistry>,
    upstream: Arc<dyn UpstreamClient>,
    shutdown: CancellationToken,
    accepting: AtomicBool,
    stats: DispatcherStats,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl PriorityDispatcher {
    /// Create a new dispatcher. Workers are not running until [`start`] is
    /// called.
    ///
    /// [`start`]: PriorityDispatcher::start
    pub fn new(
        config: LookupConfig,
        limiter: Arc<RateLimiter>,
        registry: Arc<InFlightRegistry>,
        upstream: Arc<dyn UpstreamClient>,
    ) -> Result<Arc<Self>> {
        config.validate()?;

        Ok(Arc::new(Self {
            config,
            lanes: Mutex::new(Lanes::default()),
            job_ready: Notify::new(),
            limiter,
            registry,
            upstream,
            shutdown: CancellationToken::new(),
            accepting: AtomicBool::new(true),
            stats: DispatcherStats::default(),
            workers: Mutex::new(Vec::new()),
        }))
    }

    /// Spawn the worker pool.
    pub fn start(this: &Arc<Self>) {
        let mut workers = this.workers.lock();
        for worker_id in 0..this.config.worker_count {
            let dispatcher = Arc::clone(this);
            workers.push(tokio::spawn(dispatcher.worker_loop(worker_id)));
        }
        info!(workers = this.config.worker_count, "lookup dispatcher started");
    }

    /// Enqueue a fresh job for `key` at the given priority.
    ///
    /// The caller must hold a registry entry for the key; the dispatcher
    /// resolves that entry when the job reaches a terminal state.
    pub fn enqueue(&self, key: LookupKey, priority: Priority) -> Result<()> {
        let job = Job::new(key, priority);
        if !self.push_job(job) {
            return Err(Error::ShuttingDown);
        }
        Ok(())
    }

    /// Move a still-queued job for `key` from the low lane to the high
    /// lane. No-op if the job is already high, already dispatched, or
    /// unknown. Called when a high-priority request attaches to an
    /// existing low-priority lookup.
    pub fn promote(&self, key: &LookupKey) {
        let mut lanes = self.lanes.lock();
        if let Some(pos) = lanes.low.iter().position(|j| &j.key == key) {
            if let Some(mut job) = lanes.low.remove(pos) {
                job.priority = Priority::High;
                debug!(key = %job.key, "promoted queued job to high lane");
                lanes.high.push_back(job);
            }
        }
    }

    /// Stop accepting enqueues, resolve every still-queued job with
    /// `ShuttingDown`, and wait for in-flight worker calls to finish.
    #[instrument(skip(self))]
    pub async fn drain(&self) {
        info!("draining lookup dispatcher");
        self.accepting.store(false, Ordering::SeqCst);
        self.shutdown.cancel();

        let drained: Vec<Job> = {
            let mut lanes = self.lanes.lock();
            let mut jobs: Vec<Job> = lanes.high.drain(..).collect();
            jobs.extend(lanes.low.drain(..));
            jobs
        };
        if !drained.is_empty() {
            warn!(count = drained.len(), "resolving queued jobs with shutdown error");
        }
        for job in &drained {
            self.registry.resolve(&job.key, Err(Error::ShuttingDown));
        }

        let handles: Vec<JoinHandle<()>> = self.workers.lock().drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                error!("lookup worker task failed: {}", e);
            }
        }
        info!("lookup dispatcher drained");
    }

    /// Token that fires when the dispatcher begins draining. Shared with
    /// the service layer so pass-through calls unblock on shutdown too.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Queue and counter snapshot.
    pub fn stats(&self) -> QueueStats {
        let (high, low) = {
            let lanes = self.lanes.lock();
            (lanes.high.len(), lanes.low.len())
        };
        QueueStats {
            queued: LaneDepths { high, low },
            in_flight: self.stats.in_flight.load(Ordering::Relaxed),
            succeeded_total: self.stats.succeeded_total.load(Ordering::Relaxed),
            failed_total: self.stats.failed_total.load(Ordering::Relaxed),
            retries_total: self.stats.retries_total.load(Ordering::Relaxed),
            rate_limiter: self.limiter.stats(),
        }
    }

    // =========================================================================
    // Worker Loop
    // =========================================================================

    async fn worker_loop(self: Arc<Self>, worker_id: usize) {
        debug!(worker_id, "lookup worker started");
        loop {
            // Token first, then lane head: the high lane is inspected at
            // dispatch time, so a high job arriving during the token wait
            // still wins over older low jobs.
            if self.limiter.acquire(&self.shutdown).await.is_err() {
                break;
            }
            let Some(job) = self.next_job().await else {
                break;
            };
            Self::execute(&self, job).await;
        }
        debug!(worker_id, "lookup worker stopped");
    }

    /// Pop the next job, high lane first, waiting for an enqueue or
    /// shutdown when both lanes are empty.
    async fn next_job(&self) -> Option<Job> {
        loop {
            let notified = self.job_ready.notified();
            {
                let mut lanes = self.lanes.lock();
                let job = match lanes.high.pop_front() {
                    Some(job) => Some(job),
                    None => lanes.low.pop_front(),
                };
                if let Some(job) = job {
                    if !lanes.high.is_empty() || !lanes.low.is_empty() {
                        // Wake another idle worker; Notify holds one permit
                        self.job_ready.notify_one();
                    }
                    return Some(job);
                }
            }
            tokio::select! {
                _ = notified => {}
                _ = self.shutdown.cancelled() => return None,
            }
        }
    }

    /// Run one attempt of a job and turn the outcome into a state
    /// transition. Never returns an error: every path resolves the
    /// registry or schedules a retry.
    #[instrument(skip(this, job), fields(key = %job.key, attempt = job.attempts + 1))]
    async fn execute(this: &Arc<Self>, mut job: Job) {
        job.state = JobState::InFlight;
        job.attempts += 1;

        this.stats.in_flight.fetch_add(1, Ordering::Relaxed);
        let result = tokio::time::timeout(
            this.config.attempt_timeout,
            this.upstream.fetch_by_key(&job.key),
        )
        .await;
        this.stats.in_flight.fetch_sub(1, Ordering::Relaxed);

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(_) => Err(Error::Timeout),
        };

        match outcome {
            Ok(record) => {
                job.state = JobState::Succeeded;
                this.stats.succeeded_total.fetch_add(1, Ordering::Relaxed);
                debug!(key = %job.key, attempts = job.attempts, "lookup succeeded");
                this.registry.resolve(&job.key, Ok(record));
            }
            Err(err) if err.is_permanent() => {
                job.state = JobState::Failed;
                this.stats.failed_total.fetch_add(1, Ordering::Relaxed);
                debug!(key = %job.key, %err, "lookup failed permanently");
                this.registry.resolve(&job.key, Err(err));
            }
            Err(err) if err.is_transient() => {
                if job.attempts >= this.config.max_attempts {
                    job.state = JobState::Failed;
                    this.stats.failed_total.fetch_add(1, Ordering::Relaxed);
                    warn!(key = %job.key, attempts = job.attempts, %err, "retry budget exhausted");
                    this.registry.resolve(
                        &job.key,
                        Err(Error::Exhausted {
                            attempts: job.attempts,
                            last: err.to_string(),
                        }),
                    );
                } else {
                    this.stats.retries_total.fetch_add(1, Ordering::Relaxed);
                    let delay = err
                        .retry_after()
                        .unwrap_or_else(|| this.config.backoff_for_attempt(job.attempts));
                    warn!(key = %job.key, attempt = job.attempts, delay_ms = delay.as_millis() as u64, %err, "transient failure, will retry");
                    Self::schedule_retry(Arc::clone(this), job, delay);
                }
            }
            Err(err) => {
                // Not part of the upstream taxonomy (adapter bug); fail
                // terminally rather than loop on it.
                job.state = JobState::Failed;
                this.stats.failed_total.fetch_add(1, Ordering::Relaxed);
                error!(key = %job.key, %err, "unclassified upstream error");
                this.registry.resolve(&job.key, Err(err));
            }
        }
    }

    /// Re-enqueue a job after its backoff delay (`Retrying → Queued`).
    ///
    /// The lane is re-read from the registry on re-enqueue so a priority
    /// bump that arrived mid-backoff takes effect; the backoff schedule
    /// itself is never reset by a bump.
    fn schedule_retry(this: Arc<Self>, mut job: Job, delay: Duration) {
        job.state = JobState::Retrying;
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {
                    job.state = JobState::Queued;
                    if let Some(priority) = this.registry.current_priority(&job.key) {
                        job.priority = priority;
                    }
                    if !this.push_job(job.clone()) {
                        this.registry.resolve(&job.key, Err(Error::ShuttingDown));
                    }
                }
                _ = this.shutdown.cancelled() => {
                    this.registry.resolve(&job.key, Err(Error::ShuttingDown));
                }
            }
        });
    }

    /// Append a job to its lane. Returns false when draining.
    fn push_job(&self, job: Job) -> bool {
        if !self.accepting.load(Ordering::SeqCst) {
            return false;
        }
        {
            let mut lanes = self.lanes.lock();
            match job.priority {
                Priority::High => lanes.high.push_back(job),
                Priority::Low => lanes.low.push_back(job),
            }
        }
        self.job_ready.notify_one();
        true
    }
}

// =============================================================================
// Tests
// =============================================================================
