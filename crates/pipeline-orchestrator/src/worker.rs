//! Background job processing.
//!
//! Pipeline requests can be queued instead of run inline. The queue delivers
//! each job at least once; the processor reports an explicit [`JobOutcome`]
//! carrying the attempt number, and the queue redelivers retry-requested
//! jobs after an exponential backoff until the attempt budget is spent.
//!
//! Every queued request carries an idempotency key (the job id unless the
//! caller supplied one), so a redelivered job that already finished replays
//! its stored result instead of calling the upstreams again.
//!
//! Finished and failed jobs stay visible for a retention period, then are
//! forgotten.

use async_trait::async_trait;
use dashmap::DashMap;
use pipeline_core::PipelineRequest;
use pipeline_resilience::{RetryConfig, RetryPolicy};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::orchestrator::PipelineOrchestrator;

/// Job identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    /// Generate a new job id
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// String form
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What the processor asks the queue to do with a delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// Done
    Completed {
        /// Request id of the produced result
        request_id: String,
    },
    /// Deliver again later
    Retry {
        /// Attempt that failed
        attempt: u32,
        /// Failure description
        reason: String,
    },
    /// Give up
    Failed {
        /// Failure description
        reason: String,
    },
}

/// Observable job state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for a worker
    Queued {
        /// Attempt about to run
        attempt: u32,
    },
    /// Being processed
    Running {
        /// Current attempt
        attempt: u32,
    },
    /// Waiting out a backoff delay
    RetryScheduled {
        /// Attempt that failed
        attempt: u32,
        /// Delay before the next attempt
        delay_ms: u64,
        /// Failure description
        reason: String,
    },
    /// Finished
    Completed {
        /// Attempts used
        attempts: u32,
        /// Request id of the produced result
        request_id: String,
    },
    /// Given up
    Failed {
        /// Attempts used
        attempts: u32,
        /// Failure description
        reason: String,
    },
}

impl JobStatus {
    /// Whether the job will not run again
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed { .. } | Self::Failed { .. })
    }
}

/// Queue errors
#[derive(Debug, Clone, Error)]
pub enum QueueError {
    /// The dispatcher has stopped
    #[error("Job queue is closed")]
    Closed,
}

/// Processes one delivery of a job
#[async_trait]
pub trait JobProcessor: Send + Sync {
    /// Process `request`; `attempt` is 1-based
    async fn process(&self, request: &PipelineRequest, attempt: u32, max_attempts: u32)
        -> JobOutcome;
}

/// Durable-queue seam
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Queue a request for background processing
    async fn enqueue(&self, request: PipelineRequest) -> Result<JobId, QueueError>;

    /// Current state of a job
    fn status(&self, id: &JobId) -> Option<JobStatus>;
}

/// Runs queued requests through the orchestrator
#[derive(Debug, Clone)]
pub struct PipelineJobProcessor {
    orchestrator: PipelineOrchestrator,
}

impl PipelineJobProcessor {
    /// Create a processor
    #[must_use]
    pub fn new(orchestrator: PipelineOrchestrator) -> Self {
        Self { orchestrator }
    }
}

#[async_trait]
impl JobProcessor for PipelineJobProcessor {
    async fn process(
        &self,
        request: &PipelineRequest,
        attempt: u32,
        max_attempts: u32,
    ) -> JobOutcome {
        match self.orchestrator.run(request.clone()).await {
            Ok(result) => JobOutcome::Completed {
                request_id: result.request_id.to_string(),
            },
            Err(e) if e.is_retryable() && attempt < max_attempts => JobOutcome::Retry {
                attempt,
                reason: e.to_string(),
            },
            Err(e) => JobOutcome::Failed {
                reason: e.to_string(),
            },
        }
    }
}

/// How long terminal job states stay visible by default
pub const DEFAULT_STATUS_RETENTION: Duration = Duration::from_secs(3600);

#[derive(Debug)]
struct Tracked {
    status: JobStatus,
    settled_at: Option<Instant>,
}

/// Job states; terminal ones expire after `retention`
#[derive(Debug)]
struct JobBook {
    entries: DashMap<JobId, Tracked>,
    retention: Duration,
}

impl JobBook {
    fn new(retention: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            retention,
        }
    }

    fn is_live(&self, tracked: &Tracked) -> bool {
        tracked
            .settled_at
            .map_or(true, |at| at.elapsed() < self.retention)
    }

    fn set(&self, id: JobId, status: JobStatus) {
        let settled_at = status.is_terminal().then(Instant::now);
        self.entries.insert(id, Tracked { status, settled_at });
    }

    fn get(&self, id: &JobId) -> Option<JobStatus> {
        self.entries
            .get(id)
            .filter(|tracked| self.is_live(tracked))
            .map(|tracked| tracked.status.clone())
    }

    fn prune(&self) {
        self.entries.retain(|_, tracked| self.is_live(tracked));
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

#[derive(Debug)]
struct Delivery {
    id: JobId,
    request: PipelineRequest,
    attempt: u32,
}

#[derive(Clone)]
struct Dispatch {
    processor: Arc<dyn JobProcessor>,
    jobs: Arc<JobBook>,
    policy: RetryPolicy,
    tx: mpsc::UnboundedSender<Delivery>,
}

impl Dispatch {
    async fn deliver(self, delivery: Delivery) {
        let Delivery {
            id,
            request,
            attempt,
        } = delivery;
        let max_attempts = self.policy.config().max_attempts;

        self.jobs.set(id.clone(), JobStatus::Running { attempt });
        debug!(job_id = %id, attempt, max_attempts, "Processing job");

        let status = match self.processor.process(&request, attempt, max_attempts).await {
            JobOutcome::Completed { request_id } => {
                info!(job_id = %id, attempt, "Job completed");
                JobStatus::Completed {
                    attempts: attempt,
                    request_id,
                }
            }
            JobOutcome::Retry {
                attempt: failed,
                reason,
            } if failed < max_attempts => {
                let delay = self.policy.compute_delay(failed.saturating_sub(1));
                warn!(
                    job_id = %id,
                    attempt = failed,
                    delay_ms = delay.as_millis() as u64,
                    reason = %reason,
                    "Job failed, redelivering"
                );
                let tx = self.tx.clone();
                let next = Delivery {
                    id: id.clone(),
                    request,
                    attempt: failed + 1,
                };
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    // Closed only when the queue itself is gone
                    let _ = tx.send(next);
                });
                JobStatus::RetryScheduled {
                    attempt: failed,
                    delay_ms: u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    reason,
                }
            }
            JobOutcome::Retry { attempt, reason } => {
                warn!(job_id = %id, attempt, reason = %reason, "Job exhausted its attempts");
                JobStatus::Failed {
                    attempts: attempt,
                    reason,
                }
            }
            JobOutcome::Failed { reason } => {
                warn!(job_id = %id, attempt, reason = %reason, "Job failed");
                JobStatus::Failed {
                    attempts: attempt,
                    reason,
                }
            }
        };
        let terminal = status.is_terminal();
        self.jobs.set(id, status);
        if terminal {
            self.jobs.prune();
        }
    }
}

/// In-process queue with at-least-once delivery
///
/// Dropping the queue stops the dispatcher.
pub struct InMemoryJobQueue {
    tx: mpsc::UnboundedSender<Delivery>,
    jobs: Arc<JobBook>,
    dispatcher: JoinHandle<()>,
}

impl fmt::Debug for InMemoryJobQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryJobQueue")
            .field("jobs", &self.jobs.len())
            .finish_non_exhaustive()
    }
}

impl InMemoryJobQueue {
    /// Start a dispatcher running up to `concurrency` jobs at once
    ///
    /// Terminal job states are kept for [`DEFAULT_STATUS_RETENTION`].
    /// Must be called from within a Tokio runtime.
    #[must_use]
    pub fn start(processor: Arc<dyn JobProcessor>, retry: RetryConfig, concurrency: usize) -> Self {
        Self::start_with_retention(processor, retry, concurrency, DEFAULT_STATUS_RETENTION)
    }

    /// Like [`InMemoryJobQueue::start`], keeping terminal job states for `retention`
    #[must_use]
    pub fn start_with_retention(
        processor: Arc<dyn JobProcessor>,
        retry: RetryConfig,
        concurrency: usize,
        retention: Duration,
    ) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Delivery>();
        let jobs = Arc::new(JobBook::new(retention));
        let dispatch = Dispatch {
            processor,
            jobs: Arc::clone(&jobs),
            policy: RetryPolicy::new(retry),
            tx: tx.clone(),
        };
        let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));

        let dispatcher = tokio::spawn(async move {
            while let Some(delivery) = rx.recv().await {
                let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
                    break;
                };
                let dispatch = dispatch.clone();
                tokio::spawn(async move {
                    let _permit = permit;
                    dispatch.deliver(delivery).await;
                });
            }
        });

        Self {
            tx,
            jobs,
            dispatcher,
        }
    }

    /// Number of tracked jobs, including expired ones not yet pruned
    #[must_use]
    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    /// Whether no job is tracked
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.jobs.len() == 0
    }
}

impl Drop for InMemoryJobQueue {
    fn drop(&mut self) {
        self.dispatcher.abort();
    }
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    async fn enqueue(&self, mut request: PipelineRequest) -> Result<JobId, QueueError> {
        let id = JobId::generate();
        request
            .idempotency_key
            .get_or_insert_with(|| format!("job:{id}"));

        self.jobs.prune();
        self.jobs.set(id.clone(), JobStatus::Queued { attempt: 1 });
        self.tx
            .send(Delivery {
                id: id.clone(),
                request,
                attempt: 1,
            })
            .map_err(|_| QueueError::Closed)?;
        info!(job_id = %id, "Job queued");
        Ok(id)
    }

    fn status(&self, id: &JobId) -> Option<JobStatus> {
        self.jobs.get(id)
    }
}
