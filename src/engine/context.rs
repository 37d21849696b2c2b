use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::history::{HistoryEvent, StepLog};
use super::options::StepOptions;
use super::worker::Workers;
use crate::error::{PipelineError, StepError, TimeoutKind};

/// Handle passed to every step attempt.
#[derive(Clone)]
pub struct StepContext {
    heartbeat: Arc<watch::Sender<String>>,
    attempt: u32,
    cancel: CancellationToken,
}

impl StepContext {
    /// Report liveness. Steps with a heartbeat timeout must call this more
    /// often than the timeout.
    pub fn heartbeat(&self, details: impl Into<String>) {
        let details = details.into();
        trace!(attempt = self.attempt, details = %details, "Heartbeat");
        self.heartbeat.send_replace(details);
    }

    /// 1-based number of this attempt.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Context for calling a step body outside of a workflow.
    pub fn standalone() -> Self {
        let (tx, _) = watch::channel(String::new());
        Self {
            heartbeat: Arc::new(tx),
            attempt: 1,
            cancel: CancellationToken::new(),
        }
    }

    /// Last heartbeat sent through this context.
    pub fn last_heartbeat(&self) -> String {
        self.heartbeat.borrow().clone()
    }
}

struct RunInner {
    workflow_id: String,
    run: u64,
    log: Arc<dyn StepLog>,
    workers: Workers,
    history: HashMap<u64, HistoryEvent>,
    next_seq: AtomicU64,
    settled: AtomicBool,
}

/// Handle through which a workflow issues its steps.
///
/// Steps are numbered in the order they are issued. When a run is resumed,
/// steps with a recorded result return it without executing again, so a
/// workflow must issue the same steps in the same order on every run.
#[derive(Clone)]
pub struct WorkflowContext {
    inner: Arc<RunInner>,
    cancel: CancellationToken,
}

impl WorkflowContext {
    pub(crate) fn new(
        workflow_id: String,
        run: u64,
        log: Arc<dyn StepLog>,
        workers: Workers,
        history: HashMap<u64, HistoryEvent>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(RunInner {
                workflow_id,
                run,
                log,
                workers,
                history,
                next_seq: AtomicU64::new(0),
                settled: AtomicBool::new(false),
            }),
            cancel,
        }
    }

    pub fn workflow_id(&self) -> &str {
        &self.inner.workflow_id
    }

    pub fn run(&self) -> u64 {
        self.inner.run
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// A context for the same run that ignores this run's cancellation.
    ///
    /// Compensation and cleanup steps are issued through it.
    pub fn detached(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            cancel: CancellationToken::new(),
        }
    }

    /// Mark that cleanup actions ran for this run. Recorded results may now
    /// point at resources that no longer exist, so a cancelled run is closed
    /// instead of being left open for replay.
    pub(crate) fn mark_settled(&self) {
        self.inner.settled.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_settled(&self) -> bool {
        self.inner.settled.load(Ordering::SeqCst)
    }

    /// Sleep for `duration`, or fail early if the run is cancelled.
    pub async fn sleep(&self, duration: Duration) -> Result<(), PipelineError> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(PipelineError::Cancelled),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }

    /// Issue a step.
    ///
    /// The sequence number is taken when this is called, not when the
    /// returned future is first polled, so steps fanned out together keep a
    /// stable numbering.
    pub fn execute<T, F, Fut>(
        &self,
        name: &str,
        options: StepOptions,
        step: F,
    ) -> impl Future<Output = Result<T, PipelineError>> + Send + 'static
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: Fn(StepContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, StepError>> + Send + 'static,
    {
        let seq = self.inner.next_seq.fetch_add(1, Ordering::SeqCst);
        let ctx = self.clone();
        let name = name.to_string();

        async move {
            if let Some(event) = ctx.inner.history.get(&seq) {
                return ctx.replay(seq, &name, event);
            }

            match ctx.attempts(&name, &options, &step).await {
                Ok(value) => {
                    let output = serde_json::to_value(&value)
                        .map_err(|e| PipelineError::Output(e.to_string()))?;
                    ctx.record(HistoryEvent::StepCompleted {
                        run: ctx.inner.run,
                        seq,
                        step: name,
                        output,
                    })
                    .await?;
                    Ok(value)
                }
                Err(StepError::Cancelled) => Err(PipelineError::Cancelled),
                Err(error) => {
                    ctx.record(HistoryEvent::StepFailed {
                        run: ctx.inner.run,
                        seq,
                        step: name.clone(),
                        error: error.clone(),
                    })
                    .await?;
                    Err(PipelineError::Step {
                        step: name,
                        source: error,
                    })
                }
            }
        }
    }

    fn replay<T: DeserializeOwned>(
        &self,
        seq: u64,
        name: &str,
        event: &HistoryEvent,
    ) -> Result<T, PipelineError> {
        let mismatch = |found: &str| PipelineError::NonDeterministic {
            seq,
            expected: name.to_string(),
            found: found.to_string(),
        };

        match event {
            HistoryEvent::StepCompleted { step, output, .. } => {
                if step != name {
                    return Err(mismatch(step));
                }
                debug!(workflow_id = %self.inner.workflow_id, seq, step = name, "Replaying recorded step");
                serde_json::from_value(output.clone())
                    .map_err(|e| PipelineError::Output(e.to_string()))
            }
            HistoryEvent::StepFailed { step, error, .. } => {
                if step != name {
                    return Err(mismatch(step));
                }
                Err(PipelineError::Step {
                    step: step.clone(),
                    source: error.clone(),
                })
            }
            other => Err(mismatch(&format!("{:?}", other))),
        }
    }

    async fn record(&self, event: HistoryEvent) -> Result<(), PipelineError> {
        self.inner
            .log
            .append(&self.inner.workflow_id, &event)
            .await
            .map_err(PipelineError::from)
    }

    /// Run attempts until success, a non-retryable failure or the retry
    /// policy gives up.
    async fn attempts<T, F, Fut>(
        &self,
        name: &str,
        options: &StepOptions,
        step: &F,
    ) -> Result<T, StepError>
    where
        F: Fn(StepContext) -> Fut,
        Fut: Future<Output = Result<T, StepError>>,
    {
        let mut attempt = 1;
        loop {
            if self.cancel.is_cancelled() {
                return Err(StepError::Cancelled);
            }

            match self.attempt(options, attempt, step).await {
                Ok(value) => return Ok(value),
                Err(StepError::Cancelled) => return Err(StepError::Cancelled),
                Err(error) if error.is_retryable() && options.retry.allows_retry(attempt) => {
                    let delay = options.retry.backoff(attempt);
                    warn!(
                        workflow_id = %self.inner.workflow_id,
                        step = name,
                        attempt,
                        error = %error,
                        retry_in = ?delay,
                        "Step attempt failed, retrying"
                    );
                    if self.sleep(delay).await.is_err() {
                        return Err(StepError::Cancelled);
                    }
                    attempt += 1;
                }
                Err(error) => {
                    warn!(
                        workflow_id = %self.inner.workflow_id,
                        step = name,
                        attempt,
                        error = %error,
                        "Step failed"
                    );
                    return Err(error);
                }
            }
        }
    }

    /// One attempt: wait for a worker slot, then run the step body under its
    /// start-to-close limit and heartbeat watchdog.
    async fn attempt<T, F, Fut>(
        &self,
        options: &StepOptions,
        attempt: u32,
        step: &F,
    ) -> Result<T, StepError>
    where
        F: Fn(StepContext) -> Fut,
        Fut: Future<Output = Result<T, StepError>>,
    {
        let wait = options.schedule_to_start.unwrap_or(options.start_to_close);
        let _permit = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(StepError::Cancelled),
            permit = self.inner.workers.acquire(options.queue.as_ref(), wait) => permit?,
        };

        let (tx, mut rx) = watch::channel(String::new());
        let step_ctx = StepContext {
            heartbeat: Arc::new(tx),
            attempt,
            cancel: self.cancel.child_token(),
        };

        let work = tokio::time::timeout(options.start_to_close, step(step_ctx.clone()));
        let watchdog = async {
            let Some(limit) = options.heartbeat else {
                return std::future::pending::<()>().await;
            };
            // The sender lives in `step_ctx`, so `changed` only fails after
            // the attempt is over
            while let Ok(Ok(())) = tokio::time::timeout(limit, rx.changed()).await {}
        };

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(StepError::Cancelled),
            result = work => result.unwrap_or(Err(StepError::timeout(TimeoutKind::StartToClose))),
            _ = watchdog => Err(StepError::timeout(TimeoutKind::Heartbeat)),
        }
    }
}
