use std::collections::HashMap;
use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use lru::LruCache;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use super::context::WorkflowContext;
use super::history::{HistoryEvent, LatestRun, StepLog};
use super::options::{ReusePolicy, RunOptions};
use super::worker::Workers;
use crate::error::PipelineError;

/// Default capacity of the completed-output cache.
pub const DEFAULT_RESULT_CACHE_CAPACITY: usize = 10_000;

type RunResult = Result<Value, PipelineError>;
type BoxedWorkflow = Box<dyn FnOnce(WorkflowContext) -> BoxFuture<'static, RunResult> + Send>;

struct InFlightRun {
    result: watch::Sender<Option<RunResult>>,
    cancel: CancellationToken,
}

struct EngineInner {
    log: Arc<dyn StepLog>,
    workers: Workers,
    shutdown: CancellationToken,
    tasks: TaskTracker,
    completed: Mutex<LruCache<String, Value>>,
    in_flight: Mutex<HashMap<String, Arc<InFlightRun>>>,
}

/// Runs workflows durably and deduplicates them by identity.
///
/// Each identity has at most one run in flight; concurrent callers share its
/// result. Completed outputs are cached in memory and recoverable from the
/// step log. Runs execute on their own tasks, so a caller going away never
/// cancels a run. Only [`Engine::cancel`] and [`Engine::shutdown`] do.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    pub fn new(log: Arc<dyn StepLog>, workers: Workers, result_cache: usize) -> Self {
        let capacity = NonZeroUsize::new(result_cache).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Arc::new(EngineInner {
                log,
                workers,
                shutdown: CancellationToken::new(),
                tasks: TaskTracker::new(),
                completed: Mutex::new(LruCache::new(capacity)),
                in_flight: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn workers(&self) -> &Workers {
        &self.inner.workers
    }

    /// Run `workflow` under `workflow_id`, or attach to an existing run.
    pub async fn run<T, W, Fut>(
        &self,
        workflow_id: &str,
        options: RunOptions,
        workflow: W,
    ) -> Result<T, PipelineError>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        W: FnOnce(WorkflowContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, PipelineError>> + Send + 'static,
    {
        let boxed: BoxedWorkflow = Box::new(move |ctx| {
            async move {
                let output = workflow(ctx).await?;
                serde_json::to_value(output).map_err(|e| PipelineError::Output(e.to_string()))
            }
            .boxed()
        });

        let value = self.run_value(workflow_id, options, boxed).await?;
        serde_json::from_value(value).map_err(|e| PipelineError::Output(e.to_string()))
    }

    async fn run_value(
        &self,
        workflow_id: &str,
        options: RunOptions,
        workflow: BoxedWorkflow,
    ) -> RunResult {
        if options.reuse == ReusePolicy::ReuseCompleted {
            if let Some(output) = self.inner.completed.lock().await.get(workflow_id) {
                debug!(workflow_id, "Reusing cached workflow output");
                return Ok(output.clone());
            }
        }

        let mut rx = {
            let mut in_flight = self.inner.in_flight.lock().await;
            match in_flight.get(workflow_id) {
                Some(run) => {
                    debug!(workflow_id, "Joining running workflow");
                    run.result.subscribe()
                }
                None => {
                    if self.inner.shutdown.is_cancelled() {
                        return Err(PipelineError::Cancelled);
                    }
                    let (tx, rx) = watch::channel(None);
                    let cancel = self.inner.shutdown.child_token();
                    in_flight.insert(
                        workflow_id.to_string(),
                        Arc::new(InFlightRun {
                            result: tx,
                            cancel: cancel.clone(),
                        }),
                    );
                    let engine = self.clone();
                    let id = workflow_id.to_string();
                    self.inner
                        .tasks
                        .spawn(async move { engine.drive(id, options, cancel, workflow).await });
                    rx
                }
            }
        };

        let result = rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| PipelineError::Aborted("run dropped its result".to_string()))?;
        result.clone().unwrap_or(Err(PipelineError::Cancelled))
    }

    /// Execute one run to completion and publish its result.
    async fn drive(
        self,
        workflow_id: String,
        options: RunOptions,
        cancel: CancellationToken,
        workflow: BoxedWorkflow,
    ) {
        let engine = self.clone();
        let id = workflow_id.clone();
        let handle =
            tokio::spawn(async move { engine.execute(&id, &options, cancel, workflow).await });
        let outcome = match handle.await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(workflow_id = %workflow_id, error = %e, "Workflow task failed");
                Err(PipelineError::Aborted(e.to_string()))
            }
        };

        if let Ok(output) = &outcome {
            self.inner
                .completed
                .lock()
                .await
                .put(workflow_id.clone(), output.clone());
        }

        let mut in_flight = self.inner.in_flight.lock().await;
        if let Some(run) = in_flight.remove(&workflow_id) {
            run.result.send_replace(Some(outcome));
        }
    }

    async fn execute(
        &self,
        workflow_id: &str,
        options: &RunOptions,
        cancel: CancellationToken,
        workflow: BoxedWorkflow,
    ) -> RunResult {
        let events = self.inner.log.load(workflow_id).await?;

        let (run, history) = match LatestRun::from_events(&events) {
            LatestRun::Completed { run, output } if options.reuse == ReusePolicy::ReuseCompleted => {
                info!(workflow_id, run, "Reusing completed run from history");
                return Ok(output);
            }
            LatestRun::Open { run, steps } => {
                info!(workflow_id, run, recorded = steps.len(), "Resuming interrupted run");
                (run, steps)
            }
            LatestRun::Completed { run, .. }
            | LatestRun::Failed { run }
            | LatestRun::Cancelled { run } => {
                self.start_run(workflow_id, run + 1).await?
            }
            LatestRun::None => self.start_run(workflow_id, 1).await?,
        };

        let ctx = WorkflowContext::new(
            workflow_id.to_string(),
            run,
            self.inner.log.clone(),
            self.inner.workers.clone(),
            history,
            cancel.clone(),
        );
        let handle = ctx.clone();

        let work = workflow(ctx);
        tokio::pin!(work);
        let outcome = match tokio::time::timeout(options.execution_timeout, &mut work).await {
            Ok(outcome) => outcome,
            Err(_) => {
                warn!(
                    workflow_id,
                    run,
                    timeout = ?options.execution_timeout,
                    "Workflow exceeded its execution timeout, cancelling"
                );
                cancel.cancel();
                // Compensations still run on detached contexts
                let _ = work.await;
                Err(PipelineError::ExecutionTimeout(options.execution_timeout))
            }
        };

        let terminal = match &outcome {
            Ok(output) => Some(HistoryEvent::RunCompleted {
                run,
                output: output.clone(),
            }),
            Err(PipelineError::Cancelled) if handle.is_settled() => {
                Some(HistoryEvent::RunCancelled { run })
            }
            // Nothing was undone, so the next request resumes the run
            Err(PipelineError::Cancelled) => None,
            Err(e) => Some(HistoryEvent::RunFailed {
                run,
                error: e.to_string(),
            }),
        };

        match &outcome {
            Ok(_) => info!(workflow_id, run, "Workflow completed"),
            Err(e) if e.is_cancelled() => info!(workflow_id, run, "Workflow cancelled"),
            Err(e) => warn!(workflow_id, run, error = %e, "Workflow failed"),
        }

        if let Some(event) = terminal {
            if let Err(e) = self.inner.log.append(workflow_id, &event).await {
                error!(workflow_id, run, error = %e, "Failed to record workflow result");
            }
        }

        outcome
    }

    async fn start_run(
        &self,
        workflow_id: &str,
        run: u64,
    ) -> Result<(u64, HashMap<u64, HistoryEvent>), PipelineError> {
        debug!(workflow_id, run, "Starting workflow run");
        self.inner
            .log
            .append(workflow_id, &HistoryEvent::RunStarted { run })
            .await?;
        Ok((run, HashMap::new()))
    }

    /// Cancel the running run of `workflow_id`. Returns false if none is running.
    pub async fn cancel(&self, workflow_id: &str) -> bool {
        match self.inner.in_flight.lock().await.get(workflow_id) {
            Some(run) => {
                info!(workflow_id, "Cancelling workflow");
                run.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Number of runs currently executing.
    pub async fn running(&self) -> usize {
        self.inner.in_flight.lock().await.len()
    }

    /// Cancel every run and refuse new ones without waiting for them.
    ///
    /// Callers waiting on a run get `Cancelled` once its cleanup is done.
    pub fn cancel_all(&self) {
        if !self.inner.shutdown.is_cancelled() {
            info!("Cancelling all workflows");
        }
        self.inner.shutdown.cancel();
        self.inner.tasks.close();
    }

    /// [`Engine::cancel_all`], then wait up to `grace` for runs to finish
    /// their cleanup.
    pub async fn shutdown(&self, grace: Duration) {
        self.cancel_all();
        if tokio::time::timeout(grace, self.inner.tasks.wait()).await.is_err() {
            warn!(grace = ?grace, "Workflows still running after shutdown grace period");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::affinity::WorkerAffinityToken;
    use crate::engine::history::InMemoryStepLog;
    use crate::engine::options::StepOptions;
    use crate::engine::saga::Saga;
    use crate::error::StepError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    const HOUR: Duration = Duration::from_secs(3600);

    fn engine_with(log: Arc<dyn StepLog>) -> Engine {
        Engine::new(
            log,
            Workers::new(WorkerAffinityToken::from("worker/test"), 8),
            16,
        )
    }

    fn engine() -> (Engine, Arc<InMemoryStepLog>) {
        let log = Arc::new(InMemoryStepLog::new());
        (engine_with(log.clone()), log)
    }

    fn reuse() -> RunOptions {
        RunOptions::new(ReusePolicy::ReuseCompleted, HOUR)
    }

    fn step() -> StepOptions {
        StepOptions::new(Duration::from_secs(5))
    }

    /// Workflow that counts its runs and returns `value` from one step.
    fn counting(
        runs: Arc<AtomicUsize>,
        value: u32,
    ) -> impl FnOnce(WorkflowContext) -> BoxFuture<'static, Result<u32, PipelineError>> + Send {
        move |ctx| {
            async move {
                runs.fetch_add(1, Ordering::SeqCst);
                ctx.execute("compute", step(), move |_| async move { Ok(value) })
                    .await
            }
            .boxed()
        }
    }

    // =========================================================================
    // Deduplication
    // =========================================================================

    #[tokio::test]
    async fn test_concurrent_callers_share_one_run() {
        let (engine, _) = engine();
        let runs = Arc::new(AtomicUsize::new(0));
        let gate = Arc::new(Notify::new());

        let make = |runs: Arc<AtomicUsize>, gate: Arc<Notify>| {
            move |ctx: WorkflowContext| async move {
                runs.fetch_add(1, Ordering::SeqCst);
                gate.notified().await;
                ctx.execute("compute", step(), |_| async { Ok(5u32) }).await
            }
        };

        let first = tokio::spawn({
            let engine = engine.clone();
            let workflow = make(runs.clone(), gate.clone());
            async move { engine.run("dup", reuse(), workflow).await }
        });
        while engine.running().await == 0 {
            tokio::task::yield_now().await;
        }
        let second = tokio::spawn({
            let engine = engine.clone();
            let workflow = make(runs.clone(), gate.clone());
            async move { engine.run("dup", reuse(), workflow).await }
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        gate.notify_one();

        assert_eq!(first.await.unwrap().unwrap(), 5);
        assert_eq!(second.await.unwrap().unwrap(), 5);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(engine.running().await, 0);
    }

    #[tokio::test]
    async fn test_completed_output_is_reused() {
        let (engine, _) = engine();
        let runs = Arc::new(AtomicUsize::new(0));

        let a = engine.run("id", reuse(), counting(runs.clone(), 1)).await.unwrap();
        let b = engine.run("id", reuse(), counting(runs.clone(), 2)).await.unwrap();

        assert_eq!((a, b), (1, 1));
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_join_running_starts_fresh_after_completion() {
        let (engine, log) = engine();
        let runs = Arc::new(AtomicUsize::new(0));
        let join = RunOptions::new(ReusePolicy::JoinRunning, HOUR);

        engine.run("id", join.clone(), counting(runs.clone(), 1)).await.unwrap();
        let second = engine.run("id", join, counting(runs.clone(), 2)).await.unwrap();

        assert_eq!(second, 2);
        assert_eq!(runs.load(Ordering::SeqCst), 2);
        let events = log.load("id").await.unwrap();
        assert!(events.contains(&HistoryEvent::RunStarted { run: 2 }));
    }

    #[tokio::test]
    async fn test_completion_survives_restart() {
        let log: Arc<InMemoryStepLog> = Arc::new(InMemoryStepLog::new());
        let runs = Arc::new(AtomicUsize::new(0));

        engine_with(log.clone())
            .run("id", reuse(), counting(runs.clone(), 9))
            .await
            .unwrap();

        // Fresh engine, empty in-memory cache, same log
        let value = engine_with(log)
            .run("id", reuse(), counting(runs.clone(), 0))
            .await
            .unwrap();
        assert_eq!(value, 9);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    // =========================================================================
    // Resumption
    // =========================================================================

    #[tokio::test]
    async fn test_interrupted_run_is_resumed() {
        let log = Arc::new(InMemoryStepLog::new());
        log.append("id", &HistoryEvent::RunStarted { run: 1 }).await.unwrap();
        log.append(
            "id",
            &HistoryEvent::StepCompleted {
                run: 1,
                seq: 0,
                step: "download".to_string(),
                output: serde_json::json!("/cache/frame.fits"),
            },
        )
        .await
        .unwrap();

        let downloads = Arc::new(AtomicUsize::new(0));
        let counter = downloads.clone();
        let output: String = engine_with(log.clone())
            .run("id", reuse(), move |ctx| async move {
                let path: String = ctx
                    .execute("download", step(), move |_| {
                        let counter = counter.clone();
                        async move {
                            counter.fetch_add(1, Ordering::SeqCst);
                            Ok("/elsewhere".to_string())
                        }
                    })
                    .await?;
                ctx.execute("render", step(), move |_| {
                    let path = path.clone();
                    async move { Ok(format!("{} rendered", path)) }
                })
                .await
            })
            .await
            .unwrap();

        assert_eq!(output, "/cache/frame.fits rendered");
        assert_eq!(downloads.load(Ordering::SeqCst), 0);

        let events = log.load("id").await.unwrap();
        assert!(matches!(events.last(), Some(HistoryEvent::RunCompleted { run: 1, .. })));
    }

    #[tokio::test]
    async fn test_failed_run_is_not_reused() {
        let (engine, log) = engine();
        let err = engine
            .run("id", reuse(), |ctx: WorkflowContext| async move {
                ctx.execute("fail", step(), |_| async {
                    Err::<u32, _>(StepError::non_retryable("nope"))
                })
                .await
            })
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Step { .. }));

        let runs = Arc::new(AtomicUsize::new(0));
        let value = engine.run("id", reuse(), counting(runs.clone(), 3)).await.unwrap();
        assert_eq!(value, 3);

        let events = log.load("id").await.unwrap();
        assert!(events.iter().any(|e| matches!(e, HistoryEvent::RunFailed { run: 1, .. })));
        assert!(events.contains(&HistoryEvent::RunStarted { run: 2 }));
    }

    // =========================================================================
    // Cancellation and timeouts
    // =========================================================================

    #[tokio::test(start_paused = true)]
    async fn test_execution_timeout() {
        let (engine, log) = engine();
        let err = engine
            .run(
                "slow",
                RunOptions::new(ReusePolicy::ReuseCompleted, Duration::from_secs(60)),
                |ctx: WorkflowContext| async move {
                    ctx.sleep(Duration::from_secs(3600)).await?;
                    Ok(0u32)
                },
            )
            .await
            .unwrap_err();

        assert!(matches!(err, PipelineError::ExecutionTimeout(_)));
        let events = log.load("slow").await.unwrap();
        assert!(matches!(events.last(), Some(HistoryEvent::RunFailed { .. })));
    }

    #[tokio::test]
    async fn test_cancel_leaves_run_resumable() {
        let (engine, log) = engine();
        let started = Arc::new(Notify::new());

        let signal = started.clone();
        let caller = tokio::spawn({
            let engine = engine.clone();
            async move {
                engine
                    .run("id", reuse(), move |ctx: WorkflowContext| async move {
                        signal.notify_one();
                        ctx.execute("wait", step(), |_| async {
                            std::future::pending::<Result<u32, StepError>>().await
                        })
                        .await
                    })
                    .await
            }
        });

        started.notified().await;
        assert!(engine.cancel("id").await);
        assert!(caller.await.unwrap().unwrap_err().is_cancelled());
        assert!(!engine.cancel("id").await);

        let events = log.load("id").await.unwrap();
        assert_eq!(events, vec![HistoryEvent::RunStarted { run: 1 }]);
    }

    #[tokio::test]
    async fn test_cancel_after_cleanup_closes_run() {
        let (engine, log) = engine();
        let started = Arc::new(Notify::new());

        let signal = started.clone();
        let caller = tokio::spawn({
            let engine = engine.clone();
            async move {
                engine
                    .run("id", reuse(), move |ctx: WorkflowContext| async move {
                        let mut saga = Saga::new(&ctx);
                        saga.always("cleanup", |_ctx| async { Ok(()) });
                        signal.notify_one();
                        let outcome = ctx
                            .execute("wait", step(), |_| async {
                                std::future::pending::<Result<u32, StepError>>().await
                            })
                            .await;
                        saga.settle(outcome).await
                    })
                    .await
            }
        });

        started.notified().await;
        assert!(engine.cancel("id").await);
        assert!(caller.await.unwrap().unwrap_err().is_cancelled());

        let events = log.load("id").await.unwrap();
        assert_eq!(events.last(), Some(&HistoryEvent::RunCancelled { run: 1 }));

        // A fresh engine on the same log starts over instead of replaying
        let runs = Arc::new(AtomicUsize::new(0));
        let value = engine_with(log.clone())
            .run("id", reuse(), counting(runs.clone(), 4))
            .await
            .unwrap();
        assert_eq!(value, 4);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        let events = log.load("id").await.unwrap();
        assert!(events.contains(&HistoryEvent::RunStarted { run: 2 }));
    }

    #[tokio::test]
    async fn test_cancel_all_releases_waiting_callers() {
        let (engine, _) = engine();
        let started = Arc::new(Notify::new());

        let signal = started.clone();
        let caller = tokio::spawn({
            let engine = engine.clone();
            async move {
                engine
                    .run("id", reuse(), move |ctx: WorkflowContext| async move {
                        signal.notify_one();
                        ctx.sleep(HOUR).await?;
                        Ok(0u32)
                    })
                    .await
            }
        });

        started.notified().await;
        engine.cancel_all();
        assert!(caller.await.unwrap().unwrap_err().is_cancelled());
        assert_eq!(engine.running().await, 0);
    }

    #[tokio::test]
    async fn test_dropped_caller_does_not_cancel_run() {
        let (engine, _) = engine();
        let gate = Arc::new(Notify::new());
        let runs = Arc::new(AtomicUsize::new(0));

        let caller = tokio::spawn({
            let engine = engine.clone();
            let gate = gate.clone();
            let runs = runs.clone();
            async move {
                engine
                    .run("id", reuse(), move |_ctx: WorkflowContext| async move {
                        gate.notified().await;
                        runs.fetch_add(1, Ordering::SeqCst);
                        Ok(11u32)
                    })
                    .await
            }
        });
        while engine.running().await == 0 {
            tokio::task::yield_now().await;
        }
        caller.abort();
        gate.notify_one();

        let value = engine
            .run("id", reuse(), counting(Arc::new(AtomicUsize::new(0)), 0))
            .await
            .unwrap();
        assert_eq!(value, 11);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_shutdown_refuses_new_runs() {
        let (engine, _) = engine();
        engine.shutdown(Duration::from_secs(1)).await;
        let err = engine
            .run("id", reuse(), counting(Arc::new(AtomicUsize::new(0)), 1))
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
    }
}
