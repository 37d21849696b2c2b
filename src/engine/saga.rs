use std::future::Future;

use futures::future::BoxFuture;
use futures::FutureExt;
use tracing::{error, info};

use super::context::WorkflowContext;
use crate::error::PipelineError;

type Action =
    Box<dyn FnOnce(WorkflowContext) -> BoxFuture<'static, Result<(), PipelineError>> + Send>;

/// Compensating actions for a multi-step workflow.
///
/// Compensations run only when the workflow fails; finalizers always run.
/// Both run in reverse registration order, on a detached context so they
/// still execute when the run was cancelled.
pub struct Saga {
    ctx: WorkflowContext,
    compensations: Vec<(String, Action)>,
    finalizers: Vec<(String, Action)>,
}

impl Saga {
    pub fn new(ctx: &WorkflowContext) -> Self {
        Self {
            ctx: ctx.clone(),
            compensations: Vec::new(),
            finalizers: Vec::new(),
        }
    }

    /// Register an action undone if the workflow fails.
    pub fn on_failure<F, Fut>(&mut self, name: &str, action: F)
    where
        F: FnOnce(WorkflowContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), PipelineError>> + Send + 'static,
    {
        self.compensations
            .push((name.to_string(), Box::new(move |ctx| action(ctx).boxed())));
    }

    /// Register an action run whatever the outcome.
    pub fn always<F, Fut>(&mut self, name: &str, action: F)
    where
        F: FnOnce(WorkflowContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), PipelineError>> + Send + 'static,
    {
        self.finalizers
            .push((name.to_string(), Box::new(move |ctx| action(ctx).boxed())));
    }

    /// Run compensations and finalizers for `outcome`.
    ///
    /// The original error is preserved on failure. On success, a failing
    /// finalizer turns the outcome into that error.
    pub async fn settle<T>(self, outcome: Result<T, PipelineError>) -> Result<T, PipelineError> {
        let detached = self.ctx.detached();
        let workflow_id = self.ctx.workflow_id().to_string();

        if !self.finalizers.is_empty() || (outcome.is_err() && !self.compensations.is_empty()) {
            self.ctx.mark_settled();
        }

        if let Err(cause) = &outcome {
            for (name, action) in self.compensations.into_iter().rev() {
                info!(workflow_id = %workflow_id, compensation = %name, cause = %cause, "Running compensation");
                if let Err(e) = action(detached.clone()).await {
                    error!(workflow_id = %workflow_id, compensation = %name, error = %e, "Compensation failed");
                }
            }
        }

        let mut finalizer_error = None;
        for (name, action) in self.finalizers.into_iter().rev() {
            if let Err(e) = action(detached.clone()).await {
                error!(workflow_id = %workflow_id, finalizer = %name, error = %e, "Finalizer failed");
                finalizer_error.get_or_insert(e);
            }
        }

        match (outcome, finalizer_error) {
            (Ok(_), Some(e)) => Err(e),
            (outcome, _) => outcome,
        }
    }
}
