use std::future::Future;
use std::time::Duration;

use serde::Serialize;
use tracing::warn;

use crate::engine::WorkflowContext;
use crate::error::PipelineError;

/// Default pause before a pipeline is started again.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Which pipeline failures the outer shell restarts on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum RetryScope {
    /// Only failures that may clear up on their own: retryable steps that
    /// ran out of attempts and step log I/O
    #[default]
    Transient,
    /// Every failure except cancellation and replay divergence
    All,
}

/// Restarts a whole pipeline after a fixed delay when it fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryShell {
    pub delay: Duration,
    pub scope: RetryScope,
}

impl Default for RetryShell {
    fn default() -> Self {
        Self {
            delay: DEFAULT_RETRY_DELAY,
            scope: RetryScope::default(),
        }
    }
}

impl RetryShell {
    pub fn new(delay: Duration, scope: RetryScope) -> Self {
        Self { delay, scope }
    }

    /// Whether a pipeline failing with `err` is started again.
    pub fn should_restart(&self, err: &PipelineError) -> bool {
        match err {
            PipelineError::Cancelled | PipelineError::NonDeterministic { .. } => false,
            _ => match self.scope {
                RetryScope::Transient => err.is_transient(),
                RetryScope::All => true,
            },
        }
    }

    /// Run `pipeline` until it succeeds, is cancelled or fails outside of
    /// the restart scope.
    pub async fn run<T, F, Fut>(
        &self,
        ctx: &WorkflowContext,
        label: &str,
        mut pipeline: F,
    ) -> Result<T, PipelineError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, PipelineError>>,
    {
        let mut restarts = 0u32;
        loop {
            match pipeline().await {
                Ok(value) => return Ok(value),
                Err(err) if self.should_restart(&err) => {
                    restarts += 1;
                    warn!(
                        workflow_id = ctx.workflow_id(),
                        pipeline = label,
                        restarts,
                        error = %err,
                        retry_in = ?self.delay,
                        "Pipeline failed, restarting"
                    );
                    ctx.sleep(self.delay).await?;
                }
                Err(err) => return Err(err),
            }
        }
    }
}
