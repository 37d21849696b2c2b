use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::affinity::WorkerAffinityToken;

/// Exponential backoff between attempts of one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts allowed, 0 for unlimited
    pub maximum_attempts: u32,
    pub initial_interval: Duration,
    pub backoff_coefficient: f64,
    pub maximum_interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            maximum_attempts: 0,
            initial_interval: Duration::from_secs(1),
            backoff_coefficient: 2.0,
            maximum_interval: Duration::from_secs(100),
        }
    }
}

impl RetryPolicy {
    /// Default backoff with a bounded number of attempts.
    pub fn attempts(maximum_attempts: u32) -> Self {
        Self {
            maximum_attempts,
            ..Self::default()
        }
    }

    /// Whether another attempt may follow attempt number `attempt` (1-based).
    pub fn allows_retry(&self, attempt: u32) -> bool {
        self.maximum_attempts == 0 || attempt < self.maximum_attempts
    }

    /// Delay before the attempt following attempt number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(64) as i32;
        let secs = self.initial_interval.as_secs_f64() * self.backoff_coefficient.powi(exponent);
        let capped = secs.min(self.maximum_interval.as_secs_f64());
        if capped.is_finite() && capped >= 0.0 {
            Duration::from_secs_f64(capped)
        } else {
            self.maximum_interval
        }
    }
}

/// Limits and routing for one step.
#[derive(Debug, Clone, PartialEq)]
pub struct StepOptions {
    /// Wall-clock limit of a single attempt
    pub start_to_close: Duration,
    /// How long an attempt may wait for a worker slot. Defaults to `start_to_close`.
    pub schedule_to_start: Option<Duration>,
    /// Maximum gap between heartbeats of a running attempt
    pub heartbeat: Option<Duration>,
    pub retry: RetryPolicy,
    /// Worker queue to run on; `None` is the generic queue
    pub queue: Option<WorkerAffinityToken>,
}

impl StepOptions {
    pub fn new(start_to_close: Duration) -> Self {
        Self {
            start_to_close,
            schedule_to_start: None,
            heartbeat: None,
            retry: RetryPolicy::default(),
            queue: None,
        }
    }

    pub fn schedule_to_start(mut self, timeout: Duration) -> Self {
        self.schedule_to_start = Some(timeout);
        self
    }

    pub fn heartbeat(mut self, timeout: Duration) -> Self {
        self.heartbeat = Some(timeout);
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Pin the step to the worker owning `token`.
    pub fn on(mut self, token: &WorkerAffinityToken) -> Self {
        self.queue = Some(token.clone());
        self
    }
}

/// Which earlier runs of an identity a new request may reuse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReusePolicy {
    /// Return the output of a completed run, or join a running one
    #[default]
    ReuseCompleted,
    /// Join a running run, otherwise start fresh
    JoinRunning,
}

/// Options for starting a workflow run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunOptions {
    pub reuse: ReusePolicy,
    pub execution_timeout: Duration,
}

impl RunOptions {
    pub fn new(reuse: ReusePolicy, execution_timeout: Duration) -> Self {
        Self {
            reuse,
            execution_timeout,
        }
    }
}
