use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use crate::affinity::WorkerAffinityToken;
use crate::error::{StepError, TimeoutKind};

/// Registry of in-process workers, each a queue token with a bounded number
/// of step slots.
///
/// The local worker serves both its own queue and the generic queue. A step
/// routed to a token nobody serves waits out its schedule-to-start timeout.
#[derive(Debug, Clone)]
pub struct Workers {
    local: WorkerAffinityToken,
    slots: HashMap<WorkerAffinityToken, Arc<Semaphore>>,
}

impl Workers {
    pub fn new(local: WorkerAffinityToken, slots: usize) -> Self {
        let mut map = HashMap::new();
        map.insert(local.clone(), Arc::new(Semaphore::new(slots.max(1))));
        Self { local, slots: map }
    }

    /// Register another worker queue served by this process.
    pub fn with_worker(mut self, token: WorkerAffinityToken, slots: usize) -> Self {
        self.slots
            .insert(token, Arc::new(Semaphore::new(slots.max(1))));
        self
    }

    pub fn local(&self) -> &WorkerAffinityToken {
        &self.local
    }

    /// Free slots of the worker serving `queue`, if any worker does.
    pub fn available_slots(&self, queue: Option<&WorkerAffinityToken>) -> Option<usize> {
        let token = queue.unwrap_or(&self.local);
        self.slots.get(token).map(|s| s.available_permits())
    }

    /// Wait up to `wait` for a slot on the worker serving `queue`.
    pub async fn acquire(
        &self,
        queue: Option<&WorkerAffinityToken>,
        wait: Duration,
    ) -> Result<OwnedSemaphorePermit, StepError> {
        let token = queue.unwrap_or(&self.local);
        let Some(slots) = self.slots.get(token) else {
            debug!(queue = %token, "No worker serves queue");
            tokio::time::sleep(wait).await;
            return Err(StepError::timeout(TimeoutKind::ScheduleToStart));
        };

        match tokio::time::timeout(wait, slots.clone().acquire_owned()).await {
            Ok(Ok(permit)) => Ok(permit),
            Ok(Err(_)) | Err(_) => Err(StepError::timeout(TimeoutKind::ScheduleToStart)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_generic_queue_uses_local_worker() {
        let workers = Workers::new(WorkerAffinityToken::from("worker/a"), 2);
        let permit = workers.acquire(None, Duration::from_millis(10)).await.unwrap();
        assert_eq!(workers.available_slots(None), Some(1));
        assert_eq!(
            workers.available_slots(Some(&WorkerAffinityToken::from("worker/a"))),
            Some(1)
        );
        drop(permit);
        assert_eq!(workers.available_slots(None), Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_queue_times_out() {
        let workers = Workers::new(WorkerAffinityToken::from("worker/a"), 1);
        let err = workers
            .acquire(
                Some(&WorkerAffinityToken::from("worker/gone")),
                Duration::from_secs(15),
            )
            .await
            .unwrap_err();
        assert_eq!(err, StepError::timeout(TimeoutKind::ScheduleToStart));
        assert!(err.is_retryable());
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_worker_times_out() {
        let workers = Workers::new(WorkerAffinityToken::from("worker/a"), 1);
        let _held = workers.acquire(None, Duration::from_secs(1)).await.unwrap();
        let err = workers
            .acquire(None, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err, StepError::timeout(TimeoutKind::ScheduleToStart));
    }

    #[tokio::test]
    async fn test_additional_worker() {
        let other = WorkerAffinityToken::from("worker/b");
        let workers = Workers::new(WorkerAffinityToken::from("worker/a"), 1)
            .with_worker(other.clone(), 3);
        assert_eq!(workers.available_slots(Some(&other)), Some(3));
        assert!(workers
            .acquire(Some(&other), Duration::from_millis(10))
            .await
            .is_ok());
    }
}
