//! Worker affinity.
//!
//! Steps that depend on a frame already being on local disk must run on the
//! worker that downloaded it. Each worker process owns a sticky queue token,
//! persisted in its working directory so restarts keep the same identity.

use std::fmt;
use std::io::{ErrorKind, Write};
use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::StepError;

/// File under the working directory holding this worker's token.
pub const TOKEN_FILE: &str = "worker-task-queue.txt";

/// Worker-scoped queue name, `worker/<uuid v4>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerAffinityToken(String);

impl WorkerAffinityToken {
    pub fn generate() -> Self {
        Self(format!("worker/{}", uuid::Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Read the token persisted in `working_dir`, creating it on first use.
    ///
    /// Creation uses `create_new`, so two processes racing on one directory
    /// end up sharing whichever token was written first.
    pub fn load_or_create(working_dir: &Path) -> std::io::Result<Self> {
        let path = working_dir.join(TOKEN_FILE);

        if let Some(token) = read_token(&path)? {
            return Ok(token);
        }

        std::fs::create_dir_all(working_dir)?;
        let token = Self::generate();
        match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(mut file) => {
                file.write_all(token.0.as_bytes())?;
                file.sync_all()?;
                info!(token = %token, path = %path.display(), "Created worker queue token");
                Ok(token)
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => read_token(&path)?
                .ok_or_else(|| std::io::Error::new(ErrorKind::InvalidData, "empty token file")),
            Err(e) => Err(e),
        }
    }
}

fn read_token(path: &Path) -> std::io::Result<Option<WorkerAffinityToken>> {
    match std::fs::read_to_string(path) {
        Ok(content) => {
            let trimmed = content.trim();
            if trimmed.is_empty() {
                Ok(None)
            } else {
                Ok(Some(WorkerAffinityToken(trimmed.to_string())))
            }
        }
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

impl fmt::Display for WorkerAffinityToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for WorkerAffinityToken {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Picks the worker that should handle all disk-bound steps for a frame.
#[async_trait]
pub trait AffinityResolver: Send + Sync {
    async fn resolve(&self, frame_id: &str) -> Result<WorkerAffinityToken, StepError>;
}

/// Routes every frame to the worker that answers the resolution step.
#[derive(Debug, Clone)]
pub struct LocalAffinity {
    token: WorkerAffinityToken,
}

impl LocalAffinity {
    pub fn new(token: WorkerAffinityToken) -> Self {
        Self { token }
    }
}

#[async_trait]
impl AffinityResolver for LocalAffinity {
    async fn resolve(&self, _frame_id: &str) -> Result<WorkerAffinityToken, StepError> {
        Ok(self.token.clone())
    }
}
