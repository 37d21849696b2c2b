//! Event-sourced step log.
//!
//! Every run of a workflow identity appends its events to that identity's
//! log. A run that finished has a terminal `RunCompleted`, `RunFailed` or
//! `RunCancelled` event; a run without one was interrupted and is resumed by
//! replaying its recorded steps.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::warn;

use crate::error::{HistoryError, StepError};

/// One entry of a workflow's history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum HistoryEvent {
    RunStarted {
        run: u64,
    },
    StepCompleted {
        run: u64,
        seq: u64,
        step: String,
        output: Value,
    },
    StepFailed {
        run: u64,
        seq: u64,
        step: String,
        error: StepError,
    },
    RunCompleted {
        run: u64,
        output: Value,
    },
    RunFailed {
        run: u64,
        error: String,
    },
    /// Cancelled after its cleanup ran, so it cannot be resumed
    RunCancelled {
        run: u64,
    },
}

impl HistoryEvent {
    pub fn run(&self) -> u64 {
        match self {
            HistoryEvent::RunStarted { run }
            | HistoryEvent::StepCompleted { run, .. }
            | HistoryEvent::StepFailed { run, .. }
            | HistoryEvent::RunCompleted { run, .. }
            | HistoryEvent::RunFailed { run, .. }
            | HistoryEvent::RunCancelled { run } => *run,
        }
    }

    /// Whether this event closes its run.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            HistoryEvent::RunCompleted { .. }
                | HistoryEvent::RunFailed { .. }
                | HistoryEvent::RunCancelled { .. }
        )
    }

    fn seq(&self) -> Option<u64> {
        match self {
            HistoryEvent::StepCompleted { seq, .. } | HistoryEvent::StepFailed { seq, .. } => {
                Some(*seq)
            }
            _ => None,
        }
    }
}

/// State of the most recent run found in a history.
#[derive(Debug, Clone, PartialEq)]
pub enum LatestRun {
    /// No run was ever started
    None,
    Completed {
        run: u64,
        output: Value,
    },
    Failed {
        run: u64,
    },
    Cancelled {
        run: u64,
    },
    /// Started but never finished; `steps` maps sequence numbers to results
    Open {
        run: u64,
        steps: HashMap<u64, HistoryEvent>,
    },
}

impl LatestRun {
    pub fn from_events(events: &[HistoryEvent]) -> Self {
        let Some(run) = events.iter().map(HistoryEvent::run).max() else {
            return LatestRun::None;
        };

        let mut steps = HashMap::new();
        for event in events.iter().filter(|e| e.run() == run) {
            match event {
                HistoryEvent::RunCompleted { output, .. } => {
                    return LatestRun::Completed {
                        run,
                        output: output.clone(),
                    }
                }
                HistoryEvent::RunFailed { .. } => return LatestRun::Failed { run },
                HistoryEvent::RunCancelled { .. } => return LatestRun::Cancelled { run },
                HistoryEvent::RunStarted { .. } => {}
                step => {
                    if let Some(seq) = step.seq() {
                        steps.insert(seq, step.clone());
                    }
                }
            }
        }
        LatestRun::Open { run, steps }
    }
}

/// Durable storage for workflow histories.
#[async_trait]
pub trait StepLog: Send + Sync {
    async fn append(&self, workflow_id: &str, event: &HistoryEvent) -> Result<(), HistoryError>;

    async fn load(&self, workflow_id: &str) -> Result<Vec<HistoryEvent>, HistoryError>;
}

/// Step log that lives only as long as the process.
#[derive(Debug, Default)]
pub struct InMemoryStepLog {
    histories: Mutex<HashMap<String, Vec<HistoryEvent>>>,
}

impl InMemoryStepLog {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StepLog for InMemoryStepLog {
    async fn append(&self, workflow_id: &str, event: &HistoryEvent) -> Result<(), HistoryError> {
        self.histories
            .lock()
            .await
            .entry(workflow_id.to_string())
            .or_default()
            .push(event.clone());
        Ok(())
    }

    async fn load(&self, workflow_id: &str) -> Result<Vec<HistoryEvent>, HistoryError> {
        Ok(self
            .histories
            .lock()
            .await
            .get(workflow_id)
            .cloned()
            .unwrap_or_default())
    }
}

/// Step log persisted as one JSON-lines file per workflow identity.
///
/// Files are named by the SHA-256 of the identity, since identities contain
/// slashes and arbitrary frame ids. When a run ends, its file is rewritten
/// to hold that run alone, so identities that run many times (download
/// children, `reuse_workflow=false` requests) keep a bounded history.
#[derive(Debug)]
pub struct FileStepLog {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl FileStepLog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, workflow_id: &str) -> PathBuf {
        let name = hex::encode(Sha256::digest(workflow_id.as_bytes()));
        self.dir.join(format!("{}.jsonl", name))
    }

    /// Replace the log of `workflow_id` with the events of the run `terminal`
    /// closes, followed by `terminal`. Only the latest run is ever read back.
    async fn compact(
        &self,
        workflow_id: &str,
        terminal: &HistoryEvent,
    ) -> Result<(), HistoryError> {
        let path = self.path_for(workflow_id);
        let mut content = Vec::new();
        for event in self.load(workflow_id).await? {
            if event.run() == terminal.run() {
                content.extend(encode(&event)?);
            }
        }
        content.extend(encode(terminal)?);

        let staging = path.with_extension("jsonl.tmp");
        let mut file = tokio::fs::File::create(&staging).await?;
        file.write_all(&content).await?;
        file.sync_data().await?;
        tokio::fs::rename(&staging, &path).await?;
        Ok(())
    }
}

fn encode(event: &HistoryEvent) -> Result<Vec<u8>, HistoryError> {
    let mut line = serde_json::to_vec(event).map_err(|e| HistoryError::Corrupt(e.to_string()))?;
    line.push(b'\n');
    Ok(line)
}

#[async_trait]
impl StepLog for FileStepLog {
    async fn append(&self, workflow_id: &str, event: &HistoryEvent) -> Result<(), HistoryError> {
        let _guard = self.write_lock.lock().await;
        tokio::fs::create_dir_all(&self.dir).await?;
        if event.is_terminal() {
            return self.compact(workflow_id, event).await;
        }

        let line = encode(event)?;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path_for(workflow_id))
            .await?;
        file.write_all(&line).await?;
        file.sync_data().await?;
        Ok(())
    }

    async fn load(&self, workflow_id: &str) -> Result<Vec<HistoryEvent>, HistoryError> {
        let path = self.path_for(workflow_id);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let lines: Vec<&str> = content.lines().filter(|l| !l.trim().is_empty()).collect();
        let mut events = Vec::with_capacity(lines.len());
        for (i, line) in lines.iter().enumerate() {
            match serde_json::from_str(line) {
                Ok(event) => events.push(event),
                // A torn final write is dropped; the step it recorded runs again
                Err(e) if i + 1 == lines.len() => {
                    warn!(path = %path.display(), error = %e, "Ignoring truncated history record");
                }
                Err(e) => {
                    return Err(HistoryError::Corrupt(format!(
                        "{} line {}: {}",
                        path.display(),
                        i + 1,
                        e
                    )))
                }
            }
        }
        Ok(events)
    }
}
