use std::collections::{BTreeMap, HashMap};
use std::convert::Infallible;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::TryStreamExt;
use sha2::{Digest, Sha256};
use tokio::sync::{Mutex, Notify};

use super::{CompletedPart, ObjectStore, PartBody};
use crate::error::StoreError;

struct Upload {
    key: String,
    content_type: String,
    parts: BTreeMap<i32, (String, Bytes)>,
}

#[derive(Default)]
struct State {
    next_id: u64,
    uploads: HashMap<String, Upload>,
    objects: HashMap<String, (String, Bytes)>,
    failing_parts: usize,
    part_failure: Option<StoreError>,
    failing_completion: Option<StoreError>,
    held_parts: usize,
    held_completions: usize,
}

/// [`ObjectStore`] that keeps everything in memory.
///
/// Counts calls and supports injected failures, which makes it the store
/// used by the test suite and by `--in-memory-store` local runs.
#[derive(Default)]
pub struct InMemoryObjectStore {
    state: Mutex<State>,
    created: AtomicUsize,
    part_calls: AtomicUsize,
    completed: AtomicUsize,
    aborted: AtomicUsize,
    held: Notify,
}

fn slow_down() -> StoreError {
    StoreError::Rejected {
        status: 503,
        message: "SlowDown".to_string(),
    }
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` part uploads fail with a retryable 503.
    pub async fn fail_part_uploads(&self, count: usize) {
        self.fail_part_uploads_with(count, slow_down()).await;
    }

    /// Make the next `count` part uploads fail with `error`.
    pub async fn fail_part_uploads_with(&self, count: usize, error: StoreError) {
        let mut state = self.state.lock().await;
        state.failing_parts = count;
        state.part_failure = Some(error);
    }

    /// Make the next `count` part uploads hang until the caller gives up.
    pub async fn hold_part_uploads(&self, count: usize) {
        self.state.lock().await.held_parts = count;
    }

    /// Make the next `count` completions hang until the caller gives up.
    pub async fn hold_completions(&self, count: usize) {
        self.state.lock().await.held_completions = count;
    }

    /// Wait until a call is hanging on a hold.
    pub async fn held(&self) {
        self.held.notified().await;
    }

    async fn hang(&self) -> Infallible {
        self.held.notify_one();
        std::future::pending().await
    }

    /// Make the next completion fail with `error`.
    pub async fn fail_completion(&self, error: StoreError) {
        self.state.lock().await.failing_completion = Some(error);
    }

    /// Contents of a committed object.
    pub async fn object(&self, key: &str) -> Option<Bytes> {
        self.state
            .lock()
            .await
            .objects
            .get(key)
            .map(|(_, bytes)| bytes.clone())
    }

    /// Content type a committed object was uploaded with.
    pub async fn content_type(&self, key: &str) -> Option<String> {
        self.state
            .lock()
            .await
            .objects
            .get(key)
            .map(|(content_type, _)| content_type.clone())
    }

    /// Uploads that were created but neither completed nor aborted.
    pub async fn open_uploads(&self) -> usize {
        self.state.lock().await.uploads.len()
    }

    pub fn created_count(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn part_upload_count(&self) -> usize {
        self.part_calls.load(Ordering::SeqCst)
    }

    pub fn completed_count(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }

    pub fn aborted_count(&self) -> usize {
        self.aborted.load(Ordering::SeqCst)
    }
}

fn no_such_upload(upload_id: &str) -> StoreError {
    StoreError::NoSuchUpload(upload_id.to_string())
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    async fn create_multipart_upload(
        &self,
        key: &str,
        content_type: &str,
    ) -> Result<String, StoreError> {
        self.created.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().await;
        state.next_id += 1;
        let upload_id = format!("upload-{}", state.next_id);
        state.uploads.insert(
            upload_id.clone(),
            Upload {
                key: key.to_string(),
                content_type: content_type.to_string(),
                parts: BTreeMap::new(),
            },
        );
        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        body: PartBody,
    ) -> Result<String, StoreError> {
        self.part_calls.fetch_add(1, Ordering::SeqCst);

        let hold = {
            let mut state = self.state.lock().await;
            if state.failing_parts > 0 {
                state.failing_parts -= 1;
                return Err(state.part_failure.clone().unwrap_or_else(slow_down));
            }
            if state.held_parts > 0 {
                state.held_parts -= 1;
                true
            } else {
                false
            }
        };
        if hold {
            match self.hang().await {}
        }

        let data: BytesMut = body
            .stream
            .try_fold(BytesMut::new(), |mut acc, chunk| async move {
                acc.extend_from_slice(&chunk);
                Ok(acc)
            })
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        if data.len() as u64 != body.content_length {
            return Err(StoreError::Rejected {
                status: 400,
                message: format!(
                    "IncompleteBody: got {} bytes, expected {}",
                    data.len(),
                    body.content_length
                ),
            });
        }

        let etag = format!("\"{}\"", &hex::encode(Sha256::digest(&data))[..32]);

        let mut state = self.state.lock().await;
        let upload = state
            .uploads
            .get_mut(upload_id)
            .ok_or_else(|| no_such_upload(upload_id))?;
        if upload.key != key {
            return Err(no_such_upload(upload_id));
        }
        upload
            .parts
            .insert(part_number, (etag.clone(), data.freeze()));
        Ok(etag)
    }

    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Result<String, StoreError> {
        let mut state = self.state.lock().await;
        if state.held_completions > 0 {
            state.held_completions -= 1;
            drop(state);
            match self.hang().await {}
        }
        if let Some(error) = state.failing_completion.take() {
            return Err(error);
        }

        let upload = state
            .uploads
            .get(upload_id)
            .ok_or_else(|| no_such_upload(upload_id))?;
        if upload.key != key {
            return Err(no_such_upload(upload_id));
        }

        if parts.is_empty() || parts.windows(2).any(|w| w[0].part_number >= w[1].part_number) {
            return Err(StoreError::Rejected {
                status: 400,
                message: "InvalidPartOrder".to_string(),
            });
        }

        let mut object = BytesMut::new();
        for part in parts {
            match upload.parts.get(&part.part_number) {
                Some((etag, data)) if *etag == part.etag => object.extend_from_slice(data),
                _ => {
                    return Err(StoreError::Rejected {
                        status: 400,
                        message: format!("InvalidPart: {}", part.part_number),
                    })
                }
            }
        }

        let content_type = upload.content_type.clone();
        state.uploads.remove(upload_id);
        state
            .objects
            .insert(key.to_string(), (content_type, object.freeze()));
        self.completed.fetch_add(1, Ordering::SeqCst);
        Ok(key.to_string())
    }

    async fn abort_multipart_upload(&self, _key: &str, upload_id: &str) -> Result<(), StoreError> {
        self.aborted.fetch_add(1, Ordering::SeqCst);
        self.state
            .lock()
            .await
            .uploads
            .remove(upload_id)
            .map(|_| ())
            .ok_or_else(|| no_such_upload(upload_id))
    }

    async fn presigned_get(&self, key: &str, expires_in: Duration) -> Result<String, StoreError> {
        Ok(format!(
            "memory://objects/{}?expires={}",
            key,
            expires_in.as_secs()
        ))
    }
}
