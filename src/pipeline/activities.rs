//! Step bodies of the pipelines.
//!
//! Each method is one unit of retryable work. Inputs and outputs are plain
//! serializable values so results can be recorded in the step log.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;
use tracing::{debug, info};

use crate::affinity::{AffinityResolver, WorkerAffinityToken};
use crate::cache::{FrameCache, LocalFrame};
use crate::engine::StepContext;
use crate::error::{StepError, StoreError};
use crate::fits;
use crate::iiif::NormalizedRequest;
use crate::render::{self, RenderedImage};
use crate::store::{CompletedPart, ObjectStore, PartBody};

/// Native pixel dimensions of an HDU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
}

/// Handle of a started multipart upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultipartUpload {
    pub upload_id: String,
    pub object_key: String,
}

/// Byte range of the encoded file sent as one part.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartSpec {
    /// 1-based part number
    pub part_number: i32,
    pub offset: u64,
    pub length: u64,
}

/// Shared resources used by the step bodies.
pub struct Activities {
    cache: FrameCache,
    store: Arc<dyn ObjectStore>,
    affinity: Arc<dyn AffinityResolver>,
    generated_dir: PathBuf,
}

impl Activities {
    pub fn new(
        cache: FrameCache,
        store: Arc<dyn ObjectStore>,
        affinity: Arc<dyn AffinityResolver>,
        working_dir: &Path,
    ) -> Self {
        Self {
            cache,
            store,
            affinity,
            generated_dir: working_dir.join("generated"),
        }
    }

    /// Directory encoded images are written to before upload.
    pub fn generated_dir(&self) -> &Path {
        &self.generated_dir
    }

    pub async fn find_best_worker(&self, frame_id: &str) -> Result<WorkerAffinityToken, StepError> {
        self.affinity.resolve(frame_id).await
    }

    /// Make the frame available on this worker's disk.
    pub async fn download_frame_file(
        &self,
        step: &StepContext,
        frame_id: &str,
        force_download: bool,
        recheck_version: bool,
    ) -> Result<LocalFrame, StepError> {
        let frame = self
            .cache
            .ensure_local(frame_id, force_download, recheck_version, |n, total| {
                let total = total.map_or_else(|| "?".to_string(), |t| t.to_string());
                step.heartbeat(format!("downloaded {}/{}", n, total));
            })
            .await?;
        Ok(frame)
    }

    pub async fn get_hdu_dimensions(
        &self,
        fits_path: PathBuf,
        hdu_index: usize,
    ) -> Result<Dimensions, StepError> {
        let (width, height) =
            tokio::task::spawn_blocking(move || fits::hdu_dimensions(&fits_path, hdu_index))
                .await
                .map_err(|e| StepError::retryable(format!("dimension task failed: {}", e)))??;
        Ok(Dimensions { width, height })
    }

    /// Render the requested variant into the generated directory.
    pub async fn create_image_file(
        &self,
        fits_path: PathBuf,
        hdu_index: usize,
        request: NormalizedRequest,
    ) -> Result<RenderedImage, StepError> {
        let dir = self.generated_dir.clone();
        let image = tokio::task::spawn_blocking(move || -> Result<RenderedImage, StepError> {
            let plane = fits::read_image_plane(&fits_path, hdu_index)?;
            let bytes = render::render(&plane, &request.region, &request.size, request.format)?;
            Ok(render::write_generated(&dir, &bytes, request.format)?)
        })
        .await
        .map_err(|e| StepError::retryable(format!("render task failed: {}", e)))??;

        debug!(
            path = %image.file_path.display(),
            size = image.file_size,
            sha256 = %image.sha256,
            "Created image file"
        );
        Ok(image)
    }

    pub async fn start_multipart_upload(
        &self,
        object_key: &str,
        content_type: &str,
    ) -> Result<MultipartUpload, StepError> {
        let upload_id = self
            .store
            .create_multipart_upload(object_key, content_type)
            .await?;
        Ok(MultipartUpload {
            upload_id,
            object_key: object_key.to_string(),
        })
    }

    /// Stream one byte range of `file_path` as a part, heartbeating the
    /// bytes still to send.
    pub async fn upload_part(
        &self,
        step: &StepContext,
        upload: &MultipartUpload,
        file_path: &Path,
        part: PartSpec,
    ) -> Result<CompletedPart, StepError> {
        let mut file = tokio::fs::File::open(file_path).await?;
        file.seek(std::io::SeekFrom::Start(part.offset)).await?;

        let heartbeat = step.clone();
        let mut remaining = part.length;
        heartbeat.heartbeat(format!("Remaining: {}", remaining));
        let stream = ReaderStream::new(file.take(part.length)).map(move |chunk| {
            if let Ok(bytes) = &chunk {
                remaining = remaining.saturating_sub(bytes.len() as u64);
                heartbeat.heartbeat(format!("Remaining: {}", remaining));
            }
            chunk
        });

        let etag = self
            .store
            .upload_part(
                &upload.object_key,
                &upload.upload_id,
                part.part_number,
                PartBody {
                    content_length: part.length,
                    stream: stream.boxed(),
                },
            )
            .await?;

        Ok(CompletedPart {
            part_number: part.part_number,
            etag,
        })
    }

    pub async fn finish_multipart_upload(
        &self,
        upload: &MultipartUpload,
        parts: &[CompletedPart],
    ) -> Result<String, StepError> {
        let key = self
            .store
            .complete_multipart_upload(&upload.object_key, &upload.upload_id, parts)
            .await?;
        info!(key = %key, parts = parts.len(), "Finished multipart upload");
        Ok(key)
    }

    /// Abort an upload. An upload that no longer exists counts as aborted.
    pub async fn abort_multipart_upload(&self, upload: &MultipartUpload) -> Result<(), StepError> {
        match self
            .store
            .abort_multipart_upload(&upload.object_key, &upload.upload_id)
            .await
        {
            Ok(()) | Err(StoreError::NoSuchUpload(_)) => {
                info!(upload_id = %upload.upload_id, key = %upload.object_key, "Aborted multipart upload");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Remove a file. A file that is already gone counts as removed.
    pub async fn delete_file(&self, file_path: &Path) -> Result<(), StepError> {
        match tokio::fs::remove_file(file_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove encoded images left behind by a process that stopped before
    /// its `delete_file` step ran. Call before any pipeline starts.
    ///
    /// A run resumed later whose recorded image was swept fails its part
    /// uploads and is restarted by the retry shell, which renders again.
    pub async fn sweep_generated(&self) -> std::io::Result<usize> {
        let mut entries = match tokio::fs::read_dir(&self.generated_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e),
        };

        let mut removed = 0;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_file() {
                tokio::fs::remove_file(entry.path()).await?;
                removed += 1;
            }
        }
        if removed > 0 {
            info!(dir = %self.generated_dir.display(), removed, "Swept stale generated images");
        }
        Ok(removed)
    }
}
