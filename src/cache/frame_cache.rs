use std::path::{Path, PathBuf};
use std::sync::Arc;

use base64::engine::general_purpose::URL_SAFE;
use base64::Engine as _;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::archive::{ArchiveClient, FrameVersion};
use crate::error::ArchiveError;

const LATEST: &str = "latest";

/// A frame file available on local disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalFrame {
    pub file_path: PathBuf,
    /// True when no download was needed
    pub cached: bool,
}

/// Partition key of the cache: URL-safe base64 of the SHA-256 of the API base URL.
pub fn host_hash(base_url: &str) -> String {
    URL_SAFE.encode(Sha256::digest(base_url.as_bytes()))
}

/// Version-aware frame cache backed by an [`ArchiveClient`].
#[derive(Clone)]
pub struct FrameCache {
    archive: Arc<dyn ArchiveClient>,
    root: PathBuf,
}

impl FrameCache {
    pub fn new(archive: Arc<dyn ArchiveClient>, working_dir: &Path) -> Self {
        let root = working_dir
            .join("cache")
            .join("archive")
            .join(host_hash(archive.base_url()));
        Self { archive, root }
    }

    /// Directory holding all data for the configured archive host.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn versions_dir(&self, state: &str, frame_id: &str) -> PathBuf {
        self.root
            .join(state)
            .join("frames")
            .join(frame_id)
            .join("versions")
    }

    /// Make the current version of `frame_id` available locally.
    ///
    /// Without `force_download` or `recheck_version`, an existing `latest`
    /// alias is trusted and the archive is not contacted. `recheck_version`
    /// asks the archive for the current version and reuses it if already
    /// present. `force_download` always downloads.
    ///
    /// `progress` receives `(downloaded, total)` after every chunk.
    pub async fn ensure_local<F>(
        &self,
        frame_id: &str,
        force_download: bool,
        recheck_version: bool,
        mut progress: F,
    ) -> Result<LocalFrame, ArchiveError>
    where
        F: FnMut(u64, Option<u64>) + Send,
    {
        validate_component(frame_id).map_err(ArchiveError::InvalidFrameId)?;

        let completed = self.versions_dir("completed", frame_id);
        let latest = completed.join(LATEST);

        if !force_download && !recheck_version && path_exists(&latest).await {
            let file_path = single_file(&latest).await?;
            debug!(frame_id, path = %file_path.display(), "Using latest cached frame");
            return Ok(LocalFrame {
                file_path,
                cached: true,
            });
        }

        let version = self.archive.frame_version(frame_id).await?;
        validate_version(&version)?;

        let location = completed.join(&version.version_id).join(version.file_name());
        if !force_download && path_exists(&location).await {
            debug!(
                frame_id,
                version = %version.version_id,
                "Frame version already cached"
            );
            return Ok(LocalFrame {
                file_path: canonical(&location).await?,
                cached: true,
            });
        }

        let inprogress = self
            .versions_dir("inprogress", frame_id)
            .join(&version.version_id)
            .join(version.file_name());
        self.download(&version, &inprogress, &mut progress).await?;

        if let Some(parent) = location.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::rename(&inprogress, &location).await?;
        point_latest(&completed, &version.version_id).await?;

        info!(
            frame_id,
            version = %version.version_id,
            path = %location.display(),
            "Downloaded frame"
        );

        Ok(LocalFrame {
            file_path: canonical(&location).await?,
            cached: false,
        })
    }

    async fn download<F>(
        &self,
        version: &FrameVersion,
        target: &Path,
        progress: &mut F,
    ) -> Result<(), ArchiveError>
    where
        F: FnMut(u64, Option<u64>) + Send,
    {
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut download = self.archive.download(&version.url).await?;
        let mut file = tokio::fs::File::create(target).await?;
        let mut written = 0u64;

        while let Some(chunk) = download.body.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
            progress(written, download.total);
        }
        file.flush().await?;
        file.sync_all().await?;

        Ok(())
    }
}

/// Reject values that would escape their directory when used as a path component.
fn validate_component(value: &str) -> Result<(), String> {
    if value.is_empty()
        || value == "."
        || value.contains("..")
        || value.contains('/')
        || value.contains('\\')
        || value.contains('\0')
    {
        return Err(value.to_string());
    }
    Ok(())
}

fn validate_version(version: &FrameVersion) -> Result<(), ArchiveError> {
    if version.version_id == LATEST {
        return Err(ArchiveError::Metadata("version id collides with the latest alias".to_string()));
    }
    for value in [&version.version_id, &version.basename] {
        validate_component(value)
            .map_err(|v| ArchiveError::Metadata(format!("unsafe path component {:?}", v)))?;
    }
    if !version.extension.is_empty() {
        validate_component(&version.extension)
            .map_err(|v| ArchiveError::Metadata(format!("unsafe extension {:?}", v)))?;
    }
    Ok(())
}

async fn path_exists(path: &Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}

async fn canonical(path: &Path) -> Result<PathBuf, ArchiveError> {
    Ok(tokio::fs::canonicalize(path).await?)
}

/// The only entry of `dir`, or `InvalidCacheState`.
async fn single_file(dir: &Path) -> Result<PathBuf, ArchiveError> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut files = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        files.push(entry.path());
    }

    match files.as_slice() {
        [file] => canonical(file).await,
        _ => Err(ArchiveError::InvalidCacheState(format!(
            "{} holds {} files, expected exactly one",
            dir.display(),
            files.len()
        ))),
    }
}

/// Repoint `<versions>/latest` at `<versions>/<version_id>`.
///
/// A fresh symlink is created under a unique name and renamed over the
/// alias, so the swap is atomic. The link target is relative to `versions`.
async fn point_latest(versions: &Path, version_id: &str) -> Result<(), ArchiveError> {
    let target = PathBuf::from(version_id);
    let staging = versions.join(format!(".{}-{}", LATEST, uuid::Uuid::new_v4()));

    #[cfg(unix)]
    tokio::fs::symlink(&target, &staging).await?;
    #[cfg(windows)]
    tokio::fs::symlink_dir(&target, &staging).await?;

    if let Err(e) = tokio::fs::rename(&staging, versions.join(LATEST)).await {
        let _ = tokio::fs::remove_file(&staging).await;
        return Err(e.into());
    }
    Ok(())
}
