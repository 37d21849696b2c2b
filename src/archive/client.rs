use async_trait::async_trait;
use futures::StreamExt;
use serde::Deserialize;
use tracing::debug;
use url::Url;

use super::{ArchiveClient, Download, FrameVersion};
use crate::error::ArchiveError;

/// [`ArchiveClient`] over HTTP with `reqwest`. Redirects are followed.
#[derive(Debug, Clone)]
pub struct HttpArchiveClient {
    http: reqwest::Client,
    base: Url,
    base_str: String,
}

impl HttpArchiveClient {
    /// Create a client for the API rooted at `base`.
    ///
    /// A trailing slash is added so relative joins stay under the API path.
    pub fn new(http: reqwest::Client, base: &Url) -> Self {
        let base_str = base.as_str().to_string();
        let mut base = base.clone();
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        Self {
            http,
            base,
            base_str,
        }
    }

    fn frame_url(&self, frame_id: &str) -> Result<Url, ArchiveError> {
        let encoded = urlencoding::encode(frame_id);
        self.base
            .join(&format!("frames/{}/", encoded))
            .map_err(|e| ArchiveError::InvalidFrameId(format!("{}: {}", frame_id, e)))
    }
}

#[derive(Debug, Deserialize)]
struct FrameRecord {
    basename: String,
    version_set: Vec<VersionRecord>,
}

#[derive(Debug, Deserialize)]
struct VersionRecord {
    id: serde_json::Value,
    extension: String,
    url: String,
}

/// Extract the current version from a frame metadata document.
pub(crate) fn parse_frame_version(body: &[u8]) -> Result<FrameVersion, ArchiveError> {
    let record: FrameRecord =
        serde_json::from_slice(body).map_err(|e| ArchiveError::Metadata(e.to_string()))?;
    let version = record
        .version_set
        .into_iter()
        .next()
        .ok_or_else(|| ArchiveError::Metadata("version_set is empty".to_string()))?;

    let version_id = match version.id {
        serde_json::Value::String(s) => s,
        serde_json::Value::Number(n) => n.to_string(),
        other => {
            return Err(ArchiveError::Metadata(format!(
                "unexpected version id {}",
                other
            )))
        }
    };

    Ok(FrameVersion {
        basename: record.basename,
        version_id,
        extension: version.extension,
        url: version.url,
    })
}

fn connection_error(err: reqwest::Error) -> ArchiveError {
    match err.status() {
        Some(status) => ArchiveError::Status {
            status: status.as_u16(),
        },
        None => ArchiveError::Connection(err.to_string()),
    }
}

#[async_trait]
impl ArchiveClient for HttpArchiveClient {
    fn base_url(&self) -> &str {
        &self.base_str
    }

    async fn frame_version(&self, frame_id: &str) -> Result<FrameVersion, ArchiveError> {
        let url = self.frame_url(frame_id)?;
        debug!(url = %url, "Fetching frame metadata");

        let response = self.http.get(url).send().await.map_err(connection_error)?;
        let status = response.status();
        if !status.is_success() {
            return Err(ArchiveError::Status {
                status: status.as_u16(),
            });
        }

        let body = response.bytes().await.map_err(connection_error)?;
        parse_frame_version(&body)
    }

    async fn download(&self, url: &str) -> Result<Download, ArchiveError> {
        let response = self.http.get(url).send().await.map_err(connection_error)?;
        let status = response.status();
        if !status.is_success() {
            return Err(ArchiveError::Status {
                status: status.as_u16(),
            });
        }

        let total = response.content_length();
        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(connection_error))
            .boxed();
        Ok(Download { total, body })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_frame_version() {
        let body = br#"{
            "id": 42,
            "basename": "ogg0m406-kb27-20230101-0042-e91",
            "version_set": [
                {"id": 9001, "extension": ".fits.fz", "url": "https://example.org/f.fits.fz"},
                {"id": 9000, "extension": ".fits.fz", "url": "https://example.org/old.fits.fz"}
            ]
        }"#;
        let version = parse_frame_version(body).unwrap();
        assert_eq!(version.basename, "ogg0m406-kb27-20230101-0042-e91");
        assert_eq!(version.version_id, "9001");
        assert_eq!(version.extension, ".fits.fz");
        assert_eq!(version.url, "https://example.org/f.fits.fz");
        assert_eq!(version.file_name(), "ogg0m406-kb27-20230101-0042-e91.fits.fz");
    }

    #[test]
    fn test_parse_rejects_bad_metadata() {
        let missing = br#"{"basename": "a", "version_set": []}"#;
        let err = parse_frame_version(missing).unwrap_err();
        assert!(matches!(err, ArchiveError::Metadata(_)));
        assert!(!err.is_retryable());

        let not_json = b"<html>";
        assert!(matches!(
            parse_frame_version(not_json),
            Err(ArchiveError::Metadata(_))
        ));
    }

    #[test]
    fn test_frame_url_joins_under_base() {
        let base = Url::parse("https://archive.example.org/api").unwrap();
        let client = HttpArchiveClient::new(reqwest::Client::new(), &base);
        assert_eq!(client.base_url(), "https://archive.example.org/api");
        assert_eq!(
            client.frame_url("123").unwrap().as_str(),
            "https://archive.example.org/api/frames/123/"
        );
    }
}
