use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_s3::config::http::HttpResponse;
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart as S3CompletedPart};
use aws_sdk_s3::Client;
use tracing::debug;

use super::{CompletedPart, ObjectStore, PartBody};
use crate::error::StoreError;

/// Lifetime of the presigned URL used for a single part upload.
const PART_URL_TTL: Duration = Duration::from_secs(15 * 60);

/// S3-backed implementation of [`ObjectStore`].
///
/// Control requests go through the AWS SDK. Part bodies are streamed with
/// `reqwest` to a presigned `UploadPart` URL, so a part is never buffered
/// in memory.
#[derive(Clone)]
pub struct S3ObjectStore {
    client: Client,
    bucket: String,
    http: reqwest::Client,
}

impl S3ObjectStore {
    pub fn new(client: Client, bucket: impl Into<String>, http: reqwest::Client) -> Self {
        Self {
            client,
            bucket: bucket.into(),
            http,
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }
}

fn presigning(expires_in: Duration) -> Result<PresigningConfig, StoreError> {
    PresigningConfig::expires_in(expires_in).map_err(|e| StoreError::Presign(e.to_string()))
}

/// Classify an SDK failure by service error code and HTTP status.
fn sdk_error<E>(err: SdkError<E, HttpResponse>) -> StoreError
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
{
    let message = DisplayErrorContext(&err).to_string();

    if err.as_service_error().and_then(|e| e.code()) == Some("NoSuchUpload") {
        return StoreError::NoSuchUpload(message);
    }

    match &err {
        SdkError::ServiceError(_) | SdkError::ResponseError(_) => match err.raw_response() {
            Some(response) => StoreError::Rejected {
                status: response.status().as_u16(),
                message,
            },
            None => StoreError::S3(message),
        },
        SdkError::DispatchFailure(_) | SdkError::TimeoutError(_) => {
            StoreError::Connection(message)
        }
        _ => StoreError::S3(message),
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn create_multipart_upload(
        &self,
        key: &str,
        content_type: &str,
    ) -> Result<String, StoreError> {
        let output = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .send()
            .await
            .map_err(sdk_error)?;

        output
            .upload_id()
            .map(str::to_string)
            .ok_or_else(|| StoreError::S3("CreateMultipartUpload returned no UploadId".to_string()))
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        body: PartBody,
    ) -> Result<String, StoreError> {
        let presigned = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .part_number(part_number)
            .presigned(presigning(PART_URL_TTL)?)
            .await
            .map_err(|e| StoreError::Presign(DisplayErrorContext(&e).to_string()))?;

        debug!(key, part_number, length = body.content_length, "Uploading part");

        let response = self
            .http
            .put(presigned.uri())
            .header(reqwest::header::CONTENT_LENGTH, body.content_length)
            .body(reqwest::Body::wrap_stream(body.stream))
            .send()
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(StoreError::Rejected {
                status: status.as_u16(),
                message,
            });
        }

        response
            .headers()
            .get(reqwest::header::ETAG)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| StoreError::S3(format!("part {} response has no ETag", part_number)))
    }

    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Result<String, StoreError> {
        let parts = parts
            .iter()
            .map(|p| {
                S3CompletedPart::builder()
                    .part_number(p.part_number)
                    .e_tag(&p.etag)
                    .build()
            })
            .collect();

        let output = self
            .client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(parts))
                    .build(),
            )
            .send()
            .await
            .map_err(sdk_error)?;

        Ok(output.key().unwrap_or(key).to_string())
    }

    async fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> Result<(), StoreError> {
        self.client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await
            .map_err(sdk_error)?;
        Ok(())
    }

    async fn presigned_get(&self, key: &str, expires_in: Duration) -> Result<String, StoreError> {
        let presigned = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .presigned(presigning(expires_in)?)
            .await
            .map_err(|e| StoreError::Presign(DisplayErrorContext(&e).to_string()))?;
        Ok(presigned.uri().to_string())
    }
}

/// Create an S3 client with optional custom endpoint and region.
///
/// Use a custom endpoint for S3-compatible services like MinIO:
/// ```ignore
/// let client = create_s3_client(Some("http://localhost:9000"), "us-east-1").await;
/// ```
pub async fn create_s3_client(endpoint_url: Option<&str>, region: &str) -> Client {
    let region = aws_config::Region::new(region.to_string());
    let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest()).region(region);

    if let Some(endpoint) = endpoint_url {
        loader = loader.endpoint_url(endpoint);
    }

    let sdk_config = loader.load().await;

    // S3-compatible services generally need path-style addressing
    let s3_config = aws_sdk_s3::config::Builder::from(&sdk_config)
        .force_path_style(endpoint_url.is_some())
        .build();

    Client::from_conf(s3_config)
}
