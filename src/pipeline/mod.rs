//! Durable pipelines behind the HTTP API.
//!
//! Two workflows are exposed, each deduplicated by an identity string and
//! wrapped in a [`RetryShell`]:
//!
//! ```text
//! frame_dimensions:  find_best_worker -> download (child run) -> get_hdu_dimensions
//!
//! create_image:      find_best_worker -> download (child run) -> create_image_file
//!                      -> start_multipart_upload -> upload_part x N -> finish_multipart_upload
//!                    compensation: abort_multipart_upload (after start)
//!                    finalizer:    delete_file (after create_image_file)
//! ```
//!
//! Steps that touch the frame on disk are pinned to the worker returned by
//! `find_best_worker`; bookkeeping steps run on the generic queue.

mod activities;
mod shell;

pub use activities::{Activities, Dimensions, MultipartUpload, PartSpec};
pub use shell::{RetryScope, RetryShell, DEFAULT_RETRY_DELAY};

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::affinity::WorkerAffinityToken;
use crate::cache::LocalFrame;
use crate::engine::{
    Engine, ReusePolicy, RetryPolicy, RunOptions, Saga, StepOptions, WorkflowContext,
};
use crate::error::{PipelineError, StepError};
use crate::iiif::NormalizedRequest;
use crate::render::RenderedImage;

/// Size of every multipart part but the last.
pub const PART_SIZE: u64 = 5 * 1024 * 1024;

pub const DIMENSIONS_EXECUTION_TIMEOUT: Duration = Duration::from_secs(60 * 60);
pub const IMAGE_EXECUTION_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);
pub const DOWNLOAD_EXECUTION_TIMEOUT: Duration = Duration::from_secs(30 * 60);

const SCHEDULE_TO_START: Duration = Duration::from_secs(15);

/// Identity of the dimensions workflow for one HDU.
pub fn dimensions_workflow_id(frame_id: &str, hdu_index: usize) -> String {
    format!("GetFrameDimensions:frames/{}/fits/hdus/{}", frame_id, hdu_index)
}

/// Identity of the image workflow for one normalized request.
pub fn image_workflow_id(frame_id: &str, hdu_index: usize, request: &NormalizedRequest) -> String {
    format!("CreateImage:{}/{}/{}", frame_id, hdu_index, request)
}

/// Identity of the download child workflow of one frame on one worker.
pub fn download_workflow_id(frame_id: &str, worker: &WorkerAffinityToken) -> String {
    format!("DownloadFrameFile:frames/{}/{}", frame_id, worker)
}

/// Split a file of `size` bytes into parts of `part_size` bytes.
///
/// Every part but the last is exactly `part_size` long.
pub fn plan_parts(size: u64, part_size: u64) -> Vec<PartSpec> {
    let part_size = part_size.max(1);
    (0..size.div_ceil(part_size))
        .map(|i| {
            let offset = i * part_size;
            PartSpec {
                part_number: i as i32 + 1,
                offset,
                length: part_size.min(size - offset),
            }
        })
        .collect()
}

/// The frame, HDU and cache flags shared by both pipelines.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameRequest {
    pub frame_id: String,
    pub hdu_index: usize,
    /// Return the output of an earlier completed run with the same identity
    pub reuse_workflow: bool,
    pub force_download: bool,
    pub recheck_version: bool,
}

impl FrameRequest {
    pub fn new(frame_id: impl Into<String>, hdu_index: usize) -> Self {
        Self {
            frame_id: frame_id.into(),
            hdu_index,
            reuse_workflow: true,
            force_download: false,
            recheck_version: false,
        }
    }

    fn reuse_policy(&self) -> ReusePolicy {
        if self.reuse_workflow {
            ReusePolicy::ReuseCompleted
        } else {
            ReusePolicy::JoinRunning
        }
    }
}

/// Entry points of the dimensions and image pipelines.
#[derive(Clone)]
pub struct Pipelines {
    engine: Engine,
    activities: Arc<Activities>,
    shell: RetryShell,
    part_size: u64,
}

impl Pipelines {
    pub fn new(engine: Engine, activities: Arc<Activities>, shell: RetryShell) -> Self {
        Self {
            engine,
            activities,
            shell,
            part_size: PART_SIZE,
        }
    }

    /// Override the multipart part size.
    pub fn with_part_size(mut self, part_size: u64) -> Self {
        self.part_size = part_size.max(1);
        self
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Native dimensions of the requested HDU.
    pub async fn frame_dimensions(&self, request: &FrameRequest) -> Result<Dimensions, PipelineError> {
        let workflow_id = dimensions_workflow_id(&request.frame_id, request.hdu_index);
        let options = RunOptions::new(request.reuse_policy(), DIMENSIONS_EXECUTION_TIMEOUT);
        let this = self.clone();
        let request = request.clone();

        self.engine
            .run(&workflow_id, options, move |ctx| async move {
                this.shell
                    .run(&ctx, "dimensions", || this.dimensions_once(&ctx, &request))
                    .await
            })
            .await
    }

    /// Generate the requested variant and return its object key.
    pub async fn create_image(
        &self,
        request: &FrameRequest,
        image: &NormalizedRequest,
    ) -> Result<String, PipelineError> {
        let workflow_id = image_workflow_id(&request.frame_id, request.hdu_index, image);
        let options = RunOptions::new(request.reuse_policy(), IMAGE_EXECUTION_TIMEOUT);
        let this = self.clone();
        let request = request.clone();
        let image = *image;

        self.engine
            .run(&workflow_id, options, move |ctx| async move {
                this.shell
                    .run(&ctx, "create_image", || this.create_image_once(&ctx, &request, image))
                    .await
            })
            .await
    }

    async fn dimensions_once(
        &self,
        ctx: &WorkflowContext,
        request: &FrameRequest,
    ) -> Result<Dimensions, PipelineError> {
        let worker = self.find_best_worker(ctx, &request.frame_id).await?;
        let frame = self.download(ctx, request, &worker).await?;

        let activities = self.activities.clone();
        let hdu_index = request.hdu_index;
        let dimensions = ctx
            .execute(
                "get_hdu_dimensions",
                StepOptions::new(Duration::from_secs(10))
                    .schedule_to_start(SCHEDULE_TO_START)
                    .retry(RetryPolicy::attempts(3))
                    .on(&worker),
                move |_| {
                    let activities = activities.clone();
                    let path = frame.file_path.clone();
                    async move { activities.get_hdu_dimensions(path, hdu_index).await }
                },
            )
            .await?;

        debug!(
            frame_id = %request.frame_id,
            hdu = hdu_index,
            width = dimensions.width,
            height = dimensions.height,
            "Resolved HDU dimensions"
        );
        Ok(dimensions)
    }

    async fn create_image_once(
        &self,
        ctx: &WorkflowContext,
        request: &FrameRequest,
        image: NormalizedRequest,
    ) -> Result<String, PipelineError> {
        let mut saga = Saga::new(ctx);
        let outcome = self.generate(ctx, &mut saga, request, image).await;
        saga.settle(outcome).await
    }

    async fn generate(
        &self,
        ctx: &WorkflowContext,
        saga: &mut Saga,
        request: &FrameRequest,
        image: NormalizedRequest,
    ) -> Result<String, PipelineError> {
        let worker = self.find_best_worker(ctx, &request.frame_id).await?;
        let frame = self.download(ctx, request, &worker).await?;

        let activities = self.activities.clone();
        let hdu_index = request.hdu_index;
        let fits_path = frame.file_path.clone();
        let rendered: RenderedImage = ctx
            .execute(
                "create_image_file",
                StepOptions::new(Duration::from_secs(30))
                    .schedule_to_start(SCHEDULE_TO_START)
                    .retry(RetryPolicy::attempts(3))
                    .on(&worker),
                move |_| {
                    let activities = activities.clone();
                    let path = fits_path.clone();
                    async move { activities.create_image_file(path, hdu_index, image).await }
                },
            )
            .await?;

        {
            let activities = self.activities.clone();
            let worker = worker.clone();
            let path = rendered.file_path.clone();
            saga.always("delete_file", move |ctx| async move {
                delete_file(&ctx, activities, worker, path).await
            });
        }

        if rendered.file_size == 0 {
            return Err(PipelineError::Step {
                step: "create_image_file".to_string(),
                source: StepError::non_retryable("encoded image is empty"),
            });
        }

        let activities = self.activities.clone();
        let object_key = rendered.object_key();
        let content_type = image.format.content_type();
        let upload: MultipartUpload = ctx
            .execute(
                "start_multipart_upload",
                StepOptions::new(Duration::from_secs(3)),
                move |_| {
                    let activities = activities.clone();
                    let key = object_key.clone();
                    async move { activities.start_multipart_upload(&key, content_type).await }
                },
            )
            .await?;

        {
            let activities = self.activities.clone();
            let upload = upload.clone();
            saga.on_failure("abort_multipart_upload", move |ctx| async move {
                abort_upload(&ctx, activities, upload).await
            });
        }

        let parts = plan_parts(rendered.file_size, self.part_size);
        let uploads = parts.into_iter().map(|part| {
            let activities = self.activities.clone();
            let upload = upload.clone();
            let path = rendered.file_path.clone();
            ctx.execute(
                "upload_part",
                StepOptions::new(Duration::from_secs(5 * 60))
                    .schedule_to_start(SCHEDULE_TO_START)
                    .heartbeat(Duration::from_secs(15))
                    .retry(RetryPolicy::attempts(3))
                    .on(&worker),
                move |step| {
                    let activities = activities.clone();
                    let upload = upload.clone();
                    let path = path.clone();
                    async move { activities.upload_part(&step, &upload, &path, part).await }
                },
            )
        });
        let completed = futures::future::try_join_all(uploads).await?;

        let activities = self.activities.clone();
        let key: String = ctx
            .execute(
                "finish_multipart_upload",
                StepOptions::new(Duration::from_secs(3)),
                move |_| {
                    let activities = activities.clone();
                    let upload = upload.clone();
                    let completed = completed.clone();
                    async move { activities.finish_multipart_upload(&upload, &completed).await }
                },
            )
            .await?;

        info!(
            workflow_id = ctx.workflow_id(),
            key = %key,
            size = rendered.file_size,
            "Generated image"
        );
        Ok(key)
    }

    async fn find_best_worker(
        &self,
        ctx: &WorkflowContext,
        frame_id: &str,
    ) -> Result<WorkerAffinityToken, PipelineError> {
        let activities = self.activities.clone();
        let frame_id = frame_id.to_string();
        ctx.execute(
            "find_best_worker",
            StepOptions::new(Duration::from_secs(5)),
            move |_| {
                let activities = activities.clone();
                let frame_id = frame_id.clone();
                async move { activities.find_best_worker(&frame_id).await }
            },
        )
        .await
    }

    /// Fetch the frame on `worker` through the download child workflow, so
    /// concurrent pipelines on one worker share a single download.
    async fn download(
        &self,
        ctx: &WorkflowContext,
        request: &FrameRequest,
        worker: &WorkerAffinityToken,
    ) -> Result<LocalFrame, PipelineError> {
        let engine = self.engine.clone();
        let activities = self.activities.clone();
        let request = request.clone();
        let queue = worker.clone();

        ctx.execute(
            "download_frame_file_with_workflow",
            StepOptions::new(Duration::from_secs(5 * 60))
                .schedule_to_start(SCHEDULE_TO_START)
                .retry(RetryPolicy::attempts(3))
                .on(worker),
            move |_| {
                let engine = engine.clone();
                let activities = activities.clone();
                let request = request.clone();
                let queue = queue.clone();
                async move {
                    let workflow_id = download_workflow_id(&request.frame_id, &queue);
                    let options =
                        RunOptions::new(ReusePolicy::JoinRunning, DOWNLOAD_EXECUTION_TIMEOUT);
                    engine
                        .run(&workflow_id, options, move |child| async move {
                            download_child(&child, activities, request, queue).await
                        })
                        .await
                        .map_err(into_step_error)
                }
            },
        )
        .await
    }
}

async fn download_child(
    ctx: &WorkflowContext,
    activities: Arc<Activities>,
    request: FrameRequest,
    queue: WorkerAffinityToken,
) -> Result<LocalFrame, PipelineError> {
    ctx.execute(
        "download_frame_file",
        StepOptions::new(Duration::from_secs(5 * 60))
            .schedule_to_start(SCHEDULE_TO_START)
            .heartbeat(Duration::from_secs(10))
            .retry(RetryPolicy::attempts(3))
            .on(&queue),
        move |step| {
            let activities = activities.clone();
            let request = request.clone();
            async move {
                activities
                    .download_frame_file(
                        &step,
                        &request.frame_id,
                        request.force_download,
                        request.recheck_version,
                    )
                    .await
            }
        },
    )
    .await
}

async fn delete_file(
    ctx: &WorkflowContext,
    activities: Arc<Activities>,
    worker: WorkerAffinityToken,
    path: PathBuf,
) -> Result<(), PipelineError> {
    ctx.execute(
        "delete_file",
        StepOptions::new(Duration::from_secs(5))
            .schedule_to_start(SCHEDULE_TO_START)
            .retry(RetryPolicy::attempts(3))
            .on(&worker),
        move |_| {
            let activities = activities.clone();
            let path = path.clone();
            async move { activities.delete_file(&path).await }
        },
    )
    .await
}

async fn abort_upload(
    ctx: &WorkflowContext,
    activities: Arc<Activities>,
    upload: MultipartUpload,
) -> Result<(), PipelineError> {
    ctx.execute(
        "abort_multipart_upload",
        StepOptions::new(Duration::from_secs(5)),
        move |_| {
            let activities = activities.clone();
            let upload = upload.clone();
            async move { activities.abort_multipart_upload(&upload).await }
        },
    )
    .await
}

/// Surface a failed child run as the failure of the step that started it.
fn into_step_error(err: PipelineError) -> StepError {
    match err {
        PipelineError::Step { source, .. } => source,
        PipelineError::Cancelled => StepError::Cancelled,
        other => StepError::retryable(other.to_string()),
    }
}
