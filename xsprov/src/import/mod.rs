//! Raw disk import.
//!
//! Streams a local raw or VHD image into an existing VDI through the
//! coordinator's `import_raw_vdi` endpoint, then follows the remote task that
//! writes it to storage. The import is not idempotent: running it twice
//! writes the image twice.

pub mod vhd;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use futures_util::TryStreamExt;
use reqwest::StatusCode;
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE};
use serde_json::json;
use tokio::fs::File;
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};

use crate::config::ProviderContext;
use crate::error::{ProviderError, RemoteContext, Result};
use crate::resolve::uuid_of;
use crate::retry::pause;
use crate::xapi::records::TaskStatus;
use crate::xapi::{ObjectKind, OpaqueRef, Session};

pub use vhd::{DiskFormat, ImageInfo, inspect};

const TASK_NAME: &str = "HTTP_actions.put_import_raw_vdi";

/// Upload and task-polling settings.
#[derive(Debug, Clone)]
pub struct ImportPipeline {
    pub poll_interval: Duration,
    /// Task polls before the import is cancelled as timed out.
    pub max_polls: u32,
    /// Overall limit for the HTTP upload.
    pub http_timeout: Duration,
}

impl Default for ImportPipeline {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            max_polls: 3600,
            http_timeout: Duration::from_secs(30 * 60),
        }
    }
}

impl ImportPipeline {
    /// Write `image` into `vdi`.
    pub async fn run(&self, ctx: &ProviderContext, vdi: &OpaqueRef, image: &ImageInfo) -> Result<()> {
        let session = &ctx.session;
        let vdi_uuid = uuid_of(session, ObjectKind::Vdi, vdi).await?;
        let description = format!("import disk {} to VDI {vdi_uuid}", image.path.display());
        let task: OpaqueRef = session
            .invoke("task.create", vec![json!(TASK_NAME), json!(description)])
            .await
            .remote("task.create", &vdi_uuid)?;
        debug!(task = %task, vdi = %vdi_uuid, "created import task");

        if let Err(e) = self.upload(ctx, vdi, &task, image).await {
            discard_task(session, &task).await;
            return Err(e);
        }
        self.wait_for_task(ctx, &task).await?;
        info!(vdi = %vdi_uuid, path = %image.path.display(), "imported disk image");
        Ok(())
    }

    async fn upload(
        &self,
        ctx: &ProviderContext,
        vdi: &OpaqueRef,
        task: &OpaqueRef,
        image: &ImageInfo,
    ) -> Result<()> {
        let upload_error = |reason: String| ProviderError::Upload {
            path: image.path.clone(),
            reason,
        };
        // The coordinator serves a self-signed certificate.
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .timeout(self.http_timeout)
            .build()
            .map_err(|e| upload_error(e.to_string()))?;

        let file = File::open(&image.path).await.map_err(|source| ProviderError::Io {
            path: image.path.clone(),
            source,
        })?;
        let sent = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&sent);
        let body = ReaderStream::new(file).inspect_ok(move |chunk| {
            counter.fetch_add(chunk.len() as u64, Ordering::Relaxed);
        });

        let url = format!("{}/import_raw_vdi", ctx.session.base_url());
        let request = client
            .put(&url)
            .query(&[
                ("session_id", ctx.session.session_ref().as_str()),
                ("vdi", vdi.as_str()),
                ("task_id", task.as_str()),
                ("format", image.format.as_str()),
            ])
            .header(CONTENT_LENGTH, image.file_size)
            .header(CONTENT_TYPE, "application/octet-stream")
            .body(reqwest::Body::wrap_stream(body));
        debug!(url = %url, bytes = image.file_size, format = image.format.as_str(), "uploading image");

        let started = Instant::now();
        let response = tokio::select! {
            _ = ctx.cancel.cancelled() => {
                return Err(ProviderError::Cancelled(format!("upload of {}", image.path.display())));
            }
            response = request.send() => response.map_err(|e| upload_error(e.to_string()))?,
        };

        let status = response.status();
        if status != StatusCode::OK {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::UploadRejected {
                path: image.path.clone(),
                status: status.as_u16(),
                body,
            });
        }
        let elapsed = started.elapsed();
        let bytes = sent.load(Ordering::Relaxed);
        info!(
            bytes,
            elapsed_ms = elapsed.as_millis() as u64,
            mib_per_sec = %format!("{:.2}", bytes as f64 / elapsed.as_secs_f64().max(0.001) / 1048576.0),
            "upload finished"
        );
        Ok(())
    }

    /// Poll `task` until it leaves the pending state.
    async fn wait_for_task(&self, ctx: &ProviderContext, task: &OpaqueRef) -> Result<()> {
        let session = &ctx.session;
        let mut polls = 0u32;
        loop {
            let status: TaskStatus = session
                .get_field(ObjectKind::Task, task, "status")
                .await
                .remote("task.get_status", task)?;
            match status {
                TaskStatus::Pending => {
                    if polls >= self.max_polls {
                        cancel_task(session, task).await;
                        return Err(ProviderError::Timeout {
                            wait: format!("import task {task}"),
                            after: self.poll_interval * self.max_polls,
                            last_error: None,
                        });
                    }
                    let progress: f64 = session
                        .get_field(ObjectKind::Task, task, "progress")
                        .await
                        .remote("task.get_progress", task)?;
                    debug!(task = %task, progress = %format!("{progress:.2}"), "import in progress");
                    polls += 1;
                    if let Err(e) = pause(&ctx.cancel, self.poll_interval, "import task").await {
                        cancel_task(session, task).await;
                        return Err(e);
                    }
                }
                TaskStatus::Success => {
                    discard_task(session, task).await;
                    return Ok(());
                }
                TaskStatus::Failure | TaskStatus::Cancelling | TaskStatus::Cancelled => {
                    let info: Vec<String> = session
                        .get_field(ObjectKind::Task, task, "error_info")
                        .await
                        .remote("task.get_error_info", task)?;
                    discard_task(session, task).await;
                    return Err(ProviderError::TaskFailed {
                        task: task.to_string(),
                        detail: if info.is_empty() {
                            format!("task ended as {status:?}")
                        } else {
                            info.join(" ")
                        },
                    });
                }
            }
        }
    }
}

async fn cancel_task(session: &Session, task: &OpaqueRef) {
    if let Err(e) = session.invoke_unit("task.cancel", vec![task.into()]).await {
        warn!(task = %task, error = %e, "failed to cancel import task");
    }
}

/// Best effort; the task handle only serves observability.
async fn discard_task(session: &Session, task: &OpaqueRef) {
    if let Err(e) = session.destroy(ObjectKind::Task, task).await {
        warn!(task = %task, error = %e, "failed to destroy import task");
    }
}
