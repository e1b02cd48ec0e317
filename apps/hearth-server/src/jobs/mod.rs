//! Per-queue job handlers. Each handler consumes one claimed job, reports
//! incremental progress through its [`JobContext`], and returns a typed
//! output value or a [`JobError`] that the worker maps onto queue state.

pub mod benchmark;
pub mod download;
pub mod model;
pub mod update_check;

use std::collections::HashMap;
use std::sync::Arc;

use hearth_events::Bus;
use hearth_kernel::{JobRow, Kernel};
use serde_json::{json, Value};

use crate::config::Config;
use crate::queue::{QUEUE_FILE_DOWNLOADS, QUEUE_MODEL_DOWNLOADS};
use hearth_topics as topics;

/// Handler failure. Retryable failures go back onto the queue as delayed
/// retries while attempts remain; fatal failures terminate the job.
#[derive(thiserror::Error, Debug)]
pub enum JobError {
    #[error("{0}")]
    Retryable(String),
    #[error("{0}")]
    Fatal(String),
}

impl JobError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, JobError::Retryable(_))
    }
}

/// Everything a handler may touch while running one job.
#[derive(Clone)]
pub struct JobContext {
    pub kernel: Kernel,
    pub bus: Bus,
    pub config: Arc<Config>,
    pub http: reqwest::Client,
}

impl JobContext {
    /// Persist a progress value and fan it out to observers. Download
    /// queues publish on the download topic so the UI's live view and the
    /// pull-based aggregator agree.
    pub async fn progress(&self, job: &JobRow, percent: i64, detail: Value) {
        let percent = percent.clamp(0, 100);
        if let Err(err) = self.kernel.set_job_progress_async(&job.id, percent).await {
            tracing::warn!(job_id = %job.id, %err, "failed to persist job progress");
        }
        if matches!(job.queue.as_str(), QUEUE_FILE_DOWNLOADS | QUEUE_MODEL_DOWNLOADS) {
            self.bus.publish(
                topics::TOPIC_DOWNLOAD_PROGRESS,
                &json!({
                    "id": job.id,
                    "queue": job.queue,
                    "kind": job.kind,
                    "progress": percent,
                    "detail": detail,
                }),
            );
        }
    }
}

#[async_trait::async_trait]
pub trait JobHandler: Send + Sync {
    /// The queue this handler consumes.
    fn queue(&self) -> &'static str;

    async fn run(&self, job: &JobRow, ctx: &JobContext) -> Result<Value, JobError>;
}

/// One handler per queue, fixed at process start.
pub fn handler_registry() -> HashMap<&'static str, Arc<dyn JobHandler>> {
    let handlers: Vec<Arc<dyn JobHandler>> = vec![
        Arc::new(download::FileDownloadHandler),
        Arc::new(model::ModelDownloadHandler),
        Arc::new(benchmark::BenchmarkHandler),
        Arc::new(update_check::UpdateCheckHandler),
    ];
    handlers.into_iter().map(|h| (h.queue(), h)).collect()
}
