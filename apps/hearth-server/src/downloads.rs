//! Read-time projection of live download jobs. Merges the file and model
//! queues into one client-facing view; holds no state of its own, so every
//! call reflects the queue exactly and suits fixed-interval polling.

use anyhow::Result;
use hearth_kernel::JobRow;
use serde::Serialize;
use utoipa::ToSchema;

use crate::jobs::download::FileDownloadPayload;
use crate::jobs::model::ModelDownloadPayload;
use crate::queue::{WorkQueue, QUEUE_FILE_DOWNLOADS, QUEUE_MODEL_DOWNLOADS};

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct DownloadJobView {
    pub job_id: String,
    /// URL for file downloads, model name for model pulls.
    pub source: String,
    pub progress: i64,
    /// Destination file name or model artifact name.
    pub target: String,
    /// zim | map | model
    pub filetype: String,
    pub state: String,
}

/// Per-variant projection of a queue row into the unified view. Rows whose
/// payload no longer parses are dropped rather than failing the listing.
enum DownloadPayload {
    File(FileDownloadPayload),
    Model(ModelDownloadPayload),
}

impl DownloadPayload {
    fn from_job(job: &JobRow) -> Option<Self> {
        match job.queue.as_str() {
            QUEUE_FILE_DOWNLOADS => serde_json::from_value(job.payload.clone())
                .ok()
                .map(DownloadPayload::File),
            QUEUE_MODEL_DOWNLOADS => serde_json::from_value(job.payload.clone())
                .ok()
                .map(DownloadPayload::Model),
            _ => None,
        }
    }

    fn view(&self, job: &JobRow) -> DownloadJobView {
        match self {
            DownloadPayload::File(payload) => DownloadJobView {
                job_id: job.id.clone(),
                source: payload.url.clone(),
                progress: job.progress,
                target: payload
                    .target_name()
                    .unwrap_or_else(|_| payload.url.clone()),
                filetype: payload.resource_type.clone(),
                state: job.state.clone(),
            },
            DownloadPayload::Model(payload) => DownloadJobView {
                job_id: job.id.clone(),
                source: payload.model.clone(),
                progress: job.progress,
                target: payload.artifact_name(),
                filetype: "model".to_string(),
                state: job.state.clone(),
            },
        }
    }
}

/// Live download jobs across both queues, active work first (descending
/// progress), ties preserving enqueue order.
pub async fn list_download_jobs(
    queue: &WorkQueue,
    filetype: Option<&str>,
) -> Result<Vec<DownloadJobView>> {
    let mut jobs = queue.list_live_jobs(QUEUE_FILE_DOWNLOADS).await?;
    jobs.extend(queue.list_live_jobs(QUEUE_MODEL_DOWNLOADS).await?);
    // Stable pre-sort on creation time so the later progress sort breaks
    // ties in enqueue order even across queues.
    jobs.sort_by(|a, b| a.created.cmp(&b.created));

    let mut views: Vec<DownloadJobView> = jobs
        .iter()
        .filter_map(|job| DownloadPayload::from_job(job).map(|p| p.view(job)))
        .filter(|view| filetype.is_none_or(|ft| view.filetype == ft))
        .collect();
    views.sort_by(|a, b| b.progress.cmp(&a.progress));
    Ok(views)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::queue::{EnqueueOptions, KIND_FILE_DOWNLOAD, KIND_MODEL_DOWNLOAD};
    use hearth_kernel::Kernel;
    use serde_json::json;
    use std::sync::Arc;

    struct Harness {
        _dir: tempfile::TempDir,
        kernel: Kernel,
        queue: WorkQueue,
    }

    fn harness() -> Harness {
        let dir = tempfile::tempdir().expect("tempdir");
        let kernel = Kernel::open(dir.path()).expect("kernel");
        let config = Arc::new(Config::for_tests(dir.path()));
        let queue = WorkQueue::new(kernel.clone(), config);
        Harness {
            _dir: dir,
            kernel,
            queue,
        }
    }

    async fn enqueue_file(h: &Harness, url: &str, progress: i64) -> String {
        let out = h
            .queue
            .enqueue(
                QUEUE_FILE_DOWNLOADS,
                KIND_FILE_DOWNLOAD,
                &json!({"url": url, "resource_type": "zim"}),
                EnqueueOptions::retrying(3, 100),
            )
            .await
            .unwrap();
        h.kernel.set_job_progress(&out.job.id, progress).unwrap();
        out.job.id
    }

    async fn enqueue_model(h: &Harness, model: &str, progress: i64) -> String {
        let out = h
            .queue
            .enqueue(
                QUEUE_MODEL_DOWNLOADS,
                KIND_MODEL_DOWNLOAD,
                &json!({"model": model}),
                EnqueueOptions::retrying(3, 100),
            )
            .await
            .unwrap();
        h.kernel.set_job_progress(&out.job.id, progress).unwrap();
        out.job.id
    }

    #[tokio::test]
    async fn sorted_by_descending_progress_across_queues() {
        let h = harness();
        enqueue_file(&h, "http://mirror/wiki.zim", 40).await;
        let model_id = enqueue_model(&h, "qwen2.5-3b", 70).await;

        let views = list_download_jobs(&h.queue, None).await.unwrap();
        assert_eq!(views.len(), 2);
        assert_eq!(views[0].job_id, model_id);
        assert_eq!(views[0].filetype, "model");
        assert_eq!(views[1].progress, 40);
    }

    #[tokio::test]
    async fn ties_preserve_enqueue_order() {
        let h = harness();
        let first = enqueue_file(&h, "http://mirror/a.zim", 0).await;
        let second = enqueue_file(&h, "http://mirror/b.zim", 0).await;
        let third = enqueue_model(&h, "m1", 0).await;

        let views = list_download_jobs(&h.queue, None).await.unwrap();
        let ids: Vec<&str> = views.iter().map(|v| v.job_id.as_str()).collect();
        assert_eq!(ids, vec![first.as_str(), second.as_str(), third.as_str()]);
    }

    #[tokio::test]
    async fn filetype_filter_selects_one_shape() {
        let h = harness();
        enqueue_file(&h, "http://mirror/wiki.zim", 40).await;
        let model_id = enqueue_model(&h, "qwen2.5-3b", 70).await;

        let views = list_download_jobs(&h.queue, Some("model")).await.unwrap();
        assert_eq!(views.len(), 1);
        assert_eq!(views[0].job_id, model_id);

        let views = list_download_jobs(&h.queue, Some("zim")).await.unwrap();
        assert_eq!(views.len(), 1);
        assert_eq!(views[0].source, "http://mirror/wiki.zim");
    }

    #[tokio::test]
    async fn terminal_jobs_are_excluded() {
        let h = harness();
        let done = enqueue_file(&h, "http://mirror/a.zim", 100).await;
        h.kernel.complete_job(&done, &json!({})).unwrap();
        enqueue_file(&h, "http://mirror/b.zim", 10).await;

        let views = list_download_jobs(&h.queue, None).await.unwrap();
        assert_eq!(views.len(), 1);
        assert_eq!(views[0].progress, 10);
    }
}
