use std::sync::Arc;

use anyhow::Result;
use hearth_kernel::{JobRow, Kernel, LIVE_JOB_STATES};
use serde::Serialize;
use tracing::debug;

use crate::config::Config;

// Queue names. Each queue has exactly one handler; the worker claims per
// queue so heterogeneous job categories never starve each other.
pub const QUEUE_FILE_DOWNLOADS: &str = "downloads.file";
pub const QUEUE_MODEL_DOWNLOADS: &str = "downloads.model";
pub const QUEUE_BENCH: &str = "bench";
pub const QUEUE_MAINTENANCE: &str = "maintenance";

pub const ALL_QUEUES: [&str; 4] = [
    QUEUE_FILE_DOWNLOADS,
    QUEUE_MODEL_DOWNLOADS,
    QUEUE_BENCH,
    QUEUE_MAINTENANCE,
];

// Job kinds (the logical job key within a queue).
pub const KIND_FILE_DOWNLOAD: &str = "file_download";
pub const KIND_MODEL_DOWNLOAD: &str = "model_download";
pub const KIND_BENCHMARK: &str = "benchmark";
pub const KIND_UPDATE_CHECK: &str = "update_check";

#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    pub max_attempts: i64,
    pub backoff_ms: i64,
    /// Collapses duplicate enqueues onto the live job with the same key.
    pub dedup_key: Option<String>,
}

impl EnqueueOptions {
    pub fn once(dedup_key: impl Into<String>) -> Self {
        Self {
            max_attempts: 1,
            backoff_ms: 0,
            dedup_key: Some(dedup_key.into()),
        }
    }

    pub fn retrying(max_attempts: i64, backoff_ms: i64) -> Self {
        Self {
            max_attempts,
            backoff_ms,
            dedup_key: None,
        }
    }

    pub fn with_dedup(mut self, key: impl Into<String>) -> Self {
        self.dedup_key = Some(key.into());
        self
    }
}

/// Result of an enqueue. `created: false` means a live job with the same
/// dedup key already existed and `job` is that job — callers surface the
/// existing work instead of erroring.
#[derive(Debug, Clone, Serialize)]
pub struct EnqueueOutcome {
    pub job: JobRow,
    pub created: bool,
    pub message: String,
}

/// Producer/consumer facade over the kernel's job tables. Cheap to clone;
/// opened at process start and injected through `AppState`.
#[derive(Clone)]
pub struct WorkQueue {
    kernel: Kernel,
    config: Arc<Config>,
}

impl WorkQueue {
    pub fn new(kernel: Kernel, config: Arc<Config>) -> Self {
        Self { kernel, config }
    }

    pub async fn enqueue(
        &self,
        queue: &str,
        kind: &str,
        payload: &serde_json::Value,
        options: EnqueueOptions,
    ) -> Result<EnqueueOutcome> {
        if let Some(key) = options.dedup_key.as_deref() {
            if let Some(existing) = self.kernel.find_job_by_dedup_async(queue, key).await? {
                debug!(queue, dedup_key = key, job_id = %existing.id, "enqueue coalesced onto live job");
                return Ok(EnqueueOutcome {
                    message: format!("job for {key} already exists"),
                    job: existing,
                    created: false,
                });
            }
        }
        let job = self
            .kernel
            .insert_job_async(
                queue,
                kind,
                payload,
                options.max_attempts.max(1),
                options.backoff_ms.max(0),
                options.dedup_key.as_deref(),
            )
            .await?;
        Ok(EnqueueOutcome {
            message: format!("job {} queued", job.id),
            job,
            created: true,
        })
    }

    pub async fn get_job(&self, id: &str) -> Result<Option<JobRow>> {
        self.kernel.get_job_async(id).await
    }

    /// Jobs on one queue in the given states, insertion order.
    pub async fn list_jobs(&self, queue: &str, states: &[&str]) -> Result<Vec<JobRow>> {
        self.kernel.list_jobs_async(queue, states).await
    }

    /// Live (waiting/active/delayed) jobs on one queue.
    pub async fn list_live_jobs(&self, queue: &str) -> Result<Vec<JobRow>> {
        self.kernel.list_jobs_async(queue, &LIVE_JOB_STATES).await
    }

    /// Idempotently install a recurring schedule; one active entry per key.
    pub async fn upsert_recurring(
        &self,
        queue: &str,
        key: &str,
        cron: &str,
        kind: &str,
        payload: &serde_json::Value,
    ) -> Result<()> {
        self.kernel
            .upsert_schedule_async(key, queue, kind, cron, payload)
            .await
    }

    /// Apply the retention policy to one queue's terminal jobs.
    pub async fn apply_retention(&self, queue: &str) -> Result<usize> {
        self.kernel
            .prune_jobs_async(
                queue,
                self.config.jobs_keep_completed,
                self.config.jobs_keep_failed,
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn queue() -> (tempfile::TempDir, WorkQueue) {
        let dir = tempfile::tempdir().expect("tempdir");
        let kernel = Kernel::open(dir.path()).expect("kernel");
        let config = Arc::new(Config::for_tests(dir.path()));
        (dir, WorkQueue::new(kernel, config))
    }

    #[tokio::test]
    async fn duplicate_dedup_key_returns_existing_job() {
        let (_dir, wq) = queue();
        let first = wq
            .enqueue(
                QUEUE_BENCH,
                KIND_BENCHMARK,
                &json!({"bench_id":"bench-42","bench_kind":"full"}),
                EnqueueOptions::once("bench-42"),
            )
            .await
            .unwrap();
        assert!(first.created);

        let second = wq
            .enqueue(
                QUEUE_BENCH,
                KIND_BENCHMARK,
                &json!({"bench_id":"bench-42","bench_kind":"full"}),
                EnqueueOptions::once("bench-42"),
            )
            .await
            .unwrap();
        assert!(!second.created);
        assert_eq!(second.job.id, first.job.id);
        assert!(second.message.contains("already exists"));
    }

    #[tokio::test]
    async fn dedup_keys_are_scoped_per_queue() {
        let (_dir, wq) = queue();
        let a = wq
            .enqueue(
                QUEUE_FILE_DOWNLOADS,
                KIND_FILE_DOWNLOAD,
                &json!({"url":"http://x/a.zim"}),
                EnqueueOptions::retrying(3, 100).with_dedup("a.zim"),
            )
            .await
            .unwrap();
        let b = wq
            .enqueue(
                QUEUE_MODEL_DOWNLOADS,
                KIND_MODEL_DOWNLOAD,
                &json!({"model":"a.zim"}),
                EnqueueOptions::retrying(3, 100).with_dedup("a.zim"),
            )
            .await
            .unwrap();
        assert!(a.created);
        assert!(b.created);
        assert_ne!(a.job.id, b.job.id);
    }

    #[tokio::test]
    async fn benchmark_options_disable_retries() {
        let (_dir, wq) = queue();
        let out = wq
            .enqueue(
                QUEUE_BENCH,
                KIND_BENCHMARK,
                &json!({"bench_id":"b1","bench_kind":"system"}),
                EnqueueOptions::once("b1"),
            )
            .await
            .unwrap();
        assert_eq!(out.job.max_attempts, 1);
    }
}
