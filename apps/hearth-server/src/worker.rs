//! Queue consumers. One claim loop per queue: claim the oldest eligible
//! job, hand it to the queue's handler, and map the outcome back onto the
//! job row. Producers never block on any of this.

use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use serde_json::json;
use tracing::{info, warn};

use crate::app_state::AppState;
use crate::jobs::JobError;
use crate::tasks::{spawn_supervised, TaskHandle};
use hearth_kernel::JobRow;
use hearth_topics as topics;

/// Exponential backoff from the job's base delay and attempt count,
/// capped at an hour.
fn next_retry_at(job: &JobRow) -> String {
    let exponent = (job.attempts - 1).clamp(0, 20) as u32;
    let delay_ms = (job.backoff_ms.max(1) as u64)
        .saturating_mul(1u64 << exponent)
        .min(60 * 60 * 1000);
    (Utc::now() + chrono::Duration::milliseconds(delay_ms as i64))
        .to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

/// Claim and run at most one job from `queue`. Returns whether a job was
/// processed.
pub(crate) async fn process_one(state: &AppState, queue: &str) -> Result<bool> {
    let Some(job) = state.kernel().dequeue_one_async(queue).await? else {
        return Ok(false);
    };
    let bus = state.bus();
    bus.publish(
        topics::TOPIC_JOB_RUNNING,
        &json!({"id": job.id, "queue": job.queue, "kind": job.kind, "attempts": job.attempts}),
    );

    let outcome = match state.handlers().get(queue) {
        Some(handler) => handler.run(&job, &state.job_context()).await,
        None => Err(JobError::Fatal(format!("no handler for queue {queue}"))),
    };

    match outcome {
        Ok(output) => {
            state.kernel().complete_job_async(&job.id, &output).await?;
            bus.publish(
                topics::TOPIC_JOB_COMPLETED,
                &json!({"id": job.id, "queue": job.queue, "kind": job.kind, "output": output}),
            );
            info!(job_id = %job.id, queue, "job completed");
        }
        Err(err) => {
            let message = err.to_string();
            if err.is_retryable() && job.attempts < job.max_attempts {
                let next = next_retry_at(&job);
                state
                    .kernel()
                    .retry_job_async(&job.id, &message, &next)
                    .await?;
                bus.publish(
                    topics::TOPIC_JOB_RETRY,
                    &json!({
                        "id": job.id,
                        "queue": job.queue,
                        "attempts": job.attempts,
                        "max_attempts": job.max_attempts,
                        "next_run_at": next,
                        "error": message,
                    }),
                );
                warn!(job_id = %job.id, queue, attempts = job.attempts, %message, "job failed; retry scheduled");
            } else {
                state.kernel().fail_job_async(&job.id, &message).await?;
                bus.publish(
                    topics::TOPIC_JOB_FAILED,
                    &json!({"id": job.id, "queue": job.queue, "kind": job.kind, "error": message}),
                );
                warn!(job_id = %job.id, queue, %message, "job failed terminally");
            }
        }
    }

    if let Err(err) = state.work_queue().apply_retention(queue).await {
        warn!(queue, %err, "retention prune failed");
    }
    Ok(true)
}

/// Long-running claim loop for one queue.
pub fn start_queue_worker(state: AppState, queue: &'static str) -> TaskHandle {
    spawn_supervised(format!("worker.{queue}"), move || {
        let state = state.clone();
        async move {
            let idle = Duration::from_millis(state.config().worker_poll_ms.max(10));
            loop {
                match process_one(&state, queue).await {
                    Ok(true) => {}
                    Ok(false) => tokio::time::sleep(idle).await,
                    Err(err) => {
                        warn!(queue, %err, "worker pass failed");
                        tokio::time::sleep(idle.saturating_mul(2)).await;
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app_state::AppState;
    use crate::config::Config;
    use crate::queue::{EnqueueOptions, KIND_BENCHMARK, KIND_FILE_DOWNLOAD, QUEUE_BENCH, QUEUE_FILE_DOWNLOADS};
    use hearth_kernel::Kernel;
    use hearth_mock_driver::MockDriver;
    use std::sync::Arc;

    async fn state() -> (tempfile::TempDir, AppState) {
        let dir = tempfile::tempdir().expect("tempdir");
        let kernel = Kernel::open(dir.path()).expect("kernel");
        let config = Arc::new(Config::for_tests(dir.path()));
        let state = AppState::builder(kernel, config)
            .with_driver(Arc::new(MockDriver::new()))
            .build();
        (dir, state)
    }

    #[tokio::test]
    async fn empty_queue_processes_nothing() {
        let (_dir, state) = state().await;
        assert!(!process_one(&state, QUEUE_BENCH).await.unwrap());
    }

    #[tokio::test]
    async fn benchmark_job_runs_to_completion() {
        let (_dir, state) = state().await;
        let out = state
            .work_queue()
            .enqueue(
                QUEUE_BENCH,
                KIND_BENCHMARK,
                &json!({"bench_id": "b-1", "bench_kind": "ai"}),
                EnqueueOptions::once("b-1"),
            )
            .await
            .unwrap();

        assert!(process_one(&state, QUEUE_BENCH).await.unwrap());
        let job = state.work_queue().get_job(&out.job.id).await.unwrap().unwrap();
        assert_eq!(job.state, "completed");
        assert_eq!(job.progress, 100);
        assert!(job.attempts <= job.max_attempts);
        // The ai probe with no installed models records the skip.
        assert_eq!(job.output.unwrap()["ai"]["skipped"], "no models installed");
    }

    #[tokio::test]
    async fn transient_failure_retries_then_fails_terminally() {
        let (_dir, state) = state().await;
        // Port 9 (discard) refuses connections: a retryable network error.
        let out = state
            .work_queue()
            .enqueue(
                QUEUE_FILE_DOWNLOADS,
                KIND_FILE_DOWNLOAD,
                &json!({"url": "http://127.0.0.1:9/wiki.zim", "resource_type": "zim"}),
                EnqueueOptions::retrying(2, 10),
            )
            .await
            .unwrap();

        assert!(process_one(&state, QUEUE_FILE_DOWNLOADS).await.unwrap());
        let job = state.work_queue().get_job(&out.job.id).await.unwrap().unwrap();
        assert_eq!(job.state, "delayed");
        assert_eq!(job.attempts, 1);
        assert!(job.next_run_at.is_some());

        // Wait out the short test backoff, then exhaust the last attempt.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(process_one(&state, QUEUE_FILE_DOWNLOADS).await.unwrap());
        let job = state.work_queue().get_job(&out.job.id).await.unwrap().unwrap();
        assert_eq!(job.state, "failed");
        assert_eq!(job.attempts, 2);
        assert!(job.attempts <= job.max_attempts);
        assert!(job.error.unwrap().contains("fetch"));
    }

    #[tokio::test]
    async fn malformed_payload_fails_without_retry() {
        let (_dir, state) = state().await;
        let out = state
            .work_queue()
            .enqueue(
                QUEUE_FILE_DOWNLOADS,
                KIND_FILE_DOWNLOAD,
                &json!({"resource_type": "zim"}),
                EnqueueOptions::retrying(3, 10),
            )
            .await
            .unwrap();

        assert!(process_one(&state, QUEUE_FILE_DOWNLOADS).await.unwrap());
        let job = state.work_queue().get_job(&out.job.id).await.unwrap().unwrap();
        // Fatal errors never consume the remaining attempts.
        assert_eq!(job.state, "failed");
        assert_eq!(job.attempts, 1);
    }
}
