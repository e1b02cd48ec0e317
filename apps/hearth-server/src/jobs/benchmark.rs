//! Benchmark handler. Three kinds: `system` (cpu/memory/disk probes),
//! `ai` (installed-model artifact load throughput), `full` (both).
//! Benchmarks run with `max_attempts = 1` — a retried run would produce a
//! duplicate submission — and are deduplicated by benchmark id.

use std::time::Instant;

use hearth_kernel::JobRow;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::Digest as _;
use tracing::info;

use super::{JobContext, JobError, JobHandler};
use crate::errors::OpsError;
use crate::queue::{EnqueueOptions, EnqueueOutcome, WorkQueue, KIND_BENCHMARK, QUEUE_BENCH};
use hearth_topics as topics;

pub const BENCH_KINDS: [&str; 3] = ["full", "system", "ai"];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BenchmarkPayload {
    pub bench_id: String,
    pub bench_kind: String,
}

impl BenchmarkPayload {
    pub fn parse(job: &JobRow) -> Result<Self, JobError> {
        let payload: Self = serde_json::from_value(job.payload.clone())
            .map_err(|err| JobError::Fatal(format!("malformed benchmark payload: {err}")))?;
        if !BENCH_KINDS.contains(&payload.bench_kind.as_str()) {
            return Err(JobError::Fatal(format!(
                "unknown benchmark kind {}",
                payload.bench_kind
            )));
        }
        Ok(payload)
    }
}

/// Dispatch a benchmark run. A second dispatch for the same id while a run
/// is live returns the existing job with `created: false`.
pub async fn dispatch(
    queue: &WorkQueue,
    bench_kind: &str,
    bench_id: &str,
) -> Result<EnqueueOutcome, OpsError> {
    if !BENCH_KINDS.contains(&bench_kind) {
        return Err(OpsError::Validation(format!(
            "unknown benchmark kind {bench_kind}; expected one of {BENCH_KINDS:?}"
        )));
    }
    if bench_id.trim().is_empty() {
        return Err(OpsError::Validation("benchmark id is empty".into()));
    }
    let payload = json!({"bench_id": bench_id, "bench_kind": bench_kind});
    let outcome = queue
        .enqueue(
            QUEUE_BENCH,
            KIND_BENCHMARK,
            &payload,
            EnqueueOptions::once(bench_id),
        )
        .await?;
    Ok(outcome)
}

pub struct BenchmarkHandler;

#[async_trait::async_trait]
impl JobHandler for BenchmarkHandler {
    fn queue(&self) -> &'static str {
        QUEUE_BENCH
    }

    async fn run(&self, job: &JobRow, ctx: &JobContext) -> Result<Value, JobError> {
        let payload = BenchmarkPayload::parse(job)?;
        info!(job_id = %job.id, bench_id = %payload.bench_id, kind = %payload.bench_kind, "benchmark starting");

        let mut result = json!({
            "bench_id": payload.bench_id,
            "bench_kind": payload.bench_kind,
            "host": host_inventory(),
            "started_at": crate::util::now_rfc3339(),
        });

        let run_system = payload.bench_kind != "ai";
        let run_ai = payload.bench_kind != "system";

        if run_system {
            ctx.progress(job, 10, json!({"stage": "cpu"})).await;
            let cpu = tokio::task::spawn_blocking(cpu_probe)
                .await
                .map_err(|err| JobError::Fatal(format!("cpu probe join: {err}")))?;
            ctx.progress(job, 35, json!({"stage": "memory"})).await;
            let memory = tokio::task::spawn_blocking(memory_probe)
                .await
                .map_err(|err| JobError::Fatal(format!("memory probe join: {err}")))?;
            ctx.progress(job, 55, json!({"stage": "disk"})).await;
            let disk = disk_probe(ctx).await?;
            result["system"] = json!({"cpu": cpu, "memory": memory, "disk": disk});
        }

        if run_ai {
            ctx.progress(job, 75, json!({"stage": "ai"})).await;
            result["ai"] = ai_probe(ctx).await?;
        }

        result["finished_at"] = json!(crate::util::now_rfc3339());

        let key = format!("bench.last.{}", payload.bench_kind);
        ctx.kernel
            .set_value_async(&key, &result)
            .await
            .map_err(|err| JobError::Fatal(format!("persist benchmark result: {err}")))?;
        ctx.bus.publish(
            topics::TOPIC_BENCH_COMPLETED,
            &json!({"bench_id": payload.bench_id, "bench_kind": payload.bench_kind, "job_id": job.id}),
        );
        Ok(result)
    }
}

fn host_inventory() -> Value {
    let mut sys = sysinfo::System::new_all();
    sys.refresh_all();
    json!({
        "hostname": sysinfo::System::host_name(),
        "os": sysinfo::System::name(),
        "os_version": sysinfo::System::os_version(),
        "cpus": sys.cpus().len(),
        "total_memory_bytes": sys.total_memory(),
    })
}

/// SHA-256 hashing throughput over a fixed buffer, MB/s.
fn cpu_probe() -> Value {
    let buf = vec![0xa5u8; 1024 * 1024];
    let start = Instant::now();
    let mut rounds: u64 = 0;
    let mut hasher = sha2::Sha256::new();
    while start.elapsed().as_millis() < 250 {
        hasher.update(&buf);
        rounds += 1;
    }
    let digest = hasher.finalize();
    let secs = start.elapsed().as_secs_f64();
    json!({
        "hash_mb_per_sec": (rounds as f64) / secs,
        "rounds": rounds,
        "digest_head": format!("{:02x}{:02x}", digest[0], digest[1]),
    })
}

/// Large-copy throughput, MB/s.
fn memory_probe() -> Value {
    const CHUNK_MB: usize = 64;
    let src = vec![0x5au8; CHUNK_MB * 1024 * 1024];
    let mut dst = vec![0u8; src.len()];
    let start = Instant::now();
    let mut copies: u64 = 0;
    while start.elapsed().as_millis() < 250 {
        dst.copy_from_slice(&src);
        copies += 1;
    }
    let secs = start.elapsed().as_secs_f64();
    json!({
        "copy_mb_per_sec": (copies as f64 * CHUNK_MB as f64) / secs,
        "checksum": dst[dst.len() - 1],
    })
}

/// Write + read a scratch file under the state dir, MB/s each way.
async fn disk_probe(ctx: &JobContext) -> Result<Value, JobError> {
    const SIZE_MB: usize = 8;
    let dir = ctx.config.state_dir.join("bench");
    tokio::fs::create_dir_all(&dir)
        .await
        .map_err(|err| JobError::Fatal(format!("create bench dir: {err}")))?;
    let path = dir.join("scratch.bin");
    let data = vec![0x3cu8; SIZE_MB * 1024 * 1024];

    let start = Instant::now();
    tokio::fs::write(&path, &data)
        .await
        .map_err(|err| JobError::Fatal(format!("bench write: {err}")))?;
    let write_secs = start.elapsed().as_secs_f64();

    let start = Instant::now();
    let read = tokio::fs::read(&path)
        .await
        .map_err(|err| JobError::Fatal(format!("bench read: {err}")))?;
    let read_secs = start.elapsed().as_secs_f64();
    let _ = tokio::fs::remove_file(&path).await;

    Ok(json!({
        "write_mb_per_sec": SIZE_MB as f64 / write_secs.max(1e-6),
        "read_mb_per_sec": read.len() as f64 / (1024.0 * 1024.0) / read_secs.max(1e-6),
    }))
}

/// Load throughput over the newest installed model artifact. Tracks the
/// disk and memory path an inference engine exercises on model load; when
/// no model is installed the probe reports that instead of failing the
/// whole run.
async fn ai_probe(ctx: &JobContext) -> Result<Value, JobError> {
    let models = ctx
        .kernel
        .list_resources_async(Some("model"))
        .await
        .map_err(|err| JobError::Fatal(format!("list models: {err}")))?;
    let Some(model) = models.first() else {
        return Ok(json!({"skipped": "no models installed"}));
    };

    let start = Instant::now();
    let bytes = match tokio::fs::read(&model.file_path).await {
        Ok(data) => data,
        Err(err) => {
            return Ok(json!({
                "model": model.file_path,
                "error": format!("model artifact unreadable: {err}"),
            }))
        }
    };
    let secs = start.elapsed().as_secs_f64();
    let mut hasher = sha2::Sha256::new();
    hasher.update(&bytes);
    let digest = hasher.finalize();
    Ok(json!({
        "model": model.file_path,
        "load_mb_per_sec": bytes.len() as f64 / (1024.0 * 1024.0) / secs.max(1e-6),
        "size_bytes": bytes.len(),
        "digest_head": format!("{:02x}{:02x}", digest[0], digest[1]),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use hearth_kernel::Kernel;
    use std::sync::Arc;

    fn work_queue() -> (tempfile::TempDir, WorkQueue) {
        let dir = tempfile::tempdir().expect("tempdir");
        let kernel = Kernel::open(dir.path()).expect("kernel");
        let config = Arc::new(Config::for_tests(dir.path()));
        (dir, WorkQueue::new(kernel, config))
    }

    #[tokio::test]
    async fn second_dispatch_for_same_id_reuses_job() {
        let (_dir, wq) = work_queue();
        let first = dispatch(&wq, "full", "bench-42").await.unwrap();
        assert!(first.created);
        assert_eq!(first.job.max_attempts, 1);

        let second = dispatch(&wq, "full", "bench-42").await.unwrap();
        assert!(!second.created);
        assert_eq!(second.job.id, first.job.id);
        assert!(second.message.contains("already exists"));
    }

    #[tokio::test]
    async fn dispatch_rejects_unknown_kind() {
        let (_dir, wq) = work_queue();
        assert!(matches!(
            dispatch(&wq, "turbo", "bench-1").await,
            Err(OpsError::Validation(_))
        ));
        assert!(matches!(
            dispatch(&wq, "full", "  ").await,
            Err(OpsError::Validation(_))
        ));
    }

    #[test]
    fn cpu_probe_reports_throughput() {
        let report = cpu_probe();
        assert!(report["hash_mb_per_sec"].as_f64().unwrap() > 0.0);
    }
}
