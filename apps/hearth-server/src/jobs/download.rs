//! File download handler: streams a URL to the data dir, reports byte
//! progress, and records the artifact as an installed resource.

use std::path::Path;

use hearth_kernel::JobRow;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::Digest as _;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use super::{JobContext, JobError, JobHandler};
use crate::queue::QUEUE_FILE_DOWNLOADS;
use crate::util::safe_join;
use hearth_topics as topics;

/// Resource categories a plain file download may install.
pub const FILE_RESOURCE_TYPES: [&str; 2] = ["zim", "map"];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileDownloadPayload {
    pub url: String,
    /// Relative file name under the resource-type directory; derived from
    /// the URL's last path segment when absent.
    #[serde(default)]
    pub file_name: Option<String>,
    pub resource_type: String,
    #[serde(default)]
    pub collection: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
}

impl FileDownloadPayload {
    pub fn parse(job: &JobRow) -> Result<Self, JobError> {
        let payload: Self = serde_json::from_value(job.payload.clone())
            .map_err(|err| JobError::Fatal(format!("malformed download payload: {err}")))?;
        if !FILE_RESOURCE_TYPES.contains(&payload.resource_type.as_str()) {
            return Err(JobError::Fatal(format!(
                "unsupported resource type {}",
                payload.resource_type
            )));
        }
        Ok(payload)
    }

    pub fn target_name(&self) -> Result<String, JobError> {
        if let Some(name) = self.file_name.as_deref() {
            return Ok(name.to_string());
        }
        self.url
            .rsplit('/')
            .next()
            .filter(|seg| !seg.is_empty() && !seg.contains('?'))
            .map(|seg| seg.to_string())
            .ok_or_else(|| JobError::Fatal(format!("cannot derive file name from {}", self.url)))
    }
}

pub struct FileDownloadHandler;

#[async_trait::async_trait]
impl JobHandler for FileDownloadHandler {
    fn queue(&self) -> &'static str {
        QUEUE_FILE_DOWNLOADS
    }

    async fn run(&self, job: &JobRow, ctx: &JobContext) -> Result<Value, JobError> {
        let payload = FileDownloadPayload::parse(job)?;
        let name = payload.target_name()?;
        let dir = ctx.config.data_dir.join(&payload.resource_type);
        let dest = safe_join(&dir, &name)
            .ok_or_else(|| JobError::Fatal(format!("unsafe file name {name}")))?;

        info!(job_id = %job.id, url = %payload.url, dest = %dest.display(), "file download starting");
        let fetched = stream_to_file(ctx, job, &payload.url, &dest, ByteProgress::Exact).await?;

        let resource = ctx
            .kernel
            .insert_resource_async(
                &payload.resource_type,
                payload.collection.as_deref(),
                payload.version.as_deref(),
                &payload.url,
                &dest.to_string_lossy(),
                fetched.bytes as i64,
            )
            .await
            .map_err(|err| JobError::Fatal(format!("record resource: {err}")))?;
        ctx.bus.publish(
            topics::TOPIC_RESOURCES_CHANGED,
            &json!({"id": resource.id, "resource_type": resource.resource_type, "op": "installed"}),
        );

        Ok(json!({
            "resource_id": resource.id,
            "file_path": resource.file_path,
            "size_bytes": fetched.bytes,
            "sha256": fetched.sha256,
        }))
    }
}

/// How byte counts map onto the 0–100 progress value.
#[derive(Clone, Copy, PartialEq, Eq)]
pub(super) enum ByteProgress {
    /// Percent tracks bytes exactly.
    Exact,
    /// Percent moves in 20-point buckets; model pulls report this coarser
    /// granularity on purpose.
    Coarse,
}

pub(super) struct Fetched {
    pub bytes: u64,
    pub sha256: String,
}

/// Stream `url` into `dest` via a `.part` staging file. Network failures
/// are retryable; local filesystem failures are not.
pub(super) async fn stream_to_file(
    ctx: &JobContext,
    job: &JobRow,
    url: &str,
    dest: &Path,
    granularity: ByteProgress,
) -> Result<Fetched, JobError> {
    use futures_util::StreamExt as _;

    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|err| JobError::Fatal(format!("create {}: {err}", parent.display())))?;
    }

    let response = ctx
        .http
        .get(url)
        .send()
        .await
        .map_err(|err| JobError::Retryable(format!("fetch {url}: {err}")))?;
    let status = response.status();
    if status.is_server_error() {
        return Err(JobError::Retryable(format!("fetch {url}: status {status}")));
    }
    if !status.is_success() {
        return Err(JobError::Fatal(format!("fetch {url}: status {status}")));
    }
    let total = response.content_length();

    let tmp_path = dest.with_extension("part");
    let file = tokio::fs::File::create(&tmp_path)
        .await
        .map_err(|err| JobError::Fatal(format!("create {}: {err}", tmp_path.display())))?;
    let mut writer = tokio::io::BufWriter::new(file);
    let mut hasher = sha2::Sha256::new();
    let mut downloaded: u64 = 0;
    let mut last_percent: i64 = -1;
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = match chunk {
            Ok(c) => c,
            Err(err) => {
                let _ = tokio::fs::remove_file(&tmp_path).await;
                return Err(JobError::Retryable(format!("stream {url}: {err}")));
            }
        };
        hasher.update(&chunk);
        downloaded += chunk.len() as u64;
        writer
            .write_all(&chunk)
            .await
            .map_err(|err| JobError::Fatal(format!("write {}: {err}", tmp_path.display())))?;

        if let Some(total) = total.filter(|t| *t > 0) {
            let exact = ((downloaded * 100) / total).min(99) as i64;
            let percent = match granularity {
                ByteProgress::Exact => exact,
                ByteProgress::Coarse => (exact / 20) * 20,
            };
            if percent > last_percent {
                last_percent = percent;
                ctx.progress(job, percent, json!({"bytes": downloaded, "total": total}))
                    .await;
            }
        } else if downloaded % (8 * 1024 * 1024) < chunk.len() as u64 {
            // Size unknown: progress stays indeterminate, but keep
            // observers informed of byte counts.
            ctx.progress(job, job.progress, json!({"bytes": downloaded}))
                .await;
        }
    }

    writer
        .flush()
        .await
        .map_err(|err| JobError::Fatal(format!("flush {}: {err}", tmp_path.display())))?;
    tokio::fs::rename(&tmp_path, dest)
        .await
        .map_err(|err| JobError::Fatal(format!("rename into {}: {err}", dest.display())))?;

    let sha256 = format!("{:x}", hasher.finalize());
    debug!(job_id = %job.id, bytes = downloaded, %sha256, "download staged");
    Ok(Fetched {
        bytes: downloaded,
        sha256,
    })
}
