//! Model download handler. The payload names a model rather than a URL;
//! the artifact URL is derived from the configured model source. Progress
//! is deliberately coarser than the byte-accurate file handler.

use hearth_kernel::JobRow;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::info;

use super::download::{stream_to_file, ByteProgress};
use super::{JobContext, JobError, JobHandler};
use crate::queue::QUEUE_MODEL_DOWNLOADS;
use crate::util::safe_join;
use hearth_topics as topics;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelDownloadPayload {
    pub model: String,
    #[serde(default)]
    pub version: Option<String>,
}

impl ModelDownloadPayload {
    pub fn parse(job: &JobRow) -> Result<Self, JobError> {
        let payload: Self = serde_json::from_value(job.payload.clone())
            .map_err(|err| JobError::Fatal(format!("malformed model payload: {err}")))?;
        if payload.model.trim().is_empty() {
            return Err(JobError::Fatal("model name is empty".into()));
        }
        Ok(payload)
    }

    /// On-disk artifact name; model names map 1:1 onto gguf files.
    pub fn artifact_name(&self) -> String {
        if self.model.ends_with(".gguf") {
            self.model.clone()
        } else {
            format!("{}.gguf", self.model)
        }
    }
}

pub struct ModelDownloadHandler;

#[async_trait::async_trait]
impl JobHandler for ModelDownloadHandler {
    fn queue(&self) -> &'static str {
        QUEUE_MODEL_DOWNLOADS
    }

    async fn run(&self, job: &JobRow, ctx: &JobContext) -> Result<Value, JobError> {
        let payload = ModelDownloadPayload::parse(job)?;
        let artifact = payload.artifact_name();
        let url = format!(
            "{}/{artifact}",
            ctx.config.model_source_base.trim_end_matches('/')
        );
        let dir = ctx.config.data_dir.join("models");
        let dest = safe_join(&dir, &artifact)
            .ok_or_else(|| JobError::Fatal(format!("unsafe model name {artifact}")))?;

        info!(job_id = %job.id, model = %payload.model, %url, "model download starting");
        ctx.progress(job, 5, json!({"stage": "resolving", "model": payload.model}))
            .await;

        let fetched = stream_to_file(ctx, job, &url, &dest, ByteProgress::Coarse).await?;
        ctx.progress(job, 98, json!({"stage": "verifying", "sha256": fetched.sha256}))
            .await;

        let resource = ctx
            .kernel
            .insert_resource_async(
                "model",
                None,
                payload.version.as_deref(),
                &url,
                &dest.to_string_lossy(),
                fetched.bytes as i64,
            )
            .await
            .map_err(|err| JobError::Fatal(format!("record resource: {err}")))?;
        ctx.bus.publish(
            topics::TOPIC_RESOURCES_CHANGED,
            &json!({"id": resource.id, "resource_type": "model", "op": "installed"}),
        );

        Ok(json!({
            "resource_id": resource.id,
            "model": payload.model,
            "file_path": resource.file_path,
            "size_bytes": fetched.bytes,
            "sha256": fetched.sha256,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn artifact_name_appends_extension_once() {
        let plain = ModelDownloadPayload {
            model: "qwen2.5-3b-instruct".into(),
            version: None,
        };
        assert_eq!(plain.artifact_name(), "qwen2.5-3b-instruct.gguf");
        let explicit = ModelDownloadPayload {
            model: "phi-4-mini.gguf".into(),
            version: None,
        };
        assert_eq!(explicit.artifact_name(), "phi-4-mini.gguf");
    }
}
