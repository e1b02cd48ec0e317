//! Update check handler: compares the published channel manifest against
//! the running version and persists the verdict. Applying an update is a
//! separate, explicit user action and never happens here.

use hearth_kernel::JobRow;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use super::{JobContext, JobError, JobHandler};
use crate::queue::QUEUE_MAINTENANCE;
use hearth_topics as topics;

/// Settings key holding the last update-check verdict.
pub const UPDATE_STATUS_KEY: &str = "updates.available";

#[derive(Debug, Deserialize)]
struct ChannelManifest {
    version: String,
    #[serde(default)]
    notes: Option<String>,
    #[serde(default)]
    url: Option<String>,
}

pub struct UpdateCheckHandler;

#[async_trait::async_trait]
impl JobHandler for UpdateCheckHandler {
    fn queue(&self) -> &'static str {
        QUEUE_MAINTENANCE
    }

    async fn run(&self, job: &JobRow, ctx: &JobContext) -> Result<Value, JobError> {
        let url = &ctx.config.update_manifest_url;
        ctx.progress(job, 20, json!({"stage": "fetching"})).await;
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
        let manifest: ChannelManifest = response
            .json()
            .await
            .map_err(|err| JobError::Fatal(format!("parse manifest: {err}")))?;

        let current_raw = ctx.config.running_version();
        let latest = semver::Version::parse(manifest.version.trim())
            .map_err(|err| JobError::Fatal(format!("manifest version {}: {err}", manifest.version)))?;
        let current = semver::Version::parse(current_raw.trim())
            .map_err(|err| JobError::Fatal(format!("running version {current_raw}: {err}")))?;
        let available = latest > current;

        let verdict = json!({
            "available": available,
            "latest": latest.to_string(),
            "current": current.to_string(),
            "notes": manifest.notes,
            "url": manifest.url,
            "checked_at": crate::util::now_rfc3339(),
        });
        ctx.kernel
            .set_value_async(UPDATE_STATUS_KEY, &verdict)
            .await
            .map_err(|err| JobError::Fatal(format!("persist update verdict: {err}")))?;

        ctx.bus.publish(topics::TOPIC_UPDATE_CHECKED, &verdict);
        if available {
            info!(latest = %latest, current = %current, "update available");
            ctx.bus.publish(topics::TOPIC_UPDATE_AVAILABLE, &verdict);
        }
        Ok(verdict)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manifest_parses_with_optional_fields() {
        let m: ChannelManifest =
            serde_json::from_value(json!({"version": "1.4.0"})).expect("manifest");
        assert_eq!(m.version, "1.4.0");
        assert!(m.notes.is_none());
        assert!(m.url.is_none());
    }

    #[test]
    fn semver_comparison_orders_prerelease_below_release() {
        let latest = semver::Version::parse("1.4.0").unwrap();
        let current = semver::Version::parse("1.4.0-dev").unwrap();
        assert!(latest > current);
    }
}
