use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

/// Process configuration, resolved from the environment once at startup
/// and injected everywhere through `AppState`.
#[derive(Debug, Clone)]
pub struct Config {
    /// Kernel database and scratch space.
    pub state_dir: PathBuf,
    /// Downloaded artifacts land under here (`zim/`, `maps/`, `models/`).
    pub data_dir: PathBuf,
    pub bind: SocketAddr,
    /// Optional TOML service catalog synced into the registry at startup.
    pub catalog_path: Option<PathBuf>,
    pub update_manifest_url: String,
    pub update_check_cron: String,
    pub model_source_base: String,
    pub worker_poll_ms: u64,
    pub scheduler_poll_secs: u64,
    pub bus_capacity: usize,
    pub jobs_keep_completed: i64,
    pub jobs_keep_failed: i64,
    pub download_max_attempts: i64,
    pub download_backoff_ms: i64,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let state_dir = PathBuf::from(env_string("HEARTH_STATE_DIR", "./state"));
        let data_dir = std::env::var("HEARTH_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| state_dir.join("data"));
        let bind: SocketAddr = env_string("HEARTH_BIND", "127.0.0.1:8090")
            .parse()
            .context("HEARTH_BIND is not a socket address")?;
        Ok(Self {
            state_dir,
            data_dir,
            bind,
            catalog_path: std::env::var("HEARTH_CATALOG").ok().map(PathBuf::from),
            update_manifest_url: env_string(
                "HEARTH_UPDATE_URL",
                "https://releases.hearth.box/channel/stable/manifest.json",
            ),
            update_check_cron: env_string("HEARTH_UPDATE_CRON", "0 3 * * *"),
            model_source_base: env_string(
                "HEARTH_MODEL_SOURCE",
                "https://models.hearth.box/gguf",
            ),
            worker_poll_ms: env_parse("HEARTH_WORKER_POLL_MS", 250),
            scheduler_poll_secs: env_parse("HEARTH_SCHEDULER_POLL_SECS", 20),
            bus_capacity: env_parse("HEARTH_BUS_CAPACITY", 256),
            jobs_keep_completed: env_parse("HEARTH_JOBS_KEEP_COMPLETED", 50),
            jobs_keep_failed: env_parse("HEARTH_JOBS_KEEP_FAILED", 100),
            download_max_attempts: env_parse("HEARTH_DOWNLOAD_MAX_ATTEMPTS", 4),
            download_backoff_ms: env_parse("HEARTH_DOWNLOAD_BACKOFF_MS", 2000),
        })
    }

    /// Running appliance version, used by the update check.
    pub fn running_version(&self) -> String {
        env_string("HEARTH_VERSION", env!("CARGO_PKG_VERSION"))
    }
}

#[cfg(test)]
impl Config {
    /// Config rooted in a temp dir; network endpoints point nowhere.
    pub fn for_tests(root: &std::path::Path) -> Self {
        Self {
            state_dir: root.join("state"),
            data_dir: root.join("data"),
            bind: "127.0.0.1:0".parse().unwrap(),
            catalog_path: None,
            update_manifest_url: "http://127.0.0.1:9/manifest.json".into(),
            update_check_cron: "0 3 * * *".into(),
            model_source_base: "http://127.0.0.1:9/models".into(),
            worker_poll_ms: 10,
            scheduler_poll_secs: 1,
            bus_capacity: 64,
            jobs_keep_completed: 10,
            jobs_keep_failed: 10,
            download_max_attempts: 2,
            download_backoff_ms: 10,
        }
    }
}
