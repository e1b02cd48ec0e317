//! Service catalog sync. Services are provisioned from a TOML file; the
//! dependency graph is validated here, at load time, so a bad catalog
//! never reaches the registry and install-time resolution can trust the
//! edges it reads.

use anyhow::{anyhow, bail, Context, Result};
use hearth_kernel::{Kernel, ServiceSpec};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use tracing::info;

fn empty_object() -> serde_json::Value {
    serde_json::json!({})
}

#[derive(Debug, Deserialize)]
struct CatalogFile {
    #[serde(default)]
    service: Vec<CatalogEntry>,
}

#[derive(Debug, Deserialize)]
struct CatalogEntry {
    name: String,
    image: String,
    #[serde(default)]
    command: Vec<String>,
    #[serde(default)]
    depends_on: Option<String>,
    /// Dependency-only services are hidden from top-level listings.
    #[serde(default)]
    hidden: bool,
    #[serde(default)]
    ui_location: Option<String>,
    #[serde(default = "empty_object")]
    config: serde_json::Value,
    #[serde(default = "empty_object")]
    metadata: serde_json::Value,
}

/// Parse and validate a catalog document.
pub fn parse_catalog(text: &str) -> Result<Vec<ServiceSpec>> {
    let file: CatalogFile = toml::from_str(text).context("catalog is not valid TOML")?;
    let mut seen = HashSet::new();
    for entry in &file.service {
        if entry.name.trim().is_empty() {
            bail!("catalog entry with empty name");
        }
        if !seen.insert(entry.name.as_str()) {
            bail!("duplicate catalog entry {}", entry.name);
        }
        if entry.image.trim().is_empty() {
            bail!("service {} has no image", entry.name);
        }
    }

    let by_name: HashMap<&str, &CatalogEntry> =
        file.service.iter().map(|e| (e.name.as_str(), e)).collect();
    for entry in &file.service {
        let Some(dep) = entry.depends_on.as_deref() else {
            continue;
        };
        if dep == entry.name {
            bail!("service {} depends on itself", entry.name);
        }
        if !by_name.contains_key(dep) {
            bail!("service {} depends on unknown service {dep}", entry.name);
        }
        // Follow the chain; revisiting any node means a cycle.
        let mut visited = HashSet::from([entry.name.as_str()]);
        let mut cursor = dep;
        loop {
            if !visited.insert(cursor) {
                bail!("dependency cycle involving {cursor}");
            }
            match by_name.get(cursor).and_then(|e| e.depends_on.as_deref()) {
                Some(next) => cursor = next,
                None => break,
            }
        }
    }

    Ok(file
        .service
        .into_iter()
        .map(|entry| ServiceSpec {
            name: entry.name,
            image: entry.image,
            command: entry.command,
            config: entry.config,
            depends_on: entry.depends_on,
            hidden: entry.hidden,
            ui_location: entry.ui_location,
            metadata: entry.metadata,
        })
        .collect())
}

/// Load the catalog file and upsert every entry into the registry.
/// Existing rows keep their installation status.
pub async fn sync_catalog(kernel: &Kernel, path: &Path) -> Result<usize> {
    let text = tokio::fs::read_to_string(path)
        .await
        .map_err(|err| anyhow!("read catalog {}: {err}", path.display()))?;
    let specs = parse_catalog(&text)?;
    for spec in &specs {
        kernel.upsert_service_async(spec).await?;
    }
    info!(count = specs.len(), path = %path.display(), "service catalog synced");
    Ok(specs.len())
}
