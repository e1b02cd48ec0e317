//! Container-runtime contract for the appliance.
//!
//! The installation orchestrator drives services through their install
//! state machine by calling a [`ContainerDriver`]; everything the driver
//! needs is carried in a [`ContainerSpec`]. The crate also ships
//! [`DockerCliDriver`], a thin adapter over the local docker CLI, which is
//! the driver a stock appliance runs with.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tokio::process::Command;

pub type ContainerId = String;

/// Installation state machine for a service. `Completed` and `Error` are
/// terminal for a run; a fresh install request restarts at `Preflight`.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum InstallState {
    #[default]
    Idle,
    Preflight,
    Pulling,
    Pulled,
    Creating,
    Created,
    Starting,
    Started,
    Completed,
    Error,
}

impl InstallState {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstallState::Idle => "idle",
            InstallState::Preflight => "preflight",
            InstallState::Pulling => "pulling",
            InstallState::Pulled => "pulled",
            InstallState::Creating => "creating",
            InstallState::Created => "created",
            InstallState::Starting => "starting",
            InstallState::Started => "started",
            InstallState::Completed => "completed",
            InstallState::Error => "error",
        }
    }

    pub fn from_slug(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "preflight" => InstallState::Preflight,
            "pulling" => InstallState::Pulling,
            "pulled" => InstallState::Pulled,
            "creating" => InstallState::Creating,
            "created" => InstallState::Created,
            "starting" => InstallState::Starting,
            "started" => InstallState::Started,
            "completed" => InstallState::Completed,
            "error" => InstallState::Error,
            _ => InstallState::Idle,
        }
    }

    /// Label used on broadcast install events. The preflight phase
    /// surfaces as `initializing` to observers.
    pub fn event_label(&self) -> &'static str {
        match self {
            InstallState::Preflight => "initializing",
            other => other.as_str(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, InstallState::Completed | InstallState::Error)
    }

    /// An install run currently holds the service: anything that is
    /// neither idle nor terminal.
    pub fn in_flight(&self) -> bool {
        !matches!(
            self,
            InstallState::Idle | InstallState::Completed | InstallState::Error
        )
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct PortBinding {
    pub host_port: u16,
    pub container_port: u16,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct VolumeMount {
    pub host_path: String,
    pub container_path: String,
}

/// Everything needed to pull, create, and start one service container.
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub ports: Vec<PortBinding>,
    #[serde(default)]
    pub volumes: Vec<VolumeMount>,
    /// Opaque driver-specific configuration carried through from the
    /// service catalog.
    #[serde(default)]
    pub config: serde_json::Value,
}

impl ContainerSpec {
    /// Structural validation only; no runtime is touched.
    pub fn validate(&self) -> Result<(), ContainerError> {
        if self.name.trim().is_empty() {
            return Err(ContainerError::InvalidSpec("container name is empty".into()));
        }
        if self.image.trim().is_empty() {
            return Err(ContainerError::InvalidSpec(format!(
                "service {} has no image",
                self.name
            )));
        }
        for port in &self.ports {
            if port.host_port == 0 || port.container_port == 0 {
                return Err(ContainerError::InvalidSpec(format!(
                    "service {} maps port 0",
                    self.name
                )));
            }
        }
        Ok(())
    }
}

/// Point-in-time runtime status of one container, as reported by the
/// driver.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServiceStatus {
    pub service_name: String,
    pub status: String,
}

#[derive(thiserror::Error, Debug)]
pub enum ContainerError {
    #[error("runtime unavailable: {0}")]
    Unavailable(String),
    #[error("invalid container spec: {0}")]
    InvalidSpec(String),
    #[error("image pull failed: {0}")]
    Pull(String),
    #[error("container create failed: {0}")]
    Create(String),
    #[error("container start failed: {0}")]
    Start(String),
    #[error("io error: {0}")]
    Io(String),
}

/// Narrow contract the orchestrator consumes. Implementations must be
/// safe to call from concurrent install runs for different services.
#[async_trait::async_trait]
pub trait ContainerDriver: Send + Sync {
    async fn pull_image(&self, spec: &ContainerSpec) -> Result<(), ContainerError>;

    async fn create_container(&self, spec: &ContainerSpec) -> Result<ContainerId, ContainerError>;

    async fn start_container(&self, id: &ContainerId) -> Result<(), ContainerError>;

    async fn services_status(&self) -> Result<Vec<ServiceStatus>, ContainerError>;
}

pub type BoxedDriver = std::sync::Arc<dyn ContainerDriver>;

/// Driver backed by the local `docker` CLI.
pub struct DockerCliDriver {
    binary: String,
}

impl DockerCliDriver {
    pub fn new() -> Self {
        Self {
            binary: std::env::var("HEARTH_DOCKER_BIN").unwrap_or_else(|_| "docker".to_string()),
        }
    }

    async fn run(&self, args: &[&str]) -> Result<String, ContainerError> {
        let output = Command::new(&self.binary)
            .args(args)
            .output()
            .await
            .map_err(|err| ContainerError::Unavailable(format!("{}: {err}", self.binary)))?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            Err(ContainerError::Io(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ))
        }
    }
}

impl Default for DockerCliDriver {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse `docker ps -a --format '{{.Names}}\t{{.State}}'` output.
fn parse_ps_lines(stdout: &str) -> Vec<ServiceStatus> {
    stdout
        .lines()
        .filter_map(|line| {
            let mut parts = line.splitn(2, '\t');
            let name = parts.next()?.trim();
            let state = parts.next()?.trim();
            if name.is_empty() {
                return None;
            }
            Some(ServiceStatus {
                service_name: name.to_string(),
                status: state.to_string(),
            })
        })
        .collect()
}

#[async_trait::async_trait]
impl ContainerDriver for DockerCliDriver {
    async fn pull_image(&self, spec: &ContainerSpec) -> Result<(), ContainerError> {
        spec.validate()?;
        tracing::debug!(service = %spec.name, image = %spec.image, "pulling image");
        self.run(&["pull", &spec.image])
            .await
            .map_err(|err| ContainerError::Pull(err.to_string()))?;
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<ContainerId, ContainerError> {
        spec.validate()?;
        let mut args: Vec<String> = vec!["create".into(), "--name".into(), spec.name.clone()];
        for port in &spec.ports {
            args.push("-p".into());
            args.push(format!("{}:{}", port.host_port, port.container_port));
        }
        for vol in &spec.volumes {
            args.push("-v".into());
            args.push(format!("{}:{}", vol.host_path, vol.container_path));
        }
        for (key, value) in &spec.env {
            args.push("-e".into());
            args.push(format!("{key}={value}"));
        }
        args.push(spec.image.clone());
        args.extend(spec.command.iter().cloned());
        let arg_refs: Vec<&str> = args.iter().map(|s| s.as_str()).collect();
        let id = self
            .run(&arg_refs)
            .await
            .map_err(|err| ContainerError::Create(err.to_string()))?;
        Ok(id)
    }

    async fn start_container(&self, id: &ContainerId) -> Result<(), ContainerError> {
        self.run(&["start", id])
            .await
            .map_err(|err| ContainerError::Start(err.to_string()))?;
        Ok(())
    }

    async fn services_status(&self) -> Result<Vec<ServiceStatus>, ContainerError> {
        let stdout = self
            .run(&["ps", "-a", "--format", "{{.Names}}\t{{.State}}"])
            .await?;
        Ok(parse_ps_lines(&stdout))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_slugs_roundtrip() {
        for state in [
            InstallState::Idle,
            InstallState::Preflight,
            InstallState::Pulling,
            InstallState::Pulled,
            InstallState::Creating,
            InstallState::Created,
            InstallState::Starting,
            InstallState::Started,
            InstallState::Completed,
            InstallState::Error,
        ] {
            assert_eq!(InstallState::from_slug(state.as_str()), state);
        }
        assert_eq!(InstallState::from_slug("bogus"), InstallState::Idle);
    }

    #[test]
    fn preflight_surfaces_as_initializing() {
        assert_eq!(InstallState::Preflight.event_label(), "initializing");
        assert_eq!(InstallState::Pulling.event_label(), "pulling");
        assert_eq!(InstallState::Error.event_label(), "error");
    }

    #[test]
    fn terminal_and_in_flight_are_disjoint() {
        assert!(InstallState::Completed.is_terminal());
        assert!(InstallState::Error.is_terminal());
        assert!(!InstallState::Idle.in_flight());
        assert!(!InstallState::Completed.in_flight());
        assert!(InstallState::Pulling.in_flight());
        assert!(InstallState::Preflight.in_flight());
    }

    #[test]
    fn spec_validation_rejects_missing_image_and_zero_port() {
        let mut spec = ContainerSpec {
            name: "kiwix".into(),
            image: String::new(),
            ..Default::default()
        };
        assert!(matches!(
            spec.validate(),
            Err(ContainerError::InvalidSpec(_))
        ));
        spec.image = "registry.local/kiwix:latest".into();
        spec.ports.push(PortBinding {
            host_port: 0,
            container_port: 8080,
        });
        assert!(matches!(
            spec.validate(),
            Err(ContainerError::InvalidSpec(_))
        ));
        spec.ports[0].host_port = 8080;
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn ps_lines_parse_names_and_states() {
        let parsed = parse_ps_lines("kiwix\trunning\nollama\texited\n\n");
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].service_name, "kiwix");
        assert_eq!(parsed[0].status, "running");
        assert_eq!(parsed[1].status, "exited");
    }
}
