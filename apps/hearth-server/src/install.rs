//! Installation orchestrator: resolves the dependency chain for a
//! service, runs preflight, and drives each service through the install
//! state machine against the container driver, persisting every
//! transition and broadcasting progress as it happens.
//!
//! The in-flight guard is the registry row itself: `begin_install` is a
//! conditional update on the stored status, so two requests racing for
//! the same service resolve in the database, not in process memory.

use std::collections::HashMap;

use hearth_events::Bus;
use hearth_kernel::{Kernel, ServiceRow};
use hearth_runtime::{BoxedDriver, ContainerSpec, InstallState, PortBinding, VolumeMount};
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::errors::OpsError;
use crate::preflight::PreflightCheck;
use hearth_topics as topics;

#[derive(Debug, Clone, serde::Serialize)]
pub struct InstallReport {
    pub service: String,
    pub installed: Vec<String>,
    pub message: String,
}

pub struct Orchestrator {
    kernel: Kernel,
    bus: Bus,
    driver: BoxedDriver,
    checks: Vec<Box<dyn PreflightCheck>>,
}

impl Orchestrator {
    pub fn new(
        kernel: Kernel,
        bus: Bus,
        driver: BoxedDriver,
        checks: Vec<Box<dyn PreflightCheck>>,
    ) -> Self {
        Self {
            kernel,
            bus,
            driver,
            checks,
        }
    }

    /// Install a service and everything it depends on, deepest dependency
    /// first. Ancestors already completed are skipped. A request for a
    /// service whose chain is already being installed is refused with a
    /// reference to the in-flight work rather than queued twice.
    pub async fn install_service(&self, name: &str) -> Result<InstallReport, OpsError> {
        let services = self.kernel.list_services_async(true).await?;
        let by_name: HashMap<String, ServiceRow> = services
            .into_iter()
            .map(|row| (row.name.clone(), row))
            .collect();
        if !by_name.contains_key(name) {
            return Err(OpsError::NotFound(format!("service {name}")));
        }

        let chain = resolve_chain(&by_name, name)?;
        for link in &chain {
            let row = &by_name[link];
            if InstallState::from_slug(&row.status).in_flight() {
                return Err(OpsError::AlreadyInProgress(format!(
                    "install of {link} is {}",
                    row.status
                )));
            }
        }

        let mut installed = Vec::new();
        for link in &chain {
            // Re-read: an earlier link in this loop may have completed it.
            let row = self
                .kernel
                .get_service_async(link)
                .await?
                .ok_or_else(|| OpsError::NotFound(format!("service {link}")))?;
            if InstallState::from_slug(&row.status) == InstallState::Completed && row.installed {
                info!(service = %link, "dependency already installed; skipping");
                continue;
            }
            let dep = row
                .depends_on
                .as_deref()
                .and_then(|dep_name| by_name.get(dep_name));
            self.install_one(&row, dep).await?;
            installed.push(link.clone());
        }

        let message = if installed.is_empty() {
            format!("{name} already installed")
        } else {
            format!("installed {}", installed.join(", "))
        };
        Ok(InstallReport {
            service: name.to_string(),
            installed,
            message,
        })
    }

    async fn install_one(
        &self,
        row: &ServiceRow,
        dep: Option<&ServiceRow>,
    ) -> Result<(), OpsError> {
        let name = row.name.as_str();
        if !self.kernel.begin_install_async(name).await? {
            return Err(OpsError::AlreadyInProgress(format!(
                "another install of {name} is in flight"
            )));
        }
        self.publish_event(
            name,
            InstallState::Preflight,
            &format!("validating install of {name}"),
        );

        let spec = container_spec_for(row, dep);
        for check in &self.checks {
            if let Err(reason) = check.check(&spec, &*self.driver).await {
                let message = format!("preflight {}: {reason}", check.name());
                self.fail(name, &message).await;
                return Err(OpsError::Preflight(message));
            }
        }

        self.advance(name, InstallState::Pulling, &format!("pulling {}", spec.image))
            .await?;
        if let Err(err) = self.driver.pull_image(&spec).await {
            return Err(self.fail_runtime(name, err.to_string()).await);
        }
        self.advance(name, InstallState::Pulled, &format!("pulled {}", spec.image))
            .await?;

        self.advance(name, InstallState::Creating, &format!("creating container {name}"))
            .await?;
        let container_id = match self.driver.create_container(&spec).await {
            Ok(id) => id,
            Err(err) => return Err(self.fail_runtime(name, err.to_string()).await),
        };
        self.advance(name, InstallState::Created, &format!("created container {container_id}"))
            .await?;

        self.advance(name, InstallState::Starting, &format!("starting {name}"))
            .await?;
        if let Err(err) = self.driver.start_container(&container_id).await {
            return Err(self.fail_runtime(name, err.to_string()).await);
        }
        self.advance(name, InstallState::Started, &format!("{name} started"))
            .await?;

        self.kernel.set_service_installed_async(name).await?;
        self.publish_event(name, InstallState::Completed, &format!("{name} installed"));
        self.bus.publish(
            topics::TOPIC_SERVICES_CHANGED,
            &json!({"service_name": name, "installed": true}),
        );
        info!(service = %name, "install completed");
        Ok(())
    }

    /// Persist a phase transition, then announce it. The row commits
    /// before the next driver call starts.
    async fn advance(
        &self,
        name: &str,
        state: InstallState,
        message: &str,
    ) -> Result<(), OpsError> {
        self.kernel
            .set_service_status_async(name, state.as_str())
            .await?;
        self.publish_event(name, state, message);
        Ok(())
    }

    async fn fail_runtime(&self, name: &str, message: String) -> OpsError {
        self.fail(name, &message).await;
        OpsError::Runtime(message)
    }

    /// Drive the run to its terminal error state. Partially created
    /// runtime resources are left for administrative cleanup; a fresh
    /// install request restarts from preflight.
    async fn fail(&self, name: &str, message: &str) {
        warn!(service = %name, %message, "install failed");
        if let Err(err) = self.kernel.set_service_status_async(name, "error").await {
            warn!(service = %name, %err, "failed to persist error state");
        }
        self.publish_event(name, InstallState::Error, message);
    }

    fn publish_event(&self, name: &str, state: InstallState, message: &str) {
        self.bus.publish(
            topics::TOPIC_SERVICE_INSTALL,
            &json!({
                "service_name": name,
                "type": state.event_label(),
                "timestamp": crate::util::now_rfc3339(),
                "message": message,
            }),
        );
    }
}

/// Walk `depends_on` edges from the target and return the chain deepest
/// dependency first. The catalog rejects cycles at load time; this guards
/// against hand-edited registries anyway.
fn resolve_chain(
    by_name: &HashMap<String, ServiceRow>,
    name: &str,
) -> Result<Vec<String>, OpsError> {
    let mut chain = vec![name.to_string()];
    let mut seen = std::collections::HashSet::from([name.to_string()]);
    let mut cursor = name.to_string();
    while let Some(dep) = by_name
        .get(&cursor)
        .and_then(|row| row.depends_on.clone())
    {
        if !by_name.contains_key(&dep) {
            return Err(OpsError::Validation(format!(
                "{cursor} depends on unknown service {dep}"
            )));
        }
        if !seen.insert(dep.clone()) {
            return Err(OpsError::Validation(format!(
                "dependency cycle involving {dep}"
            )));
        }
        chain.push(dep.clone());
        cursor = dep;
    }
    chain.reverse();
    Ok(chain)
}

/// Build the driver spec from a registry row. The row's `config` JSON may
/// carry `env`, `ports`, and `volumes`; a dependency with a known UI
/// location is injected into the environment so the service can reach it.
fn container_spec_for(row: &ServiceRow, dep: Option<&ServiceRow>) -> ContainerSpec {
    let mut spec = ContainerSpec {
        name: row.name.clone(),
        image: row.image.clone(),
        command: row.command.clone(),
        config: row.config.clone(),
        ..Default::default()
    };
    if let Some(env) = row.config.get("env").and_then(Value::as_object) {
        for (key, value) in env {
            if let Some(s) = value.as_str() {
                spec.env.insert(key.clone(), s.to_string());
            }
        }
    }
    if let Some(ports) = row.config.get("ports").and_then(Value::as_array) {
        for port in ports {
            let host = port.get("host").and_then(Value::as_u64);
            let container = port.get("container").and_then(Value::as_u64);
            if let (Some(host), Some(container)) = (host, container) {
                spec.ports.push(PortBinding {
                    host_port: host as u16,
                    container_port: container as u16,
                });
            }
        }
    }
    if let Some(volumes) = row.config.get("volumes").and_then(Value::as_array) {
        for volume in volumes {
            let host = volume.get("host").and_then(Value::as_str);
            let container = volume.get("container").and_then(Value::as_str);
            if let (Some(host), Some(container)) = (host, container) {
                spec.volumes.push(VolumeMount {
                    host_path: host.to_string(),
                    container_path: container.to_string(),
                });
            }
        }
    }
    if let Some(dep) = dep {
        if let Some(location) = dep.ui_location.as_deref() {
            let key = format!(
                "{}_URL",
                dep.name.to_ascii_uppercase().replace(['-', '.'], "_")
            );
            spec.env.insert(key, location.to_string());
        }
    }
    spec
}

#[cfg(test)]
mod tests {
    use super::*;
    use hearth_kernel::ServiceSpec;
    use hearth_mock_driver::MockDriver;
    use std::sync::Arc;

    fn service_spec(name: &str, depends_on: Option<&str>) -> ServiceSpec {
        ServiceSpec {
            name: name.to_string(),
            image: format!("registry.local/{name}:latest"),
            command: vec!["serve".to_string()],
            config: json!({}),
            depends_on: depends_on.map(|s| s.to_string()),
            hidden: false,
            ui_location: None,
            metadata: json!({}),
        }
    }

    struct Harness {
        _dir: tempfile::TempDir,
        kernel: Kernel,
        bus: Bus,
        driver: Arc<MockDriver>,
        orchestrator: Orchestrator,
    }

    fn harness() -> Harness {
        let dir = tempfile::tempdir().expect("tempdir");
        let kernel = Kernel::open(dir.path()).expect("kernel");
        let bus = Bus::new(256);
        let driver = Arc::new(MockDriver::new());
        let orchestrator = Orchestrator::new(
            kernel.clone(),
            bus.clone(),
            driver.clone(),
            crate::preflight::default_checks(),
        );
        Harness {
            _dir: dir,
            kernel,
            bus,
            driver,
            orchestrator,
        }
    }

    fn drain_install_events(rx: &mut tokio::sync::broadcast::Receiver<hearth_events::Envelope>) -> Vec<(String, String)> {
        let mut out = Vec::new();
        while let Ok(env) = rx.try_recv() {
            if env.kind == topics::TOPIC_SERVICE_INSTALL {
                out.push((
                    env.payload["service_name"].as_str().unwrap_or("").to_string(),
                    env.payload["type"].as_str().unwrap_or("").to_string(),
                ));
            }
        }
        out
    }

    #[tokio::test]
    async fn dependency_installs_before_dependent() {
        let h = harness();
        h.kernel.upsert_service(&service_spec("kiwix", None)).unwrap();
        h.kernel
            .upsert_service(&service_spec("wiki-portal", Some("kiwix")))
            .unwrap();

        let report = h.orchestrator.install_service("wiki-portal").await.unwrap();
        assert_eq!(report.installed, vec!["kiwix", "wiki-portal"]);

        let calls = h.driver.calls();
        let pull_dep = calls.iter().position(|c| c == "pull:kiwix").unwrap();
        let pull_target = calls.iter().position(|c| c == "pull:wiki-portal").unwrap();
        let start_dep = calls.iter().position(|c| c == "start:ctr-kiwix").unwrap();
        assert!(pull_dep < pull_target);
        assert!(start_dep < pull_target, "dependency completes before dependent pulls");

        let dep = h.kernel.get_service("kiwix").unwrap().unwrap();
        let target = h.kernel.get_service("wiki-portal").unwrap().unwrap();
        assert_eq!(dep.status, "completed");
        assert!(dep.installed);
        assert_eq!(target.status, "completed");
        assert!(target.installed);
    }

    #[tokio::test]
    async fn completed_dependency_is_skipped_not_reinstalled() {
        let h = harness();
        h.kernel.upsert_service(&service_spec("kiwix", None)).unwrap();
        h.kernel
            .upsert_service(&service_spec("wiki-portal", Some("kiwix")))
            .unwrap();
        h.kernel.set_service_installed("kiwix").unwrap();

        let report = h.orchestrator.install_service("wiki-portal").await.unwrap();
        assert_eq!(report.installed, vec!["wiki-portal"]);
        assert!(!h.driver.calls().iter().any(|c| c == "pull:kiwix"));
    }

    #[tokio::test]
    async fn preflight_failure_never_reaches_pulling() {
        let h = harness();
        h.kernel.upsert_service(&service_spec("kiwix", None)).unwrap();
        h.driver.push_status("kiwix", "running");
        let mut rx = h.bus.subscribe();

        let err = h.orchestrator.install_service("kiwix").await.unwrap_err();
        assert!(matches!(err, OpsError::Preflight(_)));

        let row = h.kernel.get_service("kiwix").unwrap().unwrap();
        assert_eq!(row.status, "error");
        assert!(!h.driver.calls().iter().any(|c| c.starts_with("pull:")));

        let events = drain_install_events(&mut rx);
        assert!(events.iter().any(|(_, t)| t == "error"));
        assert!(!events.iter().any(|(_, t)| t == "pulling" || t == "creating"));
    }

    #[tokio::test]
    async fn pull_failure_moves_service_to_error() {
        let h = harness();
        h.kernel.upsert_service(&service_spec("ollama", None)).unwrap();
        h.driver.fail_pull_for("ollama");
        let mut rx = h.bus.subscribe();

        let err = h.orchestrator.install_service("ollama").await.unwrap_err();
        assert!(matches!(err, OpsError::Runtime(_)));
        let row = h.kernel.get_service("ollama").unwrap().unwrap();
        assert_eq!(row.status, "error");

        let events = drain_install_events(&mut rx);
        let types: Vec<&str> = events.iter().map(|(_, t)| t.as_str()).collect();
        assert!(types.contains(&"pulling"));
        assert!(types.contains(&"error"));
        assert!(!types.contains(&"pulled"));
    }

    #[tokio::test]
    async fn in_flight_install_is_rejected_with_reference() {
        let h = harness();
        h.kernel.upsert_service(&service_spec("kiwix", None)).unwrap();
        h.kernel.set_service_status("kiwix", "pulling").unwrap();

        let err = h.orchestrator.install_service("kiwix").await.unwrap_err();
        match err {
            OpsError::AlreadyInProgress(msg) => assert!(msg.contains("pulling")),
            other => panic!("expected AlreadyInProgress, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_service_is_not_found() {
        let h = harness();
        assert!(matches!(
            h.orchestrator.install_service("ghost").await.unwrap_err(),
            OpsError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn registry_cycle_is_rejected_as_validation() {
        let h = harness();
        // The catalog refuses cycles; simulate a hand-edited registry.
        h.kernel.upsert_service(&service_spec("a", Some("b"))).unwrap();
        h.kernel.upsert_service(&service_spec("b", Some("a"))).unwrap();
        assert!(matches!(
            h.orchestrator.install_service("a").await.unwrap_err(),
            OpsError::Validation(_)
        ));
    }

    #[test]
    fn chain_resolves_deepest_first() {
        let mut map = HashMap::new();
        for (name, dep) in [("a", None), ("b", Some("a")), ("c", Some("b"))] {
            let spec = service_spec(name, dep);
            map.insert(
                name.to_string(),
                ServiceRow {
                    name: spec.name,
                    image: spec.image,
                    command: spec.command,
                    config: spec.config,
                    depends_on: spec.depends_on,
                    hidden: false,
                    status: "idle".into(),
                    installed: false,
                    ui_location: None,
                    metadata: json!({}),
                    created: String::new(),
                    updated: String::new(),
                },
            );
        }
        let chain = resolve_chain(&map, "c").unwrap();
        assert_eq!(chain, vec!["a", "b", "c"]);
    }

    #[test]
    fn dependency_location_lands_in_environment() {
        let mut dep_spec = service_spec("ollama", None);
        dep_spec.ui_location = Some("http://127.0.0.1:11434".into());
        let dep = ServiceRow {
            name: dep_spec.name,
            image: dep_spec.image,
            command: dep_spec.command,
            config: dep_spec.config,
            depends_on: None,
            hidden: true,
            status: "completed".into(),
            installed: true,
            ui_location: dep_spec.ui_location,
            metadata: json!({}),
            created: String::new(),
            updated: String::new(),
        };
        let row = ServiceRow {
            name: "chat-ui".into(),
            image: "registry.local/chat-ui:latest".into(),
            command: vec![],
            config: json!({"ports": [{"host": 3000, "container": 3000}]}),
            depends_on: Some("ollama".into()),
            hidden: false,
            status: "idle".into(),
            installed: false,
            ui_location: None,
            metadata: json!({}),
            created: String::new(),
            updated: String::new(),
        };
        let spec = container_spec_for(&row, Some(&dep));
        assert_eq!(
            spec.env.get("OLLAMA_URL").map(String::as_str),
            Some("http://127.0.0.1:11434")
        );
        assert_eq!(spec.ports.len(), 1);
        assert_eq!(spec.ports[0].host_port, 3000);
    }
}
