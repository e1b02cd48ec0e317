//! In-memory [`ContainerDriver`] with a call log and scriptable failures.
//! Lets orchestrator tests assert driver call ordering without a container
//! runtime on the host.

use std::sync::Mutex;

use hearth_runtime::{
    ContainerDriver, ContainerError, ContainerId, ContainerSpec, ServiceStatus,
};

#[derive(Default)]
pub struct MockDriver {
    calls: Mutex<Vec<String>>,
    fail_pull: Mutex<Option<String>>,
    fail_create: Mutex<Option<String>>,
    fail_start: Mutex<Option<String>>,
    statuses: Mutex<Vec<ServiceStatus>>,
}

impl MockDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `pull_image` fail for the named service.
    pub fn fail_pull_for(&self, service: &str) {
        *self.fail_pull.lock().unwrap() = Some(service.to_string());
    }

    pub fn fail_create_for(&self, service: &str) {
        *self.fail_create.lock().unwrap() = Some(service.to_string());
    }

    pub fn fail_start_for(&self, service: &str) {
        *self.fail_start.lock().unwrap() = Some(service.to_string());
    }

    /// Seed the status listing returned by `services_status`.
    pub fn push_status(&self, service: &str, status: &str) {
        self.statuses.lock().unwrap().push(ServiceStatus {
            service_name: service.to_string(),
            status: status.to_string(),
        });
    }

    /// Ordered log of `op:service` entries.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, op: &str, target: &str) {
        self.calls.lock().unwrap().push(format!("{op}:{target}"));
    }
}

#[async_trait::async_trait]
impl ContainerDriver for MockDriver {
    async fn pull_image(&self, spec: &ContainerSpec) -> Result<(), ContainerError> {
        self.record("pull", &spec.name);
        if self.fail_pull.lock().unwrap().as_deref() == Some(spec.name.as_str()) {
            return Err(ContainerError::Pull(format!("scripted pull failure for {}", spec.name)));
        }
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<ContainerId, ContainerError> {
        self.record("create", &spec.name);
        if self.fail_create.lock().unwrap().as_deref() == Some(spec.name.as_str()) {
            return Err(ContainerError::Create(format!(
                "scripted create failure for {}",
                spec.name
            )));
        }
        Ok(format!("ctr-{}", spec.name))
    }

    async fn start_container(&self, id: &ContainerId) -> Result<(), ContainerError> {
        self.record("start", id);
        let failing = self.fail_start.lock().unwrap().clone();
        if let Some(service) = failing {
            if id.ends_with(&service) {
                return Err(ContainerError::Start(format!("scripted start failure for {service}")));
            }
        }
        Ok(())
    }

    async fn services_status(&self) -> Result<Vec<ServiceStatus>, ContainerError> {
        self.record("status", "*");
        Ok(self.statuses.lock().unwrap().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name: &str) -> ContainerSpec {
        ContainerSpec {
            name: name.to_string(),
            image: format!("registry.local/{name}:latest"),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn records_calls_in_order() {
        let driver = MockDriver::new();
        driver.pull_image(&spec("kiwix")).await.unwrap();
        let id = driver.create_container(&spec("kiwix")).await.unwrap();
        driver.start_container(&id).await.unwrap();
        assert_eq!(
            driver.calls(),
            vec!["pull:kiwix", "create:kiwix", "start:ctr-kiwix"]
        );
    }

    #[tokio::test]
    async fn scripted_failures_only_hit_named_service() {
        let driver = MockDriver::new();
        driver.fail_pull_for("ollama");
        assert!(driver.pull_image(&spec("kiwix")).await.is_ok());
        assert!(matches!(
            driver.pull_image(&spec("ollama")).await,
            Err(ContainerError::Pull(_))
        ));
    }
}
