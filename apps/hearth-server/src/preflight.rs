//! Preflight validation for service installs. Checks are side-effect
//! free: they inspect the spec, the host, and the driver's status view,
//! and never mutate runtime state. The set is pluggable so deployments
//! can extend it without touching the orchestrator.

use hearth_runtime::{ContainerDriver, ContainerSpec};

#[async_trait::async_trait]
pub trait PreflightCheck: Send + Sync {
    fn name(&self) -> &'static str;

    /// Err carries the human-readable reason the install cannot proceed.
    async fn check(&self, spec: &ContainerSpec, driver: &dyn ContainerDriver)
        -> Result<(), String>;
}

/// Structural validation of the container spec.
pub struct SpecShapeCheck;

#[async_trait::async_trait]
impl PreflightCheck for SpecShapeCheck {
    fn name(&self) -> &'static str {
        "spec"
    }

    async fn check(
        &self,
        spec: &ContainerSpec,
        _driver: &dyn ContainerDriver,
    ) -> Result<(), String> {
        spec.validate().map_err(|err| err.to_string())
    }
}

/// Every host port the spec maps must still be bindable.
pub struct PortAvailabilityCheck;

#[async_trait::async_trait]
impl PreflightCheck for PortAvailabilityCheck {
    fn name(&self) -> &'static str {
        "ports"
    }

    async fn check(
        &self,
        spec: &ContainerSpec,
        _driver: &dyn ContainerDriver,
    ) -> Result<(), String> {
        for port in &spec.ports {
            // Bind probe; the listener drops immediately, freeing the port.
            tokio::net::TcpListener::bind(("0.0.0.0", port.host_port))
                .await
                .map_err(|err| format!("port {} unavailable: {err}", port.host_port))?;
        }
        Ok(())
    }
}

/// The target must not already be running under the container runtime.
pub struct NotAlreadyRunningCheck;

#[async_trait::async_trait]
impl PreflightCheck for NotAlreadyRunningCheck {
    fn name(&self) -> &'static str {
        "already-running"
    }

    async fn check(
        &self,
        spec: &ContainerSpec,
        driver: &dyn ContainerDriver,
    ) -> Result<(), String> {
        let statuses = driver
            .services_status()
            .await
            .map_err(|err| format!("runtime status unavailable: {err}"))?;
        for status in statuses {
            if status.service_name == spec.name && status.status == "running" {
                return Err(format!("service {} is already running", spec.name));
            }
        }
        Ok(())
    }
}

pub fn default_checks() -> Vec<Box<dyn PreflightCheck>> {
    vec![
        Box::new(SpecShapeCheck),
        Box::new(PortAvailabilityCheck),
        Box::new(NotAlreadyRunningCheck),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use hearth_mock_driver::MockDriver;

    fn spec(name: &str) -> ContainerSpec {
        ContainerSpec {
            name: name.to_string(),
            image: format!("registry.local/{name}:latest"),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn already_running_service_fails_check() {
        let driver = MockDriver::new();
        driver.push_status("kiwix", "running");
        let err = NotAlreadyRunningCheck
            .check(&spec("kiwix"), &driver)
            .await
            .expect_err("should fail");
        assert!(err.contains("already running"));

        // An exited container does not block reinstallation.
        let driver = MockDriver::new();
        driver.push_status("kiwix", "exited");
        assert!(NotAlreadyRunningCheck.check(&spec("kiwix"), &driver).await.is_ok());
    }

    #[tokio::test]
    async fn bound_port_fails_check() {
        let listener = tokio::net::TcpListener::bind(("0.0.0.0", 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut s = spec("kiwix");
        s.ports.push(hearth_runtime::PortBinding {
            host_port: port,
            container_port: 8080,
        });
        let driver = MockDriver::new();
        let err = PortAvailabilityCheck
            .check(&s, &driver)
            .await
            .expect_err("port is held");
        assert!(err.contains("unavailable"));
        drop(listener);
    }
}
