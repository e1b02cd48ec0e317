use std::collections::HashMap;
use std::sync::Arc;

use hearth_events::Bus;
use hearth_kernel::Kernel;
use hearth_runtime::BoxedDriver;

use crate::config::Config;
use crate::install::Orchestrator;
use crate::jobs::{handler_registry, JobContext, JobHandler};
use crate::preflight::{default_checks, PreflightCheck};
use crate::queue::WorkQueue;

/// Shared handle to every component a request or background task may
/// touch. Built once at bootstrap and cloned everywhere; nothing in here
/// is lazily initialized.
#[derive(Clone)]
pub struct AppState {
    bus: Bus,
    kernel: Kernel,
    config: Arc<Config>,
    http: reqwest::Client,
    handlers: Arc<HashMap<&'static str, Arc<dyn JobHandler>>>,
    orchestrator: Arc<Orchestrator>,
}

impl AppState {
    pub fn builder(kernel: Kernel, config: Arc<Config>) -> AppStateBuilder {
        AppStateBuilder {
            kernel,
            config,
            bus: None,
            driver: None,
            http: None,
            checks: None,
        }
    }

    pub fn bus(&self) -> Bus {
        self.bus.clone()
    }

    pub fn kernel(&self) -> &Kernel {
        &self.kernel
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn work_queue(&self) -> WorkQueue {
        WorkQueue::new(self.kernel.clone(), self.config.clone())
    }

    pub fn handlers(&self) -> &HashMap<&'static str, Arc<dyn JobHandler>> {
        &self.handlers
    }

    pub fn orchestrator(&self) -> Arc<Orchestrator> {
        self.orchestrator.clone()
    }

    pub fn job_context(&self) -> JobContext {
        JobContext {
            kernel: self.kernel.clone(),
            bus: self.bus.clone(),
            config: self.config.clone(),
            http: self.http.clone(),
        }
    }
}

pub struct AppStateBuilder {
    kernel: Kernel,
    config: Arc<Config>,
    bus: Option<Bus>,
    driver: Option<BoxedDriver>,
    http: Option<reqwest::Client>,
    checks: Option<Vec<Box<dyn PreflightCheck>>>,
}

impl AppStateBuilder {
    pub fn with_bus(mut self, bus: Bus) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn with_driver(mut self, driver: BoxedDriver) -> Self {
        self.driver = Some(driver);
        self
    }

    #[allow(dead_code)]
    pub fn with_http(mut self, http: reqwest::Client) -> Self {
        self.http = Some(http);
        self
    }

    #[allow(dead_code)]
    pub fn with_preflight_checks(mut self, checks: Vec<Box<dyn PreflightCheck>>) -> Self {
        self.checks = Some(checks);
        self
    }

    pub fn build(self) -> AppState {
        let bus = self
            .bus
            .unwrap_or_else(|| Bus::new(self.config.bus_capacity));
        let driver = self
            .driver
            .unwrap_or_else(|| Arc::new(hearth_runtime::DockerCliDriver::new()));
        let http = self.http.unwrap_or_else(|| {
            reqwest::Client::builder()
                .connect_timeout(std::time::Duration::from_secs(15))
                .user_agent(concat!("hearth/", env!("CARGO_PKG_VERSION")))
                .build()
                .unwrap_or_default()
        });
        let orchestrator = Arc::new(Orchestrator::new(
            self.kernel.clone(),
            bus.clone(),
            driver,
            self.checks.unwrap_or_else(default_checks),
        ));
        AppState {
            bus,
            kernel: self.kernel,
            config: self.config,
            http,
            handlers: Arc::new(handler_registry()),
            orchestrator,
        }
    }
}
