//! Process assembly: open the kernel, wire the bus and driver into the
//! shared state, sync the service catalog, seed recurring maintenance,
//! and start the background loops.

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use hearth_events::Bus;
use hearth_kernel::Kernel;
use hearth_runtime::DockerCliDriver;
use serde_json::json;
use tracing::{info, warn};

use crate::app_state::AppState;
use crate::config::Config;
use crate::queue::{ALL_QUEUES, KIND_UPDATE_CHECK, QUEUE_MAINTENANCE};
use crate::scheduler::start_scheduler;
use crate::tasks::{spawn_supervised, TaskHandle, TaskManager};
use crate::worker::start_queue_worker;
use crate::{api, catalog};

pub struct BootstrapOutput {
    pub router: Router,
    pub state: AppState,
    pub tasks: TaskManager,
}

pub async fn build(config: Config) -> Result<BootstrapOutput> {
    let config = Arc::new(config);
    tokio::fs::create_dir_all(&config.data_dir)
        .await
        .with_context(|| format!("create data dir {}", config.data_dir.display()))?;
    let kernel = Kernel::open(&config.state_dir)
        .with_context(|| format!("open kernel in {}", config.state_dir.display()))?;
    let bus = Bus::new(config.bus_capacity);

    let state = AppState::builder(kernel.clone(), config.clone())
        .with_bus(bus)
        .with_driver(Arc::new(DockerCliDriver::new()))
        .build();

    if let Some(path) = config.catalog_path.as_deref() {
        catalog::sync_catalog(&kernel, path).await?;
    } else {
        info!("no service catalog configured (HEARTH_CATALOG unset)");
    }

    // Nightly update check; one active schedule entry per key.
    state
        .work_queue()
        .upsert_recurring(
            QUEUE_MAINTENANCE,
            "nightly-update-check",
            &config.update_check_cron,
            KIND_UPDATE_CHECK,
            &json!({}),
        )
        .await?;

    let mut tasks = TaskManager::new();
    for queue in ALL_QUEUES {
        tasks.push(start_queue_worker(state.clone(), queue));
    }
    tasks.push(start_scheduler(state.clone()));
    tasks.push(start_event_journal(state.clone()));

    let router = api::router(state.clone());
    Ok(BootstrapOutput {
        router,
        state,
        tasks,
    })
}

/// Copy every published envelope into the kernel's journal. Audit only;
/// the live bus never replays from it.
fn start_event_journal(state: AppState) -> TaskHandle {
    spawn_supervised("events.journal", move || {
        let state = state.clone();
        async move {
            let mut rx = state.bus().subscribe();
            loop {
                match rx.recv().await {
                    Ok(env) => {
                        if let Err(err) = state.kernel().append_event_async(&env).await {
                            warn!(%err, "failed to journal event");
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "event journal lagged; dropped events");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    })
}
