//! Canonical event topic constants shared across the appliance.
//!
//! This crate centralizes the string constants used when publishing events
//! so producers and observers stay in sync. Keep the list alphabetized
//! within sections and favor dot.case names.

// Service installation
pub const TOPIC_SERVICE_INSTALL: &str = "service.install.progress";
pub const TOPIC_SERVICES_CHANGED: &str = "services.changed";

// Downloads
pub const TOPIC_DOWNLOAD_PROGRESS: &str = "downloads.progress";
pub const TOPIC_RESOURCES_CHANGED: &str = "resources.changed";

// Work queue
pub const TOPIC_JOB_RUNNING: &str = "jobs.running";
pub const TOPIC_JOB_COMPLETED: &str = "jobs.completed";
pub const TOPIC_JOB_FAILED: &str = "jobs.failed";
pub const TOPIC_JOB_RETRY: &str = "jobs.retry";

// Benchmarks
pub const TOPIC_BENCH_COMPLETED: &str = "bench.completed";

// Updates
pub const TOPIC_UPDATE_AVAILABLE: &str = "updates.available";
pub const TOPIC_UPDATE_CHECKED: &str = "updates.checked";

// Scheduler
pub const TOPIC_SCHEDULE_FIRED: &str = "schedule.fired";

// Process lifecycle
pub const TOPIC_SERVICE_START: &str = "service.start";
pub const TOPIC_SERVICE_STOP: &str = "service.stop";
