//! Recurring maintenance trigger. Polls the schedules table and enqueues
//! the template job for every schedule whose cron pattern matches the
//! current minute. Firing is idempotent twice over: the dedup key keeps a
//! still-live occurrence from being enqueued again, and the `last_fired`
//! minute guard keeps overlapping pollers (or a fast poll interval) from
//! double-firing within one minute.

use anyhow::Result;
use chrono::{DateTime, Datelike, Timelike, Utc};
use hearth_events::Bus;
use hearth_kernel::Kernel;
use serde_json::json;
use tracing::{debug, warn};

use crate::app_state::AppState;
use crate::queue::{EnqueueOptions, WorkQueue};
use crate::tasks::{spawn_supervised, TaskHandle};
use crate::util::minute_key;
use hearth_topics as topics;

/// Match one field of a five-field cron pattern: `*`, `*/step`, or a
/// plain number.
fn field_matches(field: &str, value: u32) -> Result<bool, String> {
    if field == "*" {
        return Ok(true);
    }
    if let Some(step) = field.strip_prefix("*/") {
        let step: u32 = step
            .parse()
            .map_err(|_| format!("bad cron step {field}"))?;
        if step == 0 {
            return Err(format!("zero cron step {field}"));
        }
        return Ok(value % step == 0);
    }
    let expected: u32 = field
        .parse()
        .map_err(|_| format!("bad cron field {field}"))?;
    Ok(expected == value)
}

/// Five-field cron subset: `minute hour day-of-month month day-of-week`
/// (day-of-week 0–6, Sunday = 0).
pub fn cron_matches(pattern: &str, at: &DateTime<Utc>) -> Result<bool, String> {
    let fields: Vec<&str> = pattern.split_whitespace().collect();
    if fields.len() != 5 {
        return Err(format!("cron pattern needs 5 fields: {pattern}"));
    }
    let values = [
        at.minute(),
        at.hour(),
        at.day(),
        at.month(),
        at.weekday().num_days_from_sunday(),
    ];
    for (field, value) in fields.iter().zip(values) {
        if !field_matches(field, value)? {
            return Ok(false);
        }
    }
    Ok(true)
}

/// One scheduler pass: enqueue every due schedule. Returns how many fired.
pub(crate) async fn run_due_schedules(
    kernel: &Kernel,
    queue: &WorkQueue,
    bus: &Bus,
    now: DateTime<Utc>,
) -> Result<usize> {
    let minute = minute_key(&now);
    let mut fired = 0usize;
    for schedule in kernel.list_schedules_async().await? {
        match cron_matches(&schedule.cron, &now) {
            Ok(true) => {}
            Ok(false) => continue,
            Err(reason) => {
                warn!(key = %schedule.key, %reason, "skipping schedule with bad cron pattern");
                continue;
            }
        }
        if schedule.last_fired.as_deref() == Some(minute.as_str()) {
            continue;
        }
        if !kernel.mark_schedule_fired_async(&schedule.key, &minute).await? {
            continue;
        }
        let outcome = queue
            .enqueue(
                &schedule.queue,
                &schedule.kind,
                &schedule.payload,
                EnqueueOptions::retrying(3, 30_000).with_dedup(&schedule.key),
            )
            .await?;
        debug!(key = %schedule.key, job_id = %outcome.job.id, created = outcome.created, "schedule fired");
        bus.publish(
            topics::TOPIC_SCHEDULE_FIRED,
            &json!({
                "key": schedule.key,
                "job_id": outcome.job.id,
                "created": outcome.created,
            }),
        );
        fired += 1;
    }
    Ok(fired)
}

pub fn start_scheduler(state: AppState) -> TaskHandle {
    spawn_supervised("scheduler", move || {
        let state = state.clone();
        async move {
            let poll = std::time::Duration::from_secs(state.config().scheduler_poll_secs.max(1));
            loop {
                let now = Utc::now();
                if let Err(err) =
                    run_due_schedules(state.kernel(), &state.work_queue(), &state.bus(), now).await
                {
                    warn!(%err, "scheduler pass failed");
                }
                tokio::time::sleep(poll).await;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::queue::QUEUE_MAINTENANCE;
    use chrono::TimeZone;
    use std::sync::Arc;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        // 2026-08-07 is a Friday (weekday 5).
        Utc.with_ymd_and_hms(2026, 8, 7, h, m, 0).unwrap()
    }

    #[test]
    fn nightly_pattern_matches_only_its_minute() {
        assert!(cron_matches("0 3 * * *", &at(3, 0)).unwrap());
        assert!(!cron_matches("0 3 * * *", &at(3, 1)).unwrap());
        assert!(!cron_matches("0 3 * * *", &at(4, 0)).unwrap());
    }

    #[test]
    fn step_and_weekday_fields() {
        assert!(cron_matches("*/15 * * * *", &at(9, 45)).unwrap());
        assert!(!cron_matches("*/15 * * * *", &at(9, 50)).unwrap());
        assert!(cron_matches("0 12 * * 5", &at(12, 0)).unwrap());
        assert!(!cron_matches("0 12 * * 3", &at(12, 0)).unwrap());
    }

    #[test]
    fn malformed_patterns_are_errors() {
        assert!(cron_matches("0 3 * *", &at(3, 0)).is_err());
        assert!(cron_matches("x 3 * * *", &at(3, 0)).is_err());
        assert!(cron_matches("*/0 * * * *", &at(3, 0)).is_err());
    }

    #[tokio::test]
    async fn due_schedule_fires_once_per_minute() {
        let dir = tempfile::tempdir().unwrap();
        let kernel = Kernel::open(dir.path()).unwrap();
        let config = Arc::new(Config::for_tests(dir.path()));
        let queue = WorkQueue::new(kernel.clone(), config);
        let bus = Bus::new(64);
        kernel
            .upsert_schedule(
                "nightly-update-check",
                QUEUE_MAINTENANCE,
                crate::queue::KIND_UPDATE_CHECK,
                "0 3 * * *",
                &json!({}),
            )
            .unwrap();

        let fired = run_due_schedules(&kernel, &queue, &bus, at(3, 0)).await.unwrap();
        assert_eq!(fired, 1);
        // Same minute: the last_fired guard holds.
        let fired = run_due_schedules(&kernel, &queue, &bus, at(3, 0)).await.unwrap();
        assert_eq!(fired, 0);
        // Off-schedule minute: nothing to do.
        let fired = run_due_schedules(&kernel, &queue, &bus, at(4, 0)).await.unwrap();
        assert_eq!(fired, 0);

        let jobs = kernel
            .list_jobs(QUEUE_MAINTENANCE, &hearth_kernel::LIVE_JOB_STATES)
            .unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].dedup_key.as_deref(), Some("nightly-update-check"));
    }
}
