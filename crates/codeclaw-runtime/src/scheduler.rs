//! C9 Scheduler — polls for due tasks and routes them through the
//! dispatch queue so scheduled work never collides with event-driven
//! work on the same repo.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use codeclaw_common::{ScheduledTask, TaskStatus};
use cron::Schedule;
use tracing::{error, info};

use crate::dispatch::DispatchQueue;
use crate::store::StoreHandle;

const POLL_INTERVAL: Duration = Duration::from_secs(60);

/// Computes the next firing instant after `now` for a schedule value,
/// dispatched on `schedule_type` (`"cron" | "interval" | "once"`).
/// `interval`'s value is milliseconds as a string; `once`'s value is an
/// RFC3339 instant.
pub fn compute_next_run(schedule_type: &str, schedule_value: &str, now: DateTime<Utc>) -> Result<DateTime<Utc>, String> {
    match schedule_type {
        "cron" => {
            let schedule = Schedule::from_str(schedule_value).map_err(|e| format!("invalid cron expression: {e}"))?;
            schedule
                .after(&now)
                .next()
                .ok_or_else(|| "cron expression has no future occurrences".to_string())
        }
        "interval" => {
            let ms: i64 = schedule_value.parse().map_err(|_| "interval value is not an integer".to_string())?;
            if ms <= 0 {
                return Err("interval must be positive".to_string());
            }
            Ok(now + chrono::Duration::milliseconds(ms))
        }
        "once" => DateTime::parse_from_rfc3339(schedule_value)
            .map(|d| d.with_timezone(&Utc))
            .map_err(|e| format!("invalid instant: {e}")),
        other => Err(format!("unknown schedule type '{other}'")),
    }
}

/// Computes the following run for a task that just fired. `once` tasks
/// have no following run and are marked completed by the caller.
fn next_run_after_fire(kind: codeclaw_common::ScheduleKind, value: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    use codeclaw_common::ScheduleKind::*;
    match kind {
        Cron => compute_next_run("cron", value, now).ok(),
        Interval => compute_next_run("interval", value, now).ok(),
        Once => None,
    }
}

#[async_trait::async_trait]
pub trait TaskRunner: Send + Sync {
    /// Runs one firing of `task` to completion, returning a short
    /// human-readable summary for the run log.
    async fn run_task(&self, task: &ScheduledTask) -> Result<String, String>;
}

pub struct Scheduler {
    store: StoreHandle,
    queue: DispatchQueue,
    runner: Arc<dyn TaskRunner>,
}

impl Scheduler {
    pub fn new(store: StoreHandle, queue: DispatchQueue, runner: Arc<dyn TaskRunner>) -> Self {
        Self { store, queue, runner }
    }

    pub async fn run_forever(&self) {
        info!("scheduler loop started");
        loop {
            if let Err(err) = self.tick().await {
                error!(error = %err, "error in scheduler loop");
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn tick(&self) -> Result<(), String> {
        let due = self.store.lock_sync().due_tasks(Utc::now()).map_err(|e| e.to_string())?;
        if !due.is_empty() {
            info!(count = due.len(), "found due tasks");
        }

        for task in due {
            let current = self.store.lock_sync().get_task(task.id).map_err(|e| e.to_string())?;
            let Some(current) = current else { continue };
            if current.status != TaskStatus::Active {
                continue;
            }

            let prefix = current.chat.repo_prefix();
            let task_id_str = current.id.to_string();
            let store = self.store.clone();
            let runner = self.runner.clone();
            let task_for_closure = current.clone();

            let make_fn: Arc<dyn Fn() -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>> + Send + Sync> =
                Arc::new(move || {
                    let store = store.clone();
                    let runner = runner.clone();
                    let task = task_for_closure.clone();
                    Box::pin(async move {
                        run_one(&store, runner.as_ref(), &task).await;
                    })
                });

            self.queue.enqueue_task(&prefix, &task_id_str, make_fn).await;
        }
        Ok(())
    }
}

async fn run_one(store: &StoreHandle, runner: &dyn TaskRunner, task: &ScheduledTask) {
    let started_at = Utc::now();
    let outcome = runner.run_task(task).await;
    let finished_at = Utc::now();

    let (task_outcome, summary) = match &outcome {
        Ok(result) => (codeclaw_common::TaskOutcome::Completed, result.chars().take(200).collect::<String>()),
        Err(error) => (codeclaw_common::TaskOutcome::Failed, format!("Error: {error}").chars().take(200).collect()),
    };

    let log = codeclaw_common::TaskRunLog {
        task_id: task.id,
        started_at,
        finished_at,
        outcome: task_outcome,
        summary: Some(summary.clone()),
    };
    if let Err(e) = store.lock_sync().record_task_run(&log) {
        error!(task_id = task.id, error = %e, "failed to record task run log");
    }

    let next_run = next_run_after_fire(task.schedule_kind, &task.schedule_value, finished_at);
    let mut updated = task.clone();
    updated.last_run = Some(finished_at);
    updated.last_result = Some(summary);
    updated.next_run = next_run;
    if next_run.is_none() {
        updated.status = codeclaw_common::TaskStatus::Completed;
    }
    if let Err(e) = store.lock_sync().update_task(&updated) {
        error!(task_id = task.id, error = %e, "failed to update task after run");
    }
}
