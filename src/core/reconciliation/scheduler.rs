use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use anyhow::Result;
use chrono::Utc;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::event_logger::EventLogger;
use super::lock::{LockOutcome, LockProvider, with_lock};
use super::registry::TaskRegistry;
use super::settings::{
    SettingsStore, cron_key, enabled_key, lock_name, parse_flag, parse_window_hours,
    run_on_startup_key, window_hours_key,
};
use super::task::ReconciliationTask;
use super::types::{
    DEFAULT_WINDOW_HOURS, ReconciliationOptions, ReconciliationResult, TriggerSource,
};

/// Everything needed to run a task once: lookup, settings, locking and audit.
///
/// Cheap to clone; cron callbacks each hold their own copy.
#[derive(Clone)]
pub struct TaskRunner {
    registry: Arc<TaskRegistry>,
    settings: Arc<dyn SettingsStore>,
    locks: Arc<dyn LockProvider>,
    events: EventLogger,
}

impl TaskRunner {
    pub fn new(
        registry: Arc<TaskRegistry>,
        settings: Arc<dyn SettingsStore>,
        locks: Arc<dyn LockProvider>,
        events: EventLogger,
    ) -> Self {
        Self {
            registry,
            settings,
            locks,
            events,
        }
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    /// Runs a task under its advisory lock.
    ///
    /// `None` means the task id is unknown or another instance holds the lock.
    pub async fn execute_task(
        &self,
        task_id: &str,
        trigger_source: TriggerSource,
        triggered_by: Option<String>,
    ) -> Option<ReconciliationResult> {
        let Some(task) = self.registry.get(task_id) else {
            error!("Unknown reconciliation task '{}'", task_id);
            return None;
        };

        let runner = self.clone();
        let body =
            async move { runner.run_task_with_logging(task, trigger_source, triggered_by).await };

        match with_lock(self.locks.as_ref(), &lock_name(task_id), body).await {
            LockOutcome::Completed(result) => Some(result),
            LockOutcome::Contended => {
                info!(
                    "Reconciliation '{}' is already running elsewhere, skipping",
                    task_id
                );
                None
            }
            LockOutcome::Failed(e) => {
                error!("Reconciliation '{}' could not run: {:#}", task_id, e);
                None
            }
        }
    }

    async fn window_hours(&self, task_id: &str) -> u32 {
        let raw = match self.settings.get_setting(&window_hours_key(task_id)).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!(
                    "Could not read window for '{}', using {}h: {:#}",
                    task_id, DEFAULT_WINDOW_HOURS, e
                );
                return DEFAULT_WINDOW_HOURS;
            }
        };
        match parse_window_hours(raw.as_deref()) {
            Some(hours) => hours,
            None => {
                if let Some(raw) = raw {
                    warn!(
                        "Ignoring invalid window '{}' for '{}', using {}h",
                        raw, task_id, DEFAULT_WINDOW_HOURS
                    );
                }
                DEFAULT_WINDOW_HOURS
            }
        }
    }

    /// Executes `task` and records start/completion events. Never fails: task
    /// errors and panics come back as a failed result.
    pub async fn run_task_with_logging(
        &self,
        task: Arc<dyn ReconciliationTask>,
        trigger_source: TriggerSource,
        triggered_by: Option<String>,
    ) -> ReconciliationResult {
        let task_id = task.id().to_string();
        let task_name = task.name().to_string();
        let window_hours = self.window_hours(&task_id).await;
        let options = ReconciliationOptions::new(window_hours, trigger_source)
            .triggered_by(triggered_by.clone());

        let actor = triggered_by
            .clone()
            .unwrap_or_else(|| trigger_source.as_str().to_string());
        let start_event_id = match self
            .events
            .log_reconciliation_start(&task_id, &task_name, window_hours, Some(&actor))
            .await
        {
            Ok(id) => Some(id),
            Err(e) => {
                warn!("Could not record start of '{}': {:#}", task_id, e);
                None
            }
        };

        info!(
            "Reconciliation '{}' started ({}, {}h window)",
            task_id,
            trigger_source.as_str(),
            window_hours
        );
        let started = Instant::now();
        let joined = tokio::spawn(async move { task.execute(&options).await }).await;
        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        let result = match joined {
            Ok(Ok(mut result)) => {
                result.duration_ms = duration_ms;
                result
            }
            Ok(Err(e)) => {
                error!("Reconciliation '{}' failed: {:#}", task_id, e);
                ReconciliationResult::failure(format!("{:#}", e), duration_ms)
            }
            Err(e) => {
                error!("Reconciliation '{}' aborted: {}", task_id, e);
                ReconciliationResult::failure(format!("Task aborted: {}", e), duration_ms)
            }
        };

        if let Err(e) = self
            .events
            .log_reconciliation_complete(&task_id, &task_name, &result, start_event_id.as_deref())
            .await
        {
            warn!("Could not record completion of '{}': {:#}", task_id, e);
        }

        let s = &result.summary;
        if result.success {
            info!(
                "Reconciliation '{}' completed in {}ms: fetched {}, new {}, updated {}, corrections {}",
                task_id, duration_ms, s.items_fetched, s.items_new, s.items_updated, s.corrections
            );
        } else {
            warn!(
                "Reconciliation '{}' finished with {} error(s) in {}ms: {}",
                task_id,
                result.errors.len(),
                duration_ms,
                result.errors.join("; ")
            );
        }
        result
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ScheduledJob {
    pub task_id: String,
    pub schedule: String,
    #[serde(skip)]
    job_id: Uuid,
}

#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    pub running: bool,
    pub registered_tasks: Vec<String>,
    pub jobs: Vec<ScheduledJob>,
}

/// Cron driver for registered reconciliation tasks. One per process.
pub struct ReconciliationScheduler {
    runner: TaskRunner,
    cron: JobScheduler,
    jobs: Mutex<HashMap<String, ScheduledJob>>,
    running: AtomicBool,
    ticking: AtomicBool,
}

impl ReconciliationScheduler {
    pub async fn new(runner: TaskRunner) -> Result<Self> {
        let cron = JobScheduler::new().await?;
        Ok(Self {
            runner,
            cron,
            jobs: Mutex::new(HashMap::new()),
            running: AtomicBool::new(false),
            ticking: AtomicBool::new(false),
        })
    }

    pub fn runner(&self) -> &TaskRunner {
        &self.runner
    }

    /// Schedules every registered task and kicks off the ones flagged to run
    /// on startup. A second call is a no-op.
    pub async fn start(&self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            info!("Reconciliation scheduler already running");
            return Ok(());
        }
        if !self.ticking.swap(true, Ordering::SeqCst)
            && let Err(e) = self.cron.start().await
        {
            self.ticking.store(false, Ordering::SeqCst);
            self.running.store(false, Ordering::SeqCst);
            return Err(e.into());
        }

        let tasks = self.runner.registry.get_all();
        for task in &tasks {
            if let Err(e) = self.schedule_task(task.id()).await {
                error!("Failed to schedule reconciliation '{}': {:#}", task.id(), e);
            }
        }

        for task in &tasks {
            let flag = self
                .runner
                .settings
                .get_setting(&run_on_startup_key(task.id()))
                .await
                .unwrap_or_else(|e| {
                    warn!("Could not read startup flag for '{}': {:#}", task.id(), e);
                    None
                });
            if parse_flag(flag.as_deref()) {
                let runner = self.runner.clone();
                let task_id = task.id().to_string();
                info!("Running reconciliation '{}' on startup", task_id);
                tokio::spawn(async move {
                    runner
                        .execute_task(&task_id, TriggerSource::Startup, None)
                        .await;
                });
            }
        }

        info!(
            "Reconciliation scheduler started with {} task(s)",
            tasks.len()
        );
        Ok(())
    }

    /// Installs (or replaces) the cron job for `task_id` from its settings.
    ///
    /// Returns `Ok(false)` when the task is unknown, disabled, or has no usable
    /// cron expression; any previous job is removed in the latter two cases.
    pub async fn schedule_task(&self, task_id: &str) -> Result<bool> {
        if !self.runner.registry.has(task_id) {
            warn!("Cannot schedule unknown reconciliation task '{}'", task_id);
            return Ok(false);
        }

        let settings = &self.runner.settings;
        let enabled = settings.get_setting(&enabled_key(task_id)).await?;
        if !parse_flag(enabled.as_deref()) {
            info!("Reconciliation '{}' is disabled", task_id);
            self.stop_task(task_id).await?;
            return Ok(false);
        }

        let Some(schedule) = settings
            .get_setting(&cron_key(task_id))
            .await?
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
        else {
            warn!(
                "Reconciliation '{}' is enabled but has no cron schedule",
                task_id
            );
            self.stop_task(task_id).await?;
            return Ok(false);
        };

        let runner = self.runner.clone();
        let job_task_id = task_id.to_string();
        let job = match Job::new_async_tz(schedule.as_str(), Utc, move |_uuid, mut _l| {
            let runner = runner.clone();
            let task_id = job_task_id.clone();
            Box::pin(async move {
                runner
                    .execute_task(&task_id, TriggerSource::Scheduled, None)
                    .await;
            })
        }) {
            Ok(job) => job,
            Err(e) => {
                warn!(
                    "Invalid cron '{}' for reconciliation '{}': {}",
                    schedule, task_id, e
                );
                self.stop_task(task_id).await?;
                return Ok(false);
            }
        };

        self.stop_task(task_id).await?;
        let job_id = self.cron.add(job).await?;
        self.jobs.lock().await.insert(
            task_id.to_string(),
            ScheduledJob {
                task_id: task_id.to_string(),
                schedule: schedule.clone(),
                job_id,
            },
        );
        info!("Scheduled reconciliation '{}' at '{}' (UTC)", task_id, schedule);
        Ok(true)
    }

    /// Returns whether a job was removed.
    pub async fn stop_task(&self, task_id: &str) -> Result<bool> {
        let removed = self.jobs.lock().await.remove(task_id);
        match removed {
            Some(job) => {
                self.cron.remove(&job.job_id).await?;
                debug!("Unscheduled reconciliation '{}'", task_id);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub async fn stop(&self) {
        let jobs: Vec<ScheduledJob> = self.jobs.lock().await.drain().map(|(_, j)| j).collect();
        for job in jobs {
            if let Err(e) = self.cron.remove(&job.job_id).await {
                warn!("Failed to unschedule '{}': {}", job.task_id, e);
            }
        }
        self.running.store(false, Ordering::SeqCst);
        info!("Reconciliation scheduler stopped");
    }

    /// Re-reads settings for one task, e.g. after its cron or enabled flag changed.
    pub async fn restart_task(&self, task_id: &str) -> Result<bool> {
        self.stop_task(task_id).await?;
        self.schedule_task(task_id).await
    }

    /// Brings cron jobs in line with the current settings so changes written
    /// by another process take effect without a restart. Returns the ids of
    /// the tasks whose job was replaced or removed.
    pub async fn refresh_schedules(&self) -> Vec<String> {
        if !self.running.load(Ordering::SeqCst) {
            return Vec::new();
        }
        let mut changed = Vec::new();
        for task in self.runner.registry.get_all() {
            let task_id = task.id();
            let wanted = match self.desired_schedule(task_id).await {
                Ok(wanted) => wanted,
                Err(e) => {
                    warn!("Could not read schedule for '{}': {:#}", task_id, e);
                    continue;
                }
            };
            let current = self.get_task_schedule(task_id).await;
            if wanted == current {
                continue;
            }
            match self.restart_task(task_id).await {
                Ok(scheduled) if scheduled || current.is_some() => {
                    info!(
                        "Schedule for '{}' changed: {} -> {}",
                        task_id,
                        current.as_deref().unwrap_or("none"),
                        wanted.as_deref().unwrap_or("none")
                    );
                    changed.push(task_id.to_string());
                }
                Ok(_) => {}
                Err(e) => error!("Failed to reschedule '{}': {:#}", task_id, e),
            }
        }
        changed
    }

    async fn desired_schedule(&self, task_id: &str) -> Result<Option<String>> {
        let settings = &self.runner.settings;
        let enabled = settings.get_setting(&enabled_key(task_id)).await?;
        if !parse_flag(enabled.as_deref()) {
            return Ok(None);
        }
        Ok(settings
            .get_setting(&cron_key(task_id))
            .await?
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty()))
    }

    pub async fn get_status(&self) -> SchedulerStatus {
        let mut registered_tasks: Vec<String> = self
            .runner
            .registry
            .get_all()
            .iter()
            .map(|t| t.id().to_string())
            .collect();
        registered_tasks.sort();
        let mut jobs: Vec<ScheduledJob> = self.jobs.lock().await.values().cloned().collect();
        jobs.sort_by(|a, b| a.task_id.cmp(&b.task_id));
        SchedulerStatus {
            running: self.running.load(Ordering::SeqCst),
            registered_tasks,
            jobs,
        }
    }

    pub async fn is_task_scheduled(&self, task_id: &str) -> bool {
        self.jobs.lock().await.contains_key(task_id)
    }

    pub async fn get_task_schedule(&self, task_id: &str) -> Option<String> {
        self.jobs
            .lock()
            .await
            .get(task_id)
            .map(|j| j.schedule.clone())
    }

    pub async fn execute_task(
        &self,
        task_id: &str,
        trigger_source: TriggerSource,
        triggered_by: Option<String>,
    ) -> Option<ReconciliationResult> {
        self.runner
            .execute_task(task_id, trigger_source, triggered_by)
            .await
    }

    /// Pre-flight check combining the task's own diagnostics with its settings.
    /// `None` for an unknown task.
    pub async fn validate_task(&self, task_id: &str) -> Option<Vec<String>> {
        let task = self.runner.registry.get(task_id)?;
        let mut problems = task.validate_config().await;
        let settings = &self.runner.settings;

        let read = |key: String| async move {
            match settings.get_setting(&key).await {
                Ok(value) => Ok(value),
                Err(e) => Err(format!("Could not read setting '{}': {:#}", key, e)),
            }
        };

        match read(enabled_key(task_id)).await {
            Ok(enabled) if parse_flag(enabled.as_deref()) => {
                match read(cron_key(task_id)).await {
                    Ok(Some(cron)) if !cron.trim().is_empty() => {
                        if let Err(e) =
                            Job::new_async_tz(cron.trim(), Utc, |_uuid, mut _l| Box::pin(async {}))
                        {
                            problems.push(format!("Invalid cron expression '{}': {}", cron, e));
                        }
                    }
                    Ok(_) => problems.push(format!(
                        "Task is enabled but '{}' is not set",
                        cron_key(task_id)
                    )),
                    Err(e) => problems.push(e),
                }
            }
            Ok(_) => {}
            Err(e) => problems.push(e),
        }

        match read(window_hours_key(task_id)).await {
            Ok(Some(raw)) if parse_window_hours(Some(&raw)).is_none() => problems.push(format!(
                "'{}' must be a positive whole number of hours, got '{}'",
                window_hours_key(task_id),
                raw
            )),
            Ok(_) => {}
            Err(e) => problems.push(e),
        }

        Some(problems)
    }
}
