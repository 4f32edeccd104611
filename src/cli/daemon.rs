use std::time::Duration;

use anyhow::Result;
use console::style;
use tracing::info;

use crate::core::app::App;
use crate::core::reconciliation::postmark::TASK_ID;
use crate::core::reconciliation::settings::{enabled_key, lock_name};
use crate::core::terminal::{GuideSection, print_info};

/// How often the daemon re-reads task settings written by `mailrecon config`.
const SETTINGS_REFRESH_INTERVAL: Duration = Duration::from_secs(60);

/// Runs the scheduler in the foreground until Ctrl+C.
pub async fn run(app: &App) -> Result<()> {
    app.scheduler.start().await?;

    let mut section = GuideSection::new("Reconciliation Scheduler")
        .status("Status", &style("RUNNING").green().bold().to_string())
        .status("Instance", app.store.instance_id())
        .status(
            "Database",
            &app.config.database_path(&app.data_dir).display().to_string(),
        );
    let mut any_scheduled = false;
    for task in app.scheduler.runner().registry().get_all() {
        let line = if app.scheduler.is_task_scheduled(task.id()).await {
            any_scheduled = true;
            let schedule = app.scheduler.get_task_schedule(task.id()).await;
            format!("{} (UTC)", schedule.unwrap_or_default())
        } else {
            style("not scheduled").dim().to_string()
        };
        section = section.status(task.id(), &line);
    }
    if !any_scheduled {
        section = section.blank().text(&format!(
            "No task is enabled. Try {}",
            style(format!("mailrecon config set {} true", enabled_key(TASK_ID))).cyan()
        ));
    }
    section
        .blank()
        .text(&format!(
            "Press {} to stop.",
            style("Ctrl+C").bold().yellow()
        ))
        .print();

    let mut refresh = tokio::time::interval(SETTINGS_REFRESH_INTERVAL);
    refresh.tick().await;
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            signal = &mut shutdown => {
                signal?;
                break;
            }
            _ = refresh.tick() => {
                for task_id in app.scheduler.refresh_schedules().await {
                    print_info(&format!("Applied new schedule settings for '{}'", task_id));
                }
            }
        }
    }
    info!("Shutdown requested");
    app.scheduler.stop().await;
    Ok(())
}

pub async fn status(app: &App) -> Result<()> {
    let registered = app.scheduler.runner().registry().get_all();
    let mut section = GuideSection::new("Reconciliation Tasks");
    if registered.is_empty() {
        section = section.text("No tasks registered.");
    }
    for task in registered {
        let holder = app.store.lock_holder(&lock_name(task.id())).await?;
        let running = match holder {
            Some(h) => format!(
                "{} by {} until {}",
                style("RUNNING").yellow().bold(),
                h.holder,
                h.expires_at.format("%Y-%m-%d %H:%M:%S UTC")
            ),
            None => style("idle").dim().to_string(),
        };
        section = section
            .status(task.id(), task.name())
            .text(&format!("  {}", task.description()))
            .text(&format!("  lock: {}", running));
    }
    section
        .blank()
        .status("Emails", &app.store.count_emails().await?.to_string())
        .status("Audit events", &app.store.count_events(None).await?.to_string())
        .status(
            "Failed runs",
            &app.store
                .count_events(Some("reconciliation_failed"))
                .await?
                .to_string(),
        )
        .print();

    let recent = app.store.recent_events(5).await?;
    if recent.is_empty() {
        print_info("No reconciliation activity recorded yet.");
        return Ok(());
    }
    let mut activity = GuideSection::new("Recent Activity");
    for event in recent {
        activity = activity.status(&event.created_at, &format!("{}: {}", event.title, event.description));
    }
    activity.print();
    Ok(())
}
