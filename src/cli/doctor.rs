use anyhow::Result;

use crate::core::app::App;
use crate::core::reconciliation::settings::{cron_key, enabled_key, window_hours_key};
use crate::core::reconciliation::SettingsStore;
use crate::core::terminal::{print_error, print_status, print_success, print_warn};

/// Pre-flight check for one task: credentials, API reachability and settings.
pub async fn validate(app: &App, task_id: &str) -> Result<()> {
    let Some(problems) = app.scheduler.validate_task(task_id).await else {
        print_error(&format!("Unknown task '{}'.", task_id));
        return Ok(());
    };

    for key in [
        enabled_key(task_id),
        cron_key(task_id),
        window_hours_key(task_id),
    ] {
        let value = app.store.get_setting(&key).await?;
        print_status(&key, value.as_deref().unwrap_or("(unset)"));
    }
    println!();

    if problems.is_empty() {
        print_success(&format!("Task '{}' looks healthy.", task_id));
    } else {
        for problem in &problems {
            print_warn(problem);
        }
    }
    Ok(())
}
