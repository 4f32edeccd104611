use anyhow::Result;
use async_trait::async_trait;

/// Key-value configuration lookup shared by every instance of the deployment.
#[async_trait]
pub trait SettingsStore: Send + Sync {
    async fn get_setting(&self, key: &str) -> Result<Option<String>>;
}

pub fn enabled_key(task_id: &str) -> String {
    format!("reconciliation_{}_enabled", task_id)
}

pub fn cron_key(task_id: &str) -> String {
    format!("reconciliation_{}_cron", task_id)
}

pub fn window_hours_key(task_id: &str) -> String {
    format!("reconciliation_{}_window_hours", task_id)
}

pub fn run_on_startup_key(task_id: &str) -> String {
    format!("reconciliation_{}_run_on_startup", task_id)
}

pub fn lock_name(task_id: &str) -> String {
    format!("reconciliation_{}", task_id)
}

pub fn parse_flag(value: Option<&str>) -> bool {
    matches!(
        value.map(|v| v.trim().to_ascii_lowercase()).as_deref(),
        Some("true" | "1" | "yes" | "on")
    )
}

/// Positive whole hours, or `None` when the value is missing, malformed or non-positive.
pub fn parse_window_hours(value: Option<&str>) -> Option<u32> {
    value
        .and_then(|v| v.trim().parse::<u32>().ok())
        .filter(|h| *h > 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_namespaced_by_task() {
        assert_eq!(enabled_key("postmark"), "reconciliation_postmark_enabled");
        assert_eq!(cron_key("postmark"), "reconciliation_postmark_cron");
        assert_eq!(
            window_hours_key("postmark"),
            "reconciliation_postmark_window_hours"
        );
        assert_eq!(lock_name("postmark"), "reconciliation_postmark");
    }

    #[test]
    fn flags_accept_common_truthy_spellings() {
        assert!(parse_flag(Some("true")));
        assert!(parse_flag(Some(" TRUE ")));
        assert!(parse_flag(Some("1")));
        assert!(!parse_flag(Some("false")));
        assert!(!parse_flag(Some("")));
        assert!(!parse_flag(None));
    }

    #[test]
    fn window_hours_reject_unset_or_bad_values() {
        assert_eq!(parse_window_hours(None), None);
        assert_eq!(parse_window_hours(Some("abc")), None);
        assert_eq!(parse_window_hours(Some("0")), None);
        assert_eq!(parse_window_hours(Some("-4")), None);
        assert_eq!(parse_window_hours(Some(" 24 ")), Some(24));
    }
}
