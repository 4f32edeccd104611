mod daemon;
mod doctor;
mod settings;

use anyhow::Result;
use console::style;

use crate::core::app::App;
use crate::core::config::AppConfig;
use crate::core::reconciliation::TriggerSource;
use crate::core::terminal::{self, GuideSection, print_error, print_info, print_warn};
use crate::platform::{NativePlatform, Platform};

fn print_help() {
    terminal::print_banner();

    GuideSection::new("Scheduler")
        .command("run", "Start the scheduler and run until Ctrl+C")
        .command("status", "Show scheduled tasks and lock holders")
        .print();

    GuideSection::new("Tasks")
        .command("exec <task> [--by <who>]", "Run a reconciliation task now")
        .command("validate <task>", "Check credentials and task settings")
        .print();

    GuideSection::new("Settings")
        .command("config list [prefix]", "List runtime settings")
        .command("config get <key>", "Print one setting")
        .command("config set <key> <value>", "Store a setting")
        .command("config unset <key>", "Remove a setting")
        .print();

    println!(
        "\n {} {} <command> [arguments]\n",
        style("Usage:").bold(),
        style("mailrecon").green()
    );
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ExecCommandArgs {
    pub task_id: Option<String>,
    pub triggered_by: Option<String>,
}

pub(crate) fn parse_exec_command_args(args: &[String], start: usize) -> ExecCommandArgs {
    let mut task_id = None;
    let mut triggered_by = None;
    let mut i = start;
    while i < args.len() {
        match args[i].as_str() {
            "--by" | "-b" => {
                if i + 1 < args.len() {
                    triggered_by = Some(args[i + 1].clone());
                    i += 2;
                } else {
                    i += 1;
                }
            }
            other if task_id.is_none() && !other.starts_with('-') => {
                task_id = Some(other.to_string());
                i += 1;
            }
            _ => i += 1,
        }
    }
    ExecCommandArgs {
        task_id,
        triggered_by,
    }
}

fn open_log_file(app_config: &AppConfig, data_dir: &std::path::Path) -> Option<std::fs::File> {
    let name = app_config.logging.file.as_deref()?;
    let path = data_dir.join(name);
    match std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
    {
        Ok(file) => {
            NativePlatform::restrict_file_permissions(&path);
            Some(file)
        }
        Err(e) => {
            print_warn(&format!(
                "Cannot open log file {}: {}",
                path.display(),
                e
            ));
            None
        }
    }
}

pub async fn run_main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let cmd = args.get(1).map(String::as_str).unwrap_or("help");
    if matches!(cmd, "help" | "--help" | "-h") {
        print_help();
        return Ok(());
    }

    let data_dir = NativePlatform::data_dir();
    if !data_dir.exists() {
        tokio::fs::create_dir_all(&data_dir).await?;
        NativePlatform::restrict_dir_permissions(&data_dir);
    }

    let config = AppConfig::load(&data_dir).await?;
    crate::logging::init(config.log_level(), open_log_file(&config, &data_dir));
    config.describe();

    let app = App::build(config, &data_dir).await?;

    match cmd {
        "run" => daemon::run(&app).await,
        "exec" => {
            let parsed = parse_exec_command_args(&args, 2);
            let Some(task_id) = parsed.task_id else {
                print_error("Missing task id. Usage: mailrecon exec <task> [--by <who>]");
                return Ok(());
            };
            let triggered_by = parsed
                .triggered_by
                .or_else(|| std::env::var("USER").ok());
            let known = app.scheduler.runner().registry().has(&task_id);
            match app
                .scheduler
                .execute_task(&task_id, TriggerSource::Manual, triggered_by)
                .await
            {
                Some(result) => terminal::print_result(&task_id, &result),
                None if known => {
                    print_warn(&format!(
                        "Reconciliation '{}' is already running elsewhere.",
                        task_id
                    ));
                }
                None => print_error(&format!("Unknown task '{}'.", task_id)),
            }
            Ok(())
        }
        "status" => daemon::status(&app).await,
        "validate" => {
            let Some(task_id) = args.get(2) else {
                print_error("Missing task id. Usage: mailrecon validate <task>");
                return Ok(());
            };
            doctor::validate(&app, task_id).await
        }
        "config" => settings::run(&app, &args).await,
        other => {
            print_error(&format!("Unknown command '{}'.", other));
            print_info("Run 'mailrecon help' to see the available commands.");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn parse_exec_command_args_reads_task_and_actor() {
        let parsed = parse_exec_command_args(
            &args(&["mailrecon", "exec", "postmark", "--by", "ops@example.com"]),
            2,
        );
        assert_eq!(parsed.task_id.as_deref(), Some("postmark"));
        assert_eq!(parsed.triggered_by.as_deref(), Some("ops@example.com"));
    }

    #[test]
    fn parse_exec_command_args_accepts_flag_before_task() {
        let parsed = parse_exec_command_args(&args(&["mailrecon", "exec", "-b", "ana", "postmark"]), 2);
        assert_eq!(parsed.task_id.as_deref(), Some("postmark"));
        assert_eq!(parsed.triggered_by.as_deref(), Some("ana"));
    }

    #[test]
    fn parse_exec_command_args_tolerates_dangling_flag() {
        let parsed = parse_exec_command_args(&args(&["mailrecon", "exec", "--by"]), 2);
        assert_eq!(
            parsed,
            ExecCommandArgs {
                task_id: None,
                triggered_by: None
            }
        );
    }
}
