use anyhow::Result;

use crate::core::app::App;
use crate::core::reconciliation::SettingsStore;
use crate::core::terminal::{GuideSection, print_error, print_info, print_success};

fn print_schedule_hint(key: &str) {
    if key.starts_with("reconciliation_") {
        print_info("A running scheduler picks up schedule changes within a minute.");
    }
}

pub async fn run(app: &App, args: &[String]) -> Result<()> {
    let sub_cmd = args.get(2).map(String::as_str).unwrap_or("list");
    match sub_cmd {
        "list" => {
            let prefix = args.get(3).map(String::as_str);
            let settings = app.store.list_settings(prefix).await?;
            if settings.is_empty() {
                print_info("No settings stored.");
                return Ok(());
            }
            let mut section = GuideSection::new("Settings");
            for setting in settings {
                section = section.status(&setting.key, &setting.value);
            }
            section.print();
        }
        "get" => {
            let Some(key) = args.get(3) else {
                print_error("Usage: mailrecon config get <key>");
                return Ok(());
            };
            match app.store.get_setting(key).await? {
                Some(value) => println!("{}", value),
                None => print_info(&format!("'{}' is not set.", key)),
            }
        }
        "set" => {
            let (Some(key), Some(value)) = (args.get(3), args.get(4)) else {
                print_error("Usage: mailrecon config set <key> <value>");
                return Ok(());
            };
            app.store.set_setting(key, value).await?;
            print_success(&format!("Set {} = {}", key, value));
            print_schedule_hint(key);
        }
        "unset" => {
            let Some(key) = args.get(3) else {
                print_error("Usage: mailrecon config unset <key>");
                return Ok(());
            };
            if app.store.remove_setting(key).await? {
                print_success(&format!("Removed {}", key));
                print_schedule_hint(key);
            } else {
                print_info(&format!("'{}' was not set.", key));
            }
        }
        other => {
            print_error(&format!(
                "Unknown config command '{}'. Expected: list, get, set, unset",
                other
            ));
        }
    }
    Ok(())
}
