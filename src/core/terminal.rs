use console::{Emoji, style};

use crate::core::reconciliation::ReconciliationResult;

pub static SUCCESS_ICON: Emoji<'_, '_> = Emoji("✅ ", "");
pub static INFO_ICON: Emoji<'_, '_> = Emoji("ℹ️  ", "");
pub static WARN_ICON: Emoji<'_, '_> = Emoji("⚠️  ", "");
pub static ERROR_ICON: Emoji<'_, '_> = Emoji("❌ ", "");
pub static GEAR: Emoji<'_, '_> = Emoji("⚙️  ", "");
pub static ENVELOPE: Emoji<'_, '_> = Emoji("✉️  ", "");

pub fn print_success(msg: &str) {
    println!("{} {}", SUCCESS_ICON, style(msg).green());
}

pub fn print_info(msg: &str) {
    println!("{} {}", INFO_ICON, style(msg).blue());
}

pub fn print_warn(msg: &str) {
    println!("{} {}", WARN_ICON, style(msg).yellow());
}

pub fn print_error(msg: &str) {
    eprintln!("{} {}", ERROR_ICON, style(msg).red().bold());
}

pub fn print_status(label: &str, msg: &str) {
    println!("  {} {}: {}", GEAR, style(label).bold().cyan(), msg);
}

pub fn print_banner() {
    println!();
    println!(
        "{} {} {}",
        ENVELOPE,
        style("mailrecon").bold().cyan(),
        style(env!("CARGO_PKG_VERSION")).dim()
    );
    println!(
        "{}\n",
        style("Keeps local email delivery state in step with Postmark.").dim()
    );
}

enum GuideRow {
    Command(String, String),
    Status(String, String),
    Text(String),
    Blank,
}

/// A titled block of command or `label: value` rows.
pub struct GuideSection {
    title: String,
    rows: Vec<GuideRow>,
}

impl GuideSection {
    pub fn new(title: &str) -> Self {
        Self {
            title: title.to_string(),
            rows: Vec::new(),
        }
    }

    pub fn command(mut self, name: &str, description: &str) -> Self {
        self.rows
            .push(GuideRow::Command(name.to_string(), description.to_string()));
        self
    }

    pub fn status(mut self, label: &str, value: &str) -> Self {
        self.rows
            .push(GuideRow::Status(label.to_string(), value.to_string()));
        self
    }

    pub fn text(mut self, line: &str) -> Self {
        self.rows.push(GuideRow::Text(line.to_string()));
        self
    }

    pub fn blank(mut self) -> Self {
        self.rows.push(GuideRow::Blank);
        self
    }

    pub fn print(&self) {
        println!(" {}", style(&self.title).bold().underlined());
        let width = self
            .rows
            .iter()
            .map(|row| match row {
                GuideRow::Command(name, _) => name.len(),
                _ => 0,
            })
            .max()
            .unwrap_or(0);
        for row in &self.rows {
            match row {
                GuideRow::Command(name, description) => {
                    let padded = format!("{:<width$}", name, width = width);
                    println!("   {}  {}", style(padded).green(), description);
                }
                GuideRow::Status(label, value) => print_status(label, value),
                GuideRow::Text(line) => println!("   {}", line),
                GuideRow::Blank => println!(),
            }
        }
        println!();
    }
}

pub fn print_result(task_id: &str, result: &ReconciliationResult) {
    let s = &result.summary;
    if result.success {
        print_success(&format!(
            "Reconciliation '{}' completed in {}ms",
            task_id, result.duration_ms
        ));
    } else {
        print_warn(&format!(
            "Reconciliation '{}' finished with {} error(s) in {}ms",
            task_id,
            result.errors.len(),
            result.duration_ms
        ));
    }
    if result.success && s.is_quiet() {
        print_info(&format!("Checked {} item(s); everything was already in sync.", s.items_fetched));
        return;
    }
    print_status("Fetched", &s.items_fetched.to_string());
    print_status("New", &s.items_new.to_string());
    print_status("Updated", &s.items_updated.to_string());
    print_status("Corrections", &s.corrections.to_string());
    for error in &result.errors {
        print_error(error);
    }
}
