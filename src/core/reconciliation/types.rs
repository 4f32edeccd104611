use std::collections::HashMap;

/// Default trailing window when no `window_hours` setting is present.
pub const DEFAULT_WINDOW_HOURS: u32 = 72;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerSource {
    Scheduled,
    Manual,
    Startup,
    Api,
}

impl TriggerSource {
    pub fn as_str(self) -> &'static str {
        match self {
            TriggerSource::Scheduled => "scheduled",
            TriggerSource::Manual => "manual",
            TriggerSource::Startup => "startup",
            TriggerSource::Api => "api",
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ReconciliationOptions {
    pub window_hours: u32,
    pub triggered_by: Option<String>,
    pub trigger_source: TriggerSource,
    /// Task-specific tuning knobs. Unknown keys are ignored by tasks.
    pub task_options: HashMap<String, String>,
}

impl ReconciliationOptions {
    pub fn new(window_hours: u32, trigger_source: TriggerSource) -> Self {
        Self {
            window_hours,
            triggered_by: None,
            trigger_source,
            task_options: HashMap::new(),
        }
    }

    pub fn triggered_by(mut self, actor: Option<String>) -> Self {
        self.triggered_by = actor;
        self
    }

    pub fn task_option(&self, key: &str) -> Option<&str> {
        self.task_options.get(key).map(String::as_str)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ReconciliationSummary {
    pub items_fetched: u64,
    pub items_new: u64,
    pub items_updated: u64,
    pub corrections: u64,
}

impl ReconciliationSummary {
    pub fn absorb(&mut self, other: &ReconciliationSummary) {
        self.items_fetched += other.items_fetched;
        self.items_new += other.items_new;
        self.items_updated += other.items_updated;
        self.corrections += other.corrections;
    }

    pub fn is_quiet(&self) -> bool {
        self.items_new == 0 && self.items_updated == 0 && self.corrections == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ReconciliationResult {
    pub success: bool,
    pub summary: ReconciliationSummary,
    pub errors: Vec<String>,
    /// Wall-clock duration in milliseconds, stamped by the scheduler.
    pub duration_ms: u64,
}

impl ReconciliationResult {
    /// Builds a result whose success flag is derived from the error list.
    pub fn from_parts(summary: ReconciliationSummary, errors: Vec<String>) -> Self {
        Self {
            success: errors.is_empty(),
            summary,
            errors,
            duration_ms: 0,
        }
    }

    pub fn failure(message: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            success: false,
            summary: ReconciliationSummary::default(),
            errors: vec![message.into()],
            duration_ms,
        }
    }
}
