//! Periodic re-derivation of email delivery state from the provider API.
//!
//! Tasks are registered in a [`TaskRegistry`] and driven by the
//! [`ReconciliationScheduler`], which guards every run with a named advisory
//! lock so that only one instance of a multi-process deployment does the work.

pub mod event_logger;
pub mod lock;
pub mod postmark;
mod registry;
pub mod repository;
mod scheduler;
pub mod settings;
mod task;
pub mod types;

pub use event_logger::{EmailEventDetails, EmailEventType, EventLogger, EventSink, EventSource};
pub use lock::{LockLease, LockProvider};
pub use registry::TaskRegistry;
pub use repository::EmailRepository;
pub use scheduler::{ReconciliationScheduler, TaskRunner};
pub use settings::SettingsStore;
pub use task::ReconciliationTask;
pub use types::{ReconciliationOptions, ReconciliationResult, ReconciliationSummary, TriggerSource};
