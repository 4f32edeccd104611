use anyhow::Result;
use async_trait::async_trait;

use super::types::{ReconciliationOptions, ReconciliationResult};

/// A pluggable unit of reconciliation work.
///
/// Implementations keep no state between runs; everything a run needs lives in
/// locals of `execute`. Partial failures belong in `ReconciliationResult::errors`.
/// An `Err` from `execute` is treated by the scheduler as a fatal run failure and
/// converted into a failed result.
#[async_trait]
pub trait ReconciliationTask: Send + Sync {
    /// Stable identifier, unique across the registry. Used in settings keys and lock names.
    fn id(&self) -> &str;

    fn name(&self) -> &str;

    fn description(&self) -> &str;

    async fn execute(&self, options: &ReconciliationOptions) -> Result<ReconciliationResult>;

    /// Pre-flight diagnostics. An empty list means healthy.
    async fn validate_config(&self) -> Vec<String>;
}
