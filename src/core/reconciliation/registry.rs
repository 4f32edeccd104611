use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::warn;

use super::task::ReconciliationTask;

/// Lookup table of reconciliation tasks keyed by task id.
#[derive(Default)]
pub struct TaskRegistry {
    tasks: RwLock<HashMap<String, Arc<dyn ReconciliationTask>>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a task. An existing task with the same id is replaced.
    pub fn register(&self, task: Arc<dyn ReconciliationTask>) {
        let id = task.id().to_string();
        let mut tasks = self.tasks.write().unwrap_or_else(|e| e.into_inner());
        if tasks.contains_key(&id) {
            warn!("Reconciliation task '{}' already registered, replacing", id);
        }
        tasks.insert(id, task);
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn ReconciliationTask>> {
        let tasks = self.tasks.read().unwrap_or_else(|e| e.into_inner());
        tasks.get(id).cloned()
    }

    pub fn get_all(&self) -> Vec<Arc<dyn ReconciliationTask>> {
        let tasks = self.tasks.read().unwrap_or_else(|e| e.into_inner());
        tasks.values().cloned().collect()
    }

    pub fn has(&self, id: &str) -> bool {
        let tasks = self.tasks.read().unwrap_or_else(|e| e.into_inner());
        tasks.contains_key(id)
    }

    #[allow(dead_code)]
    pub fn unregister(&self, id: &str) -> bool {
        let mut tasks = self.tasks.write().unwrap_or_else(|e| e.into_inner());
        tasks.remove(id).is_some()
    }

    #[allow(dead_code)]
    pub fn clear(&self) {
        let mut tasks = self.tasks.write().unwrap_or_else(|e| e.into_inner());
        tasks.clear();
    }

    pub fn len(&self) -> usize {
        let tasks = self.tasks.read().unwrap_or_else(|e| e.into_inner());
        tasks.len()
    }
}
