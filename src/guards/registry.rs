use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

use super::traits::Guard;

/// Guard registrations by name
#[derive(Default)]
pub struct GuardRegistry {
    guards: RwLock<HashMap<String, Arc<dyn Guard>>>,
}

impl GuardRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a guard under its own name, replacing any previous registration.
    pub async fn register(&self, guard: Arc<dyn Guard>) {
        let name = guard.name().to_string();
        info!(guard = %name, "Registering guard");
        self.guards.write().await.insert(name, guard);
    }

    pub async fn get(&self, name: &str) -> Option<Arc<dyn Guard>> {
        self.guards.read().await.get(name).cloned()
    }

    pub async fn contains(&self, name: &str) -> bool {
        self.guards.read().await.contains_key(name)
    }

    pub async fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.guards.read().await.keys().cloned().collect();
        names.sort();
        names
    }
}

impl std::fmt::Debug for GuardRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuardRegistry").finish_non_exhaustive()
    }
}
