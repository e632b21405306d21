use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

/// An executable saga step, compensation or fallback.
///
/// Actions must tolerate being invoked more than once with the same input.
#[async_trait]
pub trait StepAction: Send + Sync {
    async fn invoke(&self, input: Value) -> Result<Value>;
}

/// Adapter turning an async closure into a [`StepAction`].
pub struct FnAction<F> {
    f: F,
}

impl<F, Fut> FnAction<F>
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value>> + Send,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut> StepAction for FnAction<F>
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value>> + Send,
{
    async fn invoke(&self, input: Value) -> Result<Value> {
        (self.f)(input).await
    }
}

/// Returns its input. Used for dry runs.
#[derive(Debug, Default, Clone, Copy)]
pub struct EchoAction;

#[async_trait]
impl StepAction for EchoAction {
    async fn invoke(&self, input: Value) -> Result<Value> {
        Ok(input)
    }
}

/// Actions by name, with an optional catch-all.
#[derive(Default)]
pub struct ActionRegistry {
    actions: RwLock<HashMap<String, Arc<dyn StepAction>>>,
    fallback: Option<Arc<dyn StepAction>>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry that answers every unknown name with `default`.
    pub fn with_default(default: Arc<dyn StepAction>) -> Self {
        Self {
            actions: RwLock::new(HashMap::new()),
            fallback: Some(default),
        }
    }

    pub async fn register(&self, name: impl Into<String>, action: Arc<dyn StepAction>) {
        let name = name.into();
        info!(action = %name, "Registering saga action");
        self.actions.write().await.insert(name, action);
    }

    pub async fn get(&self, name: &str) -> Option<Arc<dyn StepAction>> {
        match self.actions.read().await.get(name) {
            Some(action) => Some(Arc::clone(action)),
            None => self.fallback.clone(),
        }
    }

    pub async fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.actions.read().await.keys().cloned().collect();
        names.sort();
        names
    }
}

impl std::fmt::Debug for ActionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionRegistry")
            .field("has_default", &self.fallback.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_registry_lookup_and_default() {
        let registry = ActionRegistry::new();
        registry
            .register(
                "create_booking",
                Arc::new(FnAction::new(|_input: Value| async { Ok::<_, anyhow::Error>(json!({"booking_id": "BK-1"})) })),
            )
            .await;

        let action = registry.get("create_booking").await.unwrap();
        assert_eq!(action.invoke(json!({})).await.unwrap()["booking_id"], "BK-1");
        assert!(registry.get("unknown").await.is_none());

        let dry = ActionRegistry::with_default(Arc::new(EchoAction));
        let echoed = dry.get("anything").await.unwrap().invoke(json!({"a": 1})).await.unwrap();
        assert_eq!(echoed, json!({"a": 1}));
    }
}
