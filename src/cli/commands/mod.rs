use anyhow::Result;
use shipflow::definitions::{BundleSummary, DefinitionBundle, DefinitionStore};
use shipflow::guards::{register_builtin_guards, GuardClients, GuardRegistry};
use std::path::Path;
use std::sync::Arc;

pub mod inspect;
pub mod run;
pub mod validate;

/// Parse `path` and publish it into a scratch store with the built-in guards.
pub async fn publish_bundle(path: &Path) -> Result<(DefinitionBundle, BundleSummary)> {
    let bundle = DefinitionBundle::from_path(path)?;
    let guards = Arc::new(GuardRegistry::new());
    register_builtin_guards(&guards, GuardClients::from_payload()).await;
    let store = DefinitionStore::new(guards);
    let summary = store.load_bundle(bundle.clone()).await?;
    Ok((bundle, summary))
}
