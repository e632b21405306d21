//! Definition store
//!
//! Holds every published definition. Publishing validates, rejects
//! re-publication of an existing name+version, and checks that the guards a
//! state machine names are registered. Nothing is ever replaced or removed.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

use super::sla::{Edge, SlaPolicy};
use super::state_machine::{DefinitionRef, StateMachineDefinition};
use super::workflow::WorkflowDefinition;
use crate::errors::{OrchestrationError, OrchestrationResult};
use crate::guards::GuardRegistry;

/// Definitions loaded together from one file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DefinitionBundle {
    pub state_machines: Vec<StateMachineDefinition>,
    pub sla_policies: Vec<SlaPolicy>,
    pub workflows: Vec<WorkflowDefinition>,
}

impl DefinitionBundle {
    /// Parse a bundle file; `.toml` files are read as TOML, everything else as JSON.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read definitions file {}", path.display()))?;

        let is_toml = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));

        let bundle = if is_toml {
            toml::from_str(&raw)
                .with_context(|| format!("Invalid TOML in {}", path.display()))?
        } else {
            serde_json::from_str(&raw)
                .with_context(|| format!("Invalid JSON in {}", path.display()))?
        };
        Ok(bundle)
    }
}

/// What a bundle load published.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BundleSummary {
    pub state_machines: Vec<String>,
    pub sla_policies: Vec<String>,
    pub workflows: Vec<String>,
}

type SlaKey = (String, Edge);

pub struct DefinitionStore {
    machines: RwLock<BTreeMap<DefinitionRef, Arc<StateMachineDefinition>>>,
    sla_policies: RwLock<HashMap<SlaKey, Arc<SlaPolicy>>>,
    workflows: RwLock<BTreeMap<(String, u32), Arc<WorkflowDefinition>>>,
    guards: Arc<GuardRegistry>,
}

impl DefinitionStore {
    pub fn new(guards: Arc<GuardRegistry>) -> Self {
        Self {
            machines: RwLock::new(BTreeMap::new()),
            sla_policies: RwLock::new(HashMap::new()),
            workflows: RwLock::new(BTreeMap::new()),
            guards,
        }
    }

    pub fn guards(&self) -> &Arc<GuardRegistry> {
        &self.guards
    }

    pub async fn publish_state_machine(
        &self,
        definition: StateMachineDefinition,
    ) -> OrchestrationResult<DefinitionRef> {
        definition.validate()?;

        let mut missing: Vec<&str> = Vec::new();
        for guard in definition.referenced_guards() {
            if !self.guards.contains(guard).await {
                missing.push(guard);
            }
        }
        if !missing.is_empty() {
            missing.sort();
            return Err(OrchestrationError::InvalidDefinition {
                name: definition.reference().to_string(),
                reason: format!("unregistered guards: {}", missing.join(", ")),
            });
        }

        let reference = definition.reference();
        let mut machines = self.machines.write().await;
        if machines.contains_key(&reference) {
            return Err(OrchestrationError::DuplicateDefinition(reference.to_string()));
        }
        info!(definition = %reference, states = definition.states.len(), "Published state machine");
        machines.insert(reference.clone(), Arc::new(definition));
        Ok(reference)
    }

    pub async fn state_machine(
        &self,
        reference: &DefinitionRef,
    ) -> OrchestrationResult<Arc<StateMachineDefinition>> {
        self.machines
            .read()
            .await
            .get(reference)
            .cloned()
            .ok_or_else(|| OrchestrationError::DefinitionNotFound(reference.to_string()))
    }

    /// Highest published version of `name`.
    pub async fn latest_state_machine(
        &self,
        name: &str,
    ) -> OrchestrationResult<Arc<StateMachineDefinition>> {
        self.machines
            .read()
            .await
            .iter()
            .rev()
            .find(|(reference, _)| reference.name == name)
            .map(|(_, definition)| Arc::clone(definition))
            .ok_or_else(|| OrchestrationError::DefinitionNotFound(name.to_string()))
    }

    pub async fn state_machine_refs(&self) -> Vec<DefinitionRef> {
        self.machines.read().await.keys().cloned().collect()
    }

    /// Publish an SLA policy. Some published version of its state machine
    /// must contain both states of the edge.
    pub async fn publish_sla_policy(&self, policy: SlaPolicy) -> OrchestrationResult<()> {
        policy.validate()?;

        let edge = policy.edge();
        let known_edge = self.machines.read().await.iter().any(|(reference, def)| {
            reference.name == policy.definition_name
                && def.contains_state(&edge.from)
                && def.contains_state(&edge.to)
        });
        if !known_edge {
            return Err(OrchestrationError::InvalidDefinition {
                name: format!("sla:{}:{}", policy.definition_name, edge),
                reason: "no published state machine contains this edge".to_string(),
            });
        }

        let key = (policy.definition_name.clone(), edge.clone());
        let mut policies = self.sla_policies.write().await;
        if policies.contains_key(&key) {
            return Err(OrchestrationError::DuplicateDefinition(format!(
                "sla:{}:{}",
                key.0, key.1
            )));
        }
        info!(definition = %key.0, edge = %key.1, "Published SLA policy");
        policies.insert(key, Arc::new(policy));
        Ok(())
    }

    pub async fn sla_policy(&self, definition_name: &str, edge: &Edge) -> Option<Arc<SlaPolicy>> {
        self.sla_policies
            .read()
            .await
            .get(&(definition_name.to_string(), edge.clone()))
            .cloned()
    }

    /// Policies on edges leaving `state`, ordered by edge.
    pub async fn sla_policies_from(&self, definition_name: &str, state: &str) -> Vec<Arc<SlaPolicy>> {
        let mut policies: Vec<Arc<SlaPolicy>> = self
            .sla_policies
            .read()
            .await
            .iter()
            .filter(|((name, edge), _)| name == definition_name && edge.from == state)
            .map(|(_, policy)| Arc::clone(policy))
            .collect();
        policies.sort_by(|a, b| a.edge().cmp(&b.edge()));
        policies
    }

    pub async fn publish_workflow(&self, workflow: WorkflowDefinition) -> OrchestrationResult<String> {
        workflow.validate()?;

        let key = (workflow.workflow_id.clone(), workflow.version);
        let reference = workflow.reference();
        let mut workflows = self.workflows.write().await;
        if workflows.contains_key(&key) {
            return Err(OrchestrationError::DuplicateDefinition(reference));
        }
        info!(
            workflow = %reference,
            trigger = %workflow.trigger.event_type,
            steps = workflow.steps.len(),
            "Published workflow"
        );
        workflows.insert(key, Arc::new(workflow));
        Ok(reference)
    }

    pub async fn workflow(&self, workflow_id: &str, version: u32) -> OrchestrationResult<Arc<WorkflowDefinition>> {
        self.workflows
            .read()
            .await
            .get(&(workflow_id.to_string(), version))
            .cloned()
            .ok_or_else(|| OrchestrationError::DefinitionNotFound(format!("{workflow_id}@v{version}")))
    }

    /// Latest version of every workflow triggered by `event_type`.
    pub async fn workflows_for(&self, event_type: &str) -> Vec<Arc<WorkflowDefinition>> {
        let workflows = self.workflows.read().await;
        let mut latest: BTreeMap<&str, &Arc<WorkflowDefinition>> = BTreeMap::new();
        for ((id, _), workflow) in workflows.iter() {
            // keys iterate in version order, so later entries win
            latest.insert(id.as_str(), workflow);
        }
        latest
            .into_values()
            .filter(|wf| wf.trigger.event_type == event_type)
            .cloned()
            .collect()
    }

    pub async fn workflow_refs(&self) -> Vec<String> {
        self.workflows
            .read()
            .await
            .values()
            .map(|wf| wf.reference())
            .collect()
    }

    /// Publish a whole bundle: state machines, then SLA policies, then workflows.
    /// Stops at the first error; anything published before it stays published.
    pub async fn load_bundle(&self, bundle: DefinitionBundle) -> OrchestrationResult<BundleSummary> {
        let mut summary = BundleSummary::default();
        for machine in bundle.state_machines {
            let reference = self.publish_state_machine(machine).await?;
            summary.state_machines.push(reference.to_string());
        }
        for policy in bundle.sla_policies {
            let label = format!("{}:{}", policy.definition_name, policy.edge());
            self.publish_sla_policy(policy).await?;
            summary.sla_policies.push(label);
        }
        for workflow in bundle.workflows {
            summary.workflows.push(self.publish_workflow(workflow).await?);
        }
        Ok(summary)
    }
}

impl std::fmt::Debug for DefinitionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DefinitionStore").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definitions::state_machine::StateDef;
    use crate::definitions::workflow::{StepType, Trigger, WorkflowStep};
    use crate::guards::{register_builtin_guards, GuardClients};
    use std::time::Duration;
    use tempfile::TempDir;

    fn machine(version: u32) -> StateMachineDefinition {
        StateMachineDefinition::new("si", version, "draft")
            .with_state(StateDef::new("draft").transition("submit_for_review", "review"))
            .with_state(
                StateDef::new("review")
                    .guard("hasRequiredDocs")
                    .transition("approve", "approved"),
            )
            .with_state(StateDef::new("approved").terminal())
    }

    fn workflow(version: u32) -> WorkflowDefinition {
        WorkflowDefinition::new("wf", version, Trigger::on("si.approved"))
            .step(WorkflowStep::new("validate", StepType::Validation, "validate_si"))
    }

    async fn store() -> DefinitionStore {
        let registry = Arc::new(GuardRegistry::new());
        register_builtin_guards(&registry, GuardClients::from_payload()).await;
        DefinitionStore::new(registry)
    }

    #[tokio::test]
    async fn test_publish_rejects_duplicates_and_unknown_guards() {
        let store = store().await;
        store.publish_state_machine(machine(1)).await.unwrap();

        let dup = store.publish_state_machine(machine(1)).await.unwrap_err();
        assert!(matches!(dup, OrchestrationError::DuplicateDefinition(_)));

        let mut unguarded = machine(2);
        unguarded.states[1].guards.push("nobodyRegisteredThis".to_string());
        let err = store.publish_state_machine(unguarded).await.unwrap_err();
        assert!(err.to_string().contains("nobodyRegisteredThis"));
    }

    #[tokio::test]
    async fn test_latest_versions_win() {
        let store = store().await;
        store.publish_state_machine(machine(1)).await.unwrap();
        store.publish_state_machine(machine(3)).await.unwrap();
        assert_eq!(store.latest_state_machine("si").await.unwrap().version, 3);

        store.publish_workflow(workflow(1)).await.unwrap();
        store.publish_workflow(workflow(2)).await.unwrap();
        let matching = store.workflows_for("si.approved").await;
        assert_eq!(matching.len(), 1);
        assert_eq!(matching[0].version, 2);
        assert!(store.workflows_for("si.rejected").await.is_empty());
    }

    #[tokio::test]
    async fn test_sla_policy_requires_known_edge() {
        let store = store().await;
        let policy = SlaPolicy::new("si", "review", "approved", Duration::from_secs(4 * 3600));
        assert!(store.publish_sla_policy(policy.clone()).await.is_err());

        store.publish_state_machine(machine(1)).await.unwrap();
        store.publish_sla_policy(policy).await.unwrap();
        assert_eq!(store.sla_policies_from("si", "review").await.len(), 1);
        assert!(store.sla_policies_from("si", "draft").await.is_empty());
    }

    #[tokio::test]
    async fn test_bundle_loads_from_toml_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("defs.toml");
        std::fs::write(
            &path,
            r#"
[[state_machines]]
name = "si"
version = 1
initial_state = "draft"

[[state_machines.states]]
name = "draft"
allowed_transitions = ["done"]
allowed_actions = ["finish"]
action_targets = { finish = "done" }

[[state_machines.states]]
name = "done"
terminal = true

[[sla_policies]]
definition_name = "si"
from_state = "draft"
to_state = "done"
target_duration = "2h"
"#,
        )
        .unwrap();

        let bundle = DefinitionBundle::from_path(&path).unwrap();
        let summary = store().await.load_bundle(bundle).await.unwrap();
        assert_eq!(summary.state_machines, ["si@v1"]);
        assert_eq!(summary.sla_policies, ["si:draft->done"]);
    }
}
