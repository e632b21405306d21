//! State machine definitions
//!
//! A definition is immutable once published and is referenced from instances
//! by name + version.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::fmt;

use crate::errors::{OrchestrationError, OrchestrationResult};

/// Read-only action accepted in every state.
pub const VIEW_ACTION: &str = "view";
/// Action that moves an instance in a terminal state to the archive.
pub const ARCHIVE_ACTION: &str = "archive";

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DefinitionRef {
    pub name: String,
    pub version: u32,
}

impl DefinitionRef {
    pub fn new(name: impl Into<String>, version: u32) -> Self {
        Self {
            name: name.into(),
            version,
        }
    }
}

impl fmt::Display for DefinitionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@v{}", self.name, self.version)
    }
}

/// Fire-and-forget command emitted when a state is entered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SideEffect {
    pub action: String,
    #[serde(default)]
    pub input: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateDef {
    pub name: String,
    /// Target state names reachable from this state.
    #[serde(default)]
    pub allowed_transitions: Vec<String>,
    #[serde(default)]
    pub allowed_actions: Vec<String>,
    /// Which target each transitioning action leads to.
    #[serde(default)]
    pub action_targets: BTreeMap<String, String>,
    /// Entry guards, evaluated when a transition targets this state.
    #[serde(default)]
    pub guards: Vec<String>,
    #[serde(default)]
    pub side_effects: Vec<SideEffect>,
    #[serde(default)]
    pub terminal: bool,
    /// Compensations requested from the saga layer when this state is entered.
    #[serde(default)]
    pub compensations: Vec<String>,
}

impl StateDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            allowed_transitions: Vec::new(),
            allowed_actions: Vec::new(),
            action_targets: BTreeMap::new(),
            guards: Vec::new(),
            side_effects: Vec::new(),
            terminal: false,
            compensations: Vec::new(),
        }
    }

    /// Declare `action` as leading to `target`.
    pub fn transition(mut self, action: impl Into<String>, target: impl Into<String>) -> Self {
        let action = action.into();
        let target = target.into();
        if !self.allowed_actions.contains(&action) {
            self.allowed_actions.push(action.clone());
        }
        if !self.allowed_transitions.contains(&target) {
            self.allowed_transitions.push(target.clone());
        }
        self.action_targets.insert(action, target);
        self
    }

    /// Allow a non-transitioning action.
    pub fn action(mut self, action: impl Into<String>) -> Self {
        let action = action.into();
        if !self.allowed_actions.contains(&action) {
            self.allowed_actions.push(action);
        }
        self
    }

    pub fn guard(mut self, guard: impl Into<String>) -> Self {
        self.guards.push(guard.into());
        self
    }

    pub fn side_effect(mut self, action: impl Into<String>, input: Value) -> Self {
        self.side_effects.push(SideEffect {
            action: action.into(),
            input,
        });
        self
    }

    pub fn compensation(mut self, compensation: impl Into<String>) -> Self {
        self.compensations.push(compensation.into());
        self
    }

    pub fn terminal(mut self) -> Self {
        self.terminal = true;
        self
    }

    pub fn allows_action(&self, action: &str) -> bool {
        self.allowed_actions.iter().any(|a| a == action)
    }

    /// Target for `action`, only if the edge is also listed as allowed.
    pub fn target_for(&self, action: &str) -> Option<&str> {
        self.action_targets
            .get(action)
            .map(String::as_str)
            .filter(|target| self.allowed_transitions.iter().any(|t| t == target))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateMachineDefinition {
    pub name: String,
    pub version: u32,
    pub initial_state: String,
    pub states: Vec<StateDef>,
}

impl StateMachineDefinition {
    pub fn new(name: impl Into<String>, version: u32, initial_state: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version,
            initial_state: initial_state.into(),
            states: Vec::new(),
        }
    }

    pub fn with_state(mut self, state: StateDef) -> Self {
        self.states.push(state);
        self
    }

    pub fn reference(&self) -> DefinitionRef {
        DefinitionRef::new(self.name.clone(), self.version)
    }

    pub fn state(&self, name: &str) -> Option<&StateDef> {
        self.states.iter().find(|s| s.name == name)
    }

    pub fn contains_state(&self, name: &str) -> bool {
        self.state(name).is_some()
    }

    pub fn state_names(&self) -> impl Iterator<Item = &str> {
        self.states.iter().map(|s| s.name.as_str())
    }

    /// Every guard name referenced by any state.
    pub fn referenced_guards(&self) -> HashSet<&str> {
        self.states
            .iter()
            .flat_map(|s| s.guards.iter().map(String::as_str))
            .collect()
    }

    /// Structural checks performed before a definition can be published.
    pub fn validate(&self) -> OrchestrationResult<()> {
        let invalid = |reason: String| OrchestrationError::InvalidDefinition {
            name: self.reference().to_string(),
            reason,
        };

        if self.states.is_empty() {
            return Err(invalid("no states defined".to_string()));
        }

        let mut seen = HashSet::new();
        for state in &self.states {
            if !seen.insert(state.name.as_str()) {
                return Err(invalid(format!("duplicate state '{}'", state.name)));
            }
        }

        if !self.contains_state(&self.initial_state) {
            return Err(invalid(format!(
                "initial state '{}' is not defined",
                self.initial_state
            )));
        }

        for state in &self.states {
            if state.terminal && !state.allowed_transitions.is_empty() {
                return Err(invalid(format!(
                    "terminal state '{}' declares outgoing transitions",
                    state.name
                )));
            }

            for target in &state.allowed_transitions {
                if !self.contains_state(target) {
                    return Err(invalid(format!(
                        "state '{}' allows transition to unknown state '{}'",
                        state.name, target
                    )));
                }
            }

            for (action, target) in &state.action_targets {
                if !state.allows_action(action) {
                    return Err(invalid(format!(
                        "state '{}' maps action '{}' that is not in allowed_actions",
                        state.name, action
                    )));
                }
                if !state.allowed_transitions.contains(target) {
                    return Err(invalid(format!(
                        "state '{}' maps action '{}' to '{}' which is not an allowed transition",
                        state.name, action, target
                    )));
                }
            }
        }

        Ok(())
    }
}
