// Core types for guard evaluation

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Code for a guard that exceeded its individual timeout or the overall deadline.
pub const GUARD_TIMEOUT: &str = "GUARD_TIMEOUT";
/// Code for a guard name that has no registration.
pub const GUARD_NOT_REGISTERED: &str = "GUARD_NOT_REGISTERED";

/// Structured failure returned by a guard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuardFailure {
    pub guard: String,
    pub code: String,
    pub message: String,
    #[serde(default)]
    pub remediation_actions: Vec<String>,
}

/// Outcome of one guard: pass, or a typed failure with remediation hints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum GuardResult {
    Passed { guard: String },
    Failed(GuardFailure),
}

impl GuardResult {
    pub fn pass(guard: impl Into<String>) -> Self {
        GuardResult::Passed {
            guard: guard.into(),
        }
    }

    pub fn fail(
        guard: impl Into<String>,
        code: impl Into<String>,
        message: impl Into<String>,
        remediation_actions: Vec<String>,
    ) -> Self {
        GuardResult::Failed(GuardFailure {
            guard: guard.into(),
            code: code.into(),
            message: message.into(),
            remediation_actions,
        })
    }

    pub fn timed_out(guard: impl Into<String>) -> Self {
        let guard = guard.into();
        let message = format!("guard '{guard}' did not answer in time");
        Self::fail(guard, GUARD_TIMEOUT, message, vec!["retry_transition".to_string()])
    }

    pub fn not_registered(guard: impl Into<String>) -> Self {
        let guard = guard.into();
        let message = format!("no guard registered under '{guard}'");
        Self::fail(guard, GUARD_NOT_REGISTERED, message, Vec::new())
    }

    pub fn passed(&self) -> bool {
        matches!(self, GuardResult::Passed { .. })
    }

    pub fn guard(&self) -> &str {
        match self {
            GuardResult::Passed { guard } => guard,
            GuardResult::Failed(failure) => &failure.guard,
        }
    }

    /// `None` when the guard passed.
    pub fn code(&self) -> Option<&str> {
        match self {
            GuardResult::Passed { .. } => None,
            GuardResult::Failed(failure) => Some(&failure.code),
        }
    }

    pub fn failure(&self) -> Option<&GuardFailure> {
        match self {
            GuardResult::Passed { .. } => None,
            GuardResult::Failed(failure) => Some(failure),
        }
    }

    pub fn is_timeout(&self) -> bool {
        self.code() == Some(GUARD_TIMEOUT)
    }
}

/// Everything a guard may look at. Guards read it; they never mutate the instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuardContext {
    pub instance_id: String,
    pub definition_name: String,
    pub from_state: String,
    pub to_state: String,
    pub action: String,
    pub actor: String,
    /// Caller-supplied evidence for this transition.
    #[serde(default)]
    pub evidence: Value,
    /// The instance's opaque domain payload.
    #[serde(default)]
    pub domain_payload: Value,
}

impl GuardContext {
    /// Look a field up in the evidence first, then in the domain payload.
    pub fn lookup(&self, pointer: &str) -> Option<&Value> {
        self.evidence
            .pointer(pointer)
            .filter(|v| !v.is_null())
            .or_else(|| self.domain_payload.pointer(pointer).filter(|v| !v.is_null()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvaluationMode {
    /// Stop at the first failure and cancel the guards still running.
    FailFast,
    /// Wait for every guard and report all results.
    All,
}
