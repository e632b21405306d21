//! Error taxonomy for the orchestration core
//!
//! Guard and terminal-state failures are local and recoverable by the caller:
//! they carry remediation hints so the caller can fix the input and retry.
//! Step failures are routed to the saga's `on_failure` policy and are never
//! dropped. `SlaBreach` is informational and is only ever reported, never
//! returned from a blocking path.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OrchestrationError {
    #[error("Action '{action}' is not allowed in state '{state}'")]
    InvalidAction { state: String, action: String },

    #[error("No transition for action '{action}' from state '{state}'")]
    UnknownTransition { state: String, action: String },

    #[error("State '{state}' is terminal and only accepts view/archive (got '{action}')")]
    TerminalState { state: String, action: String },

    #[error("Guard '{guard}' rejected entry into '{target}': {code} ({message})")]
    GuardFailed {
        guard: String,
        target: String,
        code: String,
        message: String,
        remediation_actions: Vec<String>,
    },

    #[error("Guard '{guard}' timed out")]
    GuardTimeout { guard: String },

    #[error("Step '{step_id}' timed out after {timeout_ms}ms")]
    StepTimeout { step_id: String, timeout_ms: u64 },

    #[error("Step '{step_id}' failed after {attempts} attempt(s): {last_error}")]
    StepExhaustedRetries {
        step_id: String,
        attempts: u32,
        last_error: String,
    },

    #[error("Compensation '{action}' for step '{step_id}' failed: {reason}")]
    CompensationFailed {
        step_id: String,
        action: String,
        reason: String,
    },

    #[error("SLA breached for {subject}: {detail}")]
    SlaBreach { subject: String, detail: String },

    #[error("Instance not found: {0}")]
    InstanceNotFound(String),

    #[error("Instance already exists: {0}")]
    InstanceExists(String),

    #[error("Saga execution not found: {0}")]
    ExecutionNotFound(String),

    #[error("Definition not found: {0}")]
    DefinitionNotFound(String),

    #[error("Definition already published: {0}")]
    DuplicateDefinition(String),

    #[error("Invalid definition '{name}': {reason}")]
    InvalidDefinition { name: String, reason: String },

    #[error("Input mapping failed for step '{step_id}': {reason}")]
    InputMapping { step_id: String, reason: String },

    #[error("Action not registered: {0}")]
    ActionNotRegistered(String),
}

impl OrchestrationError {
    /// Errors the caller can resolve (using the remediation hints) and retry.
    pub fn is_recoverable_by_caller(&self) -> bool {
        matches!(
            self,
            OrchestrationError::GuardFailed { .. } | OrchestrationError::TerminalState { .. }
        )
    }

    /// Remediation hints attached to a guard failure, empty for everything else.
    pub fn remediation_actions(&self) -> &[String] {
        match self {
            OrchestrationError::GuardFailed {
                remediation_actions,
                ..
            } => remediation_actions,
            _ => &[],
        }
    }

    /// Machine-readable code for the error, used in outbound payloads.
    pub fn code(&self) -> &str {
        match self {
            OrchestrationError::InvalidAction { .. } => "INVALID_ACTION",
            OrchestrationError::UnknownTransition { .. } => "UNKNOWN_TRANSITION",
            OrchestrationError::TerminalState { .. } => "TERMINAL_STATE",
            OrchestrationError::GuardFailed { code, .. } => code,
            OrchestrationError::GuardTimeout { .. } => "GUARD_TIMEOUT",
            OrchestrationError::StepTimeout { .. } => "STEP_TIMEOUT",
            OrchestrationError::StepExhaustedRetries { .. } => "STEP_EXHAUSTED_RETRIES",
            OrchestrationError::CompensationFailed { .. } => "COMPENSATION_FAILED",
            OrchestrationError::SlaBreach { .. } => "SLA_BREACH",
            OrchestrationError::InstanceNotFound(_) => "INSTANCE_NOT_FOUND",
            OrchestrationError::InstanceExists(_) => "INSTANCE_EXISTS",
            OrchestrationError::ExecutionNotFound(_) => "EXECUTION_NOT_FOUND",
            OrchestrationError::DefinitionNotFound(_) => "DEFINITION_NOT_FOUND",
            OrchestrationError::DuplicateDefinition(_) => "DUPLICATE_DEFINITION",
            OrchestrationError::InvalidDefinition { .. } => "INVALID_DEFINITION",
            OrchestrationError::InputMapping { .. } => "INPUT_MAPPING",
            OrchestrationError::ActionNotRegistered(_) => "ACTION_NOT_REGISTERED",
        }
    }
}

/// Result alias for orchestration operations
pub type OrchestrationResult<T> = Result<T, OrchestrationError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guard_failure_is_recoverable_and_exposes_hints() {
        let err = OrchestrationError::GuardFailed {
            guard: "hasRequiredDocs".to_string(),
            target: "review".to_string(),
            code: "MISSING_INVOICE".to_string(),
            message: "commercial invoice not uploaded".to_string(),
            remediation_actions: vec!["upload_commercial_invoice".to_string()],
        };

        assert!(err.is_recoverable_by_caller());
        assert_eq!(err.code(), "MISSING_INVOICE");
        assert_eq!(err.remediation_actions(), ["upload_commercial_invoice"]);
    }

    #[test]
    fn test_step_failures_are_not_caller_recoverable() {
        let err = OrchestrationError::StepExhaustedRetries {
            step_id: "reserve_space".to_string(),
            attempts: 3,
            last_error: "carrier unavailable".to_string(),
        };

        assert!(!err.is_recoverable_by_caller());
        assert!(err.remediation_actions().is_empty());
        assert!(err.to_string().contains("3 attempt(s)"));
    }
}
