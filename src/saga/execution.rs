use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

use crate::sla::EscalationRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Compensating,
    Compensated,
    FailedIrrecoverably,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Compensated | ExecutionStatus::FailedIrrecoverably
        )
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Compensating => "compensating",
            ExecutionStatus::Compensated => "compensated",
            ExecutionStatus::FailedIrrecoverably => "failed_irrecoverably",
        };
        f.write_str(s)
    }
}

/// A step that finished, with what it was given and what it returned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletedStep {
    pub step_id: String,
    pub action: String,
    pub input: Value,
    pub output: Value,
    pub attempts: u32,
    pub completed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepFailure {
    pub step_id: String,
    pub code: String,
    pub message: String,
}

/// One compensation invocation, successful or not.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompensationRecord {
    pub step_id: String,
    pub action: String,
    pub input: Value,
    pub attempts: u32,
    pub succeeded: bool,
    #[serde(default)]
    pub error: Option<String>,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FallbackRecord {
    pub name: String,
    pub action: String,
    pub input: Value,
    #[serde(default)]
    pub output: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaExecution {
    pub execution_id: String,
    pub workflow_ref: String,
    pub workflow_id: String,
    pub workflow_version: u32,
    pub status: ExecutionStatus,
    pub idempotency_key: String,
    pub trigger_event_type: String,
    pub trigger_payload: Value,
    /// In completion order.
    #[serde(default)]
    pub completed_steps: Vec<CompletedStep>,
    #[serde(default)]
    pub failure: Option<StepFailure>,
    /// In invocation order, i.e. reverse completion order.
    #[serde(default)]
    pub compensations: Vec<CompensationRecord>,
    #[serde(default)]
    pub compensation_failures: Vec<CompensationRecord>,
    #[serde(default)]
    pub fallback: Option<FallbackRecord>,
    /// Completed through a fallback instead of the main path.
    #[serde(default)]
    pub degraded: bool,
    #[serde(default)]
    pub escalations: Vec<EscalationRecord>,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
}

impl SagaExecution {
    pub fn step_outputs(&self) -> BTreeMap<String, Value> {
        self.completed_steps
            .iter()
            .map(|step| (step.step_id.clone(), step.output.clone()))
            .collect()
    }

    pub fn completed_step(&self, step_id: &str) -> Option<&CompletedStep> {
        self.completed_steps.iter().find(|s| s.step_id == step_id)
    }

    /// Compensation actions in the order they ran.
    pub fn compensation_order(&self) -> Vec<&str> {
        self.compensations.iter().map(|c| c.step_id.as_str()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_status_serializes_snake_case() {
        assert_eq!(
            serde_json::to_value(ExecutionStatus::FailedIrrecoverably).unwrap(),
            json!("failed_irrecoverably")
        );
        assert!(ExecutionStatus::Compensated.is_terminal());
        assert!(!ExecutionStatus::Compensating.is_terminal());
        assert_eq!(ExecutionStatus::Running.to_string(), "running");
    }
}
