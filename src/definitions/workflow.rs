//! Saga workflow definitions
//!
//! Input mappings and trigger predicates are declarative data: a list of
//! field projections and a small predicate tree over JSON pointers. There is
//! no expression language.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::time::Duration;

use super::duration;
use super::sla::Severity;
use crate::errors::{OrchestrationError, OrchestrationResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    Validation,
    Integration,
    EntityCreate,
    EntityUpdate,
    StateTransition,
    Notification,
}

/// Routing for a step that failed after exhausting its retries.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum OnFailure {
    #[default]
    Compensate,
    Fallback(String),
}

impl fmt::Display for OnFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OnFailure::Compensate => f.write_str("compensate"),
            OnFailure::Fallback(name) => write!(f, "fallback:{name}"),
        }
    }
}

impl std::str::FromStr for OnFailure {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "compensate" => Ok(OnFailure::Compensate),
            other => match other.strip_prefix("fallback:") {
                Some(name) if !name.is_empty() => Ok(OnFailure::Fallback(name.to_string())),
                _ => Err(format!(
                    "on_failure must be 'compensate' or 'fallback:<name>', got '{other}'"
                )),
            },
        }
    }
}

impl Serialize for OnFailure {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for OnFailure {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Predicate over the trigger payload, addressed with JSON pointers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum TriggerPredicate {
    Equals { pointer: String, value: Value },
    Exists { pointer: String },
    All { predicates: Vec<TriggerPredicate> },
    Any { predicates: Vec<TriggerPredicate> },
    Not { predicate: Box<TriggerPredicate> },
}

impl TriggerPredicate {
    pub fn matches(&self, payload: &Value) -> bool {
        match self {
            TriggerPredicate::Equals { pointer, value } => payload.pointer(pointer) == Some(value),
            TriggerPredicate::Exists { pointer } => payload
                .pointer(pointer)
                .map(|v| !v.is_null())
                .unwrap_or(false),
            TriggerPredicate::All { predicates } => predicates.iter().all(|p| p.matches(payload)),
            TriggerPredicate::Any { predicates } => predicates.iter().any(|p| p.matches(payload)),
            TriggerPredicate::Not { predicate } => !predicate.matches(payload),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trigger {
    pub event_type: String,
    #[serde(default)]
    pub predicate: Option<TriggerPredicate>,
}

impl Trigger {
    pub fn on(event_type: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            predicate: None,
        }
    }

    pub fn when(mut self, predicate: TriggerPredicate) -> Self {
        self.predicate = Some(predicate);
        self
    }

    pub fn matches(&self, event_type: &str, payload: &Value) -> bool {
        self.event_type == event_type
            && self
                .predicate
                .as_ref()
                .map(|p| p.matches(payload))
                .unwrap_or(true)
    }
}

/// Where a projected field takes its value from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "from", rename_all = "snake_case")]
pub enum ProjectionSource {
    Trigger { pointer: String },
    Step { step_id: String, pointer: String },
    Literal { value: Value },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldProjection {
    pub field: String,
    pub source: ProjectionSource,
    /// When set, a missing source value yields `null` instead of an error.
    #[serde(default)]
    pub optional: bool,
}

/// Ordered field projections building a step's input object.
///
/// An empty mapping passes the trigger payload through unchanged.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InputMapping(pub Vec<FieldProjection>);

impl InputMapping {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_trigger(mut self, field: impl Into<String>, pointer: impl Into<String>) -> Self {
        self.0.push(FieldProjection {
            field: field.into(),
            source: ProjectionSource::Trigger {
                pointer: pointer.into(),
            },
            optional: false,
        });
        self
    }

    pub fn from_step(
        mut self,
        field: impl Into<String>,
        step_id: impl Into<String>,
        pointer: impl Into<String>,
    ) -> Self {
        self.0.push(FieldProjection {
            field: field.into(),
            source: ProjectionSource::Step {
                step_id: step_id.into(),
                pointer: pointer.into(),
            },
            optional: false,
        });
        self
    }

    pub fn literal(mut self, field: impl Into<String>, value: Value) -> Self {
        self.0.push(FieldProjection {
            field: field.into(),
            source: ProjectionSource::Literal { value },
            optional: false,
        });
        self
    }

    /// Apply the projections to the trigger payload and prior step outputs.
    pub fn project(
        &self,
        step_id: &str,
        trigger_payload: &Value,
        step_outputs: &BTreeMap<String, Value>,
    ) -> OrchestrationResult<Value> {
        if self.0.is_empty() {
            return Ok(trigger_payload.clone());
        }

        let mut input = Map::new();
        for projection in &self.0 {
            let resolved = match &projection.source {
                ProjectionSource::Trigger { pointer } => trigger_payload.pointer(pointer).cloned(),
                ProjectionSource::Step {
                    step_id: source,
                    pointer,
                } => step_outputs
                    .get(source)
                    .and_then(|output| output.pointer(pointer))
                    .cloned(),
                ProjectionSource::Literal { value } => Some(value.clone()),
            };

            match resolved {
                Some(value) => {
                    input.insert(projection.field.clone(), value);
                }
                None if projection.optional => {
                    input.insert(projection.field.clone(), Value::Null);
                }
                None => {
                    return Err(OrchestrationError::InputMapping {
                        step_id: step_id.to_string(),
                        reason: format!(
                            "field '{}' has no value at {}",
                            projection.field,
                            describe_source(&projection.source)
                        ),
                    })
                }
            }
        }
        Ok(Value::Object(input))
    }

    fn referenced_steps(&self) -> impl Iterator<Item = &str> {
        self.0.iter().filter_map(|p| match &p.source {
            ProjectionSource::Step { step_id, .. } => Some(step_id.as_str()),
            _ => None,
        })
    }
}

fn describe_source(source: &ProjectionSource) -> String {
    match source {
        ProjectionSource::Trigger { pointer } => format!("trigger{pointer}"),
        ProjectionSource::Step { step_id, pointer } => format!("steps.{step_id}{pointer}"),
        ProjectionSource::Literal { .. } => "literal".to_string(),
    }
}

fn default_step_timeout() -> Duration {
    Duration::from_secs(30)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub step_id: String,
    #[serde(rename = "type")]
    pub step_type: StepType,
    pub action: String,
    #[serde(default)]
    pub input_mapping: InputMapping,
    #[serde(default = "default_step_timeout", with = "duration")]
    pub timeout: Duration,
    /// Retries after the first attempt.
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub on_failure: OnFailure,
    #[serde(default)]
    pub compensation: Option<String>,
}

impl WorkflowStep {
    pub fn new(step_id: impl Into<String>, step_type: StepType, action: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into(),
            step_type,
            action: action.into(),
            input_mapping: InputMapping::default(),
            timeout: default_step_timeout(),
            retry_count: 0,
            on_failure: OnFailure::Compensate,
            compensation: None,
        }
    }

    pub fn with_mapping(mut self, mapping: InputMapping) -> Self {
        self.input_mapping = mapping;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retries(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }

    pub fn on_failure(mut self, on_failure: OnFailure) -> Self {
        self.on_failure = on_failure;
        self
    }

    pub fn compensated_by(mut self, action: impl Into<String>) -> Self {
        self.compensation = Some(action.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FallbackAction {
    pub action: String,
    #[serde(default)]
    pub input_mapping: InputMapping,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlaEscalation {
    pub action: String,
    #[serde(default)]
    pub severity: Severity,
    #[serde(default)]
    pub message_template: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSla {
    #[serde(with = "duration")]
    pub total_execution_time: Duration,
    pub escalation: SlaEscalation,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub workflow_id: String,
    pub version: u32,
    pub trigger: Trigger,
    pub steps: Vec<WorkflowStep>,
    /// Compensation actions keyed by step id, for steps that don't name one inline.
    #[serde(default)]
    pub compensations: BTreeMap<String, String>,
    #[serde(default)]
    pub fallback_actions: BTreeMap<String, FallbackAction>,
    #[serde(default)]
    pub sla: Option<WorkflowSla>,
}

impl WorkflowDefinition {
    pub fn new(workflow_id: impl Into<String>, version: u32, trigger: Trigger) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            version,
            trigger,
            steps: Vec::new(),
            compensations: BTreeMap::new(),
            fallback_actions: BTreeMap::new(),
            sla: None,
        }
    }

    pub fn step(mut self, step: WorkflowStep) -> Self {
        self.steps.push(step);
        self
    }

    pub fn fallback(mut self, name: impl Into<String>, action: FallbackAction) -> Self {
        self.fallback_actions.insert(name.into(), action);
        self
    }

    pub fn with_sla(mut self, sla: WorkflowSla) -> Self {
        self.sla = Some(sla);
        self
    }

    pub fn reference(&self) -> String {
        format!("{}@v{}", self.workflow_id, self.version)
    }

    /// The compensation action for `step`, inline declaration first.
    pub fn compensation_for<'a>(&'a self, step: &'a WorkflowStep) -> Option<&'a str> {
        step.compensation
            .as_deref()
            .or_else(|| self.compensations.get(&step.step_id).map(String::as_str))
    }

    pub fn validate(&self) -> OrchestrationResult<()> {
        let invalid = |reason: String| OrchestrationError::InvalidDefinition {
            name: self.reference(),
            reason,
        };

        if self.steps.is_empty() {
            return Err(invalid("workflow has no steps".to_string()));
        }

        let mut earlier: HashSet<&str> = HashSet::new();
        for step in &self.steps {
            for source in step.input_mapping.referenced_steps() {
                if !earlier.contains(source) {
                    return Err(invalid(format!(
                        "step '{}' maps from '{}' which does not run before it",
                        step.step_id, source
                    )));
                }
            }
            if let OnFailure::Fallback(name) = &step.on_failure {
                if !self.fallback_actions.contains_key(name) {
                    return Err(invalid(format!(
                        "step '{}' routes failures to unknown fallback '{}'",
                        step.step_id, name
                    )));
                }
            }
            if !earlier.insert(step.step_id.as_str()) {
                return Err(invalid(format!("duplicate step '{}'", step.step_id)));
            }
        }

        for step_id in self.compensations.keys() {
            if !earlier.contains(step_id.as_str()) {
                return Err(invalid(format!(
                    "compensation declared for unknown step '{step_id}'"
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_on_failure_parsing() {
        assert_eq!("compensate".parse::<OnFailure>().unwrap(), OnFailure::Compensate);
        assert_eq!(
            "fallback:create_manual_task".parse::<OnFailure>().unwrap(),
            OnFailure::Fallback("create_manual_task".to_string())
        );
        assert!("fallback:".parse::<OnFailure>().is_err());
        assert!("retry".parse::<OnFailure>().is_err());
    }

    #[test]
    fn test_trigger_predicate_matching() {
        let trigger = Trigger::on("si.approved").when(TriggerPredicate::All {
            predicates: vec![
                TriggerPredicate::Equals {
                    pointer: "/mode".to_string(),
                    value: json!("ocean"),
                },
                TriggerPredicate::Not {
                    predicate: Box::new(TriggerPredicate::Exists {
                        pointer: "/booking_id".to_string(),
                    }),
                },
            ],
        });

        assert!(trigger.matches("si.approved", &json!({"mode": "ocean"})));
        assert!(!trigger.matches("si.approved", &json!({"mode": "air"})));
        assert!(!trigger.matches("si.approved", &json!({"mode": "ocean", "booking_id": "B1"})));
        assert!(!trigger.matches("si.rejected", &json!({"mode": "ocean"})));
    }

    #[test]
    fn test_projection_from_trigger_and_prior_steps() {
        let mapping = InputMapping::new()
            .from_trigger("si_id", "/si_id")
            .from_step("booking_id", "create_booking", "/booking_id")
            .literal("source", json!("saga"));

        let mut outputs = BTreeMap::new();
        outputs.insert("create_booking".to_string(), json!({"booking_id": "BK-7"}));

        let input = mapping
            .project("reserve_space", &json!({"si_id": "SI-1"}), &outputs)
            .unwrap();
        assert_eq!(input, json!({"si_id": "SI-1", "booking_id": "BK-7", "source": "saga"}));
    }

    #[test]
    fn test_missing_projection_source_is_an_error() {
        let mapping = InputMapping::new().from_step("booking_id", "create_booking", "/booking_id");
        let err = mapping
            .project("reserve_space", &json!({}), &BTreeMap::new())
            .unwrap_err();
        assert!(matches!(err, OrchestrationError::InputMapping { ref step_id, .. } if step_id == "reserve_space"));
    }

    #[test]
    fn test_validate_rejects_forward_references() {
        let wf = WorkflowDefinition::new("wf", 1, Trigger::on("x"))
            .step(
                WorkflowStep::new("a", StepType::Validation, "validate")
                    .with_mapping(InputMapping::new().from_step("id", "b", "/id")),
            )
            .step(WorkflowStep::new("b", StepType::Integration, "call"));
        assert!(wf.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_unknown_fallback() {
        let wf = WorkflowDefinition::new("wf", 1, Trigger::on("x")).step(
            WorkflowStep::new("a", StepType::Integration, "call")
                .on_failure(OnFailure::Fallback("manual".to_string())),
        );
        assert!(wf.validate().is_err());
    }

    #[test]
    fn test_workflow_deserializes_from_json() {
        let raw = json!({
            "workflow_id": "wf_si_to_booking",
            "version": 1,
            "trigger": {"event_type": "si.approved"},
            "steps": [
                {"step_id": "create_booking", "type": "entity_create", "action": "booking.create",
                 "timeout": "10s", "retry_count": 2},
                {"step_id": "reserve_space", "type": "integration", "action": "carrier.reserve",
                 "input_mapping": [
                    {"field": "booking_id", "source": {"from": "step", "step_id": "create_booking", "pointer": "/booking_id"}}
                 ],
                 "on_failure": "fallback:manual_task"}
            ],
            "compensations": {"create_booking": "cancel_booking_record"},
            "fallback_actions": {"manual_task": {"action": "tasks.create_manual"}},
            "sla": {"total_execution_time": "15m", "escalation": {"action": "notify.ops"}}
        });
        let wf: WorkflowDefinition = serde_json::from_value(raw).unwrap();
        assert!(wf.validate().is_ok());
        assert_eq!(wf.steps[0].timeout, Duration::from_secs(10));
        assert_eq!(wf.compensation_for(&wf.steps[0]), Some("cancel_booking_record"));
        assert_eq!(wf.compensation_for(&wf.steps[1]), None);
        assert_eq!(wf.steps[1].on_failure, OnFailure::Fallback("manual_task".to_string()));
    }
}
