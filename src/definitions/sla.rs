//! SLA policies and escalation rules per transition edge

use chrono::NaiveTime;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::time::Duration;

use super::duration;
use crate::errors::{OrchestrationError, OrchestrationResult};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Edge {
    pub from: String,
    pub to: String,
}

impl Edge {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
        }
    }
}

impl fmt::Display for Edge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}->{}", self.from, self.to)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    #[default]
    Warn,
    High,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::Info => "info",
            Severity::Warn => "warn",
            Severity::High => "high",
            Severity::Critical => "critical",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscalationRule {
    /// Measured from the moment the source state was entered.
    #[serde(rename = "after_duration", with = "duration")]
    pub after: Duration,
    #[serde(default)]
    pub severity: Severity,
    pub action: String,
    #[serde(default)]
    pub message_template: String,
}

impl EscalationRule {
    pub fn new(after: Duration, severity: Severity, action: impl Into<String>) -> Self {
        Self {
            after,
            severity,
            action: action.into(),
            message_template: String::new(),
        }
    }

    pub fn with_message(mut self, template: impl Into<String>) -> Self {
        self.message_template = template.into();
        self
    }

    /// Substitute `{name}` placeholders with the given values.
    pub fn render_message(&self, vars: &[(&str, String)]) -> String {
        let mut message = if self.message_template.is_empty() {
            format!("{} escalation: {}", self.severity, self.action)
        } else {
            self.message_template.clone()
        };
        for (name, value) in vars {
            message = message.replace(&format!("{{{name}}}"), value);
        }
        message
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlaPolicy {
    pub definition_name: String,
    pub from_state: String,
    pub to_state: String,
    #[serde(with = "duration")]
    pub target_duration: Duration,
    #[serde(default, with = "duration::option")]
    pub p95_duration: Option<Duration>,
    #[serde(default)]
    pub business_hours_only: bool,
    /// Local time of day after which the clock starts on the next day.
    #[serde(default)]
    pub cutoff_at: Option<NaiveTime>,
    #[serde(default)]
    pub escalations: Vec<EscalationRule>,
}

impl SlaPolicy {
    pub fn new(
        definition_name: impl Into<String>,
        from_state: impl Into<String>,
        to_state: impl Into<String>,
        target_duration: Duration,
    ) -> Self {
        Self {
            definition_name: definition_name.into(),
            from_state: from_state.into(),
            to_state: to_state.into(),
            target_duration,
            p95_duration: None,
            business_hours_only: false,
            cutoff_at: None,
            escalations: Vec::new(),
        }
    }

    pub fn with_p95(mut self, p95: Duration) -> Self {
        self.p95_duration = Some(p95);
        self
    }

    pub fn business_hours(mut self) -> Self {
        self.business_hours_only = true;
        self
    }

    pub fn with_cutoff(mut self, cutoff: NaiveTime) -> Self {
        self.cutoff_at = Some(cutoff);
        self
    }

    pub fn escalate(mut self, rule: EscalationRule) -> Self {
        self.escalations.push(rule);
        self
    }

    pub fn edge(&self) -> Edge {
        Edge::new(self.from_state.clone(), self.to_state.clone())
    }

    pub fn validate(&self) -> OrchestrationResult<()> {
        let invalid = |reason: String| OrchestrationError::InvalidDefinition {
            name: format!("sla:{}:{}", self.definition_name, self.edge()),
            reason,
        };

        if self.target_duration.is_zero() {
            return Err(invalid("target_duration must be positive".to_string()));
        }
        if let Some(p95) = self.p95_duration {
            if p95 < self.target_duration {
                return Err(invalid("p95_duration is shorter than target_duration".to_string()));
            }
        }
        let mut offsets = HashSet::new();
        for rule in &self.escalations {
            if rule.action.is_empty() {
                return Err(invalid("escalation rule without an action".to_string()));
            }
            // one stage per deadline on an edge
            if !offsets.insert(rule.after) {
                return Err(invalid(format!(
                    "two escalation rules fire after {}",
                    duration::format(&rule.after)
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
    fn test_policy_deserializes_with_human_durations() {
        let raw = json!({
            "definition_name": "si",
            "from_state": "review",
            "to_state": "approved",
            "target_duration": "4h",
            "p95_duration": "8h",
            "cutoff_at": "17:00:00",
            "escalations": [
                {"after_duration": "6h", "severity": "warn", "action": "notify.team_lead",
                 "message_template": "SI {instance_id} waiting {elapsed} in review"},
                {"after_duration": 43200, "severity": "critical", "action": "page.ops_manager"}
            ]
        });
        let policy: SlaPolicy = serde_json::from_value(raw).unwrap();
        assert_eq!(policy.target_duration, Duration::from_secs(4 * 3600));
        assert_eq!(policy.p95_duration, Some(Duration::from_secs(8 * 3600)));
        assert_eq!(policy.escalations[1].after, Duration::from_secs(12 * 3600));
        assert_eq!(policy.escalations[1].severity, Severity::Critical);
        assert!(policy.validate().is_ok());
    }

    #[test]
    fn test_p95_shorter_than_target_rejected() {
        let policy = SlaPolicy::new("si", "review", "approved", Duration::from_secs(3600))
            .with_p95(Duration::from_secs(60));
        assert!(policy.validate().is_err());
    }

    #[test]
    fn test_escalations_sharing_an_offset_rejected() {
        let policy = SlaPolicy::new("si", "review", "approved", Duration::from_secs(3600))
            .escalate(EscalationRule::new(Duration::from_secs(7200), Severity::Warn, "notify.team_lead"))
            .escalate(EscalationRule::new(Duration::from_secs(7200), Severity::High, "notify.ops_manager"));

        let err = policy.validate().unwrap_err();
        assert!(err.to_string().contains("two escalation rules fire after 2h"));
    }

    #[test]
    fn test_render_message_substitutes_placeholders() {
        let rule = EscalationRule::new(Duration::from_secs(60), Severity::Warn, "notify")
            .with_message("SI {instance_id} stuck on {edge}");
        let msg = rule.render_message(&[
            ("instance_id", "SI-9".to_string()),
            ("edge", "review->approved".to_string()),
        ]);
        assert_eq!(msg, "SI SI-9 stuck on review->approved");

        let bare = EscalationRule::new(Duration::from_secs(60), Severity::High, "page");
        assert_eq!(bare.render_message(&[]), "high escalation: page");
    }
}
