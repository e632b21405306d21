use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::definitions::DefinitionRef;
use crate::guards::GuardResult;
use crate::sla::EscalationRecord;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub from: String,
    pub to: String,
    pub action: String,
    pub at: DateTime<Utc>,
    pub actor: String,
    #[serde(default)]
    pub guard_results: Vec<GuardResult>,
    #[serde(default)]
    pub evidence: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HistoryEntry {
    Transition(TransitionRecord),
    Escalation(EscalationRecord),
}

/// One entity moving through a state machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    pub id: String,
    pub definition_ref: DefinitionRef,
    pub current_state: String,
    /// Bumped on every transition.
    pub version: u64,
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
    #[serde(default)]
    pub domain_payload: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub archived_at: Option<DateTime<Utc>>,
}

impl Instance {
    pub fn new(
        id: impl Into<String>,
        definition_ref: DefinitionRef,
        initial_state: impl Into<String>,
        domain_payload: Value,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            definition_ref,
            current_state: initial_state.into(),
            version: 0,
            history: Vec::new(),
            domain_payload,
            created_at,
            updated_at: created_at,
            archived_at: None,
        }
    }

    pub fn is_archived(&self) -> bool {
        self.archived_at.is_some()
    }

    pub fn transitions(&self) -> impl Iterator<Item = &TransitionRecord> {
        self.history.iter().filter_map(|entry| match entry {
            HistoryEntry::Transition(record) => Some(record),
            HistoryEntry::Escalation(_) => None,
        })
    }

    pub fn escalations(&self) -> impl Iterator<Item = &EscalationRecord> {
        self.history.iter().filter_map(|entry| match entry {
            HistoryEntry::Escalation(record) => Some(record),
            HistoryEntry::Transition(_) => None,
        })
    }

    /// When the current state was entered.
    pub fn entered_current_at(&self) -> DateTime<Utc> {
        self.transitions()
            .last()
            .map(|t| t.at)
            .unwrap_or(self.created_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definitions::{Edge, Severity};
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn test_history_is_split_by_kind() {
        let t0 = Utc.with_ymd_and_hms(2024, 3, 4, 9, 0, 0).unwrap();
        let mut instance = Instance::new("SI-1", DefinitionRef::new("si", 1), "draft", json!({}), t0);
        assert_eq!(instance.entered_current_at(), t0);

        let t1 = t0 + chrono::Duration::minutes(5);
        instance.history.push(HistoryEntry::Transition(TransitionRecord {
            from: "draft".to_string(),
            to: "review".to_string(),
            action: "submit_for_review".to_string(),
            at: t1,
            actor: "alice".to_string(),
            guard_results: vec![GuardResult::pass("hasRequiredDocs")],
            evidence: Value::Null,
        }));
        instance.history.push(HistoryEntry::Escalation(EscalationRecord {
            edge: Edge::new("review", "approved"),
            severity: Severity::Warn,
            action: "notify.team_lead".to_string(),
            message: "late".to_string(),
            deadline: t1,
            fired_at: t1,
            idempotency_key: "k".to_string(),
        }));

        assert_eq!(instance.transitions().count(), 1);
        assert_eq!(instance.escalations().count(), 1);
        assert_eq!(instance.entered_current_at(), t1);

        let value = serde_json::to_value(&instance).unwrap();
        assert_eq!(value["history"][0]["type"], "transition");
        assert_eq!(value["history"][1]["type"], "escalation");
    }
}
