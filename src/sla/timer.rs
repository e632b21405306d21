use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::definitions::{Edge, EscalationRule, Severity};

/// What a timer watches.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TimerSubject {
    Instance {
        instance_id: String,
        definition_name: String,
    },
    Execution {
        execution_id: String,
        workflow_ref: String,
    },
}

impl TimerSubject {
    pub fn id(&self) -> &str {
        match self {
            TimerSubject::Instance { instance_id, .. } => instance_id,
            TimerSubject::Execution { execution_id, .. } => execution_id,
        }
    }
}

impl fmt::Display for TimerSubject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimerSubject::Instance { instance_id, .. } => write!(f, "instance:{instance_id}"),
            TimerSubject::Execution { execution_id, .. } => write!(f, "execution:{execution_id}"),
        }
    }
}

/// At most one timer exists per key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TimerKey {
    pub subject_id: String,
    pub edge: Edge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimerState {
    Armed,
    Fired,
    Cleared,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StageKind {
    /// `target_duration` elapsed
    TargetBreach,
    /// `p95_duration` elapsed
    P95Breach,
    Escalation { rule: EscalationRule },
}

impl StageKind {
    pub fn is_breach(&self) -> bool {
        !matches!(self, StageKind::Escalation { .. })
    }

    pub fn severity(&self) -> Severity {
        match self {
            StageKind::TargetBreach | StageKind::P95Breach => Severity::Info,
            StageKind::Escalation { rule } => rule.severity,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            StageKind::TargetBreach => "target",
            StageKind::P95Breach => "p95",
            StageKind::Escalation { .. } => "escalation",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimerStage {
    pub kind: StageKind,
    pub deadline: DateTime<Utc>,
    pub fired: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Timer {
    pub subject: TimerSubject,
    pub edge: Edge,
    pub entered_at: DateTime<Utc>,
    /// Subject version when armed; a fired stage for an older version is stale.
    pub version: u64,
    pub state: TimerState,
    pub stages: Vec<TimerStage>,
}

impl Timer {
    pub fn new(subject: TimerSubject, edge: Edge, entered_at: DateTime<Utc>, version: u64) -> Self {
        Self {
            subject,
            edge,
            entered_at,
            version,
            state: TimerState::Armed,
            stages: Vec::new(),
        }
    }

    pub fn with_stage(mut self, kind: StageKind, deadline: DateTime<Utc>) -> Self {
        self.stages.push(TimerStage {
            kind,
            deadline,
            fired: false,
        });
        self.stages.sort_by_key(|stage| stage.deadline);
        self
    }

    pub fn key(&self) -> TimerKey {
        TimerKey {
            subject_id: self.subject.id().to_string(),
            edge: self.edge.clone(),
        }
    }

    /// Earliest deadline not yet fired.
    pub fn next_deadline(&self) -> Option<DateTime<Utc>> {
        self.stages.iter().find(|s| !s.fired).map(|s| s.deadline)
    }

    /// Mark every stage due at `now` as fired and return copies of them.
    pub fn take_due(&mut self, now: DateTime<Utc>) -> Vec<TimerStage> {
        let mut due = Vec::new();
        for stage in self.stages.iter_mut().filter(|s| !s.fired && s.deadline <= now) {
            stage.fired = true;
            due.push(stage.clone());
        }
        if !due.is_empty() {
            self.state = TimerState::Fired;
        }
        due
    }

    /// `subject:from->to:deadline`; breach notices get a suffix so they never
    /// shadow an escalation due at the same instant.
    pub fn idempotency_key(&self, stage: &TimerStage) -> String {
        let base = format!(
            "{}:{}:{}",
            self.subject.id(),
            self.edge,
            stage.deadline.to_rfc3339()
        );
        if stage.kind.is_breach() {
            format!("{base}:{}", stage.kind.label())
        } else {
            base
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::time::Duration;

    fn subject() -> TimerSubject {
        TimerSubject::Instance {
            instance_id: "SI-1".to_string(),
            definition_name: "si".to_string(),
        }
    }

    #[test]
    fn test_stages_fire_once_in_deadline_order() {
        let t0 = Utc.with_ymd_and_hms(2024, 3, 4, 9, 0, 0).unwrap();
        let rule = EscalationRule::new(Duration::from_secs(6 * 3600), Severity::Warn, "notify.lead");
        let mut timer = Timer::new(subject(), Edge::new("review", "approved"), t0, 1)
            .with_stage(StageKind::Escalation { rule }, t0 + chrono::Duration::hours(6))
            .with_stage(StageKind::TargetBreach, t0 + chrono::Duration::hours(4));

        assert_eq!(timer.next_deadline(), Some(t0 + chrono::Duration::hours(4)));
        assert!(timer.take_due(t0 + chrono::Duration::hours(3)).is_empty());
        assert_eq!(timer.state, TimerState::Armed);

        let due = timer.take_due(t0 + chrono::Duration::hours(7));
        assert_eq!(due.len(), 2);
        assert_eq!(timer.state, TimerState::Fired);
        assert!(timer.take_due(t0 + chrono::Duration::hours(8)).is_empty());
        assert_eq!(timer.next_deadline(), None);
    }

    #[test]
    fn test_idempotency_key_format() {
        let t0 = Utc.with_ymd_and_hms(2024, 3, 4, 9, 0, 0).unwrap();
        let timer = Timer::new(subject(), Edge::new("review", "approved"), t0, 1);
        let stage = TimerStage {
            kind: StageKind::Escalation {
                rule: EscalationRule::new(Duration::from_secs(60), Severity::High, "page"),
            },
            deadline: t0,
            fired: false,
        };
        assert_eq!(
            timer.idempotency_key(&stage),
            "SI-1:review->approved:2024-03-04T09:00:00+00:00"
        );

        let breach = TimerStage {
            kind: StageKind::P95Breach,
            ..stage
        };
        assert!(timer.idempotency_key(&breach).ends_with(":p95"));
    }
}
