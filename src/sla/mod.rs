//! SLA and escalation scheduling
//!
//! Timers are armed when a subject enters a state with outgoing SLA policies
//! (or when a saga with an overall SLA starts) and cleared when it leaves.
//! A single loop drives [`SlaScheduler::tick`] from a [`Clock`].

pub mod calendar;
pub mod clock;
pub mod scheduler;
pub mod timer;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[cfg(test)]
use mockall::automock;

pub use calendar::BusinessCalendar;
pub use clock::{Clock, ManualClock, SystemClock};
pub use scheduler::{SlaScheduler, SAGA_SLA_EDGE_FROM, SAGA_SLA_EDGE_TO, SLA_BREACHED_ACTION};
pub use timer::{StageKind, Timer, TimerKey, TimerStage, TimerState, TimerSubject};

use crate::definitions::{Edge, Severity};

/// A timer stage that came due.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FiredEscalation {
    pub subject: TimerSubject,
    pub edge: Edge,
    pub kind: StageKind,
    pub severity: Severity,
    pub action: String,
    pub message: String,
    pub deadline: DateTime<Utc>,
    pub fired_at: DateTime<Utc>,
    pub idempotency_key: String,
    /// Subject version the timer was armed for.
    pub version: u64,
}

/// History entry written for a fired stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscalationRecord {
    pub edge: Edge,
    pub severity: Severity,
    pub action: String,
    pub message: String,
    pub deadline: DateTime<Utc>,
    pub fired_at: DateTime<Utc>,
    pub idempotency_key: String,
}

impl FiredEscalation {
    /// Key of the timer this stage belongs to.
    pub fn timer_key(&self) -> TimerKey {
        TimerKey {
            subject_id: self.subject.id().to_string(),
            edge: self.edge.clone(),
        }
    }
}

impl From<&FiredEscalation> for EscalationRecord {
    fn from(fired: &FiredEscalation) -> Self {
        Self {
            edge: fired.edge.clone(),
            severity: fired.severity,
            action: fired.action.clone(),
            message: fired.message.clone(),
            deadline: fired.deadline,
            fired_at: fired.fired_at,
            idempotency_key: fired.idempotency_key.clone(),
        }
    }
}

/// Where fired stages are recorded.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait EscalationLedger: Send + Sync {
    /// Record `fired` against its subject. Returns `false` when the subject
    /// has moved on; the stage is then dropped without dispatch.
    async fn record_escalation(&self, fired: &FiredEscalation) -> bool;
}
