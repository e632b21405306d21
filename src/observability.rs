use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Orchestration counters
#[derive(Debug, Default)]
pub struct OrchestrationMetrics {
    pub transitions: AtomicU64,
    pub transitions_rejected: AtomicU64,
    pub guard_failures: AtomicU64,
    pub guard_timeouts: AtomicU64,
    pub escalations_fired: AtomicU64,
    pub escalations_dropped: AtomicU64,
    pub sla_breaches: AtomicU64,
    pub sagas_started: AtomicU64,
    pub sagas_completed: AtomicU64,
    pub sagas_degraded: AtomicU64,
    pub sagas_compensated: AtomicU64,
    pub sagas_failed: AtomicU64,
    pub duplicate_triggers: AtomicU64,
    pub step_retries: AtomicU64,
    pub compensation_failures: AtomicU64,
}

impl OrchestrationMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_transition(&self) {
        self.transitions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected_transition(&self) {
        self.transitions_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_guard_failure(&self) {
        self.guard_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_guard_timeout(&self) {
        self.guard_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_escalation(&self) {
        self.escalations_fired.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped_escalation(&self) {
        self.escalations_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sla_breach(&self) {
        self.sla_breaches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_saga_started(&self) {
        self.sagas_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_saga_outcome(&self, outcome: SagaOutcome) {
        let counter = match outcome {
            SagaOutcome::Completed => &self.sagas_completed,
            SagaOutcome::Degraded => &self.sagas_degraded,
            SagaOutcome::Compensated => &self.sagas_compensated,
            SagaOutcome::Failed => &self.sagas_failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_duplicate_trigger(&self) {
        self.duplicate_triggers.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_step_retry(&self) {
        self.step_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_compensation_failure(&self) {
        self.compensation_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_stats(&self) -> OrchestrationStats {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        OrchestrationStats {
            transitions: load(&self.transitions),
            transitions_rejected: load(&self.transitions_rejected),
            guard_failures: load(&self.guard_failures),
            guard_timeouts: load(&self.guard_timeouts),
            escalations_fired: load(&self.escalations_fired),
            escalations_dropped: load(&self.escalations_dropped),
            sla_breaches: load(&self.sla_breaches),
            sagas_started: load(&self.sagas_started),
            sagas_completed: load(&self.sagas_completed),
            sagas_degraded: load(&self.sagas_degraded),
            sagas_compensated: load(&self.sagas_compensated),
            sagas_failed: load(&self.sagas_failed),
            duplicate_triggers: load(&self.duplicate_triggers),
            step_retries: load(&self.step_retries),
            compensation_failures: load(&self.compensation_failures),
        }
    }

    pub fn log_stats(&self) {
        let stats = self.get_stats();
        info!(
            transitions = stats.transitions,
            rejected = stats.transitions_rejected,
            guard_failures = stats.guard_failures,
            guard_timeouts = stats.guard_timeouts,
            escalations = stats.escalations_fired,
            sla_breaches = stats.sla_breaches,
            sagas_started = stats.sagas_started,
            sagas_completed = stats.sagas_completed,
            sagas_degraded = stats.sagas_degraded,
            sagas_compensated = stats.sagas_compensated,
            sagas_failed = stats.sagas_failed,
            compensation_failures = stats.compensation_failures,
            "Orchestration metrics"
        );
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SagaOutcome {
    Completed,
    Degraded,
    Compensated,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct OrchestrationStats {
    pub transitions: u64,
    pub transitions_rejected: u64,
    pub guard_failures: u64,
    pub guard_timeouts: u64,
    pub escalations_fired: u64,
    pub escalations_dropped: u64,
    pub sla_breaches: u64,
    pub sagas_started: u64,
    pub sagas_completed: u64,
    pub sagas_degraded: u64,
    pub sagas_compensated: u64,
    pub sagas_failed: u64,
    pub duplicate_triggers: u64,
    pub step_retries: u64,
    pub compensation_failures: u64,
}

/// Global metrics instance
static METRICS: std::sync::LazyLock<OrchestrationMetrics> =
    std::sync::LazyLock::new(OrchestrationMetrics::new);

pub fn metrics() -> &'static OrchestrationMetrics {
    &METRICS
}

/// Time an operation and log its duration
pub struct OperationTimer {
    operation: String,
    start: Instant,
}

impl OperationTimer {
    pub fn new(operation: &str) -> Self {
        Self {
            operation: operation.to_string(),
            start: Instant::now(),
        }
    }

    pub fn finish(self) {
        let duration = self.start.elapsed();
        info!(
            operation = %self.operation,
            duration_ms = duration.as_millis() as u64,
            "Operation completed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let metrics = OrchestrationMetrics::new();
        metrics.record_transition();
        metrics.record_transition();
        metrics.record_saga_outcome(SagaOutcome::Degraded);
        metrics.record_saga_outcome(SagaOutcome::Compensated);

        let stats = metrics.get_stats();
        assert_eq!(stats.transitions, 2);
        assert_eq!(stats.sagas_degraded, 1);
        assert_eq!(stats.sagas_compensated, 1);
        assert_eq!(stats.sagas_completed, 0);
    }
}
