use chrono::{DateTime, Utc};
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use super::calendar::BusinessCalendar;
use super::clock::Clock;
use super::timer::{StageKind, Timer, TimerKey, TimerState, TimerSubject};
use super::{EscalationLedger, FiredEscalation};
use crate::bus::{EventBus, OutboundCommand};
use crate::config::SchedulerSettings;
use crate::definitions::{duration, Edge, EscalationRule, SlaPolicy, WorkflowSla};
use crate::observability::metrics;

/// Action carried by informational target/p95 breach notices.
pub const SLA_BREACHED_ACTION: &str = "sla.breached";
/// Edge a saga's overall SLA timer is keyed on.
pub const SAGA_SLA_EDGE_FROM: &str = "running";
pub const SAGA_SLA_EDGE_TO: &str = "ended";

pub struct SlaScheduler {
    timers: Mutex<HashMap<TimerKey, Timer>>,
    // dispatched idempotency keys, dropped together with their timer
    fired_keys: Mutex<HashMap<TimerKey, HashSet<String>>>,
    // one tick at a time
    dispatch: Mutex<()>,
    calendar: BusinessCalendar,
    clock: Arc<dyn Clock>,
    bus: Arc<dyn EventBus>,
    settings: SchedulerSettings,
}

impl SlaScheduler {
    pub fn new(
        calendar: BusinessCalendar,
        clock: Arc<dyn Clock>,
        bus: Arc<dyn EventBus>,
        settings: SchedulerSettings,
    ) -> Self {
        Self {
            timers: Mutex::new(HashMap::new()),
            fired_keys: Mutex::new(HashMap::new()),
            dispatch: Mutex::new(()),
            calendar,
            clock,
            bus,
            settings,
        }
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn calendar(&self) -> &BusinessCalendar {
        &self.calendar
    }

    /// Arm one timer per policy on an edge leaving `state`. Re-arming an
    /// existing key replaces the old timer.
    pub async fn arm_for_state(
        &self,
        instance_id: &str,
        definition_name: &str,
        state: &str,
        entered_at: DateTime<Utc>,
        version: u64,
        policies: &[Arc<SlaPolicy>],
    ) -> usize {
        let mut armed = 0;
        let mut timers = self.timers.lock().await;
        for policy in policies.iter().filter(|p| p.from_state == state) {
            let timer = self.timer_for_policy(instance_id, definition_name, policy, entered_at, version);
            debug!(
                instance_id = %instance_id,
                edge = %timer.edge,
                next_deadline = ?timer.next_deadline(),
                "Armed SLA timer"
            );
            timers.insert(timer.key(), timer);
            armed += 1;
        }
        armed
    }

    fn timer_for_policy(
        &self,
        instance_id: &str,
        definition_name: &str,
        policy: &SlaPolicy,
        entered_at: DateTime<Utc>,
        version: u64,
    ) -> Timer {
        let deadline = |after| {
            self.calendar
                .deadline(entered_at, after, policy.business_hours_only, policy.cutoff_at)
        };

        let subject = TimerSubject::Instance {
            instance_id: instance_id.to_string(),
            definition_name: definition_name.to_string(),
        };
        let mut timer = Timer::new(subject, policy.edge(), entered_at, version)
            .with_stage(StageKind::TargetBreach, deadline(policy.target_duration));
        if let Some(p95) = policy.p95_duration {
            timer = timer.with_stage(StageKind::P95Breach, deadline(p95));
        }
        for rule in &policy.escalations {
            timer = timer.with_stage(StageKind::Escalation { rule: rule.clone() }, deadline(rule.after));
        }
        timer
    }

    /// Arm the overall execution-time SLA of a saga.
    pub async fn arm_saga(
        &self,
        execution_id: &str,
        workflow_ref: &str,
        started_at: DateTime<Utc>,
        sla: &WorkflowSla,
    ) {
        let rule = EscalationRule::new(sla.total_execution_time, sla.escalation.severity, sla.escalation.action.clone())
            .with_message(sla.escalation.message_template.clone());
        let subject = TimerSubject::Execution {
            execution_id: execution_id.to_string(),
            workflow_ref: workflow_ref.to_string(),
        };
        let deadline = self.calendar.deadline(started_at, sla.total_execution_time, false, None);
        let timer = Timer::new(subject, Edge::new(SAGA_SLA_EDGE_FROM, SAGA_SLA_EDGE_TO), started_at, 0)
            .with_stage(StageKind::Escalation { rule }, deadline);
        debug!(execution_id = %execution_id, deadline = %deadline, "Armed saga SLA timer");
        self.timers.lock().await.insert(timer.key(), timer);
    }

    /// Clear every timer on an edge leaving `state`.
    pub async fn disarm_state(&self, instance_id: &str, state: &str) -> Vec<Timer> {
        self.clear_where(|key| key.subject_id == instance_id && key.edge.from == state)
            .await
    }

    /// Clear every timer of an instance (archival).
    pub async fn disarm_instance(&self, instance_id: &str) -> Vec<Timer> {
        self.clear_where(|key| key.subject_id == instance_id).await
    }

    pub async fn disarm_saga(&self, execution_id: &str) -> Vec<Timer> {
        self.clear_where(|key| key.subject_id == execution_id).await
    }

    async fn clear_where(&self, matches: impl Fn(&TimerKey) -> bool) -> Vec<Timer> {
        let mut timers = self.timers.lock().await;
        let mut fired_keys = self.fired_keys.lock().await;
        let keys: Vec<TimerKey> = timers.keys().filter(|k| matches(k)).cloned().collect();
        let mut cleared = Vec::with_capacity(keys.len());
        for key in keys {
            fired_keys.remove(&key);
            if let Some(mut timer) = timers.remove(&key) {
                debug!(subject = %timer.subject, edge = %timer.edge, "Cleared SLA timer");
                timer.state = TimerState::Cleared;
                cleared.push(timer);
            }
        }
        cleared
    }

    /// Snapshot of the live timers of one subject.
    pub async fn timers_for(&self, subject_id: &str) -> Vec<Timer> {
        let mut timers: Vec<Timer> = self
            .timers
            .lock()
            .await
            .values()
            .filter(|t| t.subject.id() == subject_id)
            .cloned()
            .collect();
        timers.sort_by(|a, b| a.edge.cmp(&b.edge));
        timers
    }

    pub async fn armed_count(&self) -> usize {
        self.timers.lock().await.len()
    }

    /// Earliest unfired deadline across all timers.
    pub async fn next_deadline(&self) -> Option<DateTime<Utc>> {
        self.timers
            .lock()
            .await
            .values()
            .filter_map(Timer::next_deadline)
            .min()
    }

    /// Fire every stage due at `now`. Each stage is recorded through `ledger`
    /// first; stale ones are dropped along with their timer, the rest are
    /// dispatched on the bus. Returns the dispatched stages.
    pub async fn tick(&self, now: DateTime<Utc>, ledger: &dyn EscalationLedger) -> Vec<FiredEscalation> {
        let _serial = self.dispatch.lock().await;

        let due: Vec<FiredEscalation> = {
            let mut timers = self.timers.lock().await;
            let mut due = Vec::new();
            for timer in timers.values_mut() {
                for stage in timer.take_due(now) {
                    due.push(build_fired(timer, &stage.kind, stage.deadline, now, timer.idempotency_key(&stage)));
                }
            }
            due
        };

        let mut dispatched = Vec::with_capacity(due.len());
        for fired in due {
            let first = self
                .fired_keys
                .lock()
                .await
                .entry(fired.timer_key())
                .or_default()
                .insert(fired.idempotency_key.clone());
            if !first {
                debug!(key = %fired.idempotency_key, "Escalation already fired, skipping");
                continue;
            }

            if !ledger.record_escalation(&fired).await {
                info!(
                    subject = %fired.subject,
                    edge = %fired.edge,
                    "Subject left the timed state, dropping stale escalation"
                );
                metrics().record_dropped_escalation();
                self.drop_stale(&fired).await;
                continue;
            }

            if fired.kind.is_breach() {
                metrics().record_sla_breach();
                info!(subject = %fired.subject, edge = %fired.edge, message = %fired.message, "SLA breached");
            } else {
                metrics().record_escalation();
                warn!(
                    subject = %fired.subject,
                    edge = %fired.edge,
                    severity = %fired.severity,
                    action = %fired.action,
                    "Escalation fired"
                );
            }

            self.bus.dispatch(OutboundCommand::new(
                fired.action.clone(),
                json!({
                    "subject": fired.subject,
                    "edge": fired.edge.to_string(),
                    "severity": fired.severity,
                    "message": fired.message,
                    "deadline": fired.deadline,
                }),
                fired.idempotency_key.clone(),
                now,
            ));
            dispatched.push(fired);
        }
        dispatched
    }

    async fn drop_stale(&self, fired: &FiredEscalation) {
        let key = fired.timer_key();
        let mut timers = self.timers.lock().await;
        if timers.get(&key).is_some_and(|t| t.version != fired.version) {
            return;
        }
        timers.remove(&key);
        self.fired_keys.lock().await.remove(&key);
    }

    /// Idempotency keys still held for de-duplication.
    pub async fn fired_key_count(&self) -> usize {
        self.fired_keys.lock().await.values().map(HashSet::len).sum()
    }

    /// Drive `tick` from the clock until `shutdown` flips to true.
    pub async fn run(self: Arc<Self>, ledger: Arc<dyn EscalationLedger>, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.settings.tick_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(tick_ms = self.settings.tick_interval_ms, "SLA scheduler started");

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let now = self.clock.now();
                    self.tick(now, ledger.as_ref()).await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        let armed = self.armed_count().await;
        info!(armed, "SLA scheduler stopped");
    }
}

fn build_fired(
    timer: &Timer,
    kind: &StageKind,
    deadline: DateTime<Utc>,
    now: DateTime<Utc>,
    idempotency_key: String,
) -> FiredEscalation {
    let elapsed = (now - timer.entered_at).to_std().unwrap_or_default();
    let vars = [
        ("instance_id", timer.subject.id().to_string()),
        ("execution_id", timer.subject.id().to_string()),
        ("from", timer.edge.from.clone()),
        ("to", timer.edge.to.clone()),
        ("elapsed", duration::format(&elapsed)),
    ];

    let (action, message) = match kind {
        StageKind::Escalation { rule } => (rule.action.clone(), rule.render_message(&vars)),
        StageKind::TargetBreach | StageKind::P95Breach => {
            let which = if matches!(kind, StageKind::TargetBreach) { "target" } else { "p95" };
            (
                SLA_BREACHED_ACTION.to_string(),
                format!(
                    "{} exceeded the {which} duration on {} after {}",
                    timer.subject,
                    timer.edge,
                    duration::format(&elapsed)
                ),
            )
        }
    };

    FiredEscalation {
        subject: timer.subject.clone(),
        edge: timer.edge.clone(),
        kind: kind.clone(),
        severity: kind.severity(),
        action,
        message,
        deadline,
        fired_at: now,
        idempotency_key,
        version: timer.version,
    }
}

impl std::fmt::Debug for SlaScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlaScheduler")
            .field("calendar", &self.calendar)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::RecordingBus;
    use crate::definitions::{Severity, SlaEscalation};
    use crate::sla::clock::ManualClock;
    use crate::sla::MockEscalationLedger;
    use chrono::TimeZone;
    use std::time::Duration;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 4, 9, 0, 0).unwrap()
    }

    fn hours(h: i64) -> chrono::Duration {
        chrono::Duration::hours(h)
    }

    fn review_policy() -> Arc<SlaPolicy> {
        Arc::new(
            SlaPolicy::new("si", "review", "approved", Duration::from_secs(4 * 3600))
                .with_p95(Duration::from_secs(8 * 3600))
                .escalate(
                    EscalationRule::new(Duration::from_secs(6 * 3600), Severity::Warn, "notify.team_lead")
                        .with_message("SI {instance_id} waiting {elapsed} on {from}->{to}"),
                ),
        )
    }

    fn scheduler(bus: Arc<RecordingBus>) -> SlaScheduler {
        SlaScheduler::new(
            BusinessCalendar::default(),
            Arc::new(ManualClock::new(t0())),
            bus,
            SchedulerSettings::default(),
        )
    }

    fn accepting_ledger() -> MockEscalationLedger {
        let mut ledger = MockEscalationLedger::new();
        ledger.expect_record_escalation().returning(|_| true);
        ledger
    }

    #[tokio::test]
    async fn test_escalation_fires_exactly_once_at_its_deadline() {
        let bus = Arc::new(RecordingBus::new());
        let scheduler = scheduler(Arc::clone(&bus));
        let ledger = accepting_ledger();
        scheduler
            .arm_for_state("SI-1", "si", "review", t0(), 1, &[review_policy()])
            .await;

        assert!(scheduler.tick(t0() + hours(3), &ledger).await.is_empty());

        let breach = scheduler.tick(t0() + hours(4), &ledger).await;
        assert_eq!(breach.len(), 1);
        assert_eq!(breach[0].action, SLA_BREACHED_ACTION);
        assert!(bus.commands_for("notify.team_lead").is_empty());

        let fired = scheduler.tick(t0() + hours(6), &ledger).await;
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].severity, Severity::Warn);
        assert_eq!(fired[0].message, "SI SI-1 waiting 6h on review->approved");
        assert_eq!(
            fired[0].idempotency_key,
            "SI-1:review->approved:2024-03-04T15:00:00+00:00"
        );

        scheduler.tick(t0() + hours(7), &ledger).await;
        assert_eq!(bus.commands_for("notify.team_lead").len(), 1);
        assert_eq!(scheduler.timers_for("SI-1").await[0].state, TimerState::Fired);
    }

    #[tokio::test]
    async fn test_cleared_timer_never_fires() {
        let bus = Arc::new(RecordingBus::new());
        let scheduler = scheduler(Arc::clone(&bus));
        let mut ledger = MockEscalationLedger::new();
        ledger.expect_record_escalation().never();

        scheduler
            .arm_for_state("SI-1", "si", "review", t0(), 1, &[review_policy()])
            .await;
        let cleared = scheduler.disarm_state("SI-1", "review").await;
        assert_eq!(cleared.len(), 1);
        assert_eq!(cleared[0].state, TimerState::Cleared);

        assert!(scheduler.tick(t0() + hours(12), &ledger).await.is_empty());
        assert!(bus.commands().is_empty());
    }

    #[tokio::test]
    async fn test_stale_stage_is_dropped_without_dispatch() {
        let bus = Arc::new(RecordingBus::new());
        let scheduler = scheduler(Arc::clone(&bus));
        let mut ledger = MockEscalationLedger::new();
        ledger.expect_record_escalation().times(1).returning(|_| false);

        scheduler
            .arm_for_state("SI-1", "si", "review", t0(), 1, &[review_policy()])
            .await;
        assert!(scheduler.tick(t0() + hours(4), &ledger).await.is_empty());
        assert!(bus.commands().is_empty());
        assert_eq!(scheduler.armed_count().await, 0);
    }

    #[tokio::test]
    async fn test_policies_for_other_states_are_ignored() {
        let bus = Arc::new(RecordingBus::new());
        let scheduler = scheduler(bus);
        let armed = scheduler
            .arm_for_state("SI-1", "si", "draft", t0(), 1, &[review_policy()])
            .await;
        assert_eq!(armed, 0);
        assert_eq!(scheduler.next_deadline().await, None);
    }

    #[tokio::test]
    async fn test_saga_timer_fires_configured_action() {
        let bus = Arc::new(RecordingBus::new());
        let scheduler = scheduler(Arc::clone(&bus));
        let ledger = accepting_ledger();
        let sla = WorkflowSla {
            total_execution_time: Duration::from_secs(2 * 3600),
            escalation: SlaEscalation {
                action: "notify.booking_desk".to_string(),
                severity: Severity::High,
                message_template: "execution {execution_id} running for {elapsed}".to_string(),
            },
        };
        scheduler.arm_saga("exec-1", "wf@v1", t0(), &sla).await;

        let fired = scheduler.tick(t0() + hours(2), &ledger).await;
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].message, "execution exec-1 running for 2h");
        assert_eq!(bus.commands_for("notify.booking_desk").len(), 1);

        assert_eq!(scheduler.disarm_saga("exec-1").await.len(), 1);
    }

    #[tokio::test]
    async fn test_fired_keys_are_released_with_their_timers() {
        let bus = Arc::new(RecordingBus::new());
        let scheduler = scheduler(Arc::clone(&bus));
        let ledger = accepting_ledger();

        for i in 0..50 {
            let id = format!("SI-{i}");
            scheduler
                .arm_for_state(&id, "si", "review", t0(), 1, &[review_policy()])
                .await;
            assert_eq!(scheduler.tick(t0() + hours(6), &ledger).await.len(), 2);
            scheduler.disarm_state(&id, "review").await;
        }

        assert_eq!(bus.commands_for("notify.team_lead").len(), 50);
        assert_eq!(scheduler.armed_count().await, 0);
        assert_eq!(scheduler.fired_key_count().await, 0);
    }

    #[tokio::test]
    async fn test_rearming_the_same_entry_does_not_refire() {
        let bus = Arc::new(RecordingBus::new());
        let scheduler = scheduler(Arc::clone(&bus));
        let ledger = accepting_ledger();

        scheduler
            .arm_for_state("SI-1", "si", "review", t0(), 1, &[review_policy()])
            .await;
        scheduler.tick(t0() + hours(6), &ledger).await;
        scheduler
            .arm_for_state("SI-1", "si", "review", t0(), 1, &[review_policy()])
            .await;
        assert!(scheduler.tick(t0() + hours(6), &ledger).await.is_empty());
        assert_eq!(bus.commands_for("notify.team_lead").len(), 1);
        assert_eq!(scheduler.fired_key_count().await, 2);
    }

    #[tokio::test]
    async fn test_stale_drop_releases_fired_keys() {
        let bus = Arc::new(RecordingBus::new());
        let scheduler = scheduler(Arc::clone(&bus));
        let mut ledger = MockEscalationLedger::new();
        ledger.expect_record_escalation().returning(|_| false);

        scheduler
            .arm_for_state("SI-1", "si", "review", t0(), 1, &[review_policy()])
            .await;
        // both due stages are stale; the second finds its timer already gone
        assert!(scheduler.tick(t0() + hours(6), &ledger).await.is_empty());
        assert_eq!(scheduler.armed_count().await, 0);
        assert_eq!(scheduler.fired_key_count().await, 0);
    }

    #[test]
    fn test_run_loop_can_be_spawned_on_the_runtime() {
        fn assert_send<T: Send + 'static>(_: &T) {}

        let scheduler = Arc::new(scheduler(Arc::new(RecordingBus::new())));
        let (_tx, rx) = watch::channel(false);
        let run = scheduler.run(Arc::new(accepting_ledger()), rx);
        assert_send(&run);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_loop_stops_on_shutdown() {
        let bus = Arc::new(RecordingBus::new());
        let clock = Arc::new(ManualClock::new(t0()));
        let scheduler = Arc::new(SlaScheduler::new(
            BusinessCalendar::default(),
            clock.clone(),
            bus.clone(),
            SchedulerSettings { tick_interval_ms: 10 },
        ));
        scheduler
            .arm_for_state("SI-1", "si", "review", t0(), 1, &[review_policy()])
            .await;

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(Arc::clone(&scheduler).run(Arc::new(accepting_ledger()), rx));

        clock.advance(Duration::from_secs(6 * 3600));
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();

        assert_eq!(bus.commands_for("notify.team_lead").len(), 1);
    }
}
