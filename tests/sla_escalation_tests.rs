//! SLA timers driven through a manual clock

use chrono::Duration as ChronoDuration;
use serde_json::json;
use shipflow::definitions::Severity;
use shipflow::saga::ActionRegistry;
use shipflow::sla::SLA_BREACHED_ACTION;
use shipflow::Clock;
use std::sync::Arc;
use std::time::Duration;

mod fixtures;
use fixtures::*;

const HOUR: u64 = 3600;

async fn in_review(id: &str) -> TestCore {
    let t = core_with(Arc::new(ActionRegistry::new())).await;
    t.core
        .engine
        .create_instance(&si_ref(), Some(id.to_string()), complete_docs())
        .await
        .unwrap();
    t.core
        .engine
        .transition(id, "submit_for_review", "alice", json!({}))
        .await
        .unwrap();
    t
}

#[tokio::test]
async fn test_review_wait_escalates_to_team_lead_at_six_hours() {
    let t = in_review("SI-10").await;

    t.clock.advance(Duration::from_secs(6 * HOUR - 60));
    let early = t.core.tick().await;
    assert!(t.bus.commands_for("notify.team_lead").is_empty());
    // target and p95 breaches are informational notices
    assert_eq!(early.len(), 2);
    assert!(early.iter().all(|f| f.kind.is_breach() && f.severity == Severity::Info));
    assert_eq!(t.bus.commands_for(SLA_BREACHED_ACTION).len(), 2);

    t.clock.advance(Duration::from_secs(60));
    let fired = t.core.tick().await;
    assert_eq!(fired.len(), 1);
    assert_eq!(fired[0].action, "notify.team_lead");
    assert_eq!(fired[0].severity, Severity::Warn);
    assert_eq!(fired[0].deadline, t0() + ChronoDuration::hours(6));

    let escalations = t.bus.commands_for("notify.team_lead");
    assert_eq!(escalations.len(), 1);
    assert_eq!(escalations[0].input["severity"], "warn");

    // a second tick at the same instant fires nothing
    assert!(t.core.tick().await.is_empty());
    assert_eq!(t.bus.commands_for("notify.team_lead").len(), 1);

    let instance = t.core.engine.get_instance("SI-10").await.unwrap();
    let recorded: Vec<_> = instance.escalations().map(|e| e.action.as_str()).collect();
    assert!(recorded.contains(&"notify.team_lead"));
    // escalations never move the instance
    assert_eq!(instance.current_state, "review");
    assert_eq!(instance.version, 1);
}

#[tokio::test]
async fn test_leaving_the_state_cancels_pending_escalations() {
    let t = in_review("SI-11").await;

    t.clock.advance(Duration::from_secs(2 * HOUR));
    t.core
        .engine
        .transition("SI-11", "reject", "bob", json!({}))
        .await
        .unwrap();

    t.clock.advance(Duration::from_secs(30 * HOUR));
    t.core.tick().await;
    assert!(t.bus.commands_for("notify.team_lead").is_empty());
    assert!(t.bus.commands_for("notify.ops_manager").is_empty());
    assert!(t
        .core
        .scheduler
        .timers_for("SI-11")
        .await
        .iter()
        .all(|timer| timer.edge.from == "draft"));
}

#[tokio::test]
async fn test_critical_escalation_follows_the_warning() {
    let t = in_review("SI-12").await;

    t.clock.advance(Duration::from_secs(25 * HOUR));
    let fired = t.core.tick().await;
    let actions: Vec<&str> = fired.iter().map(|f| f.action.as_str()).collect();
    assert!(actions.contains(&"notify.team_lead"));
    assert!(actions.contains(&"notify.ops_manager"));
    assert_eq!(t.core.scheduler.next_deadline().await, None);
}

#[tokio::test]
async fn test_draft_clock_counts_business_hours_from_cutoff() {
    let t = core_with(Arc::new(ActionRegistry::new())).await;
    // Friday after the 17:00 cutoff: the clock starts Monday morning
    let friday_evening = t0() + ChronoDuration::days(4) + ChronoDuration::hours(9);
    t.clock.set(friday_evening);
    t.core
        .engine
        .create_instance(&si_ref(), Some("SI-13".to_string()), json!({}))
        .await
        .unwrap();

    let deadline = t.core.scheduler.next_deadline().await.unwrap();
    assert!(deadline > friday_evening + ChronoDuration::days(2));

    t.clock.set(deadline - ChronoDuration::minutes(1));
    assert!(t.core.tick().await.is_empty());
    t.clock.set(deadline);
    let fired = t.core.tick().await;
    assert_eq!(fired.len(), 1);
    assert!(fired[0].kind.is_breach());
    assert_eq!(t.clock.now(), deadline);
}
