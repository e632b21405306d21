//! Shared fixtures: the shipping-instruction bundle from `demos/`, a core on
//! a manual clock, and saga actions that record every call.

#![allow(dead_code)]

use anyhow::anyhow;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::{json, Value};
use shipflow::bus::RecordingBus;
use shipflow::config::ShipflowConfig;
use shipflow::definitions::{DefinitionBundle, DefinitionRef};
use shipflow::runtime::ProcessCore;
use shipflow::saga::{ActionRegistry, FnAction};
use shipflow::ManualClock;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

pub const SI_BUNDLE: &str = "demos/shipping_instruction.json";

pub fn si_bundle() -> DefinitionBundle {
    let path = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join(SI_BUNDLE);
    DefinitionBundle::from_path(path).expect("demo bundle parses")
}

pub fn si_ref() -> DefinitionRef {
    DefinitionRef::new("si", 1)
}

/// Monday 2024-03-04 09:00 UTC
pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 4, 9, 0, 0).unwrap()
}

pub fn complete_docs() -> Value {
    json!({
        "documents": ["commercial_invoice", "packing_list"],
        "parties": {
            "shipper": { "verified": true },
            "consignee": { "verified": true }
        }
    })
}

pub fn fast_config() -> ShipflowConfig {
    let mut config = ShipflowConfig::default();
    config.sagas.backoff_base_ms = 10;
    config.sagas.backoff_max_ms = 50;
    config.sagas.jitter = false;
    config
}

/// Every saga action invocation, in order.
#[derive(Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<(String, Value)>>>);

impl CallLog {
    pub fn record(&self, name: &str, input: &Value) {
        self.0.lock().unwrap().push((name.to_string(), input.clone()));
    }

    pub fn names(&self) -> Vec<String> {
        self.0.lock().unwrap().iter().map(|(n, _)| n.clone()).collect()
    }

    pub fn inputs_to(&self, name: &str) -> Vec<Value> {
        self.0
            .lock()
            .unwrap()
            .iter()
            .filter(|(n, _)| n == name)
            .map(|(_, input)| input.clone())
            .collect()
    }
}

/// How each named action should behave.
#[derive(Clone)]
pub enum Behaviour {
    Return(Value),
    Fail(&'static str),
}

pub async fn register(actions: &ActionRegistry, log: &CallLog, name: &'static str, behaviour: Behaviour) {
    let log = log.clone();
    actions
        .register(
            name,
            Arc::new(FnAction::new(move |input: Value| {
                log.record(name, &input);
                let behaviour = behaviour.clone();
                async move {
                    match behaviour {
                        Behaviour::Return(value) => Ok(value),
                        Behaviour::Fail(reason) => Err(anyhow!(reason)),
                    }
                }
            })),
        )
        .await;
}

/// Actions for `wf_si_to_booking` where everything succeeds.
pub async fn booking_actions(log: &CallLog) -> Arc<ActionRegistry> {
    let actions = Arc::new(ActionRegistry::new());
    register(&actions, log, "validate_si", Behaviour::Return(json!({"valid": true}))).await;
    register(
        &actions,
        log,
        "create_booking_record",
        Behaviour::Return(json!({"booking_id": "BK-1001", "booking_ref": "BK-1001"})),
    )
    .await;
    register(&actions, log, "reserve_carrier_space", Behaviour::Return(json!({"reservation_id": "RS-77"}))).await;
    register(&actions, log, "request_vgm", Behaviour::Return(json!({"vgm_kg": 18250}))).await;
    register(&actions, log, "create_manual_task", Behaviour::Return(json!({"task_id": "TASK-5"}))).await;
    register(&actions, log, "cancel_booking_record", Behaviour::Return(json!({"cancelled": true}))).await;
    register(&actions, log, "release_carrier_space", Behaviour::Return(json!({"released": true}))).await;
    actions
}

pub struct TestCore {
    pub core: ProcessCore,
    pub bus: Arc<RecordingBus>,
    pub clock: Arc<ManualClock>,
}

pub async fn core_with(actions: Arc<ActionRegistry>) -> TestCore {
    let bus = Arc::new(RecordingBus::new());
    let clock = Arc::new(ManualClock::new(t0()));
    let core = ProcessCore::builder(fast_config(), bus.clone())
        .clock(clock.clone())
        .actions(actions)
        .build()
        .await;
    core.load_definitions(si_bundle()).await.expect("demo bundle publishes");
    TestCore { core, bus, clock }
}
