//! Line-delimited JSON session
//!
//! Each stdin line is one request, tagged by `op`. Every request gets exactly
//! one `response` line; domain events and outbound commands produced along the
//! way are written as `event` / `command` lines as they happen.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use shipflow::bus::ChannelBus;
use shipflow::definitions::{DefinitionBundle, DefinitionRef};
use shipflow::errors::OrchestrationError;
use shipflow::runtime::ProcessCore;
use shipflow::saga::{ActionRegistry, EchoAction};
use shipflow::{Clock, DomainEvent, ManualClock, ShipflowConfig, ShutdownCoordinator};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum SessionRequest {
    Create {
        /// `name` for the latest version or `name@vN`
        definition: String,
        #[serde(default)]
        id: Option<String>,
        #[serde(default)]
        payload: Value,
    },
    Transition {
        instance_id: String,
        action: String,
        #[serde(default = "default_actor")]
        actor: String,
        #[serde(default)]
        evidence: Value,
    },
    Event {
        event_type: String,
        #[serde(default)]
        payload: Value,
        #[serde(default)]
        idempotency_key: Option<String>,
    },
    Get {
        instance_id: String,
    },
    List,
    Execution {
        execution_id: String,
    },
    Tick,
    Advance {
        seconds: u64,
    },
    Stats,
}

fn default_actor() -> String {
    "cli".to_string()
}

/// One output line.
#[derive(Debug, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SessionLine {
    Response {
        ok: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<Value>,
    },
    Event {
        event: DomainEvent,
    },
    Command {
        command: shipflow::OutboundCommand,
    },
}

impl SessionLine {
    fn ok(result: Value) -> Self {
        SessionLine::Response {
            ok: true,
            result: Some(result),
            error: None,
        }
    }

    fn failed(error: Value) -> Self {
        SessionLine::Response {
            ok: false,
            result: None,
            error: Some(error),
        }
    }
}

pub struct RunCommand {
    pub definitions: PathBuf,
    pub settings: ShipflowConfig,
    pub dry_run_actions: bool,
    pub manual_clock: Option<String>,
}

impl RunCommand {
    pub fn new(definitions: PathBuf) -> Self {
        Self {
            definitions,
            settings: ShipflowConfig::default(),
            dry_run_actions: false,
            manual_clock: None,
        }
    }

    pub fn with_settings(mut self, settings: ShipflowConfig) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_dry_run_actions(mut self, dry_run_actions: bool) -> Self {
        self.dry_run_actions = dry_run_actions;
        self
    }

    pub fn with_manual_clock(mut self, start: Option<String>) -> Self {
        self.manual_clock = start;
        self
    }

    pub async fn execute(&self) -> Result<()> {
        let settings = self.settings.clone();
        let bundle = DefinitionBundle::from_path(&self.definitions)?;

        let manual_clock = match &self.manual_clock {
            Some(start) => {
                let start = DateTime::parse_from_rfc3339(start)
                    .with_context(|| format!("Invalid --manual-clock instant '{start}'"))?
                    .with_timezone(&Utc);
                Some(Arc::new(ManualClock::new(start)))
            }
            None => None,
        };

        let (bus, mut receivers) = ChannelBus::new();
        let actions = if self.dry_run_actions {
            ActionRegistry::with_default(Arc::new(EchoAction))
        } else {
            ActionRegistry::new()
        };
        let mut builder = ProcessCore::builder(settings.clone(), Arc::new(bus)).actions(Arc::new(actions));
        if let Some(clock) = &manual_clock {
            builder = builder.clock(clock.clone());
        }
        #[cfg(feature = "database")]
        let sqlite = match &settings.database {
            Some(db) => {
                let store = Arc::new(shipflow::SqliteAuditStore::connect(db).await?);
                builder = builder.audit(store.clone());
                Some(store)
            }
            None => None,
        };
        let core = builder.build().await;

        let summary = core.load_definitions(bundle).await?;
        info!(
            state_machines = summary.state_machines.len(),
            workflows = summary.workflows.len(),
            "Definitions loaded"
        );

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<SessionLine>();
        let writer = tokio::spawn(async move {
            let mut stdout = tokio::io::stdout();
            while let Some(line) = out_rx.recv().await {
                let Ok(mut text) = serde_json::to_string(&line) else {
                    continue;
                };
                text.push('\n');
                if stdout.write_all(text.as_bytes()).await.is_err() {
                    break;
                }
                let _ = stdout.flush().await;
            }
        });

        let mut shutdown = ShutdownCoordinator::new();
        if manual_clock.is_none() {
            shutdown.track("scheduler", core.spawn_scheduler(shutdown.subscribe()));
        }
        let event_tx = out_tx.clone();
        shutdown.track(
            "event_pump",
            core.spawn_event_pump(receivers.events, shutdown.subscribe(), move |event| {
                let _ = event_tx.send(SessionLine::Event { event: event.clone() });
            }),
        );
        let command_tx = out_tx.clone();
        // outlives the pump so commands dispatched while sagas drain still get out
        let (stop_forwarding, mut stop_commands) = watch::channel(false);
        let forwarder = tokio::spawn(async move {
            loop {
                tokio::select! {
                    received = receivers.commands.recv() => {
                        let Some(command) = received else { break };
                        let _ = command_tx.send(SessionLine::Command { command });
                    }
                    _ = stop_commands.changed() => break,
                }
            }
            while let Ok(command) = receivers.commands.try_recv() {
                let _ = command_tx.send(SessionLine::Command { command });
            }
        });

        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        let interrupted = ShutdownCoordinator::wait_for_signal();
        tokio::pin!(interrupted);
        loop {
            let line = tokio::select! {
                next = lines.next_line() => match next? {
                    Some(line) => line,
                    None => break,
                },
                _ = &mut interrupted => {
                    info!("Interrupted, ending session");
                    break;
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            let response = match serde_json::from_str::<SessionRequest>(&line) {
                Ok(request) => handle(&core, manual_clock.as_deref(), request).await,
                Err(e) => SessionLine::failed(json!({"code": "BAD_REQUEST", "message": e.to_string()})),
            };
            if out_tx.send(response).is_err() {
                warn!("Output closed, ending session");
                break;
            }
        }

        shutdown.shutdown(Duration::from_secs(5)).await;
        stop_forwarding.send_replace(true);
        let _ = forwarder.await;
        #[cfg(feature = "database")]
        {
            if let Some(store) = sqlite {
                store.shutdown().await;
            }
        }
        drop(out_tx);
        let _ = writer.await;
        Ok(())
    }
}

async fn handle(core: &ProcessCore, clock: Option<&ManualClock>, request: SessionRequest) -> SessionLine {
    let result: Result<Value, OrchestrationError> = match request {
        SessionRequest::Create {
            definition,
            id,
            payload,
        } => match resolve_definition(core, &definition).await {
            Ok(reference) => core
                .engine
                .create_instance(&reference, id, payload)
                .await
                .map(|instance| json!(instance)),
            Err(e) => Err(e),
        },
        SessionRequest::Transition {
            instance_id,
            action,
            actor,
            evidence,
        } => core
            .engine
            .transition(&instance_id, &action, &actor, evidence)
            .await
            .map(|instance| json!(instance)),
        SessionRequest::Event {
            event_type,
            payload,
            idempotency_key,
        } => {
            let mut event = DomainEvent::new(event_type, payload).at(core.scheduler.clock().now());
            if let Some(key) = idempotency_key {
                event = event.with_idempotency_key(key);
            }
            let outcomes = core.orchestrator.handle_event(&event).await;
            let executions: Vec<Value> = outcomes
                .iter()
                .map(|outcome| match outcome {
                    shipflow::saga::TriggerOutcome::Started(execution) => json!({
                        "execution_id": execution.execution_id,
                        "workflow": execution.workflow_ref,
                        "status": execution.status,
                        "degraded": execution.degraded,
                    }),
                    shipflow::saga::TriggerOutcome::Duplicate {
                        workflow_ref,
                        execution_id,
                    } => json!({
                        "execution_id": execution_id,
                        "workflow": workflow_ref,
                        "duplicate": true,
                    }),
                })
                .collect();
            Ok(json!({ "executions": executions }))
        }
        SessionRequest::Get { instance_id } => core
            .engine
            .get_instance(&instance_id)
            .await
            .map(|instance| json!(instance)),
        SessionRequest::List => Ok(json!(core.engine.list_instances().await)),
        SessionRequest::Execution { execution_id } => core
            .orchestrator
            .get_execution(&execution_id)
            .await
            .map(|execution| json!(execution)),
        SessionRequest::Tick => {
            let fired = core.tick().await;
            Ok(json!({ "fired": fired }))
        }
        SessionRequest::Advance { seconds } => match clock {
            Some(clock) => {
                clock.advance(Duration::from_secs(seconds));
                let fired = core.tick().await;
                Ok(json!({ "now": clock.now(), "fired": fired }))
            }
            None => {
                return SessionLine::failed(json!({
                    "code": "NO_MANUAL_CLOCK",
                    "message": "start the session with --manual-clock to use 'advance'",
                }))
            }
        },
        SessionRequest::Stats => Ok(json!(shipflow::metrics().get_stats())),
    };

    match result {
        Ok(value) => SessionLine::ok(value),
        Err(e) => SessionLine::failed(json!({
            "code": e.code(),
            "message": e.to_string(),
            "recoverable": e.is_recoverable_by_caller(),
            "remediation_actions": e.remediation_actions(),
        })),
    }
}

async fn resolve_definition(core: &ProcessCore, definition: &str) -> Result<DefinitionRef, OrchestrationError> {
    match definition.split_once("@v") {
        Some((name, version)) => {
            let version = version
                .parse()
                .map_err(|_| OrchestrationError::DefinitionNotFound(definition.to_string()))?;
            Ok(DefinitionRef::new(name, version))
        }
        None => Ok(core.store.latest_state_machine(definition).await?.reference()),
    }
}
