use moka::future::Cache;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

use super::actions::ActionRegistry;
use super::execution::{
    CompensationRecord, CompletedStep, ExecutionStatus, FallbackRecord, SagaExecution, StepFailure,
};
use super::lifecycle::{LifecycleDriver, SagaEvent};
use super::retry::{AttemptError, RetryFailure, RetryPolicy};
use crate::audit::AuditStore;
use crate::bus::{idempotency_key, DomainEvent, EventBus, OutboundCommand};
use crate::config::SagaSettings;
use crate::definitions::{DefinitionStore, OnFailure, StepType, WorkflowDefinition, WorkflowStep};
use crate::engine::StateMachineEngine;
use crate::errors::{OrchestrationError, OrchestrationResult};
use crate::observability::{metrics, OperationTimer, SagaOutcome};
use crate::sla::{FiredEscalation, SlaScheduler, TimerSubject};
use crate::telemetry::saga_span;

pub const SAGA_COMPLETED_EVENT: &str = "saga.completed";
pub const SAGA_COMPENSATED_EVENT: &str = "saga.compensated";
pub const SAGA_FAILED_EVENT: &str = "saga.failed";
pub const COMPENSATION_FAILED_ACTION: &str = "saga.compensation_failed";

const ENTITY_TYPE: &str = "saga";

/// What happened to one workflow matched by an inbound event.
#[derive(Debug, Clone, PartialEq)]
pub enum TriggerOutcome {
    Started(SagaExecution),
    /// The trigger's idempotency key was already seen; no new execution.
    Duplicate {
        workflow_ref: String,
        execution_id: String,
    },
}

impl TriggerOutcome {
    pub fn execution_id(&self) -> &str {
        match self {
            TriggerOutcome::Started(execution) => &execution.execution_id,
            TriggerOutcome::Duplicate { execution_id, .. } => execution_id,
        }
    }
}

/// Runs saga workflows in response to domain events.
///
/// Steps run strictly in order. A failed step is routed through its
/// `on_failure` policy: either the completed steps are compensated in reverse
/// order, or a named fallback is invoked and the execution ends degraded.
pub struct SagaOrchestrator {
    store: Arc<DefinitionStore>,
    actions: Arc<ActionRegistry>,
    engine: Arc<StateMachineEngine>,
    scheduler: Arc<SlaScheduler>,
    bus: Arc<dyn EventBus>,
    audit: Arc<dyn AuditStore>,
    settings: SagaSettings,
    retry: RetryPolicy,
    /// Trigger key -> execution id
    seen: Cache<String, String>,
    executions: RwLock<HashMap<String, Arc<Mutex<SagaExecution>>>>,
}

impl SagaOrchestrator {
    pub fn new(
        store: Arc<DefinitionStore>,
        actions: Arc<ActionRegistry>,
        engine: Arc<StateMachineEngine>,
        scheduler: Arc<SlaScheduler>,
        bus: Arc<dyn EventBus>,
        audit: Arc<dyn AuditStore>,
        settings: SagaSettings,
    ) -> Self {
        let seen = Cache::builder()
            .max_capacity(settings.idempotency_capacity)
            .time_to_live(Duration::from_secs(settings.idempotency_ttl_secs))
            .build();
        Self {
            store,
            actions,
            engine,
            scheduler,
            bus,
            audit,
            retry: RetryPolicy::from_settings(&settings),
            settings,
            seen,
            executions: RwLock::new(HashMap::new()),
        }
    }

    pub fn actions(&self) -> &Arc<ActionRegistry> {
        &self.actions
    }

    /// Start every workflow whose trigger matches `event`, once per
    /// idempotency key. Each started execution runs to a terminal status
    /// before this returns.
    pub async fn handle_event(&self, event: &DomainEvent) -> Vec<TriggerOutcome> {
        let event_key = event.effective_idempotency_key();
        let mut outcomes = Vec::new();

        for workflow in self.store.workflows_for(&event.event_type).await {
            if !workflow.trigger.matches(&event.event_type, &event.payload) {
                debug!(workflow = %workflow.reference(), "Trigger predicate did not match");
                continue;
            }

            let trigger_key = format!("{}:{}", workflow.workflow_id, event_key);
            let candidate = Uuid::new_v4().to_string();
            let entry = self
                .seen
                .entry(trigger_key.clone())
                .or_insert_with(async move { candidate })
                .await;

            if !entry.is_fresh() {
                metrics().record_duplicate_trigger();
                info!(
                    workflow = %workflow.reference(),
                    idempotency_key = %trigger_key,
                    execution_id = %entry.value(),
                    "Duplicate trigger ignored"
                );
                outcomes.push(TriggerOutcome::Duplicate {
                    workflow_ref: workflow.reference(),
                    execution_id: entry.into_value(),
                });
                continue;
            }

            let execution_id = entry.into_value();
            let span = saga_span(&workflow.reference(), &execution_id);
            let execution = self
                .execute(workflow, execution_id, trigger_key, event)
                .instrument(span)
                .await;
            outcomes.push(TriggerOutcome::Started(execution));
        }

        outcomes
    }

    async fn execute(
        &self,
        workflow: Arc<WorkflowDefinition>,
        execution_id: String,
        trigger_key: String,
        event: &DomainEvent,
    ) -> SagaExecution {
        let timer = OperationTimer::new("saga_execution");
        let started_at = self.scheduler.clock().now();
        let mut lifecycle = LifecycleDriver::new();

        let execution = SagaExecution {
            execution_id: execution_id.clone(),
            workflow_ref: workflow.reference(),
            workflow_id: workflow.workflow_id.clone(),
            workflow_version: workflow.version,
            status: lifecycle.status(),
            idempotency_key: trigger_key,
            trigger_event_type: event.event_type.clone(),
            trigger_payload: event.payload.clone(),
            completed_steps: Vec::new(),
            failure: None,
            compensations: Vec::new(),
            compensation_failures: Vec::new(),
            fallback: None,
            degraded: false,
            escalations: Vec::new(),
            started_at,
            ended_at: None,
        };
        let handle = Arc::new(Mutex::new(execution));
        self.executions
            .write()
            .await
            .insert(execution_id.clone(), Arc::clone(&handle));
        metrics().record_saga_started();

        let status = lifecycle.apply(SagaEvent::Start);
        let snapshot = update(&handle, |e| e.status = status).await;
        self.mirror(&snapshot).await;
        if let Some(sla) = &workflow.sla {
            self.scheduler
                .arm_saga(&execution_id, &workflow.reference(), started_at, sla)
                .await;
        }
        info!(steps = workflow.steps.len(), "Saga started");

        let mut outputs: BTreeMap<String, Value> = BTreeMap::new();
        let mut failed: Option<(&WorkflowStep, OrchestrationError)> = None;

        for (index, step) in workflow.steps.iter().enumerate() {
            match self
                .run_step(&workflow, &execution_id, index, step, &event.payload, &outputs)
                .await
            {
                Ok(done) => {
                    info!(step = %step.step_id, attempts = done.attempts, "Step completed");
                    outputs.insert(done.step_id.clone(), done.output.clone());
                    update(&handle, |e| e.completed_steps.push(done)).await;
                }
                Err(e) => {
                    warn!(step = %step.step_id, code = %e.code(), error = %e, "Step failed");
                    failed = Some((step, e));
                    break;
                }
            }
        }

        let outcome = match failed {
            None => {
                lifecycle.apply(SagaEvent::StepsFinished);
                SagaOutcome::Completed
            }
            Some((step, e)) => {
                let failure = StepFailure {
                    step_id: step.step_id.clone(),
                    code: e.code().to_string(),
                    message: e.to_string(),
                };
                match &step.on_failure {
                    OnFailure::Compensate => {
                        let status = lifecycle.apply(SagaEvent::StepFailed { compensate: true });
                        let snapshot = update(&handle, |e| {
                            e.failure = Some(failure);
                            e.status = status;
                        })
                        .await;
                        self.mirror(&snapshot).await;
                        self.compensate(&workflow, &handle).await;
                        lifecycle.apply(SagaEvent::UnwindFinished);
                        SagaOutcome::Compensated
                    }
                    OnFailure::Fallback(name) => {
                        lifecycle.apply(SagaEvent::StepFailed { compensate: false });
                        update(&handle, |e| e.failure = Some(failure)).await;
                        let record = self
                            .run_fallback(&workflow, name, step, &event.payload, &outputs)
                            .await;
                        let succeeded = record.error.is_none();
                        update(&handle, |e| {
                            e.fallback = Some(record);
                            e.degraded = succeeded;
                        })
                        .await;
                        if succeeded {
                            lifecycle.apply(SagaEvent::FallbackSucceeded);
                            SagaOutcome::Degraded
                        } else {
                            lifecycle.apply(SagaEvent::FallbackFailed);
                            SagaOutcome::Failed
                        }
                    }
                }
            }
        };

        let snapshot = self.finish(&handle, lifecycle.status(), outcome).await;
        timer.finish();
        snapshot
    }

    async fn finish(
        &self,
        handle: &Arc<Mutex<SagaExecution>>,
        status: ExecutionStatus,
        outcome: SagaOutcome,
    ) -> SagaExecution {
        let ended_at = self.scheduler.clock().now();
        let snapshot = update(handle, |e| {
            e.status = status;
            e.ended_at = Some(ended_at);
        })
        .await;

        self.scheduler.disarm_saga(&snapshot.execution_id).await;
        metrics().record_saga_outcome(outcome);

        let event_type = match outcome {
            SagaOutcome::Completed | SagaOutcome::Degraded => SAGA_COMPLETED_EVENT,
            SagaOutcome::Compensated => SAGA_COMPENSATED_EVENT,
            SagaOutcome::Failed => SAGA_FAILED_EVENT,
        };
        self.bus.publish_event(
            DomainEvent::new(
                event_type,
                json!({
                    "execution_id": snapshot.execution_id,
                    "workflow": snapshot.workflow_ref,
                    "status": snapshot.status,
                    "degraded": snapshot.degraded,
                    "failure": snapshot.failure,
                    "compensation_failures": snapshot.compensation_failures.len(),
                }),
            )
            .at(ended_at)
            .with_idempotency_key(idempotency_key(
                ENTITY_TYPE,
                &snapshot.execution_id,
                0,
                &json!(event_type),
            )),
        );
        self.mirror(&snapshot).await;

        info!(status = %snapshot.status, degraded = snapshot.degraded, "Saga finished");
        snapshot
    }

    async fn run_step(
        &self,
        workflow: &WorkflowDefinition,
        execution_id: &str,
        index: usize,
        step: &WorkflowStep,
        trigger_payload: &Value,
        outputs: &BTreeMap<String, Value>,
    ) -> OrchestrationResult<CompletedStep> {
        let input = step
            .input_mapping
            .project(&step.step_id, trigger_payload, outputs)?;
        let label = format!("{}/{}", workflow.reference(), step.step_id);

        let (output, attempts) = match step.step_type {
            StepType::StateTransition => {
                self.run_transition_step(workflow, step, &label, &input)
                    .await?
            }
            StepType::Notification => {
                let key = idempotency_key(ENTITY_TYPE, execution_id, index as u64, &input);
                self.bus.dispatch(OutboundCommand::new(
                    step.action.clone(),
                    input.clone(),
                    key.clone(),
                    self.scheduler.clock().now(),
                ));
                (json!({"dispatched": step.action, "idempotency_key": key}), 1)
            }
            _ => {
                let action = self
                    .actions
                    .get(&step.action)
                    .await
                    .ok_or_else(|| OrchestrationError::ActionNotRegistered(step.action.clone()))?;
                self.retry
                    .run(&label, step.retry_count, step.timeout, |_attempt| {
                        let action = Arc::clone(&action);
                        let input = input.clone();
                        async move {
                            action
                                .invoke(input)
                                .await
                                .map_err(|e| AttemptError::retryable(format!("{e:#}")))
                        }
                    })
                    .await
                    .map_err(|failure| step_error(step, failure))?
            }
        };

        Ok(CompletedStep {
            step_id: step.step_id.clone(),
            action: step.action.clone(),
            input,
            output,
            attempts,
            completed_at: self.scheduler.clock().now(),
        })
    }

    /// Drive an instance through the engine. Input fields: `instance_id`
    /// (required), `action`, `actor`, `evidence`.
    async fn run_transition_step(
        &self,
        workflow: &WorkflowDefinition,
        step: &WorkflowStep,
        label: &str,
        input: &Value,
    ) -> OrchestrationResult<(Value, u32)> {
        let instance_id = input
            .get("instance_id")
            .and_then(Value::as_str)
            .ok_or_else(|| OrchestrationError::InputMapping {
                step_id: step.step_id.clone(),
                reason: "state_transition steps need an 'instance_id' field".to_string(),
            })?;
        let action = input
            .get("action")
            .and_then(Value::as_str)
            .unwrap_or(&step.action);
        let actor = input
            .get("actor")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| format!("saga:{}", workflow.workflow_id));
        let evidence = input.get("evidence").cloned().unwrap_or_else(|| json!({}));

        let engine = &self.engine;
        let actor = actor.as_str();
        self.retry
            .run(label, step.retry_count, step.timeout, |_attempt| {
                let evidence = evidence.clone();
                async move {
                    match engine.transition(instance_id, action, actor, evidence).await {
                        Ok(instance) => Ok(json!({
                            "instance_id": instance.id,
                            "state": instance.current_state,
                            "version": instance.version,
                        })),
                        Err(e @ OrchestrationError::GuardTimeout { .. }) => {
                            Err(AttemptError::retryable(e.to_string()))
                        }
                        Err(e) => Err(AttemptError::permanent(format!("{}: {e}", e.code()))),
                    }
                }
            })
            .await
            .map_err(|failure| step_error(step, failure))
    }

    /// Unwind completed steps in reverse completion order. A failing
    /// compensation is recorded and surfaced, and the unwind continues.
    async fn compensate(&self, workflow: &WorkflowDefinition, handle: &Arc<Mutex<SagaExecution>>) {
        let (execution_id, completed) = {
            let execution = handle.lock().await;
            (execution.execution_id.clone(), execution.completed_steps.clone())
        };
        info!(completed = completed.len(), "Compensating saga");

        for done in completed.iter().rev() {
            let Some(step) = workflow.steps.iter().find(|s| s.step_id == done.step_id) else {
                continue;
            };
            let Some(action) = workflow.compensation_for(step) else {
                debug!(step = %done.step_id, "Step has no compensation");
                continue;
            };

            let record = self.run_compensation(workflow, done, action, step.timeout).await;
            if !record.succeeded {
                self.surface_compensation_failure(workflow, &execution_id, &record);
            }
            update(handle, |e| {
                if !record.succeeded {
                    e.compensation_failures.push(record.clone());
                }
                e.compensations.push(record);
            })
            .await;
        }
    }

    async fn run_compensation(
        &self,
        workflow: &WorkflowDefinition,
        done: &CompletedStep,
        action_name: &str,
        attempt_timeout: Duration,
    ) -> CompensationRecord {
        let input = done.output.clone();
        let result = match self.actions.get(action_name).await {
            None => Err((0, OrchestrationError::ActionNotRegistered(action_name.to_string()).to_string())),
            Some(action) => {
                let label = format!("{}/{}:compensate", workflow.reference(), done.step_id);
                self.retry
                    .run(&label, self.settings.compensation_retries, attempt_timeout, |_attempt| {
                        let action = Arc::clone(&action);
                        let input = input.clone();
                        async move {
                            action
                                .invoke(input)
                                .await
                                .map_err(|e| AttemptError::retryable(format!("{e:#}")))
                        }
                    })
                    .await
                    .map_err(|failure| (failure.attempts, failure.error.message))
            }
        };

        let (attempts, error) = match result {
            Ok((_, attempts)) => {
                info!(step = %done.step_id, action = %action_name, "Compensation succeeded");
                (attempts, None)
            }
            Err((attempts, message)) => (attempts, Some(message)),
        };
        CompensationRecord {
            step_id: done.step_id.clone(),
            action: action_name.to_string(),
            input,
            attempts,
            succeeded: error.is_none(),
            error,
            at: self.scheduler.clock().now(),
        }
    }

    fn surface_compensation_failure(&self, workflow: &WorkflowDefinition, execution_id: &str, record: &CompensationRecord) {
        let err = OrchestrationError::CompensationFailed {
            step_id: record.step_id.clone(),
            action: record.action.clone(),
            reason: record.error.clone().unwrap_or_default(),
        };
        metrics().record_compensation_failure();
        error!(
            step = %record.step_id,
            action = %record.action,
            attempts = record.attempts,
            error = %err,
            "Compensation failed, operator attention required"
        );

        let input = json!({
            "execution_id": execution_id,
            "workflow": workflow.reference(),
            "step_id": record.step_id,
            "action": record.action,
            "code": err.code(),
            "reason": err.to_string(),
            "compensation_input": record.input,
        });
        let key = idempotency_key(
            ENTITY_TYPE,
            execution_id,
            0,
            &json!({"compensation_failed": record.step_id}),
        );
        self.bus
            .dispatch(OutboundCommand::new(COMPENSATION_FAILED_ACTION, input, key, record.at));
    }

    async fn run_fallback(
        &self,
        workflow: &WorkflowDefinition,
        name: &str,
        failed_step: &WorkflowStep,
        trigger_payload: &Value,
        outputs: &BTreeMap<String, Value>,
    ) -> FallbackRecord {
        let Some(fallback) = workflow.fallback_actions.get(name) else {
            return FallbackRecord {
                name: name.to_string(),
                action: String::new(),
                input: Value::Null,
                output: None,
                error: Some(format!("unknown fallback '{name}'")),
            };
        };

        let mut record = FallbackRecord {
            name: name.to_string(),
            action: fallback.action.clone(),
            input: Value::Null,
            output: None,
            error: None,
        };

        let input = match fallback.input_mapping.project(name, trigger_payload, outputs) {
            Ok(input) => input,
            Err(e) => {
                record.error = Some(e.to_string());
                return record;
            }
        };
        record.input = input.clone();

        let Some(action) = self.actions.get(&fallback.action).await else {
            record.error = Some(OrchestrationError::ActionNotRegistered(fallback.action.clone()).to_string());
            return record;
        };

        info!(fallback = %name, action = %fallback.action, step = %failed_step.step_id, "Invoking fallback");
        let label = format!("{}/{}:fallback", workflow.reference(), name);
        let result = self
            .retry
            .run(&label, 0, failed_step.timeout, |_attempt| {
                let action = Arc::clone(&action);
                let input = input.clone();
                async move {
                    action
                        .invoke(input)
                        .await
                        .map_err(|e| AttemptError::permanent(format!("{e:#}")))
                }
            })
            .await;

        match result {
            Ok((output, _)) => record.output = Some(output),
            Err(failure) => {
                error!(fallback = %name, error = %failure.error.message, "Fallback failed");
                record.error = Some(failure.error.message);
            }
        }
        record
    }

    /// Append a fired saga SLA stage. Refused once the execution has ended.
    pub async fn record_escalation(&self, fired: &FiredEscalation) -> bool {
        let TimerSubject::Execution { execution_id, .. } = &fired.subject else {
            return false;
        };
        let Some(handle) = self.executions.read().await.get(execution_id).cloned() else {
            return false;
        };

        let snapshot = {
            let mut execution = handle.lock().await;
            if execution.status.is_terminal() {
                debug!(execution_id = %execution_id, "Escalation for a finished saga is stale");
                return false;
            }
            execution.escalations.push(fired.into());
            execution.clone()
        };
        self.mirror(&snapshot).await;
        true
    }

    pub async fn get_execution(&self, execution_id: &str) -> OrchestrationResult<SagaExecution> {
        let handle = self
            .executions
            .read()
            .await
            .get(execution_id)
            .cloned()
            .ok_or_else(|| OrchestrationError::ExecutionNotFound(execution_id.to_string()))?;
        let execution = handle.lock().await.clone();
        Ok(execution)
    }

    /// Every execution, oldest first.
    pub async fn list_executions(&self) -> Vec<SagaExecution> {
        let handles: Vec<Arc<Mutex<SagaExecution>>> =
            self.executions.read().await.values().cloned().collect();
        let mut executions = Vec::with_capacity(handles.len());
        for handle in handles {
            executions.push(handle.lock().await.clone());
        }
        executions.sort_by(|a, b| {
            a.started_at
                .cmp(&b.started_at)
                .then_with(|| a.execution_id.cmp(&b.execution_id))
        });
        executions
    }

    async fn mirror(&self, execution: &SagaExecution) {
        if let Err(e) = self.audit.save_execution(execution).await {
            warn!(execution_id = %execution.execution_id, error = %e, "Failed to mirror saga execution to audit store");
        }
    }
}

async fn update(handle: &Arc<Mutex<SagaExecution>>, f: impl FnOnce(&mut SagaExecution)) -> SagaExecution {
    let mut execution = handle.lock().await;
    f(&mut execution);
    execution.clone()
}

fn step_error(step: &WorkflowStep, failure: RetryFailure) -> OrchestrationError {
    if failure.error.timed_out && failure.attempts == 1 {
        OrchestrationError::StepTimeout {
            step_id: step.step_id.clone(),
            timeout_ms: step.timeout.as_millis() as u64,
        }
    } else {
        OrchestrationError::StepExhaustedRetries {
            step_id: step.step_id.clone(),
            attempts: failure.attempts,
            last_error: failure.error.message,
        }
    }
}
