use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn, Instrument};
use uuid::Uuid;

use super::instance::{HistoryEntry, Instance, TransitionRecord};
use crate::audit::AuditStore;
use crate::bus::{idempotency_key, DomainEvent, EventBus, OutboundCommand};
use crate::definitions::{DefinitionRef, DefinitionStore, StateDef, StateMachineDefinition, ARCHIVE_ACTION, VIEW_ACTION};
use crate::errors::{OrchestrationError, OrchestrationResult};
use crate::guards::{EvaluationMode, GuardContext, GuardEvaluator, GuardResult};
use crate::observability::metrics;
use crate::sla::{FiredEscalation, SlaScheduler, TimerSubject};
use crate::telemetry::transition_span;

pub const INSTANCE_CREATED_EVENT: &str = "instance.created";
pub const INSTANCE_TRANSITIONED_EVENT: &str = "instance.transitioned";
pub const INSTANCE_ARCHIVED_EVENT: &str = "instance.archived";
pub const COMPENSATION_REQUESTED_EVENT: &str = "instance.compensation_requested";

const ENTITY_TYPE: &str = "instance";

/// Owns every instance. The only writer of `current_state` and `history`.
pub struct StateMachineEngine {
    store: Arc<DefinitionStore>,
    evaluator: Arc<GuardEvaluator>,
    scheduler: Arc<SlaScheduler>,
    bus: Arc<dyn EventBus>,
    audit: Arc<dyn AuditStore>,
    live: RwLock<HashMap<String, Arc<Mutex<Instance>>>>,
    archived: RwLock<HashMap<String, Instance>>,
}

impl StateMachineEngine {
    pub fn new(
        store: Arc<DefinitionStore>,
        evaluator: Arc<GuardEvaluator>,
        scheduler: Arc<SlaScheduler>,
        bus: Arc<dyn EventBus>,
        audit: Arc<dyn AuditStore>,
    ) -> Self {
        Self {
            store,
            evaluator,
            scheduler,
            bus,
            audit,
            live: RwLock::new(HashMap::new()),
            archived: RwLock::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<DefinitionStore> {
        &self.store
    }

    /// Create an instance in the definition's initial state and arm the
    /// timers of that state. A missing id gets a fresh UUID.
    pub async fn create_instance(
        &self,
        definition_ref: &DefinitionRef,
        id: Option<String>,
        domain_payload: Value,
    ) -> OrchestrationResult<Instance> {
        let definition = self.store.state_machine(definition_ref).await?;
        let id = id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let now = self.scheduler.clock().now();

        let instance = Instance::new(
            id.clone(),
            definition_ref.clone(),
            definition.initial_state.clone(),
            domain_payload,
            now,
        );

        {
            let mut live = self.live.write().await;
            if live.contains_key(&id) || self.archived.read().await.contains_key(&id) {
                return Err(OrchestrationError::InstanceExists(id));
            }
            live.insert(id.clone(), Arc::new(Mutex::new(instance.clone())));
        }

        let policies = self
            .store
            .sla_policies_from(&definition.name, &definition.initial_state)
            .await;
        self.scheduler
            .arm_for_state(&id, &definition.name, &definition.initial_state, now, 0, &policies)
            .await;

        self.bus.publish_event(
            DomainEvent::new(
                INSTANCE_CREATED_EVENT,
                json!({
                    "instance_id": id,
                    "definition": definition_ref.to_string(),
                    "state": instance.current_state,
                    "domain_payload": instance.domain_payload,
                }),
            )
            .at(now)
            .with_idempotency_key(idempotency_key(ENTITY_TYPE, &id, 0, &json!(INSTANCE_CREATED_EVENT))),
        );
        self.mirror(&instance).await;

        info!(instance_id = %id, definition = %definition_ref, state = %instance.current_state, "Instance created");
        Ok(instance)
    }

    /// Apply `action` to an instance.
    ///
    /// Guard failures, unknown actions and terminal states leave the instance
    /// untouched. `view` never mutates; `archive` is only accepted in a
    /// terminal state.
    pub async fn transition(
        &self,
        instance_id: &str,
        action: &str,
        actor: &str,
        evidence: Value,
    ) -> OrchestrationResult<Instance> {
        let span = transition_span(instance_id, action, actor);
        self.transition_inner(instance_id, action, actor, evidence)
            .instrument(span)
            .await
    }

    async fn transition_inner(
        &self,
        instance_id: &str,
        action: &str,
        actor: &str,
        evidence: Value,
    ) -> OrchestrationResult<Instance> {
        let Some(handle) = self.live_handle(instance_id).await else {
            let archived = self.archived.read().await.get(instance_id).cloned();
            return match archived {
                Some(instance) if action == VIEW_ACTION => Ok(instance),
                Some(instance) => Err(OrchestrationError::TerminalState {
                    state: instance.current_state,
                    action: action.to_string(),
                }),
                None => Err(OrchestrationError::InstanceNotFound(instance_id.to_string())),
            };
        };

        let mut instance = handle.lock().await;
        if action == VIEW_ACTION {
            return Ok(instance.clone());
        }
        if instance.is_archived() {
            return Err(OrchestrationError::TerminalState {
                state: instance.current_state.clone(),
                action: action.to_string(),
            });
        }

        let definition = self.store.state_machine(&instance.definition_ref).await?;
        let current = state_of(&definition, &instance.current_state)?;

        if current.terminal {
            if action == ARCHIVE_ACTION {
                return self.archive_locked(&mut instance, actor).await;
            }
            metrics().record_rejected_transition();
            return Err(OrchestrationError::TerminalState {
                state: current.name.clone(),
                action: action.to_string(),
            });
        }

        if !current.allows_action(action) {
            metrics().record_rejected_transition();
            return Err(OrchestrationError::InvalidAction {
                state: current.name.clone(),
                action: action.to_string(),
            });
        }

        let Some(target_name) = current.target_for(action) else {
            metrics().record_rejected_transition();
            return Err(OrchestrationError::UnknownTransition {
                state: current.name.clone(),
                action: action.to_string(),
            });
        };
        let target = state_of(&definition, target_name)?;

        let ctx = GuardContext {
            instance_id: instance.id.clone(),
            definition_name: definition.name.clone(),
            from_state: current.name.clone(),
            to_state: target.name.clone(),
            action: action.to_string(),
            actor: actor.to_string(),
            evidence: evidence.clone(),
            domain_payload: instance.domain_payload.clone(),
        };
        let guard_results = self
            .evaluator
            .evaluate(&target.guards, &ctx, EvaluationMode::FailFast)
            .await;

        if let Some(failed) = guard_results.iter().find(|r| !r.passed()) {
            metrics().record_rejected_transition();
            return Err(guard_error(failed, &target.name));
        }

        let now = self.scheduler.clock().now();
        let from = current.name.clone();
        instance.history.push(HistoryEntry::Transition(TransitionRecord {
            from: from.clone(),
            to: target.name.clone(),
            action: action.to_string(),
            at: now,
            actor: actor.to_string(),
            guard_results,
            evidence,
        }));
        instance.current_state = target.name.clone();
        instance.version += 1;
        instance.updated_at = now;

        self.scheduler.disarm_state(&instance.id, &from).await;
        let policies = self.store.sla_policies_from(&definition.name, &target.name).await;
        self.scheduler
            .arm_for_state(&instance.id, &definition.name, &target.name, now, instance.version, &policies)
            .await;

        self.emit_side_effects(&instance, target, now);
        self.publish_transition(&instance, &from, target, action, actor);
        self.mirror(&instance).await;

        metrics().record_transition();
        info!(
            instance_id = %instance.id,
            from = %from,
            to = %target.name,
            version = instance.version,
            "Transition applied"
        );
        Ok(instance.clone())
    }

    /// Move an instance in a terminal state to the archive.
    pub async fn archive(&self, instance_id: &str, actor: &str) -> OrchestrationResult<Instance> {
        self.transition(instance_id, ARCHIVE_ACTION, actor, Value::Null).await
    }

    async fn archive_locked(&self, instance: &mut Instance, actor: &str) -> OrchestrationResult<Instance> {
        let now = self.scheduler.clock().now();
        let state = instance.current_state.clone();
        instance.history.push(HistoryEntry::Transition(TransitionRecord {
            from: state.clone(),
            to: state,
            action: ARCHIVE_ACTION.to_string(),
            at: now,
            actor: actor.to_string(),
            guard_results: Vec::new(),
            evidence: Value::Null,
        }));
        instance.version += 1;
        instance.updated_at = now;
        instance.archived_at = Some(now);

        self.scheduler.disarm_instance(&instance.id).await;
        self.live.write().await.remove(&instance.id);
        self.archived
            .write()
            .await
            .insert(instance.id.clone(), instance.clone());

        self.bus.publish_event(
            DomainEvent::new(
                INSTANCE_ARCHIVED_EVENT,
                json!({"instance_id": instance.id, "state": instance.current_state, "actor": actor}),
            )
            .at(now)
            .with_idempotency_key(idempotency_key(
                ENTITY_TYPE,
                &instance.id,
                instance.version,
                &json!(INSTANCE_ARCHIVED_EVENT),
            )),
        );
        self.mirror(instance).await;
        info!(instance_id = %instance.id, "Instance archived");
        Ok(instance.clone())
    }

    /// Live or archived instance by id.
    pub async fn get_instance(&self, instance_id: &str) -> OrchestrationResult<Instance> {
        if let Some(handle) = self.live_handle(instance_id).await {
            return Ok(handle.lock().await.clone());
        }
        self.archived
            .read()
            .await
            .get(instance_id)
            .cloned()
            .ok_or_else(|| OrchestrationError::InstanceNotFound(instance_id.to_string()))
    }

    /// Every instance, live and archived, ordered by id.
    pub async fn list_instances(&self) -> Vec<Instance> {
        let handles: Vec<Arc<Mutex<Instance>>> = self.live.read().await.values().cloned().collect();
        let mut instances = Vec::with_capacity(handles.len());
        for handle in handles {
            instances.push(handle.lock().await.clone());
        }
        instances.extend(self.archived.read().await.values().cloned());
        instances.sort_by(|a, b| a.id.cmp(&b.id));
        instances
    }

    /// Append a fired SLA stage to the instance history. Refused when the
    /// instance has left the timed state since the timer was armed.
    pub async fn record_escalation(&self, fired: &FiredEscalation) -> bool {
        let TimerSubject::Instance { instance_id, .. } = &fired.subject else {
            return false;
        };
        let Some(handle) = self.live_handle(instance_id).await else {
            return false;
        };

        let mut instance = handle.lock().await;
        if instance.is_archived()
            || instance.current_state != fired.edge.from
            || instance.version != fired.version
        {
            debug!(instance_id = %instance_id, edge = %fired.edge, "Escalation is stale");
            return false;
        }

        instance.history.push(HistoryEntry::Escalation(fired.into()));
        self.mirror(&instance).await;
        true
    }

    async fn live_handle(&self, instance_id: &str) -> Option<Arc<Mutex<Instance>>> {
        self.live.read().await.get(instance_id).cloned()
    }

    fn emit_side_effects(&self, instance: &Instance, target: &StateDef, now: chrono::DateTime<chrono::Utc>) {
        for effect in &target.side_effects {
            let input = with_instance_id(&effect.input, &instance.id);
            let key = idempotency_key(
                ENTITY_TYPE,
                &instance.id,
                instance.version,
                &json!({"action": effect.action, "input": input}),
            );
            self.bus
                .dispatch(OutboundCommand::new(effect.action.clone(), input, key, now));
        }
    }

    fn publish_transition(&self, instance: &Instance, from: &str, target: &StateDef, action: &str, actor: &str) {
        let now = instance.updated_at;
        self.bus.publish_event(
            DomainEvent::new(
                INSTANCE_TRANSITIONED_EVENT,
                json!({
                    "instance_id": instance.id,
                    "definition": instance.definition_ref.to_string(),
                    "from": from,
                    "to": target.name,
                    "action": action,
                    "actor": actor,
                    "version": instance.version,
                    "domain_payload": instance.domain_payload,
                }),
            )
            .at(now)
            .with_idempotency_key(idempotency_key(
                ENTITY_TYPE,
                &instance.id,
                instance.version,
                &json!(INSTANCE_TRANSITIONED_EVENT),
            )),
        );

        if !target.compensations.is_empty() {
            self.bus.publish_event(
                DomainEvent::new(
                    COMPENSATION_REQUESTED_EVENT,
                    json!({
                        "instance_id": instance.id,
                        "state": target.name,
                        "compensations": target.compensations,
                        "domain_payload": instance.domain_payload,
                    }),
                )
                .at(now)
                .with_idempotency_key(idempotency_key(
                    ENTITY_TYPE,
                    &instance.id,
                    instance.version,
                    &json!(COMPENSATION_REQUESTED_EVENT),
                )),
            );
        }
    }

    async fn mirror(&self, instance: &Instance) {
        if let Err(e) = self.audit.save_instance(instance).await {
            warn!(instance_id = %instance.id, error = %e, "Failed to mirror instance to audit store");
        }
    }
}

fn state_of<'a>(definition: &'a StateMachineDefinition, name: &str) -> OrchestrationResult<&'a StateDef> {
    definition
        .state(name)
        .ok_or_else(|| OrchestrationError::InvalidDefinition {
            name: definition.reference().to_string(),
            reason: format!("state '{name}' is not defined"),
        })
}

fn guard_error(failed: &GuardResult, target: &str) -> OrchestrationError {
    if failed.is_timeout() {
        return OrchestrationError::GuardTimeout {
            guard: failed.guard().to_string(),
        };
    }
    match failed.failure() {
        Some(failure) => OrchestrationError::GuardFailed {
            guard: failure.guard.clone(),
            target: target.to_string(),
            code: failure.code.clone(),
            message: failure.message.clone(),
            remediation_actions: failure.remediation_actions.clone(),
        },
        None => OrchestrationError::GuardFailed {
            guard: failed.guard().to_string(),
            target: target.to_string(),
            code: "GUARD_FAILED".to_string(),
            message: String::new(),
            remediation_actions: Vec::new(),
        },
    }
}

/// Side-effect input with the instance id added when the input is an object
/// (or empty) and doesn't name one already.
fn with_instance_id(input: &Value, instance_id: &str) -> Value {
    match input {
        Value::Object(map) if !map.contains_key("instance_id") => {
            let mut map = map.clone();
            map.insert("instance_id".to_string(), json!(instance_id));
            Value::Object(map)
        }
        Value::Null => {
            let mut map = Map::new();
            map.insert("instance_id".to_string(), json!(instance_id));
            Value::Object(map)
        }
        other => other.clone(),
    }
}

impl std::fmt::Debug for StateMachineEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateMachineEngine").finish_non_exhaustive()
    }
}
