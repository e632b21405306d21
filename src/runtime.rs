//! Process wiring
//!
//! Builds the engine, orchestrator and scheduler around one definition store,
//! routes fired SLA stages to whichever component owns the subject, and pumps
//! domain events from the bus into the orchestrator.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tracing::{debug, info, warn, Instrument};

use crate::audit::{AuditStore, InMemoryAuditStore};
use crate::bus::{DomainEvent, EventBus};
use crate::config::ShipflowConfig;
use crate::definitions::{BundleSummary, DefinitionBundle, DefinitionStore};
use crate::engine::StateMachineEngine;
use crate::errors::OrchestrationResult;
use crate::guards::{register_builtin_guards, GuardClients, GuardEvaluator, GuardRegistry};
use crate::saga::{ActionRegistry, SagaOrchestrator};
use crate::sla::{BusinessCalendar, Clock, EscalationLedger, FiredEscalation, SlaScheduler, SystemClock, TimerSubject};

/// Sends each fired stage to the component that owns its subject.
pub struct LedgerRouter {
    engine: Arc<StateMachineEngine>,
    orchestrator: Arc<SagaOrchestrator>,
}

impl LedgerRouter {
    pub fn new(engine: Arc<StateMachineEngine>, orchestrator: Arc<SagaOrchestrator>) -> Self {
        Self { engine, orchestrator }
    }
}

#[async_trait]
impl EscalationLedger for LedgerRouter {
    async fn record_escalation(&self, fired: &FiredEscalation) -> bool {
        match &fired.subject {
            TimerSubject::Instance { .. } => self.engine.record_escalation(fired).await,
            TimerSubject::Execution { .. } => self.orchestrator.record_escalation(fired).await,
        }
    }
}

/// The assembled orchestration core.
pub struct ProcessCore {
    pub store: Arc<DefinitionStore>,
    pub engine: Arc<StateMachineEngine>,
    pub orchestrator: Arc<SagaOrchestrator>,
    pub scheduler: Arc<SlaScheduler>,
    pub audit: Arc<dyn AuditStore>,
    ledger: Arc<LedgerRouter>,
}

pub struct CoreBuilder {
    config: ShipflowConfig,
    bus: Arc<dyn EventBus>,
    clock: Arc<dyn Clock>,
    audit: Arc<dyn AuditStore>,
    actions: Arc<ActionRegistry>,
    guard_clients: GuardClients,
}

impl CoreBuilder {
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn audit(mut self, audit: Arc<dyn AuditStore>) -> Self {
        self.audit = audit;
        self
    }

    pub fn actions(mut self, actions: Arc<ActionRegistry>) -> Self {
        self.actions = actions;
        self
    }

    pub fn guard_clients(mut self, clients: GuardClients) -> Self {
        self.guard_clients = clients;
        self
    }

    pub async fn build(self) -> ProcessCore {
        let guards = Arc::new(GuardRegistry::new());
        register_builtin_guards(&guards, self.guard_clients).await;

        let store = Arc::new(DefinitionStore::new(Arc::clone(&guards)));
        let evaluator = Arc::new(GuardEvaluator::new(guards, self.config.guards.clone()));
        let scheduler = Arc::new(SlaScheduler::new(
            BusinessCalendar::from_config(&self.config.business_hours),
            self.clock,
            Arc::clone(&self.bus),
            self.config.scheduler.clone(),
        ));
        let engine = Arc::new(StateMachineEngine::new(
            Arc::clone(&store),
            evaluator,
            Arc::clone(&scheduler),
            Arc::clone(&self.bus),
            Arc::clone(&self.audit),
        ));
        let orchestrator = Arc::new(SagaOrchestrator::new(
            Arc::clone(&store),
            self.actions,
            Arc::clone(&engine),
            Arc::clone(&scheduler),
            self.bus,
            Arc::clone(&self.audit),
            self.config.sagas.clone(),
        ));
        let ledger = Arc::new(LedgerRouter::new(Arc::clone(&engine), Arc::clone(&orchestrator)));

        ProcessCore {
            store,
            engine,
            orchestrator,
            scheduler,
            audit: self.audit,
            ledger,
        }
    }
}

impl ProcessCore {
    /// Builder with the system clock, an in-memory audit mirror, no saga
    /// actions and payload-backed guard clients.
    pub fn builder(config: ShipflowConfig, bus: Arc<dyn EventBus>) -> CoreBuilder {
        CoreBuilder {
            config,
            bus,
            clock: Arc::new(SystemClock),
            audit: Arc::new(InMemoryAuditStore::new()),
            actions: Arc::new(ActionRegistry::new()),
            guard_clients: GuardClients::from_payload(),
        }
    }

    pub fn ledger(&self) -> Arc<dyn EscalationLedger> {
        self.ledger.clone()
    }

    pub async fn load_definitions(&self, bundle: DefinitionBundle) -> OrchestrationResult<BundleSummary> {
        self.store.load_bundle(bundle).await
    }

    /// Run one scheduler tick at the clock's current time.
    pub async fn tick(&self) -> Vec<FiredEscalation> {
        let now = self.scheduler.clock().now();
        self.scheduler.tick(now, self.ledger.as_ref()).await
    }

    /// Start the scheduler loop.
    pub fn spawn_scheduler(&self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let scheduler = Arc::clone(&self.scheduler);
        let ledger = self.ledger();
        tokio::spawn(scheduler.run(ledger, shutdown))
    }

    /// Forward every domain event to the orchestrator. Each event is handled
    /// on its own task so one long saga does not hold up other triggers.
    /// `tap` sees every event first. On shutdown the pump still handles every
    /// queued event and waits for in-flight handlers before it returns.
    pub fn spawn_event_pump<F>(
        &self,
        mut events: mpsc::UnboundedReceiver<DomainEvent>,
        mut shutdown: watch::Receiver<bool>,
        tap: F,
    ) -> JoinHandle<()>
    where
        F: Fn(&DomainEvent) + Send + 'static,
    {
        let orchestrator = Arc::clone(&self.orchestrator);
        tokio::spawn(
            async move {
                info!("Event pump started");
                let mut in_flight = JoinSet::new();
                loop {
                    tokio::select! {
                        received = events.recv() => {
                            let Some(event) = received else { break };
                            tap(&event);
                            in_flight.spawn(handle_event(Arc::clone(&orchestrator), event));
                        }
                        Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                            log_handler_exit(joined);
                        }
                        changed = shutdown.changed() => {
                            if changed.is_err() || *shutdown.borrow() {
                                break;
                            }
                        }
                    }
                }

                info!(in_flight = in_flight.len(), "Event pump draining");
                loop {
                    // handlers publish before they finish, so this sees their events
                    while let Ok(event) = events.try_recv() {
                        tap(&event);
                        in_flight.spawn(handle_event(Arc::clone(&orchestrator), event));
                    }
                    match in_flight.join_next().await {
                        Some(joined) => log_handler_exit(joined),
                        None => break,
                    }
                }
                info!("Event pump stopped");
            }
            .instrument(tracing::info_span!("event_pump")),
        )
    }
}

async fn handle_event(orchestrator: Arc<SagaOrchestrator>, event: DomainEvent) {
    let outcomes = orchestrator.handle_event(&event).await;
    debug!(event_type = %event.event_type, sagas = outcomes.len(), "Event handled");
}

fn log_handler_exit(joined: Result<(), JoinError>) {
    if let Err(e) = joined {
        warn!(error = %e, "Event handler task ended abnormally");
    }
}
