// shipflow - business process orchestration core
// State machines with guarded transitions, SLA escalation and saga workflows.

pub mod audit;
pub mod bus;
pub mod config;
#[cfg(feature = "database")]
pub mod database;
pub mod definitions;
pub mod engine;
pub mod errors;
pub mod guards;
pub mod observability;
pub mod runtime;
pub mod saga;
pub mod shutdown;
pub mod sla;
pub mod telemetry;

// Re-export key types for easy access
pub use audit::{AuditStore, InMemoryAuditStore};
pub use bus::{ChannelBus, DomainEvent, EventBus, OutboundCommand, RecordingBus};
pub use config::{config, init_config, ShipflowConfig};
#[cfg(feature = "database")]
pub use database::SqliteAuditStore;
pub use definitions::{DefinitionBundle, DefinitionRef, DefinitionStore, StateMachineDefinition, WorkflowDefinition};
pub use engine::{Instance, StateMachineEngine};
pub use errors::{OrchestrationError, OrchestrationResult};
pub use guards::{GuardEvaluator, GuardRegistry, GuardResult};
pub use observability::{metrics, OperationTimer, OrchestrationMetrics};
pub use runtime::{LedgerRouter, ProcessCore};
pub use saga::{ActionRegistry, ExecutionStatus, SagaExecution, SagaOrchestrator, StepAction};
pub use shutdown::ShutdownCoordinator;
pub use sla::{Clock, ManualClock, SlaScheduler, SystemClock};
pub use telemetry::{generate_correlation_id, init_telemetry, shutdown_telemetry};
