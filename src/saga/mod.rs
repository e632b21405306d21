//! Saga orchestration
//!
//! A workflow is an ordered list of steps triggered by a domain event. Each
//! step's output is captured so later steps can map from it and so its
//! compensation can undo exactly what it did.

pub mod actions;
pub mod execution;
pub mod lifecycle;
pub mod orchestrator;
pub mod retry;

pub use actions::{ActionRegistry, EchoAction, FnAction, StepAction};
pub use execution::{
    CompensationRecord, CompletedStep, ExecutionStatus, FallbackRecord, SagaExecution, StepFailure,
};
pub use lifecycle::{LifecycleDriver, SagaEvent};
pub use orchestrator::{
    SagaOrchestrator, TriggerOutcome, COMPENSATION_FAILED_ACTION, SAGA_COMPENSATED_EVENT,
    SAGA_COMPLETED_EVENT, SAGA_FAILED_EVENT,
};
pub use retry::{AttemptError, RetryFailure, RetryPolicy};
