pub mod duration;
pub mod sla;
pub mod state_machine;
pub mod store;
pub mod workflow;

pub use sla::{Edge, EscalationRule, Severity, SlaPolicy};
pub use state_machine::{DefinitionRef, SideEffect, StateDef, StateMachineDefinition, ARCHIVE_ACTION, VIEW_ACTION};
pub use store::{BundleSummary, DefinitionBundle, DefinitionStore};
pub use workflow::{
    FallbackAction, FieldProjection, InputMapping, OnFailure, ProjectionSource, SlaEscalation, StepType, Trigger,
    TriggerPredicate, WorkflowDefinition, WorkflowSla, WorkflowStep,
};
