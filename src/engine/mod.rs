pub mod instance;
pub mod state_machine;

pub use instance::{HistoryEntry, Instance, TransitionRecord};
pub use state_machine::{
    StateMachineEngine, COMPENSATION_REQUESTED_EVENT, INSTANCE_ARCHIVED_EVENT, INSTANCE_CREATED_EVENT,
    INSTANCE_TRANSITIONED_EVENT,
};
