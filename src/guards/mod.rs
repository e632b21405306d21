pub mod builtin;
pub mod evaluator;
pub mod registry;
pub mod traits;
pub mod types;

pub use builtin::{register_builtin_guards, GuardClients};
pub use evaluator::GuardEvaluator;
pub use registry::GuardRegistry;
pub use traits::{BookingClient, ComplianceClient, DocumentClient, Guard, PartyDirectory, ScreeningOutcome};
pub use types::{EvaluationMode, GuardContext, GuardFailure, GuardResult, GUARD_NOT_REGISTERED, GUARD_TIMEOUT};
