// Saga execution lifecycle:
// pending -> running -> {completed | compensating -> compensated | failed_irrecoverably}
// A step failing with a fallback route passes through falling_back, which is
// reported as running.

use statig::prelude::*;

use super::execution::ExecutionStatus;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SagaEvent {
    Start,
    StepsFinished,
    StepFailed { compensate: bool },
    FallbackSucceeded,
    FallbackFailed,
    UnwindFinished,
}

#[derive(Debug, Default)]
pub struct SagaLifecycle;

#[state_machine(initial = "State::pending()")]
impl SagaLifecycle {
    #[state]
    fn pending(event: &SagaEvent) -> Outcome<State> {
        match event {
            SagaEvent::Start => Transition(State::running()),
            _ => Handled,
        }
    }

    #[state]
    fn running(event: &SagaEvent) -> Outcome<State> {
        match event {
            SagaEvent::StepsFinished => Transition(State::completed()),
            SagaEvent::StepFailed { compensate: true } => Transition(State::compensating()),
            SagaEvent::StepFailed { compensate: false } => Transition(State::falling_back()),
            _ => Handled,
        }
    }

    #[state]
    fn falling_back(event: &SagaEvent) -> Outcome<State> {
        match event {
            SagaEvent::FallbackSucceeded => Transition(State::completed()),
            SagaEvent::FallbackFailed => Transition(State::failed_irrecoverably()),
            _ => Handled,
        }
    }

    #[state]
    fn compensating(event: &SagaEvent) -> Outcome<State> {
        match event {
            SagaEvent::UnwindFinished => Transition(State::compensated()),
            _ => Handled,
        }
    }

    #[state]
    fn completed(event: &SagaEvent) -> Outcome<State> {
        match event {
            _ => Handled,
        }
    }

    #[state]
    fn compensated(event: &SagaEvent) -> Outcome<State> {
        match event {
            _ => Handled,
        }
    }

    #[state]
    fn failed_irrecoverably(event: &SagaEvent) -> Outcome<State> {
        match event {
            _ => Handled,
        }
    }
}

/// Drives a [`SagaLifecycle`] and reports the public status after each event.
pub struct LifecycleDriver {
    machine: StateMachine<SagaLifecycle>,
    status: ExecutionStatus,
}

impl Default for LifecycleDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl LifecycleDriver {
    pub fn new() -> Self {
        Self {
            machine: SagaLifecycle.state_machine(),
            status: ExecutionStatus::Pending,
        }
    }

    pub fn apply(&mut self, event: SagaEvent) -> ExecutionStatus {
        self.machine.handle(&event);
        self.status = status_of(self.machine.state());
        self.status
    }

    pub fn status(&self) -> ExecutionStatus {
        self.status
    }
}

fn status_of(state: &State) -> ExecutionStatus {
    match state {
        State::Pending { .. } => ExecutionStatus::Pending,
        State::Running { .. } | State::FallingBack { .. } => ExecutionStatus::Running,
        State::Completed { .. } => ExecutionStatus::Completed,
        State::Compensating { .. } => ExecutionStatus::Compensating,
        State::Compensated { .. } => ExecutionStatus::Compensated,
        State::FailedIrrecoverably { .. } => ExecutionStatus::FailedIrrecoverably,
    }
}
