//! Workflow status ordering.
//!
//! ```text
//! PENDING → PLANNING → PROVISIONING → CONFIGURING → VALIDATING → DOCUMENTING → COMPLETED
//!                        any non-terminal state ↓
//!                                          FAILED → ROLLED_BACK
//! ```

use super::types::WorkflowStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Same state requested; only timestamps move
    NoOp,
    Allowed,
    Rejected,
}

pub fn check_transition(from: WorkflowStatus, to: WorkflowStatus) -> Transition {
    use WorkflowStatus::*;

    if from.is_terminal() {
        return Transition::Rejected;
    }
    if from == to {
        return Transition::NoOp;
    }

    match (from, to) {
        (_, Failed) => Transition::Allowed,
        (Failed, RolledBack) => Transition::Allowed,
        (Failed, _) | (_, RolledBack) => Transition::Rejected,
        (from, to) if to.rank() > from.rank() => Transition::Allowed,
        _ => Transition::Rejected,
    }
}
