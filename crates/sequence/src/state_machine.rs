use serde::{Deserialize, Serialize};

use crate::types::EnrollmentStatus;

/// A single permitted status change for an enrollment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: EnrollmentStatus,
    pub to: EnrollmentStatus,
    pub trigger: &'static str,
}

/// Guards the enrollment lifecycle. Terminal statuses have no outgoing
/// transitions.
#[derive(Debug, Clone)]
pub struct EnrollmentStateMachine {
    transitions: Vec<StateTransition>,
}

impl EnrollmentStateMachine {
    pub fn new() -> Self {
        use EnrollmentStatus::*;

        let mut transitions = Vec::new();
        let mut allow = |from, to, trigger| transitions.push(StateTransition { from, to, trigger });

        for from in [Active, Waiting] {
            allow(from, Active, "step_due");
            allow(from, Waiting, "step_scheduled");
            allow(from, Paused, "operator_pause");
            allow(from, Completed, "last_step_done");
            allow(from, EndedByCondition, "condition_end");
            allow(from, Failed, "send_failed");
        }
        allow(Paused, Active, "operator_resume");
        allow(Paused, Waiting, "operator_resume");

        Self { transitions }
    }

    pub fn can_transition(&self, from: EnrollmentStatus, to: EnrollmentStatus) -> bool {
        self.transitions.iter().any(|t| t.from == from && t.to == to)
    }

    /// Trigger name of the transition, if permitted.
    pub fn trigger(&self, from: EnrollmentStatus, to: EnrollmentStatus) -> Option<&'static str> {
        self.transitions
            .iter()
            .find(|t| t.from == from && t.to == to)
            .map(|t| t.trigger)
    }
}

impl Default for EnrollmentStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use EnrollmentStatus::*;

    #[test]
    fn test_terminal_states_are_final() {
        let sm = EnrollmentStateMachine::new();
        for terminal in [Completed, EndedByCondition, Failed] {
            for to in [Active, Waiting, Paused, Completed, EndedByCondition, Failed] {
                assert!(!sm.can_transition(terminal, to), "{terminal:?} -> {to:?}");
            }
        }
    }

    #[test]
    fn test_paused_only_resumes() {
        let sm = EnrollmentStateMachine::new();
        assert!(sm.can_transition(Paused, Active));
        assert!(sm.can_transition(Paused, Waiting));
        assert!(!sm.can_transition(Paused, Completed));
        assert!(!sm.can_transition(Paused, Failed));
    }

    #[test]
    fn test_trigger_names() {
        let sm = EnrollmentStateMachine::new();
        assert_eq!(sm.trigger(Active, Completed), Some("last_step_done"));
        assert_eq!(sm.trigger(Waiting, Paused), Some("operator_pause"));
        assert_eq!(sm.trigger(Failed, Active), None);
    }
}
