use campaign_core::types::EnrollmentStatus;
use campaign_core::{CampaignError, CampaignResult};
use serde::{Deserialize, Serialize};

/// Describes a single valid state transition for an enrollment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: EnrollmentStatus,
    pub to: EnrollmentStatus,
    pub trigger: &'static str,
}

/// Guards the enrollment lifecycle by enforcing a finite set of valid
/// state transitions. Completed and stopped have no exits.
#[derive(Debug, Clone)]
pub struct EnrollmentStateMachine {
    transitions: Vec<StateTransition>,
}

impl EnrollmentStateMachine {
    pub fn new() -> Self {
        use EnrollmentStatus::*;
        let transitions = vec![
            // Active ->
            StateTransition {
                from: Active,
                to: Frozen,
                trigger: "campaign_paused",
            },
            StateTransition {
                from: Active,
                to: Completed,
                trigger: "sequence_exhausted",
            },
            StateTransition {
                from: Active,
                to: Stopped,
                trigger: "stop",
            },
            // Frozen ->
            StateTransition {
                from: Frozen,
                to: Active,
                trigger: "campaign_resumed",
            },
            StateTransition {
                from: Frozen,
                to: Completed,
                trigger: "sequence_exhausted",
            },
            StateTransition {
                from: Frozen,
                to: Stopped,
                trigger: "stop",
            },
        ];

        Self { transitions }
    }

    /// Returns `true` if the given transition is allowed.
    pub fn can_transition(&self, from: EnrollmentStatus, to: EnrollmentStatus) -> bool {
        self.transitions.iter().any(|t| t.from == from && t.to == to)
    }

    /// Validate a move from `from` to `to`.
    pub fn check(&self, from: EnrollmentStatus, to: EnrollmentStatus) -> CampaignResult<()> {
        if self.can_transition(from, to) {
            Ok(())
        } else {
            Err(CampaignError::InvalidTransition {
                from: from.to_string(),
                to: to.to_string(),
            })
        }
    }

    /// Validate and apply a move on `status` in place.
    pub fn transition(&self, status: &mut EnrollmentStatus, to: EnrollmentStatus) -> CampaignResult<()> {
        self.check(*status, to)?;
        *status = to;
        Ok(())
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
    fn test_freeze_round_trip() {
        let sm = EnrollmentStateMachine::new();
        let mut status = Active;
        sm.transition(&mut status, Frozen).unwrap();
        sm.transition(&mut status, Active).unwrap();
        assert_eq!(status, Active);
    }

    #[test]
    fn test_terminal_states_have_no_exits() {
        let sm = EnrollmentStateMachine::new();
        for terminal in [Completed, Stopped] {
            for to in [Active, Frozen, Completed, Stopped] {
                assert!(!sm.can_transition(terminal, to), "{terminal} -> {to}");
            }
        }
    }

    #[test]
    fn test_invalid_transition_leaves_status() {
        let sm = EnrollmentStateMachine::new();
        let mut status = Stopped;
        let err = sm.transition(&mut status, Active).unwrap_err();
        assert!(matches!(err, CampaignError::InvalidTransition { .. }));
        assert_eq!(status, Stopped);
    }

    #[test]
    fn test_live_states_can_end() {
        let sm = EnrollmentStateMachine::new();
        for from in [Active, Frozen] {
            assert!(sm.can_transition(from, Completed));
            assert!(sm.can_transition(from, Stopped));
        }
        assert!(!sm.can_transition(Active, Active));
    }
}
