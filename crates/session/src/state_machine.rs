use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

/// Aggregate execution status of one query set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    #[default]
    Idle,
    Debouncing,
    Loading,
    /// Previous results stay visible while a newer execution runs.
    Refreshing,
    Success,
    Error,
}

impl ExecutionStatus {
    /// No execution is pending or in flight.
    pub fn is_settled(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Idle | ExecutionStatus::Success | ExecutionStatus::Error
        )
    }

    pub fn is_busy(&self) -> bool {
        matches!(self, ExecutionStatus::Loading | ExecutionStatus::Refreshing)
    }
}

/// A single permitted status change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: ExecutionStatus,
    pub to: ExecutionStatus,
    pub trigger: String,
}

fn t(from: ExecutionStatus, to: ExecutionStatus, trigger: &str) -> StateTransition {
    StateTransition {
        from,
        to,
        trigger: trigger.to_string(),
    }
}

/// Guards the scheduler's status with a fixed transition table.
#[derive(Debug, Clone)]
pub struct ExecutionStateMachine {
    pub state: ExecutionStatus,
    pub transitions: Vec<StateTransition>,
}

impl ExecutionStateMachine {
    pub fn new() -> Self {
        use ExecutionStatus::*;
        let mut transitions = vec![
            // configuration edits (re)start the debounce window
            t(Idle, Debouncing, "config_changed"),
            t(Debouncing, Debouncing, "config_changed"),
            t(Loading, Debouncing, "config_changed"),
            t(Refreshing, Debouncing, "config_changed"),
            t(Success, Debouncing, "config_changed"),
            t(Error, Debouncing, "config_changed"),
            // debounce window elapsed
            t(Debouncing, Loading, "debounce_elapsed"),
            t(Debouncing, Refreshing, "debounce_elapsed_with_results"),
            // current generation resolved
            t(Loading, Success, "execution_succeeded"),
            t(Loading, Error, "execution_failed"),
            t(Refreshing, Success, "execution_succeeded"),
            t(Refreshing, Error, "execution_failed"),
        ];
        for from in [Debouncing, Loading, Refreshing, Success, Error] {
            transitions.push(t(from, Idle, "cleared"));
        }

        Self {
            state: Idle,
            transitions,
        }
    }

    pub fn can_transition(&self, from: &ExecutionStatus, to: &ExecutionStatus) -> bool {
        self.transitions
            .iter()
            .any(|t| t.from == *from && t.to == *to)
    }

    pub fn transition(&mut self, to: ExecutionStatus) -> Result<()> {
        if self.can_transition(&self.state, &to) {
            self.state = to;
            Ok(())
        } else {
            Err(anyhow!(
                "Invalid execution transition from {:?} to {:?}",
                self.state,
                to
            ))
        }
    }

    /// Back to idle from anywhere.
    pub fn reset(&mut self) {
        self.state = ExecutionStatus::Idle;
    }
}

impl Default for ExecutionStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ExecutionStatus::*;

    #[test]
    fn test_happy_path() {
        let mut sm = ExecutionStateMachine::new();
        assert_eq!(sm.state, Idle);
        sm.transition(Debouncing).unwrap();
        sm.transition(Loading).unwrap();
        sm.transition(Success).unwrap();
        sm.transition(Debouncing).unwrap();
        sm.transition(Refreshing).unwrap();
        sm.transition(Error).unwrap();
    }

    #[test]
    fn test_invalid_transitions() {
        let mut sm = ExecutionStateMachine::new();
        assert!(sm.transition(Loading).is_err());
        assert!(sm.transition(Success).is_err());
        assert!(sm.transition(Idle).is_err());
        assert_eq!(sm.state, Idle);

        sm.transition(Debouncing).unwrap();
        assert!(sm.transition(Success).is_err());
    }

    #[test]
    fn test_every_active_state_can_clear() {
        for state in [Debouncing, Loading, Refreshing, Success, Error] {
            let sm = ExecutionStateMachine {
                state,
                ..ExecutionStateMachine::new()
            };
            assert!(sm.can_transition(&state, &Idle), "{state:?}");
        }
    }

    #[test]
    fn test_settled() {
        assert!(Idle.is_settled());
        assert!(Success.is_settled());
        assert!(!Debouncing.is_settled());
        assert!(Refreshing.is_busy());
    }
}
