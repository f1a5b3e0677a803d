//! Lifecycle state machines shared across components.

use serde::{Deserialize, Serialize};
use std::fmt;

/// State of one task execution attempt.
///
/// The only legal forward path is CREATED → SCHEDULED → DEPLOYING → RUNNING,
/// after which exactly one terminal state is reached. DEPLOYING → RUNNING is
/// driven solely by the owning task executor's report; the master never
/// transitions optimistically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    Created,
    Scheduled,
    Deploying,
    Running,
    Finished,
    Canceling,
    Canceled,
    Failed,
}

impl ExecutionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished | Self::Canceled | Self::Failed)
    }

    /// Whether `next` is a legal successor of this state.
    pub fn can_transition_to(&self, next: ExecutionState) -> bool {
        use ExecutionState::*;
        match (self, next) {
            (Created, Scheduled) => true,
            (Scheduled, Deploying) => true,
            (Deploying, Running) => true,
            (Running, Finished) => true,
            // Cancellation and failure can interrupt any non-terminal state.
            (s, Canceling) if !s.is_terminal() && *s != Canceling => true,
            (Canceling, Canceled) => true,
            (s, Failed) if !s.is_terminal() => true,
            (s, Canceled) if !s.is_terminal() => true,
            _ => false,
        }
    }
}

impl fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Created => "CREATED",
            Self::Scheduled => "SCHEDULED",
            Self::Deploying => "DEPLOYING",
            Self::Running => "RUNNING",
            Self::Finished => "FINISHED",
            Self::Canceling => "CANCELING",
            Self::Canceled => "CANCELED",
            Self::Failed => "FAILED",
        };
        write!(f, "{s}")
    }
}

/// State of one job as tracked by its job master.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Created,
    Running,
    Finished,
    Canceled,
    Failed,
    /// The master lost leadership; recoverable.
    Suspended,
}

impl JobStatus {
    /// Terminal for the cluster: the job will not make progress again under
    /// any master. SUSPENDED is terminal only for this master incarnation.
    pub fn is_globally_terminal(&self) -> bool {
        matches!(self, Self::Finished | Self::Canceled | Self::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Created => "CREATED",
            Self::Running => "RUNNING",
            Self::Finished => "FINISHED",
            Self::Canceled => "CANCELED",
            Self::Failed => "FAILED",
            Self::Suspended => "SUSPENDED",
        };
        write!(f, "{s}")
    }
}

/// State of one slot on a task executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotState {
    Free,
    /// Reserved for a job under an allocation id; no job master has taken
    /// ownership yet.
    Allocated,
    /// A job master accepted the offer and may run tasks in it.
    Active,
    Releasing,
}

/// Final status a cluster shuts down with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplicationStatus {
    Succeeded,
    Failed,
    Canceled,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_transitions() {
        use ExecutionState::*;
        assert!(Created.can_transition_to(Scheduled));
        assert!(Scheduled.can_transition_to(Deploying));
        assert!(Deploying.can_transition_to(Running));
        assert!(Running.can_transition_to(Finished));
    }

    #[test]
    fn test_no_transitions_out_of_terminal_states() {
        use ExecutionState::*;
        for terminal in [Finished, Canceled, Failed] {
            for next in [Created, Scheduled, Deploying, Running, Canceling, Canceled, Failed] {
                assert!(!terminal.can_transition_to(next), "{terminal} -> {next}");
            }
        }
    }

    #[test]
    fn test_failure_interrupts_running() {
        assert!(ExecutionState::Running.can_transition_to(ExecutionState::Failed));
        assert!(ExecutionState::Deploying.can_transition_to(ExecutionState::Canceling));
    }

    #[test]
    fn test_suspended_is_not_globally_terminal() {
        assert!(!JobStatus::Suspended.is_globally_terminal());
        assert!(JobStatus::Failed.is_globally_terminal());
    }
}
