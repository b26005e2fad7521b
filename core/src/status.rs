//! Entity status model.
//!
//! Statuses are small enums that move forward only. Terminal statuses
//! (`completed`, `failed`, `closed`, ...) accept no further transitions, which is
//! what keeps a finished entity from being reverted by a late caller.

use crate::error::LifecycleError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A module-specific status enumeration
pub trait Status: Copy + Eq + fmt::Debug {
    /// Stable lowercase name
    fn as_str(&self) -> &'static str;

    /// Whether no further transition is possible
    fn is_terminal(&self) -> bool;

    /// Whether `self -> next` is allowed
    ///
    /// The default allows any change out of a non-terminal status.
    fn can_transition_to(&self, next: Self) -> bool {
        !self.is_terminal() && *self != next
    }
}

/// Move `current` to `next`, or explain why not
///
/// # Errors
///
/// Returns [`LifecycleError::InvalidTransition`] when
/// [`Status::can_transition_to`] refuses the move.
pub fn transition<S: Status>(
    kind: &'static str,
    id: &str,
    current: S,
    next: S,
) -> Result<S, LifecycleError> {
    if current.can_transition_to(next) {
        Ok(next)
    } else {
        Err(LifecycleError::InvalidTransition {
            kind,
            id: id.to_string(),
            from: current.as_str(),
            to: next.as_str(),
        })
    }
}

/// `pending → running → {completed | failed}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Created, not started
    Pending,
    /// In progress
    Running,
    /// Finished successfully
    Completed,
    /// Finished unsuccessfully
    Failed,
}

impl Status for RunStatus {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    fn can_transition_to(&self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Running | Self::Failed)
                | (Self::Running, Self::Completed | Self::Failed)
        )
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `open → closed`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateStatus {
    /// Accepting work
    Open,
    /// Closed for good
    Closed,
}

impl Status for GateStatus {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Closed => "closed",
        }
    }

    fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed)
    }
}

impl fmt::Display for GateStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_status_happy_path() {
        let status = transition("Job", "j1", RunStatus::Pending, RunStatus::Running).unwrap();
        let status = transition("Job", "j1", status, RunStatus::Completed).unwrap();
        assert_eq!(status, RunStatus::Completed);
    }

    #[test]
    fn test_terminal_status_cannot_revert() {
        for terminal in [RunStatus::Completed, RunStatus::Failed] {
            for next in [RunStatus::Pending, RunStatus::Running, RunStatus::Completed, RunStatus::Failed] {
                assert!(transition("Job", "j1", terminal, next).is_err());
            }
        }
    }

    #[test]
    fn test_pending_cannot_skip_to_completed() {
        let err = transition("Job", "j9", RunStatus::Pending, RunStatus::Completed).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Job j9 cannot move from pending to completed"
        );
    }

    #[test]
    fn test_gate_closes_once() {
        let closed = transition("Policy", "p1", GateStatus::Open, GateStatus::Closed).unwrap();
        assert!(transition("Policy", "p1", closed, GateStatus::Open).is_err());
        assert!(transition("Policy", "p1", closed, GateStatus::Closed).is_err());
    }
}
