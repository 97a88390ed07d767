//! Batch state tracking.

use serde::{Deserialize, Serialize};

/// Sequencer lifecycle state.
///
/// # State Machine
///
/// ```text
///            start                 SlotReached            ImageReady
/// Idle ──────────────> AwaitingFilter ─────────> Exposing ─────────> Downloading
///   ▲  └──(no filter)──────────────────────────────▲   ▲                 │
///   │                                              │   └──next image─────┤
///   │                     AwaitingFilter <─────────┼──────next group─────┤
///   │                                                                    │
///   ├──────────── Done <──────────────── last image of last group ───────┘
///   ├──────────── Alert <─────────────── device failure / disconnect
///   └──────────── Aborting <──────────── abort (ack or timeout → Idle)
/// ```
///
/// `Done` and `Alert` are transient: they are published, then the sequencer
/// settles in `Idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BatchState {
    /// No batch running
    Idle,
    /// Waiting for the filter wheel to reach the group's slot
    AwaitingFilter,
    /// Waiting for the camera to deliver the current image
    Exposing,
    /// Waiting for the current image to be persisted
    Downloading,
    /// Abort requested, waiting for the device to acknowledge
    Aborting,
    /// Last image of the last group persisted
    Done,
    /// Run terminated by a device failure
    Alert,
}

impl std::fmt::Display for BatchState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BatchState::Idle => write!(f, "Idle"),
            BatchState::AwaitingFilter => write!(f, "AwaitingFilter"),
            BatchState::Exposing => write!(f, "Exposing"),
            BatchState::Downloading => write!(f, "Downloading"),
            BatchState::Aborting => write!(f, "Aborting"),
            BatchState::Done => write!(f, "Done"),
            BatchState::Alert => write!(f, "Alert"),
        }
    }
}

impl BatchState {
    /// Whether a run is in progress (including a pending abort).
    pub fn is_busy(&self) -> bool {
        matches!(
            self,
            BatchState::AwaitingFilter
                | BatchState::Exposing
                | BatchState::Downloading
                | BatchState::Aborting
        )
    }

    /// Whether groups and controlled devices may be changed.
    pub fn can_configure(&self) -> bool {
        matches!(self, BatchState::Idle)
    }

    /// Whether `abort` has something to cancel.
    pub fn can_abort(&self) -> bool {
        !matches!(self, BatchState::Idle | BatchState::Done | BatchState::Alert)
    }

    /// Coarse health derived from the state.
    pub fn health(&self) -> Health {
        match self {
            BatchState::Idle | BatchState::Done => Health::Ok,
            BatchState::Alert => Health::Alert,
            _ => Health::Busy,
        }
    }
}

/// Status light published to the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Health {
    /// Nothing running, last transition was normal
    Ok,
    /// Batch in progress
    Busy,
    /// Run terminated by a failure
    Alert,
}

impl std::fmt::Display for Health {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Health::Ok => write!(f, "Ok"),
            Health::Busy => write!(f, "Busy"),
            Health::Alert => write!(f, "Alert"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_predicates() {
        assert!(BatchState::Idle.can_configure());
        assert!(!BatchState::Exposing.can_configure());
        assert!(!BatchState::Aborting.can_configure());

        assert!(BatchState::Exposing.can_abort());
        assert!(BatchState::Aborting.can_abort());
        assert!(!BatchState::Idle.can_abort());
        assert!(!BatchState::Done.can_abort());
        assert!(!BatchState::Alert.can_abort());

        assert!(BatchState::Downloading.is_busy());
        assert!(!BatchState::Alert.is_busy());
    }

    #[test]
    fn test_health_projection() {
        assert_eq!(BatchState::Idle.health(), Health::Ok);
        assert_eq!(BatchState::Done.health(), Health::Ok);
        assert_eq!(BatchState::AwaitingFilter.health(), Health::Busy);
        assert_eq!(BatchState::Aborting.health(), Health::Busy);
        assert_eq!(BatchState::Alert.health(), Health::Alert);
    }
}
