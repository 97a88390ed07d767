//! Inbound events and outbound commands of the sequencer.
//!
//! The sequencer is a pure transition function: every [`ImagerEvent`] it is fed
//! produces a list of [`Command`]s for the agent to carry out. Nothing here
//! performs I/O.

use crate::hardware::{DeviceEvent, DeviceId};
use crate::imager::status::StatusReport;
use crate::imager::Binning;
use bytes::Bytes;
use std::time::Duration;

/// Everything the sequencer reacts to besides operator requests.
#[derive(Debug, Clone, PartialEq)]
pub enum ImagerEvent {
    /// Notification from a device driver
    Device(DeviceEvent),
    /// The image store persisted a frame
    DownloadComplete {
        /// Name the frame was stored under
        filename: String,
        /// Token of the `Persist` command that produced this result
        token: u64,
    },
    /// The image store could not persist a frame
    DownloadFailed {
        /// Name the frame was to be stored under
        filename: String,
        /// Token of the `Persist` command that produced this result
        token: u64,
        /// Store-supplied reason
        reason: String,
    },
    /// The bounded wait after an abort request elapsed
    AbortTimeout {
        /// Token of the `ArmAbortTimer` command that scheduled this timeout
        token: u64,
    },
}

impl From<DeviceEvent> for ImagerEvent {
    fn from(event: DeviceEvent) -> Self {
        ImagerEvent::Device(event)
    }
}

/// A downloaded frame on its way to the image store.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageRecord {
    /// Deterministic file name
    pub filename: String,
    /// Identifies this save; names repeat across runs, tokens do not
    pub token: u64,
    /// Zero-based group index
    pub group: usize,
    /// Zero-based image index within the group
    pub image: u32,
    /// Encoded frame
    pub payload: Bytes,
    /// Container format tag reported by the camera
    pub format: String,
}

/// Action requested by the sequencer.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Rotate the filter wheel
    SelectFilter {
        /// Target wheel
        device: DeviceId,
        /// Slot to select
        slot: u32,
    },
    /// Start one exposure
    StartExposure {
        /// Target camera
        device: DeviceId,
        /// Integration time
        exposure: Duration,
        /// On-chip binning
        binning: Binning,
    },
    /// Abort the exposure in progress
    AbortExposure {
        /// Target camera
        device: DeviceId,
    },
    /// Stop filter wheel motion
    StopFilterWheel {
        /// Target wheel
        device: DeviceId,
    },
    /// Hand a frame to the image store
    Persist(ImageRecord),
    /// Deliver `ImagerEvent::AbortTimeout { token }` after the given delay
    ArmAbortTimer {
        /// Identifies the abort request; stale timeouts are ignored
        token: u64,
        /// Bounded wait for acknowledgement
        after: Duration,
    },
    /// Publish a status snapshot to the supervisor
    Publish(StatusReport),
}

impl Command {
    /// Whether the command is addressed to a device.
    pub fn is_device_command(&self) -> bool {
        matches!(
            self,
            Command::SelectFilter { .. }
                | Command::StartExposure { .. }
                | Command::AbortExposure { .. }
                | Command::StopFilterWheel { .. }
        )
    }
}
