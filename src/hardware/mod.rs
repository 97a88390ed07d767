//! Device boundary.
//!
//! The sequencer never talks to hardware directly. Drivers implement the capability
//! traits in [`capabilities`] and report completion asynchronously as [`DeviceEvent`]s;
//! the sequencer keeps its own view of each device in [`proxy`].

pub mod capabilities;
pub mod mock;
pub mod proxy;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

pub use capabilities::{CameraControl, FilterWheelControl};
pub use proxy::{CameraProxy, ConnectionState, ExposureState, FilterWheelProxy};

/// Name of a remote device, as used by the transport to route events.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    /// Create a device identifier.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// The device name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for DeviceId {
    fn from(name: String) -> Self {
        Self(name)
    }
}

/// Asynchronous notification from a device driver.
///
/// Events for one device arrive in the order the driver observed them; there is no
/// ordering guarantee across devices.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceEvent {
    /// Device connected or disconnected
    ConnectionChanged {
        /// Originating device
        device: DeviceId,
        /// New connection state
        connected: bool,
    },
    /// Filter wheel settled on a slot
    SlotReached {
        /// Originating device
        device: DeviceId,
        /// Slot now in the beam
        slot: u32,
    },
    /// Filter wheel could not complete a move
    MoveFailed {
        /// Originating device
        device: DeviceId,
        /// Driver-supplied reason
        reason: String,
    },
    /// Camera finished an exposure and delivered the frame
    ImageReady {
        /// Originating device
        device: DeviceId,
        /// Encoded image bytes
        payload: Bytes,
        /// Container format tag, e.g. `.fits`
        format: String,
    },
    /// Camera could not complete an exposure
    ExposureFailed {
        /// Originating device
        device: DeviceId,
        /// Driver-supplied reason
        reason: String,
    },
    /// Camera acknowledged an abort request
    ExposureAborted {
        /// Originating device
        device: DeviceId,
    },
}

impl DeviceEvent {
    /// The device that emitted the event.
    pub fn device(&self) -> &DeviceId {
        match self {
            DeviceEvent::ConnectionChanged { device, .. }
            | DeviceEvent::SlotReached { device, .. }
            | DeviceEvent::MoveFailed { device, .. }
            | DeviceEvent::ImageReady { device, .. }
            | DeviceEvent::ExposureFailed { device, .. }
            | DeviceEvent::ExposureAborted { device } => device,
        }
    }

    /// Short event name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            DeviceEvent::ConnectionChanged { .. } => "connection_changed",
            DeviceEvent::SlotReached { .. } => "slot_reached",
            DeviceEvent::MoveFailed { .. } => "move_failed",
            DeviceEvent::ImageReady { .. } => "image_ready",
            DeviceEvent::ExposureFailed { .. } => "exposure_failed",
            DeviceEvent::ExposureAborted { .. } => "exposure_aborted",
        }
    }
}
