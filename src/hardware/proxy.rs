//! The sequencer's local view of the devices it drives.
//!
//! Proxies are bookkeeping only. They remember which device is bound, whether it is
//! connected, the last value it reported and whether a command to it is still
//! outstanding. Device handles themselves live with the agent.

use crate::hardware::{DeviceEvent, DeviceId};
use serde::{Deserialize, Serialize};

/// Connection state of a controlled device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ConnectionState {
    /// Not connected (the initial state)
    #[default]
    Disconnected,
    /// Connected and accepting commands
    Connected,
}

impl ConnectionState {
    /// Whether the device is connected.
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

impl From<bool> for ConnectionState {
    fn from(connected: bool) -> Self {
        if connected {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        }
    }
}

/// Last exposure state reported by the camera.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExposureState {
    /// Exposure started
    Exposing,
    /// Frame delivered
    Complete,
    /// Exposure failed
    Failed(String),
    /// Exposure aborted on request
    Aborted,
}

/// Camera bookkeeping.
#[derive(Debug, Clone, PartialEq)]
pub struct CameraProxy {
    id: DeviceId,
    connection: ConnectionState,
    last_state: Option<ExposureState>,
    outstanding: bool,
}

impl CameraProxy {
    /// Bind a camera; it starts out disconnected.
    pub fn new(id: DeviceId) -> Self {
        Self {
            id,
            connection: ConnectionState::Disconnected,
            last_state: None,
            outstanding: false,
        }
    }

    /// Bound device name.
    pub fn id(&self) -> &DeviceId {
        &self.id
    }

    /// Current connection state.
    pub fn connection(&self) -> ConnectionState {
        self.connection
    }

    /// Last exposure state reported.
    pub fn last_state(&self) -> Option<&ExposureState> {
        self.last_state.as_ref()
    }

    /// Whether an exposure command is awaiting completion.
    pub fn has_outstanding(&self) -> bool {
        self.outstanding
    }

    /// Whether the event was emitted by this camera.
    pub fn owns(&self, event: &DeviceEvent) -> bool {
        event.device() == &self.id
    }

    pub(crate) fn exposure_issued(&mut self) {
        self.outstanding = true;
        self.last_state = Some(ExposureState::Exposing);
    }

    pub(crate) fn clear_outstanding(&mut self) {
        self.outstanding = false;
    }

    /// Fold an event from this camera into the bookkeeping.
    ///
    /// Only a disconnect clears the outstanding exposure here. Completion events
    /// may be left over from an earlier run, so the sequencer clears it once it
    /// has accepted one.
    pub(crate) fn observe(&mut self, event: &DeviceEvent) {
        match event {
            DeviceEvent::ConnectionChanged { connected, .. } => {
                self.connection = (*connected).into();
                if !connected {
                    self.outstanding = false;
                }
            }
            DeviceEvent::ImageReady { .. } => {
                self.last_state = Some(ExposureState::Complete);
            }
            DeviceEvent::ExposureFailed { reason, .. } => {
                self.last_state = Some(ExposureState::Failed(reason.clone()));
            }
            DeviceEvent::ExposureAborted { .. } => {
                self.last_state = Some(ExposureState::Aborted);
            }
            DeviceEvent::SlotReached { .. } | DeviceEvent::MoveFailed { .. } => {}
        }
    }
}

/// Filter wheel bookkeeping.
#[derive(Debug, Clone, PartialEq)]
pub struct FilterWheelProxy {
    id: DeviceId,
    connection: ConnectionState,
    last_slot: Option<u32>,
    outstanding: Option<u32>,
}

impl FilterWheelProxy {
    /// Bind a filter wheel; it starts out disconnected.
    pub fn new(id: DeviceId) -> Self {
        Self {
            id,
            connection: ConnectionState::Disconnected,
            last_slot: None,
            outstanding: None,
        }
    }

    /// Bound device name.
    pub fn id(&self) -> &DeviceId {
        &self.id
    }

    /// Current connection state.
    pub fn connection(&self) -> ConnectionState {
        self.connection
    }

    /// Last slot the wheel reported reaching.
    pub fn last_slot(&self) -> Option<u32> {
        self.last_slot
    }

    /// Slot requested and not yet reached.
    pub fn outstanding(&self) -> Option<u32> {
        self.outstanding
    }

    /// Whether the event was emitted by this wheel.
    pub fn owns(&self, event: &DeviceEvent) -> bool {
        event.device() == &self.id
    }

    pub(crate) fn move_issued(&mut self, slot: u32) {
        self.outstanding = Some(slot);
    }

    pub(crate) fn clear_outstanding(&mut self) {
        self.outstanding = None;
    }

    /// Fold an event from this wheel into the bookkeeping.
    pub(crate) fn observe(&mut self, event: &DeviceEvent) {
        match event {
            DeviceEvent::ConnectionChanged { connected, .. } => {
                self.connection = (*connected).into();
                if !connected {
                    self.outstanding = None;
                }
            }
            DeviceEvent::SlotReached { slot, .. } => {
                self.last_slot = Some(*slot);
                if self.outstanding == Some(*slot) {
                    self.outstanding = None;
                }
            }
            DeviceEvent::MoveFailed { .. }
            | DeviceEvent::ImageReady { .. }
            | DeviceEvent::ExposureFailed { .. }
            | DeviceEvent::ExposureAborted { .. } => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn test_camera_proxy_tracks_exposure() {
        let mut camera = CameraProxy::new("ccd".into());
        assert_eq!(camera.connection(), ConnectionState::Disconnected);

        camera.observe(&DeviceEvent::ConnectionChanged {
            device: "ccd".into(),
            connected: true,
        });
        assert!(camera.connection().is_connected());

        camera.exposure_issued();
        assert!(camera.has_outstanding());

        camera.observe(&DeviceEvent::ImageReady {
            device: "ccd".into(),
            payload: Bytes::from_static(b"SIMPLE"),
            format: ".fits".into(),
        });
        assert_eq!(camera.last_state(), Some(&ExposureState::Complete));
        // Stays outstanding until the sequencer accepts the frame
        assert!(camera.has_outstanding());
        camera.clear_outstanding();
        assert!(!camera.has_outstanding());
    }

    #[test]
    fn test_completion_events_keep_outstanding() {
        let mut camera = CameraProxy::new("ccd".into());
        camera.exposure_issued();
        camera.observe(&DeviceEvent::ExposureAborted {
            device: "ccd".into(),
        });
        assert!(camera.has_outstanding());
        assert_eq!(camera.last_state(), Some(&ExposureState::Aborted));

        let mut wheel = FilterWheelProxy::new("wheel".into());
        wheel.move_issued(3);
        wheel.observe(&DeviceEvent::MoveFailed {
            device: "wheel".into(),
            reason: "jammed".into(),
        });
        assert_eq!(wheel.outstanding(), Some(3));
    }

    #[test]
    fn test_disconnect_clears_outstanding() {
        let mut camera = CameraProxy::new("ccd".into());
        camera.exposure_issued();
        camera.observe(&DeviceEvent::ConnectionChanged {
            device: "ccd".into(),
            connected: false,
        });
        assert!(!camera.has_outstanding());

        let mut wheel = FilterWheelProxy::new("wheel".into());
        wheel.move_issued(3);
        wheel.observe(&DeviceEvent::ConnectionChanged {
            device: "wheel".into(),
            connected: false,
        });
        assert_eq!(wheel.outstanding(), None);
    }

    #[test]
    fn test_wheel_proxy_only_clears_on_requested_slot() {
        let mut wheel = FilterWheelProxy::new("wheel".into());
        wheel.move_issued(3);

        // Passing an intermediate slot does not complete the move
        wheel.observe(&DeviceEvent::SlotReached {
            device: "wheel".into(),
            slot: 2,
        });
        assert_eq!(wheel.outstanding(), Some(3));
        assert_eq!(wheel.last_slot(), Some(2));

        wheel.observe(&DeviceEvent::SlotReached {
            device: "wheel".into(),
            slot: 3,
        });
        assert_eq!(wheel.outstanding(), None);
        assert_eq!(wheel.last_slot(), Some(3));
    }
}
