//! Device Capabilities
//!
//! Fine-grained capability traits for the two devices the imager drives. Each
//! trait is a fire-and-forget command surface: a method returns once the device
//! has accepted the command, and completion is reported later as a
//! [`DeviceEvent`](crate::hardware::DeviceEvent) on the driver's event channel.
//!
//! - A camera implements [`CameraControl`]
//! - A filter wheel implements [`FilterWheelControl`]
//!
//! # Design Philosophy
//!
//! Each capability trait:
//! - Is async (uses #[async_trait])
//! - Is thread-safe (requires Send + Sync)
//! - Uses anyhow::Result for errors
//! - Never retries; retry and abort policy belongs to the sequencer
//!
//! # Example
//!
//! ```rust,ignore
//! async fn expose_through<C, W>(camera: &C, wheel: &W) -> Result<()>
//! where
//!     C: CameraControl,
//!     W: FilterWheelControl,
//! {
//!     wheel.select_slot(2).await?;
//!     // ... wait for DeviceEvent::SlotReached on the event channel ...
//!     camera.begin_exposure(Duration::from_secs(30), Binning::new(2, 2)).await?;
//!     // ... wait for DeviceEvent::ImageReady ...
//!     Ok(())
//! }
//! ```

use crate::hardware::DeviceId;
use crate::imager::Binning;
use anyhow::Result;
use async_trait::async_trait;
use std::time::Duration;

/// Capability: Exposure Control
///
/// Cameras that take single timed exposures and upload the resulting frame.
///
/// # Contract
/// - `begin_exposure` returns as soon as the exposure has started
/// - The frame arrives later as `DeviceEvent::ImageReady`, or the failure as
///   `DeviceEvent::ExposureFailed`
/// - `abort_exposure` is acknowledged with `DeviceEvent::ExposureAborted`
#[async_trait]
pub trait CameraControl: Send + Sync {
    /// Device name used to tag events
    fn id(&self) -> &DeviceId;

    /// Whether the camera is currently connected
    fn is_connected(&self) -> bool;

    /// Start a single exposure
    ///
    /// # Arguments
    /// * `exposure` - Integration time
    /// * `binning` - On-chip binning for this frame
    ///
    /// # Returns
    /// - Ok(()) if the exposure started
    /// - Err if the camera is offline, busy or rejects the parameters
    async fn begin_exposure(&self, exposure: Duration, binning: Binning) -> Result<()>;

    /// Abort the exposure in progress
    ///
    /// Aborting an idle camera is not an error.
    async fn abort_exposure(&self) -> Result<()>;
}

/// Capability: Filter Selection
///
/// Filter wheels with numbered slots (1-based, like most wheel drivers).
///
/// # Contract
/// - `select_slot` returns once motion has started
/// - Arrival is reported as `DeviceEvent::SlotReached`, failure as
///   `DeviceEvent::MoveFailed`
#[async_trait]
pub trait FilterWheelControl: Send + Sync {
    /// Device name used to tag events
    fn id(&self) -> &DeviceId;

    /// Whether the wheel is currently connected
    fn is_connected(&self) -> bool;

    /// Number of slots on the wheel
    fn slot_count(&self) -> u32;

    /// Rotate to a slot
    ///
    /// # Returns
    /// - Ok(()) if motion started
    /// - Err if the slot is out of range or the wheel is offline
    async fn select_slot(&self, slot: u32) -> Result<()>;

    /// Stop motion in progress
    ///
    /// # Default Implementation
    /// Returns an error indicating stop is not supported.
    async fn stop(&self) -> Result<()> {
        anyhow::bail!("Stop not supported by this filter wheel")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct RecordingWheel {
        id: DeviceId,
        requested: Mutex<Vec<u32>>,
    }

    #[async_trait]
    impl FilterWheelControl for RecordingWheel {
        fn id(&self) -> &DeviceId {
            &self.id
        }

        fn is_connected(&self) -> bool {
            true
        }

        fn slot_count(&self) -> u32 {
            5
        }

        async fn select_slot(&self, slot: u32) -> Result<()> {
            if slot == 0 || slot > self.slot_count() {
                anyhow::bail!("slot {} out of range", slot);
            }
            self.requested.lock().unwrap().push(slot);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_filter_wheel_trait() {
        let wheel = RecordingWheel {
            id: DeviceId::new("wheel"),
            requested: Mutex::new(Vec::new()),
        };

        wheel.select_slot(2).await.unwrap();
        wheel.select_slot(5).await.unwrap();
        assert!(wheel.select_slot(6).await.is_err());
        assert_eq!(*wheel.requested.lock().unwrap(), vec![2, 5]);

        // Default stop is unsupported
        assert!(wheel.stop().await.is_err());
    }
}
