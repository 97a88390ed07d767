//! Mock Hardware Implementations
//!
//! Provides simulated devices for running batches without physical hardware.
//! All mock devices use async-safe operations (tokio::time::sleep, not std::thread::sleep)
//! and report completion on the event channel they were built with.
//!
//! # Available Mocks
//!
//! - `MockCamera` - Simulated camera producing small FITS frames
//! - `MockFilterWheel` - Simulated wheel that steps through every slot on its way
//!
//! # Timing
//!
//! - MockCamera: exposure duration × time scale (1.0 = real time)
//! - MockFilterWheel: 100ms per slot step by default
//!
//! Both can be told to fail their next command, and the camera can be told to
//! ignore abort requests, so error and abort paths can be exercised.

use crate::hardware::capabilities::{CameraControl, FilterWheelControl};
use crate::hardware::{DeviceEvent, DeviceId};
use crate::imager::Binning;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use chrono::Utc;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};
use tracing::{debug, info};

/// FITS files are written in blocks of this many bytes.
const FITS_BLOCK: usize = 2880;

// =============================================================================
// MockCamera - Simulated Camera
// =============================================================================

/// Mock camera with timed exposures
///
/// Simulates a camera with:
/// - Configurable sensor resolution (binning divides it)
/// - Exposure time scaled by a configurable factor
/// - FITS-encoded frames tagged with the frame number
///
/// # Example
///
/// ```rust,ignore
/// let (tx, mut rx) = tokio::sync::mpsc::channel(16);
/// let camera = MockCamera::new("CCD Simulator", tx).with_time_scale(0.01);
/// camera.connect().await;
/// camera.begin_exposure(Duration::from_secs(1), Binning::default()).await?;
/// // rx yields ConnectionChanged, then ImageReady after ~10ms
/// ```
pub struct MockCamera {
    id: DeviceId,
    events: mpsc::Sender<DeviceEvent>,
    connected: Arc<AtomicBool>,
    resolution: (u32, u32),
    time_scale: f64,
    acknowledge_abort: bool,
    frame_count: Arc<AtomicU64>,
    exposure_task: Mutex<Option<JoinHandle<()>>>,
    failures: Mutex<VecDeque<String>>,
}

impl MockCamera {
    /// Create a disconnected mock camera with a 64x64 sensor running in real time.
    pub fn new(id: impl Into<DeviceId>, events: mpsc::Sender<DeviceEvent>) -> Self {
        Self {
            id: id.into(),
            events,
            connected: Arc::new(AtomicBool::new(false)),
            resolution: (64, 64),
            time_scale: 1.0,
            acknowledge_abort: true,
            frame_count: Arc::new(AtomicU64::new(0)),
            exposure_task: Mutex::new(None),
            failures: Mutex::new(VecDeque::new()),
        }
    }

    /// Set the sensor resolution in unbinned pixels.
    pub fn with_resolution(mut self, width: u32, height: u32) -> Self {
        self.resolution = (width, height);
        self
    }

    /// Scale exposure durations (0.001 turns seconds into milliseconds).
    pub fn with_time_scale(mut self, scale: f64) -> Self {
        self.time_scale = scale.max(0.0);
        self
    }

    /// Whether `abort_exposure` emits `ExposureAborted`.
    pub fn with_abort_acknowledgement(mut self, acknowledge: bool) -> Self {
        self.acknowledge_abort = acknowledge;
        self
    }

    /// Frames delivered so far.
    pub fn frame_count(&self) -> u64 {
        self.frame_count.load(Ordering::SeqCst)
    }

    /// Connect and announce it on the event channel.
    pub async fn connect(&self) {
        self.connected.store(true, Ordering::SeqCst);
        info!(device = %self.id, "MockCamera: Connected");
        self.emit(DeviceEvent::ConnectionChanged {
            device: self.id.clone(),
            connected: true,
        })
        .await;
    }

    /// Drop the connection, killing any exposure in progress.
    pub async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        if let Some(task) = self.exposure_task.lock().await.take() {
            task.abort();
        }
        info!(device = %self.id, "MockCamera: Disconnected");
        self.emit(DeviceEvent::ConnectionChanged {
            device: self.id.clone(),
            connected: false,
        })
        .await;
    }

    /// Make the next exposure fail with `reason`.
    pub async fn fail_next_exposure(&self, reason: impl Into<String>) {
        self.failures.lock().await.push_back(reason.into());
    }

    async fn emit(&self, event: DeviceEvent) {
        // Receiver gone means nobody is listening any more
        let _ = self.events.send(event).await;
    }

    fn scaled(&self, exposure: Duration) -> Duration {
        exposure.mul_f64(self.time_scale)
    }
}

#[async_trait]
impl CameraControl for MockCamera {
    fn id(&self) -> &DeviceId {
        &self.id
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn begin_exposure(&self, exposure: Duration, binning: Binning) -> Result<()> {
        if !self.is_connected() {
            anyhow::bail!("MockCamera: {} is not connected", self.id);
        }
        if !binning.is_valid() {
            anyhow::bail!("MockCamera: invalid binning {}", binning);
        }

        let mut task = self.exposure_task.lock().await;
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            anyhow::bail!("MockCamera: exposure already in progress");
        }

        let delay = self.scaled(exposure);
        let device = self.id.clone();
        let events = self.events.clone();
        let failure = self.failures.lock().await.pop_front();
        debug!(device = %device, ?exposure, %binning, "MockCamera: Exposure started");

        let handle = match failure {
            Some(reason) => tokio::spawn(async move {
                sleep(delay).await;
                let _ = events
                    .send(DeviceEvent::ExposureFailed { device, reason })
                    .await;
            }),
            None => {
                let frame_count = Arc::clone(&self.frame_count);
                let (width, height) = (
                    (self.resolution.0 / u32::from(binning.x)).max(1),
                    (self.resolution.1 / u32::from(binning.y)).max(1),
                );
                tokio::spawn(async move {
                    sleep(delay).await;
                    let frame = frame_count.fetch_add(1, Ordering::SeqCst) + 1;
                    let payload = fits_frame(width, height, frame, exposure);
                    debug!(device = %device, frame, bytes = payload.len(), "MockCamera: Frame ready");
                    let _ = events
                        .send(DeviceEvent::ImageReady {
                            device,
                            payload,
                            format: ".fits".to_string(),
                        })
                        .await;
                })
            }
        };
        *task = Some(handle);
        Ok(())
    }

    async fn abort_exposure(&self) -> Result<()> {
        if let Some(task) = self.exposure_task.lock().await.take() {
            task.abort();
            info!(device = %self.id, "MockCamera: Exposure aborted");
        }
        if self.acknowledge_abort {
            emit_detached(
                &self.events,
                DeviceEvent::ExposureAborted {
                    device: self.id.clone(),
                },
            );
        }
        Ok(())
    }
}

/// Send an event without waiting for channel capacity.
///
/// Commands are issued from the task that drains the event channel, so a
/// command must never block on that channel itself.
fn emit_detached(events: &mpsc::Sender<DeviceEvent>, event: DeviceEvent) {
    let events = events.clone();
    tokio::spawn(async move {
        let _ = events.send(event).await;
    });
}

/// Encode a 16-bit test pattern as a single-HDU FITS file.
fn fits_frame(width: u32, height: u32, frame: u64, exposure: Duration) -> Bytes {
    let cards = [
        format!("{:<8}= {:>20}", "SIMPLE", "T"),
        format!("{:<8}= {:>20}", "BITPIX", 16),
        format!("{:<8}= {:>20}", "NAXIS", 2),
        format!("{:<8}= {:>20}", "NAXIS1", width),
        format!("{:<8}= {:>20}", "NAXIS2", height),
        format!("{:<8}= {:>20}", "BZERO", 32768),
        format!("{:<8}= {:>20}", "EXPTIME", format!("{:.3}", exposure.as_secs_f64())),
        format!(
            "{:<8}= '{}'",
            "DATE-OBS",
            Utc::now().format("%Y-%m-%dT%H:%M:%S%.3f")
        ),
        format!("{:<8}= {:>20}", "FRAME", frame),
        "END".to_string(),
    ];

    let pixels = width as usize * height as usize;
    let mut buf = BytesMut::with_capacity(FITS_BLOCK * 2 + pixels * 2);
    for card in &cards {
        buf.put_slice(format!("{:<80}", card).as_bytes());
    }
    buf.put_bytes(b' ', padding(buf.len()));

    let header_len = buf.len();
    for i in 0..pixels {
        let value = ((i as u64 + frame) % 4096) as i32 - 32768;
        buf.put_i16(value as i16);
    }
    buf.put_bytes(0, padding(buf.len() - header_len));
    buf.freeze()
}

fn padding(len: usize) -> usize {
    (FITS_BLOCK - len % FITS_BLOCK) % FITS_BLOCK
}

// =============================================================================
// MockFilterWheel - Simulated Filter Wheel
// =============================================================================

/// Mock filter wheel that rotates one slot at a time
///
/// Simulates a wheel with:
/// - Slots numbered from 1
/// - Forward-only rotation that wraps around, reporting every slot it passes
/// - Fixed time per slot step
///
/// # Example
///
/// ```rust,ignore
/// let wheel = MockFilterWheel::new("Filter Simulator", 5, tx);
/// wheel.connect().await;
/// wheel.select_slot(3).await?; // SlotReached(2), SlotReached(3)
/// ```
pub struct MockFilterWheel {
    id: DeviceId,
    events: mpsc::Sender<DeviceEvent>,
    connected: Arc<AtomicBool>,
    slot_count: u32,
    position: Arc<AtomicU32>,
    step_time: Duration,
    motion: Mutex<Option<JoinHandle<()>>>,
    failures: Mutex<VecDeque<String>>,
}

impl MockFilterWheel {
    /// Create a disconnected wheel parked on slot 1.
    pub fn new(
        id: impl Into<DeviceId>,
        slot_count: u32,
        events: mpsc::Sender<DeviceEvent>,
    ) -> Self {
        Self {
            id: id.into(),
            events,
            connected: Arc::new(AtomicBool::new(false)),
            slot_count: slot_count.max(1),
            position: Arc::new(AtomicU32::new(1)),
            step_time: Duration::from_millis(100),
            motion: Mutex::new(None),
            failures: Mutex::new(VecDeque::new()),
        }
    }

    /// Set the time taken to advance one slot.
    pub fn with_step_time(mut self, step_time: Duration) -> Self {
        self.step_time = step_time;
        self
    }

    /// Slot currently in the beam.
    pub fn position(&self) -> u32 {
        self.position.load(Ordering::SeqCst)
    }

    /// Connect and announce it on the event channel.
    pub async fn connect(&self) {
        self.connected.store(true, Ordering::SeqCst);
        info!(device = %self.id, "MockFilterWheel: Connected");
        self.emit(DeviceEvent::ConnectionChanged {
            device: self.id.clone(),
            connected: true,
        })
        .await;
    }

    /// Drop the connection, stopping the wheel where it is.
    pub async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        if let Some(task) = self.motion.lock().await.take() {
            task.abort();
        }
        info!(device = %self.id, "MockFilterWheel: Disconnected");
        self.emit(DeviceEvent::ConnectionChanged {
            device: self.id.clone(),
            connected: false,
        })
        .await;
    }

    /// Make the next move fail with `reason`.
    pub async fn fail_next_move(&self, reason: impl Into<String>) {
        self.failures.lock().await.push_back(reason.into());
    }

    async fn emit(&self, event: DeviceEvent) {
        let _ = self.events.send(event).await;
    }
}

#[async_trait]
impl FilterWheelControl for MockFilterWheel {
    fn id(&self) -> &DeviceId {
        &self.id
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn slot_count(&self) -> u32 {
        self.slot_count
    }

    async fn select_slot(&self, slot: u32) -> Result<()> {
        if !self.is_connected() {
            anyhow::bail!("MockFilterWheel: {} is not connected", self.id);
        }
        if slot == 0 || slot > self.slot_count {
            return Err(anyhow!(
                "MockFilterWheel: slot {} out of range 1..={}",
                slot,
                self.slot_count
            ));
        }

        let mut motion = self.motion.lock().await;
        if motion.as_ref().is_some_and(|t| !t.is_finished()) {
            anyhow::bail!("MockFilterWheel: already moving");
        }

        let device = self.id.clone();
        let events = self.events.clone();
        let position = Arc::clone(&self.position);
        let step_time = self.step_time;
        let slot_count = self.slot_count;
        let failure = self.failures.lock().await.pop_front();
        debug!(device = %device, from = self.position(), to = slot, "MockFilterWheel: Moving");

        let handle = tokio::spawn(async move {
            if let Some(reason) = failure {
                sleep(step_time).await;
                let _ = events.send(DeviceEvent::MoveFailed { device, reason }).await;
                return;
            }

            let mut current = position.load(Ordering::SeqCst);
            if current == slot {
                let _ = events.send(DeviceEvent::SlotReached { device, slot }).await;
                return;
            }
            while current != slot {
                sleep(step_time).await;
                current = current % slot_count + 1;
                position.store(current, Ordering::SeqCst);
                let _ = events
                    .send(DeviceEvent::SlotReached {
                        device: device.clone(),
                        slot: current,
                    })
                    .await;
            }
        });
        *motion = Some(handle);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        if let Some(task) = self.motion.lock().await.take() {
            task.abort();
        }
        let slot = self.position();
        info!(device = %self.id, slot, "MockFilterWheel: Stopped");
        emit_detached(
            &self.events,
            DeviceEvent::SlotReached {
                device: self.id.clone(),
                slot,
            },
        );
        Ok(())
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    async fn next(rx: &mut mpsc::Receiver<DeviceEvent>) -> DeviceEvent {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for device event")
            .expect("event channel closed")
    }

    #[tokio::test]
    async fn test_mock_camera_requires_connection() {
        let (tx, _rx) = mpsc::channel(8);
        let camera = MockCamera::new("ccd", tx);

        let result = camera
            .begin_exposure(Duration::from_millis(1), Binning::default())
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_mock_camera_delivers_fits_frame() {
        let (tx, mut rx) = mpsc::channel(8);
        let camera = MockCamera::new("ccd", tx)
            .with_resolution(32, 16)
            .with_time_scale(0.001);
        camera.connect().await;
        assert!(matches!(
            next(&mut rx).await,
            DeviceEvent::ConnectionChanged { connected: true, .. }
        ));

        camera
            .begin_exposure(Duration::from_secs(1), Binning::new(2, 2))
            .await
            .unwrap();

        match next(&mut rx).await {
            DeviceEvent::ImageReady {
                payload, format, ..
            } => {
                assert_eq!(format, ".fits");
                assert!(payload.starts_with(b"SIMPLE  ="));
                assert_eq!(payload.len() % FITS_BLOCK, 0);
                let header = String::from_utf8_lossy(&payload[..FITS_BLOCK]);
                assert!(header.contains("NAXIS1  =                   16"));
                assert!(header.contains("NAXIS2  =                    8"));
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert_eq!(camera.frame_count(), 1);
    }

    #[tokio::test]
    async fn test_mock_camera_rejects_overlapping_exposure() {
        let (tx, _rx) = mpsc::channel(8);
        let camera = MockCamera::new("ccd", tx);
        camera.connect().await;

        camera
            .begin_exposure(Duration::from_secs(10), Binning::default())
            .await
            .unwrap();
        assert!(camera
            .begin_exposure(Duration::from_secs(10), Binning::default())
            .await
            .is_err());
        camera.abort_exposure().await.unwrap();
    }

    #[tokio::test]
    async fn test_mock_camera_abort_acknowledged() {
        let (tx, mut rx) = mpsc::channel(8);
        let camera = MockCamera::new("ccd", tx);
        camera.connect().await;
        next(&mut rx).await;

        camera
            .begin_exposure(Duration::from_secs(10), Binning::default())
            .await
            .unwrap();
        camera.abort_exposure().await.unwrap();
        assert!(matches!(
            next(&mut rx).await,
            DeviceEvent::ExposureAborted { .. }
        ));
        assert_eq!(camera.frame_count(), 0);
    }

    #[tokio::test]
    async fn test_abort_and_stop_return_with_full_channel() {
        let (tx, mut rx) = mpsc::channel(1);
        let camera = MockCamera::new("ccd", tx);
        // Connection event fills the only slot
        camera.connect().await;
        tokio::time::timeout(Duration::from_secs(1), camera.abort_exposure())
            .await
            .expect("abort blocked on the event channel")
            .unwrap();
        assert!(matches!(
            next(&mut rx).await,
            DeviceEvent::ConnectionChanged { .. }
        ));
        assert!(matches!(
            next(&mut rx).await,
            DeviceEvent::ExposureAborted { .. }
        ));

        let (tx, mut rx) = mpsc::channel(1);
        let wheel = MockFilterWheel::new("wheel", 5, tx);
        wheel.connect().await;
        tokio::time::timeout(Duration::from_secs(1), wheel.stop())
            .await
            .expect("stop blocked on the event channel")
            .unwrap();
        next(&mut rx).await;
        assert!(matches!(
            next(&mut rx).await,
            DeviceEvent::SlotReached { slot: 1, .. }
        ));
    }

    #[tokio::test]
    async fn test_mock_camera_injected_failure() {
        let (tx, mut rx) = mpsc::channel(8);
        let camera = MockCamera::new("ccd", tx).with_time_scale(0.001);
        camera.connect().await;
        next(&mut rx).await;

        camera.fail_next_exposure("shutter stuck").await;
        camera
            .begin_exposure(Duration::from_secs(1), Binning::default())
            .await
            .unwrap();
        match next(&mut rx).await {
            DeviceEvent::ExposureFailed { reason, .. } => assert_eq!(reason, "shutter stuck"),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_mock_wheel_reports_every_slot() {
        let (tx, mut rx) = mpsc::channel(16);
        let wheel =
            MockFilterWheel::new("wheel", 5, tx).with_step_time(Duration::from_millis(1));
        wheel.connect().await;
        next(&mut rx).await;

        wheel.select_slot(4).await.unwrap();
        let mut reached = Vec::new();
        for _ in 0..3 {
            if let DeviceEvent::SlotReached { slot, .. } = next(&mut rx).await {
                reached.push(slot);
            }
        }
        assert_eq!(reached, vec![2, 3, 4]);
        assert_eq!(wheel.position(), 4);

        // Wraps around going forward
        wheel.select_slot(1).await.unwrap();
        let mut reached = Vec::new();
        for _ in 0..2 {
            if let DeviceEvent::SlotReached { slot, .. } = next(&mut rx).await {
                reached.push(slot);
            }
        }
        assert_eq!(reached, vec![5, 1]);
    }

    #[tokio::test]
    async fn test_mock_wheel_same_slot_reports_immediately() {
        let (tx, mut rx) = mpsc::channel(8);
        let wheel = MockFilterWheel::new("wheel", 5, tx);
        wheel.connect().await;
        next(&mut rx).await;

        wheel.select_slot(1).await.unwrap();
        assert_eq!(
            next(&mut rx).await,
            DeviceEvent::SlotReached {
                device: "wheel".into(),
                slot: 1
            }
        );
    }

    #[tokio::test]
    async fn test_mock_wheel_range_check() {
        let (tx, _rx) = mpsc::channel(8);
        let wheel = MockFilterWheel::new("wheel", 5, tx);
        wheel.connect().await;

        assert!(wheel.select_slot(0).await.is_err());
        assert!(wheel.select_slot(6).await.is_err());
    }

    #[test]
    fn test_fits_padding() {
        let frame = fits_frame(3, 3, 1, Duration::from_millis(500));
        assert_eq!(frame.len(), FITS_BLOCK * 2);
        assert_eq!(padding(FITS_BLOCK), 0);
        assert_eq!(padding(1), FITS_BLOCK - 1);
    }
}
