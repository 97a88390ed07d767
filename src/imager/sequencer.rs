//! Batch sequencer.
//!
//! [`Imager`] is the state machine that walks a batch of groups. Operator requests
//! (`configure`, `set_controlled_devices`, `start`, `abort`) are validated
//! synchronously; everything else arrives through [`Imager::handle_event`]. Both
//! return the [`Command`]s the caller must carry out. The sequencer does no I/O and
//! never blocks, so it can be driven by the agent task or directly by tests.
//!
//! # Architecture
//!
//! ```text
//! operator ──start/abort──┐
//!                          ▼
//! device events ──────> Imager ──> Commands ──> agent ──> camera / filter wheel / store
//!                          ▲                                      │
//!                          └──────────── events ──────────────────┘
//! ```
//!
//! At most one device command is outstanding at any time: the wheel is only moved
//! while the camera is idle, and the next exposure is only started once the
//! previous frame has been stored.

use crate::error::{AppResult, ImagerError};
use crate::hardware::{CameraProxy, DeviceEvent, DeviceId, FilterWheelProxy};
use crate::imager::event::{Command, ImageRecord, ImagerEvent};
use crate::imager::group::{validate_groups, Group};
use crate::imager::naming::{image_filename, validate_prefix, DEFAULT_PREFIX};
use crate::imager::state::BatchState;
use crate::imager::status::{estimate_remaining, StatusReport};
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Default bounded wait for a device to acknowledge an abort.
pub const DEFAULT_ABORT_TIMEOUT: Duration = Duration::from_secs(5);

/// Batch sequencer driving one camera and an optional filter wheel.
///
/// # Example
///
/// ```
/// use imager_agent::hardware::DeviceEvent;
/// use imager_agent::imager::{Binning, BatchState, Group, Imager};
/// use std::time::Duration;
///
/// let mut imager = Imager::new();
/// imager.set_controlled_devices("CCD Simulator".into(), None)?;
/// imager.configure(vec![Group::new(2, None, Duration::from_secs(1), Binning::default())?])?;
/// imager.handle_event(
///     DeviceEvent::ConnectionChanged { device: "CCD Simulator".into(), connected: true }.into(),
/// );
///
/// imager.start()?;
/// assert_eq!(imager.state(), BatchState::Exposing);
/// # Ok::<(), imager_agent::error::ImagerError>(())
/// ```
#[derive(Debug)]
pub struct Imager {
    groups: Vec<Group>,
    state: BatchState,
    current_group: usize,
    current_image: u32,
    camera: Option<CameraProxy>,
    filter_wheel: Option<FilterWheelProxy>,
    prefix: String,
    abort_timeout: Duration,
    abort_token: u64,
    /// Slot confirmed by the wheel during the current run
    selected_slot: Option<u32>,
    download_token: u64,
    /// Token and file name of the frame being stored
    pending_download: Option<(u64, String)>,
    last_alert: Option<String>,
    run_id: Option<String>,
}

impl Default for Imager {
    fn default() -> Self {
        Self::new()
    }
}

impl Imager {
    /// Create an idle sequencer with no groups and no devices bound.
    pub fn new() -> Self {
        Self {
            groups: Vec::new(),
            state: BatchState::Idle,
            current_group: 0,
            current_image: 0,
            camera: None,
            filter_wheel: None,
            prefix: DEFAULT_PREFIX.to_string(),
            abort_timeout: DEFAULT_ABORT_TIMEOUT,
            abort_token: 0,
            download_token: 0,
            selected_slot: None,
            pending_download: None,
            last_alert: None,
            run_id: None,
        }
    }

    /// Set the bounded wait for abort acknowledgement.
    pub fn with_abort_timeout(mut self, timeout: Duration) -> Self {
        self.abort_timeout = timeout;
        self
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Current state.
    pub fn state(&self) -> BatchState {
        self.state
    }

    /// Configured groups.
    pub fn groups(&self) -> &[Group] {
        &self.groups
    }

    /// Zero-based index of the group being captured.
    pub fn current_group(&self) -> usize {
        self.current_group
    }

    /// Zero-based index of the image being captured within its group.
    pub fn current_image(&self) -> u32 {
        self.current_image
    }

    /// Camera bookkeeping, if a camera is bound.
    pub fn camera(&self) -> Option<&CameraProxy> {
        self.camera.as_ref()
    }

    /// Filter wheel bookkeeping, if a wheel is bound.
    pub fn filter_wheel(&self) -> Option<&FilterWheelProxy> {
        self.filter_wheel.as_ref()
    }

    /// File name prefix for stored frames.
    pub fn image_prefix(&self) -> &str {
        &self.prefix
    }

    /// Reason the most recent run ended in Alert.
    pub fn last_alert(&self) -> Option<&str> {
        self.last_alert.as_deref()
    }

    /// Identifier of the current or most recent run.
    pub fn run_id(&self) -> Option<&str> {
        self.run_id.as_deref()
    }

    /// Number of exposures a full batch takes.
    pub fn total_images(&self) -> u64 {
        self.groups.iter().map(|g| u64::from(g.image_count)).sum()
    }

    /// Whether any group needs the filter wheel.
    pub fn requires_filter_wheel(&self) -> bool {
        self.groups.iter().any(Group::requires_filter)
    }

    /// Build the status snapshot for the current state.
    pub fn status(&self) -> StatusReport {
        let remaining = if self.state.is_busy() {
            estimate_remaining(&self.groups, self.current_group, self.current_image)
        } else {
            Duration::ZERO
        };
        StatusReport {
            state: self.state,
            health: self.state.health(),
            group: self.current_group,
            image: self.current_image,
            remaining,
            group_count: self.groups.len(),
            camera_connected: self
                .camera
                .as_ref()
                .is_some_and(|c| c.connection().is_connected()),
            filter_wheel_connected: self
                .filter_wheel
                .as_ref()
                .map(|w| w.connection().is_connected()),
            alert: self.last_alert.clone(),
            run_id: self.run_id.clone(),
        }
    }

    // =========================================================================
    // Operator requests
    // =========================================================================

    /// Replace the group list.
    ///
    /// # Errors
    /// - `Busy` unless idle
    /// - `Configuration` for an empty list, more than `MAX_GROUP_COUNT` groups or an
    ///   invalid group; the previous groups are kept
    pub fn configure(&mut self, groups: Vec<Group>) -> AppResult<Vec<Command>> {
        self.ensure_idle()?;
        validate_groups(&groups)?;

        info!(
            group_count = groups.len(),
            "Configured {} images in {} groups",
            groups.iter().map(|g| u64::from(g.image_count)).sum::<u64>(),
            groups.len()
        );
        self.groups = groups;
        self.current_group = 0;
        self.current_image = 0;
        Ok(vec![Command::Publish(self.status())])
    }

    /// Choose which camera and filter wheel to drive.
    ///
    /// Rebinding a device to the same name keeps its bookkeeping; a new name starts
    /// out disconnected until the device reports otherwise.
    pub fn set_controlled_devices(
        &mut self,
        camera: DeviceId,
        filter_wheel: Option<DeviceId>,
    ) -> AppResult<Vec<Command>> {
        self.ensure_idle()?;

        if self.camera.as_ref().map(CameraProxy::id) != Some(&camera) {
            info!(camera = %camera, "Controlled camera set");
            self.camera = Some(CameraProxy::new(camera));
        }
        match filter_wheel {
            Some(wheel) => {
                if self.filter_wheel.as_ref().map(FilterWheelProxy::id) != Some(&wheel) {
                    info!(filter_wheel = %wheel, "Controlled filter wheel set");
                    self.filter_wheel = Some(FilterWheelProxy::new(wheel));
                }
            }
            None => {
                if self.filter_wheel.take().is_some() {
                    info!("Controlled filter wheel cleared");
                }
            }
        }
        Ok(vec![Command::Publish(self.status())])
    }

    /// Change the file name prefix for stored frames.
    pub fn set_image_prefix(&mut self, prefix: impl Into<String>) -> AppResult<()> {
        self.ensure_idle()?;
        let prefix = prefix.into();
        validate_prefix(&prefix)?;
        self.prefix = prefix;
        Ok(())
    }

    /// Start a batch from the first image of the first group.
    ///
    /// # Errors
    /// Fails without changing state if the sequencer is busy, no group is
    /// configured, a group is invalid, the camera is missing or offline, or a
    /// group needs a filter and the wheel is missing or offline.
    pub fn start(&mut self) -> AppResult<Vec<Command>> {
        self.ensure_idle()?;
        validate_groups(&self.groups)?;

        let camera = self
            .camera
            .as_ref()
            .ok_or(ImagerError::DeviceNotAssigned("camera"))?;
        if !camera.connection().is_connected() {
            return Err(ImagerError::DeviceNotConnected(camera.id().to_string()));
        }
        if self.requires_filter_wheel() {
            let wheel = self
                .filter_wheel
                .as_ref()
                .ok_or(ImagerError::DeviceNotAssigned("filter wheel"))?;
            if !wheel.connection().is_connected() {
                return Err(ImagerError::DeviceNotConnected(wheel.id().to_string()));
            }
        }

        let run_id = Uuid::new_v4().to_string();
        info!(
            run_id = %run_id,
            groups = self.groups.len(),
            images = self.total_images(),
            "Starting batch"
        );
        self.run_id = Some(run_id);
        self.current_group = 0;
        self.current_image = 0;
        self.selected_slot = None;
        self.pending_download = None;
        self.last_alert = None;

        let mut commands = Vec::new();
        self.begin_group(&mut commands);
        Ok(commands)
    }

    /// Cancel the running batch.
    ///
    /// The device with an outstanding command is told to stop and an abort timer is
    /// armed; the sequencer returns to `Idle` on the first acknowledgement or when
    /// the timer fires, whichever comes first. With nothing outstanding it returns
    /// to `Idle` at once. Calling `abort` with nothing to cancel is a no-op.
    pub fn abort(&mut self) -> AppResult<Vec<Command>> {
        let mut commands = Vec::new();
        if !self.state.can_abort() {
            debug!(state = %self.state, "Abort requested with no batch running");
            return Ok(commands);
        }
        match self.state {
            BatchState::Idle | BatchState::Done | BatchState::Alert => {}
            BatchState::Aborting => {
                debug!("Abort already in progress");
            }
            BatchState::AwaitingFilter => {
                info!(run_id = ?self.run_id, "Aborting batch during filter move");
                if let Some(wheel) = &self.filter_wheel {
                    commands.push(Command::StopFilterWheel {
                        device: wheel.id().clone(),
                    });
                }
                self.arm_abort_timer(&mut commands);
                self.transition(BatchState::Aborting, &mut commands);
            }
            BatchState::Exposing => {
                info!(run_id = ?self.run_id, "Aborting batch during exposure");
                if let Some(camera) = &self.camera {
                    commands.push(Command::AbortExposure {
                        device: camera.id().clone(),
                    });
                }
                self.arm_abort_timer(&mut commands);
                self.transition(BatchState::Aborting, &mut commands);
            }
            BatchState::Downloading => {
                info!(run_id = ?self.run_id, "Aborting batch during download");
                self.transition(BatchState::Aborting, &mut commands);
                self.finish_abort(&mut commands);
            }
        }
        Ok(commands)
    }

    // =========================================================================
    // Event handling
    // =========================================================================

    /// Process one inbound event.
    ///
    /// Events the sequencer is not waiting for, or that come from devices it does
    /// not drive, are logged and ignored.
    pub fn handle_event(&mut self, event: ImagerEvent) -> Vec<Command> {
        let mut commands = Vec::new();
        match event {
            ImagerEvent::Device(event) => self.handle_device_event(event, &mut commands),
            ImagerEvent::DownloadComplete { filename, token } => {
                if self.is_pending_download(token, &filename) {
                    info!(file = %filename, "Image stored");
                    self.pending_download = None;
                    self.advance(&mut commands);
                } else {
                    debug!(file = %filename, token, state = %self.state, "Ignoring stale download completion");
                }
            }
            ImagerEvent::DownloadFailed {
                filename,
                token,
                reason,
            } => {
                if self.is_pending_download(token, &filename) {
                    self.alert(
                        format!("Failed to store {}: {}", filename, reason),
                        &mut commands,
                    );
                } else {
                    debug!(file = %filename, token, state = %self.state, "Ignoring stale download failure");
                }
            }
            ImagerEvent::AbortTimeout { token } => {
                if self.state == BatchState::Aborting && token == self.abort_token {
                    warn!(
                        "Abort not acknowledged within {:?}, returning to Idle",
                        self.abort_timeout
                    );
                    self.finish_abort(&mut commands);
                } else {
                    debug!(token, "Ignoring expired abort timer");
                }
            }
        }
        commands
    }

    fn handle_device_event(&mut self, event: DeviceEvent, commands: &mut Vec<Command>) {
        let from_camera = self.camera.as_ref().is_some_and(|c| c.owns(&event));
        let from_wheel = self.filter_wheel.as_ref().is_some_and(|w| w.owns(&event));
        if !from_camera && !from_wheel {
            debug!(device = %event.device(), kind = event.kind(), "Ignoring event from uncontrolled device");
            return;
        }

        if from_camera {
            if let Some(camera) = self.camera.as_mut() {
                camera.observe(&event);
            }
        }
        if from_wheel {
            if let Some(wheel) = self.filter_wheel.as_mut() {
                wheel.observe(&event);
            }
        }

        if let DeviceEvent::ConnectionChanged { device, connected } = &event {
            self.on_connection_changed(device, *connected, from_camera, commands);
            return;
        }

        match (self.state, event) {
            (BatchState::AwaitingFilter, DeviceEvent::SlotReached { slot, .. }) if from_wheel => {
                let wanted = self.groups[self.current_group].filter_slot;
                if wanted == Some(slot) {
                    info!(slot, "Filter in place");
                    self.selected_slot = Some(slot);
                    self.begin_exposure(commands);
                } else {
                    debug!(slot, ?wanted, "Filter wheel passing slot");
                }
            }
            (BatchState::AwaitingFilter, DeviceEvent::MoveFailed { device, reason })
                if from_wheel =>
            {
                if let Some(wheel) = self.filter_wheel.as_mut() {
                    wheel.clear_outstanding();
                }
                self.alert(
                    format!("Filter wheel '{}' move failed: {}", device, reason),
                    commands,
                );
            }
            (
                BatchState::Exposing,
                DeviceEvent::ImageReady {
                    payload, format, ..
                },
            ) if from_camera => {
                if let Some(camera) = self.camera.as_mut() {
                    camera.clear_outstanding();
                }
                let filename =
                    image_filename(&self.prefix, self.current_group, self.current_image, &format);
                self.download_token = self.download_token.wrapping_add(1);
                let token = self.download_token;
                debug!(file = %filename, token, bytes = payload.len(), "Image ready, downloading");
                self.pending_download = Some((token, filename.clone()));
                commands.push(Command::Persist(ImageRecord {
                    filename,
                    token,
                    group: self.current_group,
                    image: self.current_image,
                    payload,
                    format,
                }));
                self.transition(BatchState::Downloading, commands);
            }
            (BatchState::Exposing, DeviceEvent::ExposureFailed { device, reason })
                if from_camera =>
            {
                if let Some(camera) = self.camera.as_mut() {
                    camera.clear_outstanding();
                }
                self.alert(
                    format!("Camera '{}' exposure failed: {}", device, reason),
                    commands,
                );
            }
            (BatchState::Aborting, event) => {
                let acknowledged = match &event {
                    DeviceEvent::ExposureAborted { .. } | DeviceEvent::ExposureFailed { .. } => {
                        from_camera
                    }
                    DeviceEvent::ImageReady { .. } => {
                        info!("Discarding image from aborted exposure");
                        from_camera
                    }
                    DeviceEvent::SlotReached { .. } | DeviceEvent::MoveFailed { .. } => from_wheel,
                    DeviceEvent::ConnectionChanged { .. } => false,
                };
                if acknowledged {
                    info!(kind = event.kind(), "Abort acknowledged");
                    self.finish_abort(commands);
                }
            }
            (state, event) => {
                debug!(%state, device = %event.device(), kind = event.kind(), "Ignoring unexpected event");
            }
        }
    }

    fn on_connection_changed(
        &mut self,
        device: &DeviceId,
        connected: bool,
        from_camera: bool,
        commands: &mut Vec<Command>,
    ) {
        let role = if from_camera { "Camera" } else { "Filter wheel" };
        if connected {
            info!(device = %device, "{} connected", role);
            commands.push(Command::Publish(self.status()));
            return;
        }

        warn!(device = %device, "{} disconnected", role);
        let required = from_camera || self.requires_filter_wheel();
        match self.state {
            BatchState::Aborting => self.finish_abort(commands),
            state if state.is_busy() && required => {
                self.alert(format!("{} '{}' disconnected", role, device), commands);
            }
            _ => commands.push(Command::Publish(self.status())),
        }
    }

    // =========================================================================
    // Transitions
    // =========================================================================

    /// Whether a store result belongs to the frame this run is waiting on.
    fn is_pending_download(&self, token: u64, filename: &str) -> bool {
        self.state == BatchState::Downloading
            && self
                .pending_download
                .as_ref()
                .is_some_and(|(pending, name)| *pending == token && name == filename)
    }

    fn ensure_idle(&self) -> AppResult<()> {
        if self.state.can_configure() {
            Ok(())
        } else {
            Err(ImagerError::Busy(self.state))
        }
    }

    fn transition(&mut self, next: BatchState, commands: &mut Vec<Command>) {
        if self.state != next {
            debug!(from = %self.state, to = %next, "State transition");
        }
        self.state = next;
        commands.push(Command::Publish(self.status()));
    }

    /// Select the current group's filter, or go straight to exposing when the
    /// group has none or the wheel already sits on it.
    fn begin_group(&mut self, commands: &mut Vec<Command>) {
        let group = &self.groups[self.current_group];
        info!(
            group = self.current_group + 1,
            images = group.image_count,
            exposure = ?group.exposure,
            binning = %group.binning,
            "Starting group"
        );

        let filter_slot = group.filter_slot;

        match filter_slot {
            Some(slot) if self.selected_slot != Some(slot) => {
                if let Some(wheel) = self.filter_wheel.as_mut() {
                    wheel.move_issued(slot);
                    commands.push(Command::SelectFilter {
                        device: wheel.id().clone(),
                        slot,
                    });
                    self.transition(BatchState::AwaitingFilter, commands);
                } else {
                    self.alert("No filter wheel bound for filter selection".into(), commands);
                }
            }
            _ => self.begin_exposure(commands),
        }
    }

    fn begin_exposure(&mut self, commands: &mut Vec<Command>) {
        let group = &self.groups[self.current_group];
        let (exposure, binning) = (group.exposure, group.binning);
        debug_assert!(
            self.filter_wheel
                .as_ref()
                .map_or(true, |w| w.outstanding().is_none()),
            "exposure issued while the filter wheel is moving"
        );
        if let Some(camera) = self.camera.as_mut() {
            camera.exposure_issued();
            commands.push(Command::StartExposure {
                device: camera.id().clone(),
                exposure,
                binning,
            });
            self.transition(BatchState::Exposing, commands);
        } else {
            self.alert("No camera bound for exposure".into(), commands);
        }
    }

    /// Decide the next step after a frame has been stored.
    fn advance(&mut self, commands: &mut Vec<Command>) {
        let image_count = self.groups[self.current_group].image_count;
        if self.current_image + 1 < image_count {
            self.current_image += 1;
            self.begin_exposure(commands);
        } else if self.current_group + 1 < self.groups.len() {
            self.current_group += 1;
            self.current_image = 0;
            self.begin_group(commands);
        } else {
            info!(
                run_id = ?self.run_id,
                images = self.total_images(),
                "Batch complete"
            );
            self.transition(BatchState::Done, commands);
            self.transition(BatchState::Idle, commands);
        }
    }

    fn arm_abort_timer(&mut self, commands: &mut Vec<Command>) {
        self.abort_token = self.abort_token.wrapping_add(1);
        commands.push(Command::ArmAbortTimer {
            token: self.abort_token,
            after: self.abort_timeout,
        });
    }

    fn finish_abort(&mut self, commands: &mut Vec<Command>) {
        self.clear_outstanding();
        info!(run_id = ?self.run_id, "Batch aborted");
        self.transition(BatchState::Idle, commands);
    }

    /// Terminate the run: stop anything still in flight, publish the alert and
    /// settle in Idle.
    fn alert(&mut self, reason: String, commands: &mut Vec<Command>) {
        error!(run_id = ?self.run_id, "{}", reason);

        if let Some(camera) = &self.camera {
            if camera.has_outstanding() && camera.connection().is_connected() {
                commands.push(Command::AbortExposure {
                    device: camera.id().clone(),
                });
            }
        }
        if let Some(wheel) = &self.filter_wheel {
            if wheel.outstanding().is_some() && wheel.connection().is_connected() {
                commands.push(Command::StopFilterWheel {
                    device: wheel.id().clone(),
                });
            }
        }
        self.clear_outstanding();

        self.last_alert = Some(reason);
        self.transition(BatchState::Alert, commands);
        self.transition(BatchState::Idle, commands);
    }

    fn clear_outstanding(&mut self) {
        if let Some(camera) = self.camera.as_mut() {
            camera.clear_outstanding();
        }
        if let Some(wheel) = self.filter_wheel.as_mut() {
            wheel.clear_outstanding();
        }
        self.pending_download = None;
    }
}
