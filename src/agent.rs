//! Imager agent: the actor that owns the sequencer.
//!
//! The [`Imager`] state machine does no I/O. `ImagerAgent` wraps it in a single tokio
//! task that serializes operator requests, device events, download results and abort
//! timers, and carries out the [`Command`]s the sequencer returns.
//!
//! # Message Flow
//!
//! ```text
//! AgentHandle ──AgentRequest──┐
//!                              ▼
//! device drivers ──DeviceEvent──> agent task ──> Imager::handle_event
//!                              ▲        │
//! store / timers ──ImagerEvent─┘        └──> camera / filter wheel / ImageStore / watch
//! ```
//!
//! Requests carry a oneshot sender for the reply. Status reports are published on a
//! `watch` channel so any number of observers see the latest snapshot.

use crate::error::{AppResult, ImagerError};
use crate::hardware::{CameraControl, DeviceEvent, DeviceId, FilterWheelControl};
use crate::imager::{Command, Group, ImageRecord, Imager, ImagerEvent, StatusReport};
use crate::storage::{ImageStore, StoredImage};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Capacity of the request and internal event channels.
const CHANNEL_CAPACITY: usize = 64;

/// Requests accepted by the agent task.
///
/// Each variant carries a `oneshot::Sender` for the reply. Prefer the methods on
/// [`AgentHandle`], which build the request and await the reply.
#[derive(Debug)]
pub enum AgentRequest {
    /// Replace the group list (Idle only)
    Configure {
        groups: Vec<Group>,
        response: oneshot::Sender<AppResult<()>>,
    },
    /// Choose the camera and optional filter wheel by name (Idle only)
    SetDevices {
        camera: DeviceId,
        filter_wheel: Option<DeviceId>,
        response: oneshot::Sender<AppResult<()>>,
    },
    /// Change the file name prefix (Idle only)
    SetImagePrefix {
        prefix: String,
        response: oneshot::Sender<AppResult<()>>,
    },
    /// Start a batch
    Start {
        response: oneshot::Sender<AppResult<()>>,
    },
    /// Abort the running batch
    Abort {
        response: oneshot::Sender<AppResult<()>>,
    },
    /// Current status snapshot
    Status {
        response: oneshot::Sender<StatusReport>,
    },
    /// Read back a stored frame by zero-based (group, image)
    LoadImage {
        group: usize,
        image: u32,
        response: oneshot::Sender<AppResult<Option<StoredImage>>>,
    },
    /// Abort anything running and stop the task
    Shutdown { response: oneshot::Sender<()> },
}

/// Cloneable front end to a running agent.
#[derive(Clone)]
pub struct AgentHandle {
    requests: mpsc::Sender<AgentRequest>,
    status: watch::Receiver<StatusReport>,
}

impl AgentHandle {
    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> AgentRequest,
    ) -> AppResult<T> {
        let (tx, rx) = oneshot::channel();
        self.requests
            .send(make(tx))
            .await
            .map_err(|_| ImagerError::AgentStopped)?;
        rx.await.map_err(|_| ImagerError::AgentStopped)
    }

    /// Replace the group list.
    pub async fn configure(&self, groups: Vec<Group>) -> AppResult<()> {
        self.request(|response| AgentRequest::Configure { groups, response })
            .await?
    }

    /// Choose the devices to drive. Both must be registered with the agent.
    pub async fn set_devices(
        &self,
        camera: impl Into<DeviceId>,
        filter_wheel: Option<DeviceId>,
    ) -> AppResult<()> {
        let camera = camera.into();
        self.request(|response| AgentRequest::SetDevices {
            camera,
            filter_wheel,
            response,
        })
        .await?
    }

    /// Change the file name prefix.
    pub async fn set_image_prefix(&self, prefix: impl Into<String>) -> AppResult<()> {
        let prefix = prefix.into();
        self.request(|response| AgentRequest::SetImagePrefix { prefix, response })
            .await?
    }

    /// Start a batch. Returns once the first device command has been issued.
    pub async fn start(&self) -> AppResult<()> {
        self.request(|response| AgentRequest::Start { response })
            .await?
    }

    /// Abort the running batch. A no-op when nothing is running.
    pub async fn abort(&self) -> AppResult<()> {
        self.request(|response| AgentRequest::Abort { response })
            .await?
    }

    /// Ask the agent for a fresh status snapshot.
    pub async fn status(&self) -> AppResult<StatusReport> {
        self.request(|response| AgentRequest::Status { response })
            .await
    }

    /// Subscribe to published status reports.
    pub fn subscribe(&self) -> watch::Receiver<StatusReport> {
        self.status.clone()
    }

    /// Read back the frame stored for zero-based (group, image).
    pub async fn load_image(&self, group: usize, image: u32) -> AppResult<Option<StoredImage>> {
        self.request(|response| AgentRequest::LoadImage {
            group,
            image,
            response,
        })
        .await?
    }

    /// Stop the agent, aborting any batch in progress.
    pub async fn shutdown(&self) -> AppResult<()> {
        self.request(|response| AgentRequest::Shutdown { response })
            .await
    }
}

/// Owns the sequencer, the device registry and the image store.
pub struct ImagerAgent {
    imager: Imager,
    cameras: HashMap<DeviceId, Arc<dyn CameraControl>>,
    filter_wheels: HashMap<DeviceId, Arc<dyn FilterWheelControl>>,
    store: Arc<dyn ImageStore>,
    status_tx: watch::Sender<StatusReport>,
    internal_tx: mpsc::Sender<ImagerEvent>,
    internal_rx: Option<mpsc::Receiver<ImagerEvent>>,
}

impl ImagerAgent {
    /// Create an agent around `imager`, storing frames in `store`.
    pub fn new(imager: Imager, store: Arc<dyn ImageStore>) -> Self {
        let (status_tx, _) = watch::channel(imager.status());
        let (internal_tx, internal_rx) = mpsc::channel(CHANNEL_CAPACITY);
        Self {
            imager,
            cameras: HashMap::new(),
            filter_wheels: HashMap::new(),
            store,
            status_tx,
            internal_tx,
            internal_rx: Some(internal_rx),
        }
    }

    /// Make a camera available for `SetDevices`.
    pub fn register_camera(&mut self, camera: Arc<dyn CameraControl>) {
        debug!(device = %camera.id(), "Registered camera");
        self.cameras.insert(camera.id().clone(), camera);
    }

    /// Make a filter wheel available for `SetDevices`.
    pub fn register_filter_wheel(&mut self, wheel: Arc<dyn FilterWheelControl>) {
        debug!(device = %wheel.id(), "Registered filter wheel");
        self.filter_wheels.insert(wheel.id().clone(), wheel);
    }

    /// Spawn the agent task.
    ///
    /// `device_events` is the receiving end of the channel the registered drivers
    /// report on.
    pub fn spawn(self, device_events: mpsc::Receiver<DeviceEvent>) -> (AgentHandle, JoinHandle<()>) {
        let (request_tx, request_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let handle = AgentHandle {
            requests: request_tx,
            status: self.status_tx.subscribe(),
        };
        let task = tokio::spawn(self.run(request_rx, device_events));
        (handle, task)
    }

    /// Agent event loop.
    ///
    /// Runs until a `Shutdown` request arrives or every [`AgentHandle`] is dropped.
    pub async fn run(
        mut self,
        mut requests: mpsc::Receiver<AgentRequest>,
        mut device_events: mpsc::Receiver<DeviceEvent>,
    ) {
        let Some(mut internal) = self.internal_rx.take() else {
            error!("Imager agent started twice");
            return;
        };
        info!("Imager agent started");

        loop {
            tokio::select! {
                request = requests.recv() => {
                    let Some(request) = request else {
                        info!("All agent handles dropped");
                        break;
                    };
                    if !self.handle_request(request).await {
                        break;
                    }
                }
                Some(event) = device_events.recv() => {
                    self.process(event.into()).await;
                }
                Some(event) = internal.recv() => {
                    self.process(event).await;
                }
            }
        }

        if let Ok(commands) = self.imager.abort() {
            self.execute(commands).await;
        }
        info!("Imager agent stopped");
    }

    /// Returns false once the agent should stop.
    async fn handle_request(&mut self, request: AgentRequest) -> bool {
        match request {
            AgentRequest::Configure { groups, response } => {
                let result = self.imager.configure(groups);
                let _ = response.send(self.complete(result).await);
            }
            AgentRequest::SetDevices {
                camera,
                filter_wheel,
                response,
            } => {
                let result = self.set_devices(camera, filter_wheel).await;
                let _ = response.send(result);
            }
            AgentRequest::SetImagePrefix { prefix, response } => {
                let _ = response.send(self.imager.set_image_prefix(prefix));
            }
            AgentRequest::Start { response } => {
                let result = self.imager.start();
                let _ = response.send(self.complete(result).await);
            }
            AgentRequest::Abort { response } => {
                let result = self.imager.abort();
                let _ = response.send(self.complete(result).await);
            }
            AgentRequest::Status { response } => {
                let _ = response.send(self.imager.status());
            }
            AgentRequest::LoadImage {
                group,
                image,
                response,
            } => {
                let result = self
                    .store
                    .load(group, image)
                    .await
                    .map_err(|e| ImagerError::Storage(format!("{:#}", e)));
                let _ = response.send(result);
            }
            AgentRequest::Shutdown { response } => {
                info!("Shutdown requested");
                if let Ok(commands) = self.imager.abort() {
                    self.execute(commands).await;
                }
                let _ = response.send(());
                return false;
            }
        }
        true
    }

    async fn complete(&mut self, result: AppResult<Vec<Command>>) -> AppResult<()> {
        match result {
            Ok(commands) => {
                self.execute(commands).await;
                Ok(())
            }
            Err(e) if e.is_rejection() => {
                warn!(error = %e, "Request rejected");
                Err(e)
            }
            Err(e) => {
                error!(error = %e, "Request failed");
                Err(e)
            }
        }
    }

    async fn set_devices(
        &mut self,
        camera: DeviceId,
        filter_wheel: Option<DeviceId>,
    ) -> AppResult<()> {
        let camera_handle = self.cameras.get(&camera).cloned().ok_or_else(|| {
            ImagerError::Configuration(format!("Unknown camera '{}'", camera))
        })?;
        let wheel_handle = match &filter_wheel {
            Some(id) => Some(self.filter_wheels.get(id).cloned().ok_or_else(|| {
                ImagerError::Configuration(format!("Unknown filter wheel '{}'", id))
            })?),
            None => None,
        };

        let commands = self.imager.set_controlled_devices(camera, filter_wheel)?;
        self.execute(commands).await;

        // Newly bound proxies start out disconnected; sync them with the drivers
        let mut events = vec![DeviceEvent::ConnectionChanged {
            device: camera_handle.id().clone(),
            connected: camera_handle.is_connected(),
        }];
        if let Some(wheel) = wheel_handle {
            events.push(DeviceEvent::ConnectionChanged {
                device: wheel.id().clone(),
                connected: wheel.is_connected(),
            });
        }
        for event in events {
            self.process(event.into()).await;
        }
        Ok(())
    }

    async fn process(&mut self, event: ImagerEvent) {
        let commands = self.imager.handle_event(event);
        self.execute(commands).await;
    }

    /// Carry out commands in order. Synchronous device failures are fed back to the
    /// sequencer as device events, and the commands they produce run in turn.
    async fn execute(&mut self, commands: Vec<Command>) {
        let mut queue: VecDeque<Command> = commands.into();
        while let Some(command) = queue.pop_front() {
            if let Some(event) = self.execute_one(command).await {
                queue.extend(self.imager.handle_event(event));
            }
        }
    }

    async fn execute_one(&mut self, command: Command) -> Option<ImagerEvent> {
        match command {
            Command::SelectFilter { device, slot } => {
                let result = match self.filter_wheels.get(&device) {
                    Some(wheel) => wheel.select_slot(slot).await,
                    None => Err(anyhow::anyhow!("filter wheel not registered")),
                };
                result.err().map(|e| {
                    DeviceEvent::MoveFailed {
                        device,
                        reason: format!("{:#}", e),
                    }
                    .into()
                })
            }
            Command::StopFilterWheel { device } => {
                let result = match self.filter_wheels.get(&device) {
                    Some(wheel) => wheel.stop().await,
                    None => Err(anyhow::anyhow!("filter wheel not registered")),
                };
                result.err().map(|e| {
                    warn!(device = %device, error = %e, "Filter wheel stop failed");
                    DeviceEvent::MoveFailed {
                        device,
                        reason: format!("{:#}", e),
                    }
                    .into()
                })
            }
            Command::StartExposure {
                device,
                exposure,
                binning,
            } => {
                let result = match self.cameras.get(&device) {
                    Some(camera) => camera.begin_exposure(exposure, binning).await,
                    None => Err(anyhow::anyhow!("camera not registered")),
                };
                result.err().map(|e| {
                    DeviceEvent::ExposureFailed {
                        device,
                        reason: format!("{:#}", e),
                    }
                    .into()
                })
            }
            Command::AbortExposure { device } => {
                let result = match self.cameras.get(&device) {
                    Some(camera) => camera.abort_exposure().await,
                    None => Err(anyhow::anyhow!("camera not registered")),
                };
                result.err().map(|e| {
                    warn!(device = %device, error = %e, "Exposure abort failed");
                    DeviceEvent::ExposureFailed {
                        device,
                        reason: format!("{:#}", e),
                    }
                    .into()
                })
            }
            Command::Persist(record) => {
                self.persist(record);
                None
            }
            Command::ArmAbortTimer { token, after } => {
                self.arm_abort_timer(token, after);
                None
            }
            Command::Publish(report) => {
                debug!(status = %report.summary(), "Publishing status");
                self.status_tx.send_replace(report);
                None
            }
        }
    }

    /// Store a frame off the agent task; the outcome comes back as an event.
    fn persist(&self, record: ImageRecord) {
        let store = Arc::clone(&self.store);
        let events = self.internal_tx.clone();
        tokio::spawn(async move {
            let event = match store.save(&record).await {
                Ok(path) => {
                    debug!(path = %path.display(), "Frame persisted");
                    ImagerEvent::DownloadComplete {
                        filename: record.filename,
                        token: record.token,
                    }
                }
                Err(e) => ImagerEvent::DownloadFailed {
                    filename: record.filename,
                    token: record.token,
                    reason: format!("{:#}", e),
                },
            };
            let _ = events.send(event).await;
        });
    }

    fn arm_abort_timer(&self, token: u64, after: Duration) {
        let events = self.internal_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = events.send(ImagerEvent::AbortTimeout { token }).await;
        });
    }
}
