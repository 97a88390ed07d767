//! Integration tests for the imager agent running against mock hardware.
//!
//! Exposures are scaled down so a full batch runs in milliseconds.

use imager_agent::agent::{AgentHandle, ImagerAgent};
use imager_agent::error::ImagerError;
use imager_agent::hardware::mock::{MockCamera, MockFilterWheel};
use imager_agent::hardware::DeviceId;
use imager_agent::imager::{BatchState, Binning, Group, Imager, StatusReport};
use imager_agent::storage::{FileImageStore, ImageStore, MemoryImageStore};
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const CAMERA: &str = "CCD Simulator";
const WHEEL: &str = "Filter Simulator";

struct Bench {
    handle: AgentHandle,
    task: JoinHandle<()>,
    camera: Arc<MockCamera>,
    wheel: Arc<MockFilterWheel>,
}

/// Spawn an agent with both simulators connected and bound.
async fn bench(
    store: Arc<dyn ImageStore>,
    camera: impl FnOnce(MockCamera) -> MockCamera,
    wheel_step: Duration,
    abort_timeout: Duration,
) -> Bench {
    let (tx, rx) = mpsc::channel(64);
    let camera = Arc::new(camera(MockCamera::new(CAMERA, tx.clone())));
    let wheel = Arc::new(MockFilterWheel::new(WHEEL, 5, tx).with_step_time(wheel_step));

    let mut agent = ImagerAgent::new(Imager::new().with_abort_timeout(abort_timeout), store);
    agent.register_camera(camera.clone());
    agent.register_filter_wheel(wheel.clone());
    let (handle, task) = agent.spawn(rx);

    camera.connect().await;
    wheel.connect().await;
    handle
        .set_devices(CAMERA, Some(DeviceId::from(WHEEL)))
        .await
        .unwrap();

    Bench {
        handle,
        task,
        camera,
        wheel,
    }
}

fn group(count: u32, slot: Option<u32>, exposure: Duration) -> Group {
    Group::new(count, slot, exposure, Binning::default()).unwrap()
}

async fn wait_for_state(handle: &AgentHandle, state: BatchState) -> StatusReport {
    let mut status = handle.subscribe();
    let report = tokio::time::timeout(Duration::from_secs(10), status.wait_for(|s| s.state == state))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {}", state))
        .expect("agent stopped");
    report.clone()
}

#[tokio::test]
async fn test_batch_writes_fits_files() {
    let dir = tempdir().unwrap();
    let store = Arc::new(FileImageStore::new(dir.path()));
    let bench = bench(
        store,
        |c| c.with_time_scale(0.001),
        Duration::from_millis(2),
        Duration::from_secs(1),
    )
    .await;

    bench.handle.set_image_prefix("M42").await.unwrap();
    bench
        .handle
        .configure(vec![
            group(2, Some(2), Duration::from_secs(1)),
            group(1, Some(4), Duration::from_secs(2)),
        ])
        .await
        .unwrap();
    bench.handle.start().await.unwrap();

    let status = wait_for_state(&bench.handle, BatchState::Idle).await;
    assert!(status.alert.is_none(), "unexpected alert: {:?}", status.alert);
    assert!(status.run_id.is_some());

    for name in ["M42_1_001.fits", "M42_1_002.fits", "M42_2_001.fits"] {
        let bytes = std::fs::read(dir.path().join(name)).unwrap();
        assert!(bytes.starts_with(b"SIMPLE  ="), "{} is not FITS", name);
        assert_eq!(bytes.len() % 2880, 0);
    }
    assert_eq!(bench.wheel.position(), 4);
    assert_eq!(bench.camera.frame_count(), 3);

    let frame = bench.handle.load_image(1, 0).await.unwrap().unwrap();
    assert_eq!(frame.filename, "M42_2_001.fits");
    assert!(bench.handle.load_image(1, 1).await.unwrap().is_none());
}

#[tokio::test]
async fn test_abort_acknowledged_by_camera() {
    let store = Arc::new(MemoryImageStore::new());
    let bench = bench(
        store.clone(),
        |c| c,
        Duration::from_millis(1),
        Duration::from_secs(30),
    )
    .await;

    bench
        .handle
        .configure(vec![group(3, None, Duration::from_secs(60))])
        .await
        .unwrap();
    bench.handle.start().await.unwrap();
    assert_eq!(
        bench.handle.status().await.unwrap().state,
        BatchState::Exposing
    );

    bench.handle.abort().await.unwrap();
    // The acknowledgement arrives long before the 30s timer
    let status = wait_for_state(&bench.handle, BatchState::Idle).await;
    assert!(status.alert.is_none());
    assert!(store.is_empty().await);
    assert_eq!(bench.camera.frame_count(), 0);
}

#[tokio::test]
async fn test_abort_falls_back_to_timeout() {
    let store = Arc::new(MemoryImageStore::new());
    let bench = bench(
        store.clone(),
        |c| c.with_abort_acknowledgement(false),
        Duration::from_millis(1),
        Duration::from_millis(50),
    )
    .await;

    bench
        .handle
        .configure(vec![group(1, None, Duration::from_secs(60))])
        .await
        .unwrap();
    bench.handle.start().await.unwrap();
    bench.handle.abort().await.unwrap();
    assert_eq!(
        bench.handle.status().await.unwrap().state,
        BatchState::Aborting
    );

    wait_for_state(&bench.handle, BatchState::Idle).await;
    assert!(store.is_empty().await);

    // Ready for another run
    bench.handle.abort().await.unwrap();
    bench.handle.start().await.unwrap();
}

#[tokio::test]
async fn test_requests_rejected_while_running() {
    let store = Arc::new(MemoryImageStore::new());
    let bench = bench(
        store,
        |c| c,
        Duration::from_millis(1),
        Duration::from_secs(1),
    )
    .await;

    bench
        .handle
        .configure(vec![group(1, None, Duration::from_secs(60))])
        .await
        .unwrap();
    bench.handle.start().await.unwrap();

    let err = bench
        .handle
        .configure(vec![group(1, None, Duration::from_secs(1))])
        .await
        .unwrap_err();
    assert!(matches!(err, ImagerError::Busy(BatchState::Exposing)));
    assert!(matches!(
        bench.handle.set_devices(CAMERA, None).await.unwrap_err(),
        ImagerError::Busy(_)
    ));
    assert!(bench.handle.start().await.is_err());

    bench.handle.abort().await.unwrap();
}

#[tokio::test]
async fn test_wheel_disconnect_during_move_alerts() {
    let store = Arc::new(MemoryImageStore::new());
    let bench = bench(
        store.clone(),
        |c| c.with_time_scale(0.001),
        Duration::from_secs(5),
        Duration::from_secs(1),
    )
    .await;

    bench
        .handle
        .configure(vec![group(1, Some(3), Duration::from_secs(1))])
        .await
        .unwrap();
    bench.handle.start().await.unwrap();
    assert_eq!(
        bench.handle.status().await.unwrap().state,
        BatchState::AwaitingFilter
    );

    bench.wheel.disconnect().await;
    let status = wait_for_state(&bench.handle, BatchState::Idle).await;

    let alert = status.alert.expect("alert expected");
    assert!(alert.contains(WHEEL), "alert should name the wheel: {}", alert);
    assert_eq!(status.filter_wheel_connected, Some(false));
    assert!(store.is_empty().await);
}

#[tokio::test]
async fn test_exposure_failure_reported_as_alert() {
    let store = Arc::new(MemoryImageStore::new());
    let bench = bench(
        store.clone(),
        |c| c.with_time_scale(0.001),
        Duration::from_millis(1),
        Duration::from_secs(1),
    )
    .await;
    bench.camera.fail_next_exposure("sensor overheated").await;

    bench
        .handle
        .configure(vec![group(2, None, Duration::from_secs(1))])
        .await
        .unwrap();
    bench.handle.start().await.unwrap();

    let status = wait_for_state(&bench.handle, BatchState::Idle).await;
    assert!(status.alert.unwrap().contains("sensor overheated"));
    assert!(store.is_empty().await);
}

#[tokio::test]
async fn test_dropping_handles_stops_agent() {
    let store = Arc::new(MemoryImageStore::new());
    let bench = bench(
        store,
        |c| c,
        Duration::from_millis(1),
        Duration::from_secs(1),
    )
    .await;

    drop(bench.handle);
    tokio::time::timeout(Duration::from_secs(1), bench.task)
        .await
        .expect("agent did not stop")
        .unwrap();
}
