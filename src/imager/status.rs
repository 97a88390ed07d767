//! Progress and health reporting.
//!
//! A [`StatusReport`] is a pure projection of sequencer state, rebuilt and published
//! after every transition.

use crate::imager::state::{BatchState, Health};
use crate::imager::Group;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Snapshot published to the supervisor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    /// Sequencer state at the time of the snapshot
    pub state: BatchState,
    /// Coarse health light
    pub health: Health,
    /// Zero-based index of the current group
    pub group: usize,
    /// Zero-based index of the current image within the group
    pub image: u32,
    /// Approximate exposure time left in the batch
    #[serde(with = "humantime_serde")]
    pub remaining: Duration,
    /// Number of configured groups
    pub group_count: usize,
    /// Camera connection light
    pub camera_connected: bool,
    /// Filter wheel connection light (`None` when no wheel is bound)
    pub filter_wheel_connected: Option<bool>,
    /// Reason the last run ended in Alert, cleared by the next start
    pub alert: Option<String>,
    /// Identifier of the current or most recent run
    pub run_id: Option<String>,
}

impl Default for StatusReport {
    fn default() -> Self {
        Self {
            state: BatchState::Idle,
            health: Health::Ok,
            group: 0,
            image: 0,
            remaining: Duration::ZERO,
            group_count: 0,
            camera_connected: false,
            filter_wheel_connected: None,
            alert: None,
            run_id: None,
        }
    }
}

impl StatusReport {
    /// One-line progress summary for logs and the CLI, with 1-based numbering.
    pub fn summary(&self) -> String {
        format!(
            "{} [{}] group {}/{} image {} remaining {:.1}s",
            self.state,
            self.health,
            self.group + 1,
            self.group_count,
            self.image + 1,
            self.remaining.as_secs_f64()
        )
    }
}

/// Estimate exposure time still to be spent.
///
/// Counts the images of the current group from `image` on (the one in flight
/// included) plus every image of the later groups. Filter moves and downloads are
/// ignored, so this is a lower bound rather than a forecast.
pub fn estimate_remaining(groups: &[Group], group: usize, image: u32) -> Duration {
    let Some(current) = groups.get(group) else {
        return Duration::ZERO;
    };
    let left_in_group = current.image_count.saturating_sub(image);
    groups[group + 1..]
        .iter()
        .map(Group::total_exposure)
        .fold(current.exposure.saturating_mul(left_in_group), |acc, d| {
            acc.saturating_add(d)
        })
}

/// Exposure time of the whole batch.
pub fn total_exposure(groups: &[Group]) -> Duration {
    estimate_remaining(groups, 0, 0)
}
