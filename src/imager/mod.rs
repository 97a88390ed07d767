//! Batch/group capture sequencing.
//!
//! - [`group`]: capture groups and their validation
//! - [`state`]: batch lifecycle states and the derived health light
//! - [`event`]: inbound events and outbound commands
//! - [`sequencer`]: the [`Imager`] state machine
//! - [`naming`]: deterministic image file names
//! - [`status`]: progress projection and remaining-time estimate

pub mod event;
pub mod group;
pub mod naming;
pub mod sequencer;
pub mod state;
pub mod status;

pub use event::{Command, ImageRecord, ImagerEvent};
pub use group::{Binning, Group, MAX_GROUP_COUNT};
pub use sequencer::{Imager, DEFAULT_ABORT_TIMEOUT};
pub use state::{BatchState, Health};
pub use status::StatusReport;
