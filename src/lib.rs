//! # Imager Agent Library
//!
//! Batch capture sequencing for a camera and an optional filter wheel. An operator
//! describes a batch as a list of groups (image count, filter slot, exposure,
//! binning); the agent selects each group's filter, takes the exposures one at a
//! time, stores every frame under a deterministic name and reports progress.
//!
//! ## Crate Structure
//!
//! - **`imager`**: The pure sequencing core: groups, batch states, the `Imager` state
//!   machine, file naming and status projection. No I/O.
//! - **`hardware`**: Device identity, the events drivers report, the capability traits
//!   `CameraControl` / `FilterWheelControl`, the sequencer's device proxies and mock
//!   drivers for running without hardware.
//! - **`agent`**: The tokio actor that owns an `Imager`, executes its commands and
//!   serializes requests, device events, downloads and abort timers.
//! - **`storage`**: The `ImageStore` trait with file and in-memory stores.
//! - **`config`**: Figment-based configuration (TOML file + `IMAGER_` environment).
//! - **`tracing_init`**: Structured logging setup.
//! - **`error`**: The crate-wide `ImagerError` type.

pub mod agent;
pub mod config;
pub mod error;
pub mod hardware;
pub mod imager;
pub mod storage;
pub mod tracing_init;
