//! Grid scan execution.
//!
//! The engine turns a [`ScanSettings`] description into a persisted scan
//! run over abstract devices:
//!
//! - [`settings`] loads and validates the run parameters (toml + env).
//! - [`session`] executes one run: build the grid, lay out the scan
//!   group, then move / settle / acquire / persist per step, reporting
//!   progress over a broadcast channel.
//! - [`coordinator`] admits one running session at a time and carries
//!   stop requests to it.
//!
//! Devices enter through the `Actuator`/`Detector` traits of
//! `scan-core`; storage goes through a `scan-storage` container opened
//! from the configured url (local file or `scan://` server).

pub mod coordinator;
pub mod session;
pub mod settings;

pub use coordinator::{CoordinatorStatus, ScanCoordinator};
pub use session::{AcquisitionSession, SessionStatus, StopHandle};
pub use settings::ScanSettings;
