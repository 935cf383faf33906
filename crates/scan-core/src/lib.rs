//! Core types shared by every crate in the scan workspace.
//!
//! This crate deliberately stays small: the error taxonomy, the device
//! capability traits (`Actuator`/`Detector`), the detector payload data
//! model, and the status report messages the engine broadcasts. Everything
//! here is consumed both by the acquisition engine and by the storage
//! layer, so it must not depend on either.

pub mod data;
pub mod device;
pub mod error;
pub mod report;

pub use data::{ChannelData, DataDim, DetectorPayload};
pub use device::{Actuator, Detector, GrabDone, MoveDone};
pub use error::{ScanError, ScanResult, WaitPhase};
pub use report::{ScanReport, Severity};
