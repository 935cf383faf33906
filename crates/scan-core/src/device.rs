//! Device capability traits consumed by the acquisition engine.
//!
//! The engine never talks to hardware directly; it commands devices
//! through these two small traits and listens for completion on tokio
//! broadcast channels. Commands initiate an operation and may return
//! before it finishes; completion is always signalled separately, keyed
//! by device name, so the engine can wait on many devices at once under
//! one deadline.
//!
//! # Design Philosophy
//!
//! Each trait:
//! - Is async (uses #[async_trait])
//! - Is thread-safe (requires Send + Sync)
//! - Uses anyhow::Result for driver errors
//! - Signals completion via `broadcast` so multiple listeners can observe
//!
//! Implementations should use interior mutability for state; all methods
//! take `&self` so devices can be shared as `Arc<dyn Actuator>`.

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::data::DetectorPayload;

/// Completion event emitted when an actuator settles at a target.
#[derive(Debug, Clone, PartialEq)]
pub struct MoveDone {
    /// Name of the actuator that finished moving.
    pub name: String,
    /// Position actually reached, in device-native units.
    pub position: f64,
}

/// Completion event emitted when a detector finishes an acquisition.
#[derive(Debug, Clone)]
pub struct GrabDone {
    /// Name of the detector that finished acquiring.
    pub name: String,
    /// Channels produced by this acquisition.
    pub payload: DetectorPayload,
}

/// Capability: positioning device (stage, goniometer, delay line).
///
/// # Contract
/// - Positions are in device-native units
/// - `move_abs`/`move_rel`/`move_home` initiate motion and may return
///   before the device settles
/// - Settling is signalled by a [`MoveDone`] event carrying this device's
///   name on the channel returned by `subscribe_move_done`
/// - `stop_motion` halts motion in progress; a stopped move emits no
///   completion event
#[async_trait]
pub trait Actuator: Send + Sync {
    /// Unique device name, matched against grid targets and completion
    /// events.
    fn name(&self) -> &str;

    /// Move to absolute position.
    async fn move_abs(&self, position: f64) -> Result<()>;

    /// Move relative to the current position.
    async fn move_rel(&self, delta: f64) -> Result<()>;

    /// Return to the home/reference position.
    async fn move_home(&self) -> Result<()>;

    /// Halt motion in progress.
    async fn stop_motion(&self) -> Result<()>;

    /// Snapshot of the device settings, persisted into the scan file for
    /// reproducibility.
    fn settings_snapshot(&self) -> serde_json::Value {
        serde_json::Value::Null
    }

    /// Subscribe to move-completion events.
    ///
    /// Subscribers must be registered before the command whose completion
    /// they want to observe.
    fn subscribe_move_done(&self) -> broadcast::Receiver<MoveDone>;
}

/// Capability: measuring device (camera, spectrometer, photodiode).
///
/// # Contract
/// - `trigger` initiates one acquisition and may return before data is
///   ready
/// - The resulting [`GrabDone`] carries the full payload for this trigger
/// - `naverage` is forwarded so drivers that average internally can do so;
///   drivers that do not can ignore it
#[async_trait]
pub trait Detector: Send + Sync {
    /// Unique device name, matched against completion events.
    fn name(&self) -> &str;

    /// Start one acquisition.
    ///
    /// # Arguments
    /// * `naverage` - Averaging count of the enclosing scan (>= 1)
    /// * `destination_hint` - Optional label of where the data will land
    ///   (e.g. the scan group name), for drivers that tag their output
    async fn trigger(&self, naverage: usize, destination_hint: Option<String>) -> Result<()>;

    /// Snapshot of the device settings, persisted into the scan file.
    fn settings_snapshot(&self) -> serde_json::Value {
        serde_json::Value::Null
    }

    /// Subscribe to acquisition-completion events.
    fn subscribe_grab_done(&self) -> broadcast::Receiver<GrabDone>;
}
