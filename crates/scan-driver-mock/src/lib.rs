//! Simulated devices for testing the scan engine without hardware.
//!
//! All mocks use async-safe timing (`tokio::time::sleep`) and complete
//! their commands on spawned tasks, so command dispatch returns promptly
//! and completion arrives asynchronously on the broadcast channel, the
//! way real drivers behave.
//!
//! - [`MockActuator`] - settles after a configurable travel delay; a
//!   `stuck` variant accepts commands but never completes them, for
//!   timeout tests.
//! - [`MockDetector`] - produces deterministic channel values
//!   (`base + trigger_count`) with optional trace/image channels and
//!   optional noise.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use ndarray::{ArrayD, IxDyn};
use rand::Rng;
use serde_json::json;
use tokio::sync::{broadcast, RwLock};
use tokio::time::{sleep, Duration};
use tracing::debug;

use scan_core::{Actuator, ChannelData, Detector, DetectorPayload, GrabDone, MoveDone};

// =============================================================================
// MockActuator
// =============================================================================

/// Simulated positioning stage.
pub struct MockActuator {
    name: String,
    position: Arc<RwLock<f64>>,
    travel_delay: Duration,
    stuck: bool,
    move_done_tx: broadcast::Sender<MoveDone>,
}

impl MockActuator {
    /// Stage that settles `travel_delay` after each move command.
    pub fn new(name: impl Into<String>, travel_delay: Duration) -> Self {
        let (move_done_tx, _) = broadcast::channel(64);
        Self {
            name: name.into(),
            position: Arc::new(RwLock::new(0.0)),
            travel_delay,
            stuck: false,
            move_done_tx,
        }
    }

    /// Stage that accepts move commands but never settles. Used to
    /// exercise the per-step deadline.
    pub fn stuck(name: impl Into<String>) -> Self {
        let mut actuator = Self::new(name, Duration::from_millis(1));
        actuator.stuck = true;
        actuator
    }

    pub async fn position(&self) -> f64 {
        *self.position.read().await
    }

    fn start_move(&self, target: f64) {
        if self.stuck {
            debug!(actuator = %self.name, target, "Stuck actuator swallowed move command");
            return;
        }
        let position = self.position.clone();
        let tx = self.move_done_tx.clone();
        let name = self.name.clone();
        let delay = self.travel_delay;
        tokio::spawn(async move {
            sleep(delay).await;
            *position.write().await = target;
            // No subscribers is fine; the event is simply unobserved.
            let _ = tx.send(MoveDone { name, position: target });
        });
    }
}

#[async_trait]
impl Actuator for MockActuator {
    fn name(&self) -> &str {
        &self.name
    }

    async fn move_abs(&self, position: f64) -> Result<()> {
        debug!(actuator = %self.name, target = position, "Move command");
        self.start_move(position);
        Ok(())
    }

    async fn move_rel(&self, delta: f64) -> Result<()> {
        let current = *self.position.read().await;
        self.move_abs(current + delta).await
    }

    async fn move_home(&self) -> Result<()> {
        self.move_abs(0.0).await
    }

    async fn stop_motion(&self) -> Result<()> {
        debug!(actuator = %self.name, "Stop command");
        Ok(())
    }

    fn settings_snapshot(&self) -> serde_json::Value {
        json!({
            "units": "mm",
            "travel_delay_ms": self.travel_delay.as_millis() as u64,
            "stuck": self.stuck,
        })
    }

    fn subscribe_move_done(&self) -> broadcast::Receiver<MoveDone> {
        self.move_done_tx.subscribe()
    }
}

// =============================================================================
// MockDetector
// =============================================================================

/// Simulated detector producing `base + trigger_count` in every channel.
///
/// The counter makes scan data predictable: on a fresh detector the k-th
/// trigger reports the value `base + k`, so a 1D scan records the step
/// numbers themselves when `base` is zero.
pub struct MockDetector {
    name: String,
    base: f64,
    trigger_count: Arc<AtomicU64>,
    trace_len: Option<usize>,
    image_shape: Option<(usize, usize)>,
    noise: Option<f64>,
    acquisition_delay: Duration,
    grab_done_tx: broadcast::Sender<GrabDone>,
}

impl MockDetector {
    pub fn new(name: impl Into<String>) -> Self {
        let (grab_done_tx, _) = broadcast::channel(64);
        Self {
            name: name.into(),
            base: 0.0,
            trigger_count: Arc::new(AtomicU64::new(0)),
            trace_len: None,
            image_shape: None,
            noise: None,
            acquisition_delay: Duration::from_millis(1),
            grab_done_tx,
        }
    }

    /// Offset added to every reported value.
    pub fn with_base(mut self, base: f64) -> Self {
        self.base = base;
        self
    }

    /// Add a 1D trace channel of the given length (with an x axis).
    pub fn with_trace(mut self, len: usize) -> Self {
        self.trace_len = Some(len);
        self
    }

    /// Add a 2D image channel of the given (rows, cols) shape.
    pub fn with_image(mut self, rows: usize, cols: usize) -> Self {
        self.image_shape = Some((rows, cols));
        self
    }

    /// Add uniform noise of the given amplitude to every value.
    pub fn with_noise(mut self, amplitude: f64) -> Self {
        self.noise = Some(amplitude);
        self
    }

    /// Simulated acquisition time between trigger and completion.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.acquisition_delay = delay;
        self
    }

    fn sample(&self, count: u64) -> f64 {
        let mut value = self.base + count as f64;
        if let Some(amplitude) = self.noise {
            value += rand::thread_rng().gen_range(-amplitude..=amplitude);
        }
        value
    }

    fn build_payload(&self, count: u64) -> DetectorPayload {
        let mut payload = DetectorPayload::new();
        payload.insert("ch1", ChannelData::scalar(self.sample(count)));
        if let Some(len) = self.trace_len {
            let values: Vec<f64> = (0..len).map(|_| self.sample(count)).collect();
            let x_axis: Vec<f64> = (0..len).map(|i| i as f64).collect();
            payload.insert("trace", ChannelData::trace(values, Some(x_axis)));
        }
        if let Some((rows, cols)) = self.image_shape {
            let image = ArrayD::from_elem(IxDyn(&[rows, cols]), self.sample(count));
            payload.insert(
                "image",
                ChannelData::array(
                    image,
                    Some((0..cols).map(|i| i as f64).collect()),
                    Some((0..rows).map(|i| i as f64).collect()),
                ),
            );
        }
        payload
    }
}

#[async_trait]
impl Detector for MockDetector {
    fn name(&self) -> &str {
        &self.name
    }

    async fn trigger(&self, naverage: usize, destination_hint: Option<String>) -> Result<()> {
        let count = self.trigger_count.fetch_add(1, Ordering::SeqCst);
        debug!(
            detector = %self.name,
            count,
            naverage,
            hint = destination_hint.as_deref().unwrap_or(""),
            "Trigger"
        );
        let payload = self.build_payload(count);
        let tx = self.grab_done_tx.clone();
        let name = self.name.clone();
        let delay = self.acquisition_delay;
        tokio::spawn(async move {
            sleep(delay).await;
            let _ = tx.send(GrabDone { name, payload });
        });
        Ok(())
    }

    fn settings_snapshot(&self) -> serde_json::Value {
        json!({
            "base": self.base,
            "trace_len": self.trace_len,
            "image_shape": self.image_shape.map(|(r, c)| vec![r, c]),
            "noise": self.noise,
        })
    }

    fn subscribe_grab_done(&self) -> broadcast::Receiver<GrabDone> {
        self.grab_done_tx.subscribe()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::float_cmp)]
mod tests {
    use super::*;
    use scan_core::DataDim;
    use tokio::time::timeout;

    #[tokio::test]
    async fn actuator_settles_and_reports() {
        let stage = MockActuator::new("X", Duration::from_millis(5));
        let mut rx = stage.subscribe_move_done();
        stage.move_abs(3.0).await.unwrap();

        let done = timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
        assert_eq!(done.name, "X");
        assert_eq!(done.position, 3.0);
        assert_eq!(stage.position().await, 3.0);
    }

    #[tokio::test]
    async fn relative_moves_accumulate() {
        let stage = MockActuator::new("X", Duration::from_millis(1));
        let mut rx = stage.subscribe_move_done();
        stage.move_abs(2.0).await.unwrap();
        rx.recv().await.unwrap();
        stage.move_rel(0.5).await.unwrap();
        let done = rx.recv().await.unwrap();
        assert_eq!(done.position, 2.5);
    }

    #[tokio::test]
    async fn stuck_actuator_never_completes() {
        let stage = MockActuator::stuck("X");
        let mut rx = stage.subscribe_move_done();
        stage.move_abs(1.0).await.unwrap();
        assert!(timeout(Duration::from_millis(50), rx.recv()).await.is_err());
    }

    #[tokio::test]
    async fn detector_counts_triggers() {
        let det = MockDetector::new("D");
        let mut rx = det.subscribe_grab_done();
        for _ in 0..3 {
            det.trigger(1, None).await.unwrap();
        }
        let mut values = Vec::new();
        for _ in 0..3 {
            let done = timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
            let ch = done.payload.channel(DataDim::D0, "ch1").unwrap();
            values.push(ch.data[IxDyn(&[])]);
        }
        values.sort_by(f64::total_cmp);
        assert_eq!(values, vec![0.0, 1.0, 2.0]);
    }

    #[tokio::test]
    async fn optional_channels_carry_their_axes() {
        let det = MockDetector::new("D").with_base(1.0).with_trace(4).with_image(2, 3);
        let mut rx = det.subscribe_grab_done();
        det.trigger(1, Some("Scan000".to_string())).await.unwrap();
        let done = rx.recv().await.unwrap();

        let trace = done.payload.channel(DataDim::D1, "trace").unwrap();
        assert_eq!(trace.data.shape(), &[4]);
        assert_eq!(trace.x_axis.as_ref().unwrap().len(), 4);

        let image = done.payload.channel(DataDim::D2, "image").unwrap();
        assert_eq!(image.data.shape(), &[2, 3]);
        assert_eq!(image.y_axis.as_ref().unwrap().len(), 2);
        assert_eq!(image.data[IxDyn(&[1, 2])], 1.0);
    }
}
