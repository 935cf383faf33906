//! One scan run from grid generation to a flushed container.
//!
//! An [`AcquisitionSession`] is prepared once (grid built, scan group and
//! device groups created, navigation axes written) and then consumed by
//! [`AcquisitionSession::run`], which walks the grid:
//!
//! For each average, for each step:
//! 1. Check the stop flag; honoured only at step boundaries.
//! 2. Report the (step, average) pair being processed.
//! 3. Command all of the step's moves, then wait for every `MoveDone`
//!    under the step deadline.
//! 4. Trigger every detector, then wait for every `GrabDone` under the
//!    same deadline.
//! 5. Persist the collected payloads at the step's grid cell.
//!
//! The run always flushes the container before emitting its single
//! terminal report, so a consumer that sees `ScanDone` can immediately
//! re-open the file.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::time::{timeout_at, Duration, Instant};
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{StreamExt, StreamMap};
use tracing::{debug, error, info, warn};

use scan_core::{
    Actuator, Detector, DetectorPayload, ScanError, ScanReport, ScanResult, WaitPhase,
};
use scan_grid::{Grid, GridStep};
use scan_storage::{DimensionSaver, NodeId, ScanContext, ScanFile};

use crate::settings::ScanSettings;

/// Capacity of the session's report channel. Sized so a consumer that
/// only drains after the run still sees every report of a typical scan.
const REPORT_CHANNEL_CAPACITY: usize = 1024;

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    /// Every step of every average was executed and persisted.
    Done,
    /// The stop flag was honoured at a step boundary.
    Stopped,
    /// A move or acquire deadline elapsed.
    TimedOut,
    /// A device, configuration or storage error aborted the run.
    Failed,
}

/// Clonable handle that requests a stop at the next step boundary.
#[derive(Clone)]
pub struct StopHandle {
    flag: Arc<AtomicBool>,
}

impl StopHandle {
    pub fn stop(&self) {
        info!("Scan stop requested");
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// A prepared scan run: grid, devices, scan group, report channel.
pub struct AcquisitionSession {
    grid: Grid,
    scan_type: String,
    naverage: usize,
    step_timeout: Duration,
    actuators: BTreeMap<String, Arc<dyn Actuator>>,
    detectors: BTreeMap<String, Arc<dyn Detector>>,
    file: ScanFile,
    ctx: ScanContext,
    detector_groups: BTreeMap<String, NodeId>,
    report_tx: broadcast::Sender<ScanReport>,
    stop: Arc<AtomicBool>,
}

impl AcquisitionSession {
    /// Build the grid and lay out the scan group for one run.
    ///
    /// Creates `Scan{NNN}` under `RawData`, writes the navigation axes,
    /// and creates one `Move{NNN}`/`Detector{NNN}` group per device with
    /// its settings snapshot. Data arrays are not created here; the
    /// layout of those is derived from the first step's payloads.
    pub async fn prepare(
        settings: &ScanSettings,
        mut file: ScanFile,
        actuators: Vec<Arc<dyn Actuator>>,
        detectors: Vec<Arc<dyn Detector>>,
    ) -> ScanResult<Self> {
        settings.validate()?;
        let grid = Grid::build(&settings.grid_request())?;
        if grid.is_empty() {
            return Err(ScanError::InvalidScanConfig(
                "grid contains no steps".to_string(),
            ));
        }

        let actuators: BTreeMap<String, Arc<dyn Actuator>> = actuators
            .into_iter()
            .map(|a| (a.name().to_string(), a))
            .collect();
        let detectors: BTreeMap<String, Arc<dyn Detector>> = detectors
            .into_iter()
            .map(|d| (d.name().to_string(), d))
            .collect();
        if detectors.is_empty() {
            return Err(ScanError::Configuration(
                "no detectors were provided".to_string(),
            ));
        }
        for step in &grid.steps {
            for (name, _) in &step.targets {
                if !actuators.contains_key(name) {
                    return Err(ScanError::Configuration(format!(
                        "grid targets actuator '{}' which is not among the provided devices",
                        name
                    )));
                }
            }
        }

        let ctx = file.new_scan().await?;
        info!(
            scan = %ctx.name,
            steps = grid.len(),
            shape = ?grid.shape(),
            naverage = settings.naverage,
            "Scan group created"
        );
        file.write_navigation_axes(&ctx, &grid).await?;

        for (index, (name, actuator)) in actuators.iter().enumerate() {
            file.add_actuator_group(&ctx, index, name, actuator.settings_snapshot())
                .await?;
        }
        let mut detector_groups = BTreeMap::new();
        for (index, (name, detector)) in detectors.iter().enumerate() {
            let group = file
                .add_detector_group(&ctx, index, name, detector.settings_snapshot())
                .await?;
            detector_groups.insert(name.clone(), group);
        }
        file.log_line(&format!("{} started", ctx.name)).await?;

        let (report_tx, _) = broadcast::channel(REPORT_CHANNEL_CAPACITY);
        Ok(Self {
            grid,
            scan_type: settings.scan_type(),
            naverage: settings.naverage,
            step_timeout: settings.step_timeout(),
            actuators,
            detectors,
            file,
            ctx,
            detector_groups,
            report_tx,
            stop: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Subscribe to this run's reports. Subscribe before calling `run`
    /// to observe the run from its first step.
    pub fn reports(&self) -> broadcast::Receiver<ScanReport> {
        self.report_tx.subscribe()
    }

    /// Handle for requesting a stop at the next step boundary.
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            flag: self.stop.clone(),
        }
    }

    /// Name of the scan group this run writes into (`Scan000`, ...).
    pub fn scan_name(&self) -> &str {
        &self.ctx.name
    }

    pub fn grid(&self) -> &Grid {
        &self.grid
    }

    /// Execute the run to its end.
    ///
    /// Never returns early on failure: storage is flushed and exactly one
    /// terminal report is emitted for every outcome. A failed run reports
    /// an error status line first, then `ScanDone`.
    pub async fn run(mut self) -> SessionStatus {
        let outcome = self.execute().await;
        if let Err(flush_err) = self.file.flush().await {
            warn!(error = %flush_err, "Final container flush failed");
        }

        let status = match outcome {
            Ok(status) => status,
            Err(ScanError::Timeout { phase, step, missing }) => {
                warn!(%phase, step, ?missing, "Scan timed out");
                SessionStatus::TimedOut
            }
            Err(err) => {
                error!(error = %err, "Scan failed");
                let _ = self.report_tx.send(ScanReport::error(err.to_string()));
                SessionStatus::Failed
            }
        };

        let terminal = match status {
            SessionStatus::Done | SessionStatus::Failed => ScanReport::ScanDone,
            SessionStatus::TimedOut => ScanReport::TimedOut,
            SessionStatus::Stopped => ScanReport::Stopped,
        };
        let _ = self.report_tx.send(terminal);
        status
    }

    async fn execute(&mut self) -> ScanResult<SessionStatus> {
        // Subscribing before any command guarantees no completion event
        // can be missed.
        let mut move_streams: StreamMap<String, BroadcastStream<scan_core::MoveDone>> =
            StreamMap::new();
        for (name, actuator) in &self.actuators {
            move_streams.insert(
                name.clone(),
                BroadcastStream::new(actuator.subscribe_move_done()),
            );
        }
        let mut grab_streams: StreamMap<String, BroadcastStream<scan_core::GrabDone>> =
            StreamMap::new();
        for (name, detector) in &self.detectors {
            grab_streams.insert(
                name.clone(),
                BroadcastStream::new(detector.subscribe_grab_done()),
            );
        }

        let mut saver =
            DimensionSaver::new(self.grid.shape(), self.naverage, self.scan_type.clone());
        let steps: Vec<GridStep> = self.grid.steps.clone();

        for average in 0..self.naverage {
            for (step_idx, step) in steps.iter().enumerate() {
                if self.stop.load(Ordering::SeqCst) {
                    info!(step = step_idx, average, "Stop honoured at step boundary");
                    return Ok(SessionStatus::Stopped);
                }
                let _ = self.report_tx.send(ScanReport::UpdateStepIndex {
                    step: step_idx,
                    average,
                });
                let deadline = Instant::now() + self.step_timeout;

                self.move_to(step, step_idx, &mut move_streams, deadline)
                    .await?;
                let payloads = self
                    .acquire(step_idx, &mut grab_streams, deadline)
                    .await?;

                let outcome = saver
                    .save_step(
                        self.file.container().backend_mut(),
                        &self.detector_groups,
                        &payloads,
                        &step.cell,
                        average,
                    )
                    .await?;
                debug!(
                    step = step_idx,
                    average,
                    written = outcome.written,
                    skipped = outcome.skipped,
                    "Step persisted"
                );
            }
        }

        self.file.mark_scan_done(&self.ctx).await?;
        self.file
            .log_line(&format!("{} completed", self.ctx.name))
            .await?;
        info!(scan = %self.ctx.name, "Scan completed");
        Ok(SessionStatus::Done)
    }

    /// Command every target of the step, then wait for all settles.
    async fn move_to(
        &self,
        step: &GridStep,
        step_idx: usize,
        streams: &mut StreamMap<String, BroadcastStream<scan_core::MoveDone>>,
        deadline: Instant,
    ) -> ScanResult<()> {
        let mut pending: HashSet<String> = HashSet::new();
        for (name, position) in &step.targets {
            let actuator = self.actuators.get(name).ok_or_else(|| {
                ScanError::Configuration(format!("unknown actuator '{}'", name))
            })?;
            actuator
                .move_abs(*position)
                .await
                .map_err(ScanError::device)?;
            pending.insert(name.clone());
        }

        while !pending.is_empty() {
            match timeout_at(deadline, streams.next()).await {
                Err(_) => {
                    let mut missing: Vec<String> = pending.into_iter().collect();
                    missing.sort();
                    return Err(ScanError::Timeout {
                        phase: WaitPhase::Move,
                        step: step_idx,
                        missing,
                    });
                }
                Ok(Some((_, Ok(done)))) => {
                    debug!(actuator = %done.name, position = done.position, "Move settled");
                    pending.remove(&done.name);
                }
                Ok(Some((key, Err(BroadcastStreamRecvError::Lagged(count))))) => {
                    warn!(device = %key, skipped = count, "Move channel lagged");
                }
                Ok(None) => {
                    return Err(ScanError::Device(
                        "all move completion channels closed".to_string(),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Trigger every detector, then collect one payload per detector.
    async fn acquire(
        &self,
        step_idx: usize,
        streams: &mut StreamMap<String, BroadcastStream<scan_core::GrabDone>>,
        deadline: Instant,
    ) -> ScanResult<BTreeMap<String, DetectorPayload>> {
        let mut pending: HashSet<String> = HashSet::new();
        for (name, detector) in &self.detectors {
            detector
                .trigger(self.naverage, Some(self.ctx.name.clone()))
                .await
                .map_err(ScanError::device)?;
            pending.insert(name.clone());
        }

        let mut payloads = BTreeMap::new();
        while !pending.is_empty() {
            match timeout_at(deadline, streams.next()).await {
                Err(_) => {
                    let mut missing: Vec<String> = pending.into_iter().collect();
                    missing.sort();
                    return Err(ScanError::Timeout {
                        phase: WaitPhase::Acquire,
                        step: step_idx,
                        missing,
                    });
                }
                Ok(Some((_, Ok(done)))) => {
                    if pending.remove(&done.name) {
                        debug!(
                            detector = %done.name,
                            channels = done.payload.channel_count(),
                            "Acquisition done"
                        );
                        payloads.insert(done.name, done.payload);
                    }
                }
                Ok(Some((key, Err(BroadcastStreamRecvError::Lagged(count))))) => {
                    warn!(device = %key, skipped = count, "Grab channel lagged");
                }
                Ok(None) => {
                    return Err(ScanError::Device(
                        "all grab completion channels closed".to_string(),
                    ));
                }
            }
        }
        Ok(payloads)
    }
}
