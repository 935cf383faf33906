//! Single-scan admission control.
//!
//! A [`ScanCoordinator`] owns at most one running session at a time: the
//! container is exclusively held by its session, so a second `start`
//! while one is running is rejected instead of queued.

use tokio::sync::broadcast;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::info;

use scan_core::{ScanError, ScanReport, ScanResult};

use crate::session::{AcquisitionSession, SessionStatus, StopHandle};

/// Observable coordinator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorStatus {
    Idle,
    Running,
}

struct RunningScan {
    stop: StopHandle,
    handle: JoinHandle<SessionStatus>,
}

/// Runs prepared sessions one at a time on the tokio runtime.
pub struct ScanCoordinator {
    running: Mutex<Option<RunningScan>>,
}

impl ScanCoordinator {
    pub fn new() -> Self {
        Self {
            running: Mutex::new(None),
        }
    }

    /// Launch a prepared session. Returns a report receiver subscribed
    /// before the first step. Fails if a scan is still running.
    pub async fn start(
        &self,
        session: AcquisitionSession,
    ) -> ScanResult<broadcast::Receiver<ScanReport>> {
        let mut slot = self.running.lock().await;
        if let Some(run) = slot.as_ref() {
            if !run.handle.is_finished() {
                return Err(ScanError::Configuration(
                    "a scan is already running".to_string(),
                ));
            }
        }
        info!(scan = %session.scan_name(), "Launching scan session");
        let reports = session.reports();
        let stop = session.stop_handle();
        let handle = tokio::spawn(session.run());
        *slot = Some(RunningScan { stop, handle });
        Ok(reports)
    }

    /// Request a stop at the next step boundary of the running scan.
    /// No-op when idle.
    pub async fn stop(&self) {
        if let Some(run) = self.running.lock().await.as_ref() {
            run.stop.stop();
        }
    }

    pub async fn status(&self) -> CoordinatorStatus {
        match self.running.lock().await.as_ref() {
            Some(run) if !run.handle.is_finished() => CoordinatorStatus::Running,
            _ => CoordinatorStatus::Idle,
        }
    }

    /// Wait for the running scan to end and return how it ended. The
    /// coordinator is idle afterwards.
    pub async fn wait(&self) -> ScanResult<SessionStatus> {
        let run = self
            .running
            .lock()
            .await
            .take()
            .ok_or_else(|| ScanError::Configuration("no scan is running".to_string()))?;
        run.handle
            .await
            .map_err(|e| ScanError::Device(format!("session task failed: {}", e)))
    }
}

impl Default for ScanCoordinator {
    fn default() -> Self {
        Self::new()
    }
}
