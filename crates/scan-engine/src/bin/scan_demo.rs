//! Run a configured scan against simulated devices and persist it.
//!
//! Reads `Scan.toml` / `SCAN_*` environment variables; by default runs a
//! 6-point 1D linear scan into `scan_demo.scan`. `RUST_LOG` controls
//! verbosity.

use std::sync::Arc;

use tokio::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

use scan_core::{Actuator, Detector, ScanReport};
use scan_driver_mock::{MockActuator, MockDetector};
use scan_engine::{AcquisitionSession, ScanSettings};
use scan_storage::{OpenMode, ScanFile};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let settings = ScanSettings::load()?;
    info!(
        url = %settings.storage_url,
        scan = %settings.scan_type(),
        naverage = settings.naverage,
        "Configured scan"
    );

    let actuators: Vec<Arc<dyn Actuator>> = settings
        .actuators
        .iter()
        .map(|name| {
            Arc::new(MockActuator::new(name.clone(), Duration::from_millis(10)))
                as Arc<dyn Actuator>
        })
        .collect();
    let detectors: Vec<Arc<dyn Detector>> = settings
        .detectors
        .iter()
        .enumerate()
        .map(|(i, name)| {
            Arc::new(
                MockDetector::new(name.clone())
                    .with_base(i as f64)
                    .with_trace(32)
                    .with_noise(0.05),
            ) as Arc<dyn Detector>
        })
        .collect();

    let file = ScanFile::open(&settings.storage_url, OpenMode::Write).await?;
    let session = AcquisitionSession::prepare(&settings, file, actuators, detectors).await?;
    info!(
        scan = %session.scan_name(),
        steps = session.grid().len(),
        shape = ?session.grid().shape(),
        "Scan prepared"
    );

    let mut reports = session.reports();
    let printer = tokio::spawn(async move {
        while let Ok(report) = reports.recv().await {
            match &report {
                ScanReport::UpdateStatus { text, severity } => {
                    info!(%severity, "{}", text);
                }
                ScanReport::UpdateStepIndex { step, average } => {
                    info!(step, average, "Step");
                }
                terminal => info!(?terminal, "Scan ended"),
            }
            if report.is_terminal() {
                break;
            }
        }
    });

    let status = session.run().await;
    let _ = printer.await;
    info!(?status, url = %settings.storage_url, "Run finished");
    Ok(())
}
