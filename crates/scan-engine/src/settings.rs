//! Scan configuration loading.
//!
//! Configuration is loaded in three layers, later layers overriding
//! earlier ones:
//! 1. Built-in defaults (a 6-point 1D linear demo scan)
//! 2. `Scan.toml` in the working directory
//! 3. Environment variables prefixed with `SCAN_` (nested keys split on
//!    `__`, e.g. `SCAN_NAVERAGE=3`)

use std::path::Path;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use tokio::time::Duration;

use scan_core::{ScanError, ScanResult};
use scan_grid::{AxisRange, GridRequest, ScanKind, ScanSubKind, SpiralRange};

/// Everything a scan run is parameterized by.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanSettings {
    /// Scan dimensionality.
    pub kind: ScanKind,
    /// Trajectory shape within the scan kind.
    pub sub_kind: ScanSubKind,
    /// Per-axis ranges, in axis order. Ignored for `Spiral`.
    pub axes: Vec<AxisRange>,
    /// Spiral parameters, required when `sub_kind` is `Spiral`.
    pub spiral: Option<SpiralRange>,
    /// Actuator names in axis order.
    pub actuators: Vec<String>,
    /// Detector names; every one is triggered at every step.
    pub detectors: Vec<String>,
    /// Acquisitions per grid step (>= 1).
    pub naverage: usize,
    /// Per-step deadline covering both the move and the acquire wait.
    pub timeout_ms: u64,
    /// Container url: a file path, or `scan://host:port/name`.
    pub storage_url: String,
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self {
            kind: ScanKind::Scan1D,
            sub_kind: ScanSubKind::Linear,
            axes: vec![AxisRange {
                start: 0.0,
                stop: 10.0,
                step: 2.0,
            }],
            spiral: None,
            actuators: vec!["Xaxis".to_string()],
            detectors: vec!["Det0D".to_string()],
            naverage: 1,
            timeout_ms: 10_000,
            storage_url: "scan_demo.scan".to_string(),
        }
    }
}

impl ScanSettings {
    /// Load from `Scan.toml` and the environment.
    pub fn load() -> Result<Self, figment::Error> {
        Self::load_from("Scan.toml")
    }

    /// Load from a specific toml file and the environment.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, figment::Error> {
        Figment::from(Serialized::defaults(ScanSettings::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("SCAN_").split("__"))
            .extract()
    }

    /// Reject settings no session could run with. Grid-level validation
    /// (axis bounds, step signs, axis count) happens at grid build.
    pub fn validate(&self) -> ScanResult<()> {
        if self.detectors.is_empty() {
            return Err(ScanError::Configuration(
                "at least one detector must be configured".to_string(),
            ));
        }
        if has_duplicates(&self.actuators) {
            return Err(ScanError::Configuration(
                "actuator names must be unique".to_string(),
            ));
        }
        if has_duplicates(&self.detectors) {
            return Err(ScanError::Configuration(
                "detector names must be unique".to_string(),
            ));
        }
        if self.naverage == 0 {
            return Err(ScanError::InvalidScanConfig(
                "naverage must be >= 1".to_string(),
            ));
        }
        if self.timeout_ms == 0 {
            return Err(ScanError::InvalidScanConfig(
                "timeout_ms must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    /// The grid these settings describe.
    pub fn grid_request(&self) -> GridRequest {
        GridRequest {
            kind: self.kind,
            sub_kind: self.sub_kind,
            axes: self.axes.clone(),
            spiral: self.spiral,
            actuators: self.actuators.clone(),
        }
    }

    /// Label stored in every data array's `scan_type` attribute, e.g.
    /// `"Scan1D/Linear"`.
    pub fn scan_type(&self) -> String {
        format!("{}/{}", self.kind, self.sub_kind)
    }

    pub fn step_timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

fn has_duplicates(names: &[String]) -> bool {
    let mut seen = std::collections::HashSet::new();
    names.iter().any(|n| !seen.insert(n.as_str()))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_validate() {
        let settings = ScanSettings::default();
        settings.validate().unwrap();
        assert_eq!(settings.scan_type(), "Scan1D/Linear");
    }

    #[test]
    fn toml_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Scan.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(
            f,
            r#"
naverage = 3
actuators = ["X", "Y"]
kind = "Scan2D"

[[axes]]
start = 0.0
stop = 1.0
step = 0.5

[[axes]]
start = -1.0
stop = 1.0
step = 1.0
"#
        )
        .unwrap();

        let settings = ScanSettings::load_from(&path).unwrap();
        assert_eq!(settings.naverage, 3);
        assert_eq!(settings.kind, ScanKind::Scan2D);
        assert_eq!(settings.axes.len(), 2);
        // Untouched keys keep their defaults.
        assert_eq!(settings.timeout_ms, 10_000);
        assert_eq!(settings.detectors, vec!["Det0D".to_string()]);
    }

    #[test]
    fn rejects_empty_detectors_and_duplicates() {
        let mut settings = ScanSettings::default();
        settings.detectors.clear();
        assert!(settings.validate().is_err());

        let mut settings = ScanSettings::default();
        settings.actuators = vec!["X".to_string(), "X".to_string()];
        assert!(settings.validate().is_err());
    }

    #[test]
    fn rejects_zero_naverage_and_timeout() {
        let mut settings = ScanSettings::default();
        settings.naverage = 0;
        assert!(settings.validate().is_err());

        let mut settings = ScanSettings::default();
        settings.timeout_ms = 0;
        assert!(settings.validate().is_err());
    }
}
