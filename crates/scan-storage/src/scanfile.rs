//! The scan-file hierarchy on top of a [`Container`].
//!
//! Layout maintained here:
//!
//! ```text
//! /RawData/                      (created once per file)
//!     Logger                     (variable-length log lines)
//!     Scan000/ ... Scan{NNN}/    (one per run, monotonically numbered)
//!         Move000/ ...           (settings snapshot per actuator)
//!         Detector000/ ...       (channel layout filled by the saver)
//!         scan_x_axis, scan_x_axis_unique
//!         scan_y_axis, scan_y_axis_unique   (2D scans only)
//! ```
//!
//! A scan group is reused by [`ScanFile::new_scan`] only while it is still
//! empty and not marked done; once anything has been written into it, the
//! next run gets a fresh number.

use chrono::Local;
use ndarray::{ArrayD, IxDyn};
use serde_json::json;
use tracing::info;

use crate::backend::{AttrMap, Container, OpenMode};
use crate::error::StorageResult;
use crate::node::NodeId;
use scan_grid::Grid;

const RAW_GROUP: &str = "RawData";
const LOGGER: &str = "Logger";

/// Session-scoped handle to one run's scan group.
#[derive(Debug, Clone)]
pub struct ScanContext {
    pub scan_group: NodeId,
    pub name: String,
}

/// A container with the scan hierarchy maintained on top.
pub struct ScanFile {
    container: Container,
}

impl ScanFile {
    /// Open the container at `url` and ensure the `RawData` group exists
    /// (in writable modes).
    pub async fn open(url: &str, mode: OpenMode) -> StorageResult<Self> {
        let mut container = Container::open(url, mode).await?;
        if mode != OpenMode::Read {
            let root = container.root();
            container
                .get_or_create_group(root, RAW_GROUP, "Acquired data")
                .await?;
        }
        Ok(Self { container })
    }

    /// Direct access to the underlying container.
    pub fn container(&mut self) -> &mut Container {
        &mut self.container
    }

    /// The `RawData` group.
    pub async fn raw_group(&mut self) -> StorageResult<NodeId> {
        let root = self.container.root();
        self.container
            .get_or_create_group(root, RAW_GROUP, "Acquired data")
            .await
    }

    /// Append one timestamped line to the container's log array.
    pub async fn log_line(&mut self, line: &str) -> StorageResult<()> {
        let raw = self.raw_group().await?;
        let logger = self
            .container
            .create_vlarray(raw, LOGGER, AttrMap::new())
            .await?;
        let stamped = format!("{} {}", Local::now().format("%Y-%m-%d %H:%M:%S"), line);
        self.container.append_text(logger, &stamped).await
    }

    /// Allocate the scan group for a new run.
    ///
    /// The highest-numbered existing group is reused only if it is still
    /// empty and not marked `scan_done`; otherwise the next number is
    /// taken. Numbers are never reused once a group was populated.
    pub async fn new_scan(&mut self) -> StorageResult<ScanContext> {
        let raw = self.raw_group().await?;
        let names = self.container.children(raw).await?;
        let last = names
            .iter()
            .filter_map(|n| scan_index(n).map(|i| (i, n.clone())))
            .max_by_key(|(i, _)| *i);

        if let Some((index, name)) = &last {
            if let Some(group) = self.container.find_child(raw, name).await? {
                let empty = self.container.children(group).await?.is_empty();
                let done = self
                    .container
                    .get_attr(group, "scan_done")
                    .await?
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false);
                if empty && !done {
                    info!(scan = %name, "Reusing empty scan group");
                    return Ok(ScanContext {
                        scan_group: group,
                        name: name.clone(),
                    });
                }
                let name = format!("Scan{:03}", index + 1);
                return self.create_scan_group(raw, &name).await;
            }
        }
        self.create_scan_group(raw, "Scan000").await
    }

    async fn create_scan_group(&mut self, raw: NodeId, name: &str) -> StorageResult<ScanContext> {
        let group = self
            .container
            .get_or_create_group(raw, name, "Scan data")
            .await?;
        self.container
            .set_attr(group, "scan_done", json!(false))
            .await?;
        info!(scan = %name, "Created scan group");
        Ok(ScanContext {
            scan_group: group,
            name: name.to_string(),
        })
    }

    /// Mark a run's group complete; it will never be reused afterwards.
    pub async fn mark_scan_done(&mut self, ctx: &ScanContext) -> StorageResult<()> {
        self.container
            .set_attr(ctx.scan_group, "scan_done", json!(true))
            .await
    }

    /// Persist the navigation axes for a run, once, before the first
    /// step: the raw per-step coordinate sequence and the unique sorted
    /// values per scan dimension.
    pub async fn write_navigation_axes(
        &mut self,
        ctx: &ScanContext,
        grid: &Grid,
    ) -> StorageResult<()> {
        let names = [
            ("scan_x_axis", "scan_x_axis_unique"),
            ("scan_y_axis", "scan_y_axis_unique"),
        ];
        for (dim, (raw_name, unique_name)) in names.iter().enumerate().take(grid.axes.len()) {
            self.write_axis(ctx.scan_group, raw_name, &grid.axes[dim])
                .await?;
            self.write_axis(ctx.scan_group, unique_name, &grid.axes_unique[dim])
                .await?;
        }
        Ok(())
    }

    async fn write_axis(&mut self, scan_group: NodeId, name: &str, values: &[f64]) -> StorageResult<()> {
        let data = ArrayD::from_shape_vec(IxDyn(&[values.len()]), values.to_vec())
            .unwrap_or_else(|_| ArrayD::zeros(IxDyn(&[0])));
        let mut attrs = AttrMap::new();
        attrs.insert("type".to_string(), json!("navigation_axis"));
        attrs.insert("TITLE".to_string(), json!(name));
        attrs.insert("shape".to_string(), json!([values.len()]));
        self.container
            .create_array(scan_group, name, data, attrs)
            .await?;
        Ok(())
    }

    /// Create the settings group for one actuator (`Move000`, ...).
    pub async fn add_actuator_group(
        &mut self,
        ctx: &ScanContext,
        index: usize,
        name: &str,
        settings: serde_json::Value,
    ) -> StorageResult<NodeId> {
        self.add_device_group(ctx, &format!("Move{:03}", index), name, "actuator", settings)
            .await
    }

    /// Create the data group for one detector (`Detector000`, ...).
    pub async fn add_detector_group(
        &mut self,
        ctx: &ScanContext,
        index: usize,
        name: &str,
        settings: serde_json::Value,
    ) -> StorageResult<NodeId> {
        self.add_device_group(
            ctx,
            &format!("Detector{:03}", index),
            name,
            "detector",
            settings,
        )
        .await
    }

    async fn add_device_group(
        &mut self,
        ctx: &ScanContext,
        group_name: &str,
        device_name: &str,
        device_type: &str,
        settings: serde_json::Value,
    ) -> StorageResult<NodeId> {
        let group = self
            .container
            .get_or_create_group(ctx.scan_group, group_name, device_name)
            .await?;
        self.container
            .set_attr(group, "name", json!(device_name))
            .await?;
        self.container
            .set_attr(group, "type", json!(device_type))
            .await?;
        self.container.set_attr(group, "settings", settings).await?;
        Ok(group)
    }

    /// Durable sync of the whole container.
    pub async fn flush(&mut self) -> StorageResult<()> {
        self.container.flush().await
    }
}

fn scan_index(name: &str) -> Option<u32> {
    name.strip_prefix("Scan").and_then(|s| s.parse().ok())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use scan_grid::{AxisRange, GridRequest, ScanKind, ScanSubKind};

    fn url(dir: &tempfile::TempDir, name: &str) -> String {
        dir.path().join(name).display().to_string()
    }

    async fn open_write(dir: &tempfile::TempDir) -> ScanFile {
        ScanFile::open(&url(dir, "t.scan"), OpenMode::Write).await.unwrap()
    }

    #[tokio::test]
    async fn first_scan_is_scan000() {
        let dir = tempfile::tempdir().unwrap();
        let mut sf = open_write(&dir).await;
        let ctx = sf.new_scan().await.unwrap();
        assert_eq!(ctx.name, "Scan000");
    }

    #[tokio::test]
    async fn empty_scan_group_is_reused() {
        let dir = tempfile::tempdir().unwrap();
        let mut sf = open_write(&dir).await;
        let first = sf.new_scan().await.unwrap();
        let second = sf.new_scan().await.unwrap();
        assert_eq!(first.scan_group, second.scan_group);
        assert_eq!(second.name, "Scan000");
    }

    #[tokio::test]
    async fn populated_scan_group_is_never_reused() {
        let dir = tempfile::tempdir().unwrap();
        let mut sf = open_write(&dir).await;
        let first = sf.new_scan().await.unwrap();
        sf.add_actuator_group(&first, 0, "X", serde_json::Value::Null)
            .await
            .unwrap();
        let second = sf.new_scan().await.unwrap();
        assert_eq!(second.name, "Scan001");
        assert_ne!(first.scan_group, second.scan_group);
    }

    #[tokio::test]
    async fn done_scan_group_is_not_reused_even_when_empty() {
        let dir = tempfile::tempdir().unwrap();
        let mut sf = open_write(&dir).await;
        let first = sf.new_scan().await.unwrap();
        sf.mark_scan_done(&first).await.unwrap();
        let second = sf.new_scan().await.unwrap();
        assert_eq!(second.name, "Scan001");
    }

    #[tokio::test]
    async fn navigation_axes_are_written_once_with_attrs() {
        let dir = tempfile::tempdir().unwrap();
        let mut sf = open_write(&dir).await;
        let ctx = sf.new_scan().await.unwrap();
        let grid = Grid::build(&GridRequest {
            kind: ScanKind::Scan1D,
            sub_kind: ScanSubKind::Linear,
            axes: vec![AxisRange {
                start: 0.0,
                stop: 4.0,
                step: 1.0,
            }],
            spiral: None,
            actuators: vec!["X".to_string()],
        })
        .unwrap();
        sf.write_navigation_axes(&ctx, &grid).await.unwrap();

        let axis = sf
            .container()
            .find_child(ctx.scan_group, "scan_x_axis")
            .await
            .unwrap()
            .unwrap();
        let data = sf.container().read(axis).await.unwrap();
        assert_eq!(data.shape(), &[5]);
        let kind = sf.container().get_attr(axis, "type").await.unwrap().unwrap();
        assert_eq!(kind, serde_json::json!("navigation_axis"));
        assert!(sf
            .container()
            .find_child(ctx.scan_group, "scan_y_axis")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn device_groups_carry_settings_snapshots() {
        let dir = tempfile::tempdir().unwrap();
        let mut sf = open_write(&dir).await;
        let ctx = sf.new_scan().await.unwrap();
        let group = sf
            .add_actuator_group(&ctx, 0, "X", serde_json::json!({"units": "mm"}))
            .await
            .unwrap();
        let settings = sf.container().get_attr(group, "settings").await.unwrap().unwrap();
        assert_eq!(settings, serde_json::json!({"units": "mm"}));
        let names = sf.container().children(ctx.scan_group).await.unwrap();
        assert_eq!(names, vec!["Move000".to_string()]);
    }

    #[tokio::test]
    async fn log_lines_accumulate() {
        let dir = tempfile::tempdir().unwrap();
        let mut sf = open_write(&dir).await;
        sf.log_line("started").await.unwrap();
        sf.log_line("done").await.unwrap();
        let raw = sf.raw_group().await.unwrap();
        let logger = sf.container().find_child(raw, "Logger").await.unwrap().unwrap();
        let lines = sf.container().read_text(logger).await.unwrap();
        assert_eq!(lines.len(), 2);
        // Lines carry a timestamp prefix.
        assert!(lines[0].ends_with("started"));
        assert!(lines[1].ends_with("done"));
    }
}
