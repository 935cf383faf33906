//! The Data-Dimension Saver: per-channel array layout and indexed writes.
//!
//! The saver is a two-phase state machine. It starts `Uninitialized`; the
//! first saved sample (step 0, average 0) transitions it to `Initialized`
//! by creating, for every populated dimension bucket of every detector
//! payload, the `data0D/data1D/data2D/dataND` group, a `CH{NNN}` group per
//! channel and a zero-filled fixed-shape `Data` array sized
//!
//! ```text
//! scan_shape [+ (naverage,) if naverage > 1] [+ signal_shape]
//! ```
//!
//! plus the channel's own `x_axis`/`y_axis` arrays where present. Every
//! later step performs pure indexed writes into those arrays; nothing
//! structural is ever created again.
//!
//! Channel-level failures (unknown channel appearing later, shape
//! disagreement with the layout fixed at initialization, a refused write)
//! are isolated: logged at warn level, skipped for that step, and counted
//! in the returned [`StepSaveOutcome`]. The run continues.

use std::collections::BTreeMap;

use ndarray::{ArrayD, IxDyn};
use serde_json::json;
use tracing::{debug, warn};

use crate::backend::{AttrMap, StorageBackend};
use crate::error::{StorageError, StorageResult};
use crate::node::NodeId;
use scan_core::{ChannelData, DataDim, DetectorPayload};

/// (detector, dimension bucket, channel name).
type ChannelKey = (String, DataDim, String);

/// Layout fixed at initialization for one channel.
struct ChannelSlot {
    array: NodeId,
    signal_shape: Vec<usize>,
}

enum SaverState {
    Uninitialized,
    Initialized(BTreeMap<ChannelKey, ChannelSlot>),
}

/// Counts for one saved step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StepSaveOutcome {
    /// Channels written at this step.
    pub written: usize,
    /// Channels skipped after an isolated failure.
    pub skipped: usize,
}

/// Builds and maintains the channel array layout for one run.
pub struct DimensionSaver {
    scan_shape: Vec<usize>,
    naverage: usize,
    scan_type: String,
    state: SaverState,
}

impl DimensionSaver {
    /// # Arguments
    /// * `scan_shape` - per-axis unique-value counts of the grid
    /// * `naverage` - averaging count of the run (>= 1)
    /// * `scan_type` - label stored in every array's `scan_type` attribute
    pub fn new(scan_shape: Vec<usize>, naverage: usize, scan_type: impl Into<String>) -> Self {
        Self {
            scan_shape,
            naverage: naverage.max(1),
            scan_type: scan_type.into(),
            state: SaverState::Uninitialized,
        }
    }

    pub fn is_initialized(&self) -> bool {
        matches!(self.state, SaverState::Initialized(_))
    }

    /// Full array shape for a channel with the given signal shape.
    fn array_shape(&self, signal_shape: &[usize]) -> Vec<usize> {
        let mut shape = self.scan_shape.clone();
        if self.naverage > 1 {
            shape.push(self.naverage);
        }
        shape.extend_from_slice(signal_shape);
        shape
    }

    /// Save the aggregated payloads of one step at the given grid cell.
    ///
    /// `detector_groups` maps detector names to their `Detector{NNN}`
    /// groups. The first call creates the whole layout; later calls only
    /// write. Structural errors at initialization are fatal; channel-level
    /// write failures are isolated.
    pub async fn save_step(
        &mut self,
        backend: &mut dyn StorageBackend,
        detector_groups: &BTreeMap<String, NodeId>,
        payloads: &BTreeMap<String, DetectorPayload>,
        cell: &[usize],
        average: usize,
    ) -> StorageResult<StepSaveOutcome> {
        if cell.len() != 1 && cell.len() != 2 {
            return Err(StorageError::Dimensionality(cell.len()));
        }
        if cell.len() != self.scan_shape.len() {
            return Err(StorageError::Dimensionality(cell.len()));
        }
        if let SaverState::Uninitialized = self.state {
            self.initialize(backend, detector_groups, payloads).await?;
        }

        let table = match &self.state {
            SaverState::Initialized(table) => table,
            SaverState::Uninitialized => unreachable!("layout initialized above"),
        };

        let mut index: Vec<usize> = cell.to_vec();
        if self.naverage > 1 {
            index.push(average);
        }

        let mut outcome = StepSaveOutcome::default();
        for (det_name, payload) in payloads {
            for (dim, channels) in payload.buckets() {
                for (ch_name, channel) in channels {
                    let key = (det_name.clone(), dim, ch_name.clone());
                    let slot = match table.get(&key) {
                        Some(slot) => slot,
                        None => {
                            warn!(
                                detector = %det_name,
                                channel = %ch_name,
                                "Channel appeared after layout initialization, skipping"
                            );
                            outcome.skipped += 1;
                            continue;
                        }
                    };
                    if channel.signal_shape() != slot.signal_shape {
                        warn!(
                            detector = %det_name,
                            channel = %ch_name,
                            expected = ?slot.signal_shape,
                            got = ?channel.signal_shape(),
                            "Channel shape disagrees with initialized layout, skipping"
                        );
                        outcome.skipped += 1;
                        continue;
                    }
                    match backend
                        .write_at(slot.array, &index, channel.data.clone())
                        .await
                    {
                        Ok(()) => outcome.written += 1,
                        Err(e) => {
                            warn!(
                                detector = %det_name,
                                channel = %ch_name,
                                error = %e,
                                "Channel write failed, skipping for this step"
                            );
                            outcome.skipped += 1;
                        }
                    }
                }
            }
        }
        Ok(outcome)
    }

    /// One-time layout creation from the first step's payloads.
    async fn initialize(
        &mut self,
        backend: &mut dyn StorageBackend,
        detector_groups: &BTreeMap<String, NodeId>,
        payloads: &BTreeMap<String, DetectorPayload>,
    ) -> StorageResult<()> {
        let mut table = BTreeMap::new();
        for (det_name, payload) in payloads {
            let det_group = match detector_groups.get(det_name) {
                Some(&g) => g,
                None => {
                    warn!(detector = %det_name, "No storage group for detector, skipping");
                    continue;
                }
            };
            for (dim, channels) in payload.buckets() {
                let dim_group = backend
                    .get_or_create_group(det_group, dim.group_name(), "")
                    .await?;
                for (ch_index, (ch_name, channel)) in channels.iter().enumerate() {
                    let ch_group = backend
                        .get_or_create_group(dim_group, &format!("CH{:03}", ch_index), ch_name)
                        .await?;
                    let slot = self
                        .create_channel_arrays(backend, ch_group, dim, ch_name, channel)
                        .await?;
                    table.insert((det_name.clone(), dim, ch_name.clone()), slot);
                }
            }
        }
        debug!(
            channels = table.len(),
            scan_shape = ?self.scan_shape,
            naverage = self.naverage,
            "Initialized channel layout"
        );
        self.state = SaverState::Initialized(table);
        Ok(())
    }

    async fn create_channel_arrays(
        &self,
        backend: &mut dyn StorageBackend,
        ch_group: NodeId,
        dim: DataDim,
        ch_name: &str,
        channel: &ChannelData,
    ) -> StorageResult<ChannelSlot> {
        let signal_shape = channel.signal_shape();
        let full_shape = self.array_shape(&signal_shape);

        let mut attrs = AttrMap::new();
        attrs.insert("data_type".to_string(), json!(dim.label()));
        attrs.insert("scan_type".to_string(), json!(self.scan_type));
        attrs.insert("shape".to_string(), json!(full_shape));
        attrs.insert("Naverage".to_string(), json!(self.naverage));
        attrs.insert("data_name".to_string(), json!(ch_name));
        attrs.insert("TITLE".to_string(), json!(ch_name));

        let array = backend
            .create_array(
                ch_group,
                "Data",
                ArrayD::zeros(IxDyn(&full_shape)),
                attrs,
            )
            .await?;

        if let Some(x) = &channel.x_axis {
            self.write_signal_axis(backend, ch_group, "x_axis", x).await?;
        }
        if let Some(y) = &channel.y_axis {
            self.write_signal_axis(backend, ch_group, "y_axis", y).await?;
        }
        Ok(ChannelSlot {
            array,
            signal_shape,
        })
    }

    async fn write_signal_axis(
        &self,
        backend: &mut dyn StorageBackend,
        ch_group: NodeId,
        name: &str,
        values: &[f64],
    ) -> StorageResult<()> {
        let data = ArrayD::from_shape_vec(IxDyn(&[values.len()]), values.to_vec())
            .unwrap_or_else(|_| ArrayD::zeros(IxDyn(&[0])));
        let mut attrs = AttrMap::new();
        attrs.insert("type".to_string(), json!("signal_axis"));
        attrs.insert("TITLE".to_string(), json!(name));
        attrs.insert("shape".to_string(), json!([values.len()]));
        backend.create_array(ch_group, name, data, attrs).await?;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::float_cmp)]
mod tests {
    use super::*;
    use crate::backend::OpenMode;
    use crate::file::FileBackend;

    async fn backend(dir: &tempfile::TempDir) -> FileBackend {
        FileBackend::open(&dir.path().join("t.scan"), OpenMode::Write)
            .await
            .unwrap()
    }

    async fn detector_group(fb: &mut FileBackend) -> BTreeMap<String, NodeId> {
        let root = fb.root();
        let group = fb.get_or_create_group(root, "Detector000", "D").await.unwrap();
        BTreeMap::from([("D".to_string(), group)])
    }

    fn scalar_payload(value: f64) -> BTreeMap<String, DetectorPayload> {
        let mut payload = DetectorPayload::new();
        payload.insert("ch1", ChannelData::scalar(value));
        BTreeMap::from([("D".to_string(), payload)])
    }

    #[tokio::test]
    async fn first_save_creates_the_layout() {
        let dir = tempfile::tempdir().unwrap();
        let mut fb = backend(&dir).await;
        let groups = detector_group(&mut fb).await;

        let mut saver = DimensionSaver::new(vec![5], 1, "Scan1D/Linear");
        assert!(!saver.is_initialized());
        let outcome = saver
            .save_step(&mut fb, &groups, &scalar_payload(1.0), &[0], 0)
            .await
            .unwrap();
        assert!(saver.is_initialized());
        assert_eq!(outcome, StepSaveOutcome { written: 1, skipped: 0 });

        let det = groups["D"];
        let d0 = fb.find_child(det, "data0D").await.unwrap().unwrap();
        let ch = fb.find_child(d0, "CH000").await.unwrap().unwrap();
        let data = fb.find_child(ch, "Data").await.unwrap().unwrap();
        let array = fb.read(data).await.unwrap();
        assert_eq!(array.shape(), &[5]);
        assert_eq!(array[IxDyn(&[0])], 1.0);

        // Self-describing attributes.
        assert_eq!(
            fb.get_attr(data, "data_type").await.unwrap().unwrap(),
            json!("0D")
        );
        assert_eq!(
            fb.get_attr(data, "scan_type").await.unwrap().unwrap(),
            json!("Scan1D/Linear")
        );
        assert_eq!(fb.get_attr(data, "shape").await.unwrap().unwrap(), json!([5]));
        assert_eq!(fb.get_attr(data, "Naverage").await.unwrap().unwrap(), json!(1));
    }

    #[tokio::test]
    async fn naverage_appends_a_trailing_dimension() {
        let dir = tempfile::tempdir().unwrap();
        let mut fb = backend(&dir).await;
        let groups = detector_group(&mut fb).await;

        let mut saver = DimensionSaver::new(vec![4], 3, "Scan1D/Linear");
        for average in 0..3usize {
            for step in 0..4usize {
                saver
                    .save_step(
                        &mut fb,
                        &groups,
                        &scalar_payload((step + 10 * average) as f64 + 1.0),
                        &[step],
                        average,
                    )
                    .await
                    .unwrap();
            }
        }

        let det = groups["D"];
        let d0 = fb.find_child(det, "data0D").await.unwrap().unwrap();
        let ch = fb.find_child(d0, "CH000").await.unwrap().unwrap();
        let data = fb.find_child(ch, "Data").await.unwrap().unwrap();
        let array = fb.read(data).await.unwrap();
        assert_eq!(array.shape(), &[4, 3]);
        // Every cell got a non-zero value.
        assert!(array.iter().all(|&v| v != 0.0));
        assert_eq!(array[IxDyn(&[2, 1])], 13.0);
    }

    #[tokio::test]
    async fn trace_channels_store_signal_shape_and_axis() {
        let dir = tempfile::tempdir().unwrap();
        let mut fb = backend(&dir).await;
        let groups = detector_group(&mut fb).await;

        let mut payload = DetectorPayload::new();
        payload.insert(
            "spectrum",
            ChannelData::trace(vec![1.0, 2.0, 3.0], Some(vec![0.0, 0.5, 1.0])),
        );
        let payloads = BTreeMap::from([("D".to_string(), payload)]);

        let mut saver = DimensionSaver::new(vec![2], 1, "Scan1D/Linear");
        saver.save_step(&mut fb, &groups, &payloads, &[1], 0).await.unwrap();

        let det = groups["D"];
        let d1 = fb.find_child(det, "data1D").await.unwrap().unwrap();
        let ch = fb.find_child(d1, "CH000").await.unwrap().unwrap();
        let data = fb.find_child(ch, "Data").await.unwrap().unwrap();
        let array = fb.read(data).await.unwrap();
        assert_eq!(array.shape(), &[2, 3]);
        assert_eq!(array[IxDyn(&[1, 2])], 3.0);
        assert_eq!(array[IxDyn(&[0, 0])], 0.0);

        let x = fb.find_child(ch, "x_axis").await.unwrap().unwrap();
        assert_eq!(fb.read(x).await.unwrap().shape(), &[3]);
        assert_eq!(fb.get_attr(x, "shape").await.unwrap().unwrap(), json!([3]));
    }

    #[tokio::test]
    async fn late_channel_is_skipped_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let mut fb = backend(&dir).await;
        let groups = detector_group(&mut fb).await;

        let mut saver = DimensionSaver::new(vec![3], 1, "Scan1D/Linear");
        saver
            .save_step(&mut fb, &groups, &scalar_payload(1.0), &[0], 0)
            .await
            .unwrap();

        // A second channel shows up at step 1.
        let mut payload = DetectorPayload::new();
        payload.insert("ch1", ChannelData::scalar(2.0));
        payload.insert("late", ChannelData::scalar(9.0));
        let payloads = BTreeMap::from([("D".to_string(), payload)]);
        let outcome = saver.save_step(&mut fb, &groups, &payloads, &[1], 0).await.unwrap();
        assert_eq!(outcome, StepSaveOutcome { written: 1, skipped: 1 });

        // Nothing structural was created for the late channel.
        let det = groups["D"];
        let d0 = fb.find_child(det, "data0D").await.unwrap().unwrap();
        let names = fb.children(d0).await.unwrap();
        assert_eq!(names, vec!["CH000".to_string()]);
    }

    #[tokio::test]
    async fn shape_disagreement_is_skipped_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let mut fb = backend(&dir).await;
        let groups = detector_group(&mut fb).await;

        let mut payload = DetectorPayload::new();
        payload.insert("spectrum", ChannelData::trace(vec![1.0, 2.0, 3.0], None));
        let payloads = BTreeMap::from([("D".to_string(), payload)]);
        let mut saver = DimensionSaver::new(vec![2], 1, "Scan1D/Linear");
        saver.save_step(&mut fb, &groups, &payloads, &[0], 0).await.unwrap();

        // Same channel, different length at the next step.
        let mut payload = DetectorPayload::new();
        payload.insert("spectrum", ChannelData::trace(vec![1.0, 2.0], None));
        let payloads = BTreeMap::from([("D".to_string(), payload)]);
        let outcome = saver.save_step(&mut fb, &groups, &payloads, &[1], 0).await.unwrap();
        assert_eq!(outcome, StepSaveOutcome { written: 0, skipped: 1 });
    }

    #[tokio::test]
    async fn bad_cell_arity_is_a_dimensionality_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut fb = backend(&dir).await;
        let groups = detector_group(&mut fb).await;

        let mut saver = DimensionSaver::new(vec![2, 2], 1, "Scan2D/Linear");
        let err = saver
            .save_step(&mut fb, &groups, &scalar_payload(1.0), &[0, 0, 0], 0)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Dimensionality(3)));
    }
}
