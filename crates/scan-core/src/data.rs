//! Detector payload data model.
//!
//! A detector answers a trigger with a [`DetectorPayload`]: its channels
//! bucketed by data dimensionality (scalar, trace, image, higher-rank),
//! each channel carrying an [`ndarray::ArrayD`] of samples plus optional
//! signal axes. The storage layer mirrors these buckets one-to-one as
//! `data0D/data1D/data2D/dataND` groups, and relies on the `BTreeMap`
//! ordering for deterministic channel numbering.

use std::collections::BTreeMap;

use ndarray::{ArrayD, IxDyn};
use serde::{Deserialize, Serialize};

/// Dimensionality bucket of a detector channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum DataDim {
    /// Scalar samples.
    D0,
    /// 1D traces (spectra, waveforms).
    D1,
    /// 2D images.
    D2,
    /// Rank three or higher.
    DN,
}

impl DataDim {
    /// Storage group name for this bucket.
    pub fn group_name(&self) -> &'static str {
        match self {
            DataDim::D0 => "data0D",
            DataDim::D1 => "data1D",
            DataDim::D2 => "data2D",
            DataDim::DN => "dataND",
        }
    }

    /// Short label used in the `data_type` attribute.
    pub fn label(&self) -> &'static str {
        match self {
            DataDim::D0 => "0D",
            DataDim::D1 => "1D",
            DataDim::D2 => "2D",
            DataDim::DN => "ND",
        }
    }

    /// Bucket for a signal of the given rank.
    pub fn of_ndim(ndim: usize) -> Self {
        match ndim {
            0 => DataDim::D0,
            1 => DataDim::D1,
            2 => DataDim::D2,
            _ => DataDim::DN,
        }
    }
}

/// One named channel of a detector payload.
///
/// `data` has the rank its [`DataDim`] bucket implies (a 0D channel is a
/// zero-rank array). `x_axis`/`y_axis` describe the signal coordinates for
/// 1D and 2D channels; they are persisted once at layout creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelData {
    pub data: ArrayD<f64>,
    pub x_axis: Option<Vec<f64>>,
    pub y_axis: Option<Vec<f64>>,
}

impl ChannelData {
    /// Scalar channel.
    pub fn scalar(value: f64) -> Self {
        Self {
            data: ArrayD::from_elem(IxDyn(&[]), value),
            x_axis: None,
            y_axis: None,
        }
    }

    /// 1D trace channel with an optional signal axis.
    pub fn trace(values: Vec<f64>, x_axis: Option<Vec<f64>>) -> Self {
        let n = values.len();
        Self {
            // Shape is taken from the input length, so this cannot fail.
            data: ArrayD::from_shape_vec(IxDyn(&[n]), values).unwrap_or_default(),
            x_axis,
            y_axis: None,
        }
    }

    /// Channel from an arbitrary-rank array.
    pub fn array(data: ArrayD<f64>, x_axis: Option<Vec<f64>>, y_axis: Option<Vec<f64>>) -> Self {
        Self {
            data,
            x_axis,
            y_axis,
        }
    }

    /// Dimensionality bucket this channel belongs to.
    pub fn dim(&self) -> DataDim {
        DataDim::of_ndim(self.data.ndim())
    }

    /// Signal shape (empty for scalar channels).
    pub fn signal_shape(&self) -> Vec<usize> {
        self.data.shape().to_vec()
    }
}

/// Everything one detector produced for one trigger, bucketed by
/// dimensionality and keyed by channel name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DetectorPayload {
    channels: BTreeMap<DataDim, BTreeMap<String, ChannelData>>,
}

impl DetectorPayload {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a channel into the bucket its rank implies.
    pub fn insert(&mut self, name: impl Into<String>, channel: ChannelData) {
        self.channels
            .entry(channel.dim())
            .or_default()
            .insert(name.into(), channel);
    }

    /// Populated dimension buckets in deterministic order.
    pub fn buckets(&self) -> impl Iterator<Item = (DataDim, &BTreeMap<String, ChannelData>)> {
        self.channels.iter().map(|(dim, chans)| (*dim, chans))
    }

    /// Look up one channel.
    pub fn channel(&self, dim: DataDim, name: &str) -> Option<&ChannelData> {
        self.channels.get(&dim).and_then(|c| c.get(name))
    }

    /// Total channel count across buckets.
    pub fn channel_count(&self) -> usize {
        self.channels.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}
