//! Node model shared by the storage backends.
//!
//! Containers hold their tree as an arena of [`StoredNode`]s addressed by
//! [`NodeId`]; id 0 is always the root group. Attribute values are kept as
//! JSON text so the node tree round-trips through bincode unchanged (the
//! wire frames and the file image both carry nodes verbatim).

use std::collections::BTreeMap;

use ndarray::ArrayD;
use serde::{Deserialize, Serialize};

/// Handle to a node within one open container.
///
/// Ids are only meaningful against the container that issued them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeId(pub(crate) u64);

impl NodeId {
    /// The root group of every container.
    pub const ROOT: NodeId = NodeId(0);

    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Payload of a stored node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum NodeKind {
    /// Interior node holding children.
    Group,
    /// Fixed-shape numeric array.
    Array { data: ArrayD<f64> },
    /// Enlargeable numeric array growing along its leading dimension.
    EArray {
        data: ArrayD<f64>,
        row_shape: Vec<usize>,
    },
    /// Variable-length text array (log lines, ragged sequences).
    VlArray { lines: Vec<String> },
}

impl NodeKind {
    /// Short label for error messages.
    pub fn label(&self) -> &'static str {
        match self {
            NodeKind::Group => "group",
            NodeKind::Array { .. } => "array",
            NodeKind::EArray { .. } => "earray",
            NodeKind::VlArray { .. } => "vlarray",
        }
    }
}

/// One node of the container tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredNode {
    pub name: String,
    pub parent: Option<NodeId>,
    pub children: Vec<NodeId>,
    pub kind: NodeKind,
    /// Attribute values, JSON-encoded.
    pub attrs: BTreeMap<String, String>,
}

impl StoredNode {
    pub fn group(name: impl Into<String>, parent: Option<NodeId>) -> Self {
        Self {
            name: name.into(),
            parent,
            children: Vec::new(),
            kind: NodeKind::Group,
            attrs: BTreeMap::new(),
        }
    }
}
