//! Local single-process file backend.
//!
//! The whole node tree is memory-resident (an arena of nodes indexed by
//! [`NodeId`]) and serialized with bincode on `flush`. Durability is
//! atomic: the image is written to a sibling temp file and renamed over
//! the target, so a crash mid-flush leaves the previous image intact.
//! One process, one writer; no locking is attempted.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use ndarray::{ArrayD, Axis, IxDyn, SliceInfoElem};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::backend::{AttrMap, OpenMode, StorageBackend};
use crate::error::{StorageError, StorageResult};
use crate::node::{NodeId, NodeKind, StoredNode};

/// Bumped when the file image layout changes.
const FORMAT_VERSION: u32 = 1;

/// On-disk image of a container.
#[derive(Serialize, Deserialize)]
struct FileImage {
    version: u32,
    nodes: Vec<StoredNode>,
}

/// Memory-resident container persisted to a local file.
pub struct FileBackend {
    path: PathBuf,
    mode: OpenMode,
    nodes: Vec<StoredNode>,
    dirty: bool,
}

impl FileBackend {
    /// Open or create a container file.
    ///
    /// `Write` starts from a fresh tree regardless of what is on disk;
    /// `Read` and `Append` load the existing image.
    pub async fn open(path: &Path, mode: OpenMode) -> StorageResult<Self> {
        let nodes = match mode {
            OpenMode::Write => vec![StoredNode::group("/", None)],
            OpenMode::Read | OpenMode::Append => {
                let bytes = tokio::fs::read(path).await?;
                let image: FileImage = bincode::deserialize(&bytes)?;
                if image.version != FORMAT_VERSION {
                    return Err(StorageError::Protocol(format!(
                        "unsupported container version {} (expected {})",
                        image.version, FORMAT_VERSION
                    )));
                }
                if image.nodes.is_empty() {
                    vec![StoredNode::group("/", None)]
                } else {
                    image.nodes
                }
            }
        };
        debug!(path = %path.display(), ?mode, nodes = nodes.len(), "Opened container file");
        Ok(Self {
            path: path.to_path_buf(),
            mode,
            nodes,
            dirty: mode == OpenMode::Write,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn check_writable(&self) -> StorageResult<()> {
        if self.mode == OpenMode::Read {
            return Err(StorageError::ReadOnly(self.path.display().to_string()));
        }
        Ok(())
    }

    fn node(&self, id: NodeId) -> StorageResult<&StoredNode> {
        self.nodes.get(id.index()).ok_or(StorageError::UnknownNode(id))
    }

    fn node_mut(&mut self, id: NodeId) -> StorageResult<&mut StoredNode> {
        self.nodes
            .get_mut(id.index())
            .ok_or(StorageError::UnknownNode(id))
    }

    fn child_by_name(&self, parent: NodeId, name: &str) -> StorageResult<Option<NodeId>> {
        let node = self.node(parent)?;
        if !matches!(node.kind, NodeKind::Group) {
            return Err(StorageError::NotAGroup(node.name.clone()));
        }
        for &child in &node.children {
            if self.node(child)?.name.eq_ignore_ascii_case(name) {
                return Ok(Some(child));
            }
        }
        Ok(None)
    }

    fn insert_node(&mut self, parent: NodeId, node: StoredNode) -> NodeId {
        let id = NodeId(self.nodes.len() as u64);
        self.nodes.push(node);
        // Parent validated by the caller.
        if let Some(p) = self.nodes.get_mut(parent.index()) {
            p.children.push(id);
        }
        self.dirty = true;
        id
    }

    fn encode_attrs(attrs: &AttrMap) -> StorageResult<Vec<(String, String)>> {
        attrs
            .iter()
            .map(|(k, v)| Ok((k.clone(), serde_json::to_string(v)?)))
            .collect()
    }

    /// Shared creation path for the three array flavours.
    fn create_node(
        &mut self,
        parent: NodeId,
        name: &str,
        kind: NodeKind,
        attrs: AttrMap,
    ) -> StorageResult<NodeId> {
        self.check_writable()?;
        if let Some(existing) = self.child_by_name(parent, name)? {
            let node = self.node(existing)?;
            if node.kind.label() != kind.label() {
                return Err(StorageError::KindMismatch(name.to_string()));
            }
            return Ok(existing);
        }
        let encoded = Self::encode_attrs(&attrs)?;
        let mut node = StoredNode::group(name, Some(parent));
        node.kind = kind;
        node.attrs.extend(encoded);
        Ok(self.insert_node(parent, node))
    }
}

#[async_trait]
impl StorageBackend for FileBackend {
    fn root(&self) -> NodeId {
        NodeId::ROOT
    }

    async fn get_or_create_group(
        &mut self,
        parent: NodeId,
        name: &str,
        title: &str,
    ) -> StorageResult<NodeId> {
        self.check_writable()?;
        if let Some(existing) = self.child_by_name(parent, name)? {
            let node = self.node(existing)?;
            if !matches!(node.kind, NodeKind::Group) {
                return Err(StorageError::KindMismatch(name.to_string()));
            }
            return Ok(existing);
        }
        let mut node = StoredNode::group(name, Some(parent));
        node.attrs.insert(
            "TITLE".to_string(),
            serde_json::to_string(&serde_json::Value::String(title.to_string()))?,
        );
        Ok(self.insert_node(parent, node))
    }

    async fn find_child(&mut self, parent: NodeId, name: &str) -> StorageResult<Option<NodeId>> {
        self.child_by_name(parent, name)
    }

    async fn children(&mut self, parent: NodeId) -> StorageResult<Vec<String>> {
        let node = self.node(parent)?;
        if !matches!(node.kind, NodeKind::Group) {
            return Err(StorageError::NotAGroup(node.name.clone()));
        }
        node.children
            .iter()
            .map(|&c| Ok(self.node(c)?.name.clone()))
            .collect()
    }

    async fn create_array(
        &mut self,
        parent: NodeId,
        name: &str,
        data: ArrayD<f64>,
        attrs: AttrMap,
    ) -> StorageResult<NodeId> {
        self.create_node(parent, name, NodeKind::Array { data }, attrs)
    }

    async fn create_earray(
        &mut self,
        parent: NodeId,
        name: &str,
        row_shape: Vec<usize>,
        attrs: AttrMap,
    ) -> StorageResult<NodeId> {
        let mut shape = Vec::with_capacity(row_shape.len() + 1);
        shape.push(0);
        shape.extend_from_slice(&row_shape);
        let data = ArrayD::zeros(IxDyn(&shape));
        self.create_node(parent, name, NodeKind::EArray { data, row_shape }, attrs)
    }

    async fn append(&mut self, array: NodeId, rows: ArrayD<f64>) -> StorageResult<()> {
        self.check_writable()?;
        let node = self.node_mut(array)?;
        let name = node.name.clone();
        let (data, row_shape) = match &mut node.kind {
            NodeKind::EArray { data, row_shape } => (data, row_shape.clone()),
            _ => {
                return Err(StorageError::NotAnArray {
                    name,
                    expected: "an enlargeable array",
                })
            }
        };
        let mismatch = |values: &ArrayD<f64>, data: &ArrayD<f64>| StorageError::ShapeMismatch {
            index: Vec::new(),
            array: data.shape().to_vec(),
            values: values.shape().to_vec(),
        };
        if rows.shape() == row_shape.as_slice() {
            let expanded = rows.clone().insert_axis(Axis(0));
            data.append(Axis(0), expanded.view())
                .map_err(|_| mismatch(&rows, data))?;
        } else if rows.ndim() == row_shape.len() + 1 && rows.shape()[1..] == row_shape[..] {
            data.append(Axis(0), rows.view())
                .map_err(|_| mismatch(&rows, data))?;
        } else {
            return Err(StorageError::ShapeMismatch {
                index: Vec::new(),
                array: row_shape,
                values: rows.shape().to_vec(),
            });
        }
        self.dirty = true;
        Ok(())
    }

    async fn create_vlarray(
        &mut self,
        parent: NodeId,
        name: &str,
        attrs: AttrMap,
    ) -> StorageResult<NodeId> {
        self.create_node(parent, name, NodeKind::VlArray { lines: Vec::new() }, attrs)
    }

    async fn append_text(&mut self, array: NodeId, line: &str) -> StorageResult<()> {
        self.check_writable()?;
        let node = self.node_mut(array)?;
        match &mut node.kind {
            NodeKind::VlArray { lines } => {
                lines.push(line.to_string());
            }
            _ => {
                return Err(StorageError::NotAnArray {
                    name: node.name.clone(),
                    expected: "a variable-length array",
                })
            }
        }
        self.dirty = true;
        Ok(())
    }

    async fn write_at(
        &mut self,
        array: NodeId,
        index: &[usize],
        values: ArrayD<f64>,
    ) -> StorageResult<()> {
        self.check_writable()?;
        // Validate against an immutable borrow first.
        let node = self.node(array)?;
        let data_shape = match &node.kind {
            NodeKind::Array { data } => data.shape().to_vec(),
            _ => {
                return Err(StorageError::NotAnArray {
                    name: node.name.clone(),
                    expected: "a fixed-shape array",
                })
            }
        };
        if index.len() > data_shape.len() {
            return Err(StorageError::OutOfBounds {
                index: index.to_vec(),
                shape: data_shape,
            });
        }
        for (k, &i) in index.iter().enumerate() {
            if i >= data_shape[k] {
                return Err(StorageError::OutOfBounds {
                    index: index.to_vec(),
                    shape: data_shape,
                });
            }
        }
        let rest = &data_shape[index.len()..];
        if values.shape() != rest {
            return Err(StorageError::ShapeMismatch {
                index: index.to_vec(),
                array: data_shape,
                values: values.shape().to_vec(),
            });
        }

        let elems: Vec<SliceInfoElem> = index
            .iter()
            .map(|&i| SliceInfoElem::Index(i as isize))
            .chain(
                std::iter::repeat(SliceInfoElem::Slice {
                    start: 0,
                    end: None,
                    step: 1,
                })
                .take(data_shape.len() - index.len()),
            )
            .collect();
        let node = self.node_mut(array)?;
        if let NodeKind::Array { data } = &mut node.kind {
            let mut view = data.slice_mut(elems.as_slice());
            view.assign(&values);
        }
        self.dirty = true;
        Ok(())
    }

    async fn read(&mut self, array: NodeId) -> StorageResult<ArrayD<f64>> {
        let node = self.node(array)?;
        match &node.kind {
            NodeKind::Array { data } | NodeKind::EArray { data, .. } => Ok(data.clone()),
            _ => Err(StorageError::NotAnArray {
                name: node.name.clone(),
                expected: "a numeric array",
            }),
        }
    }

    async fn read_text(&mut self, array: NodeId) -> StorageResult<Vec<String>> {
        let node = self.node(array)?;
        match &node.kind {
            NodeKind::VlArray { lines } => Ok(lines.clone()),
            _ => Err(StorageError::NotAnArray {
                name: node.name.clone(),
                expected: "a variable-length array",
            }),
        }
    }

    async fn set_attr(
        &mut self,
        node: NodeId,
        key: &str,
        value: serde_json::Value,
    ) -> StorageResult<()> {
        self.check_writable()?;
        let encoded = serde_json::to_string(&value)?;
        let node = self.node_mut(node)?;
        node.attrs.insert(key.to_string(), encoded);
        self.dirty = true;
        Ok(())
    }

    async fn get_attr(
        &mut self,
        node: NodeId,
        key: &str,
    ) -> StorageResult<Option<serde_json::Value>> {
        let node = self.node(node)?;
        match node.attrs.get(key) {
            Some(text) => Ok(Some(serde_json::from_str(text)?)),
            None => Ok(None),
        }
    }

    async fn attr_keys(&mut self, node: NodeId) -> StorageResult<Vec<String>> {
        Ok(self.node(node)?.attrs.keys().cloned().collect())
    }

    async fn flush(&mut self) -> StorageResult<()> {
        if self.mode == OpenMode::Read || !self.dirty {
            return Ok(());
        }
        let image = FileImage {
            version: FORMAT_VERSION,
            nodes: self.nodes.clone(),
        };
        let bytes = bincode::serialize(&image)?;
        let mut tmp = self.path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        self.dirty = false;
        debug!(path = %self.path.display(), bytes = bytes.len(), "Flushed container");
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::float_cmp)]
mod tests {
    use super::*;

    fn temp_path(dir: &tempfile::TempDir, name: &str) -> PathBuf {
        dir.path().join(name)
    }

    #[tokio::test]
    async fn group_creation_is_idempotent_and_case_insensitive() {
        let dir = tempfile::tempdir().unwrap();
        let mut fb = FileBackend::open(&temp_path(&dir, "c.scan"), OpenMode::Write)
            .await
            .unwrap();
        let root = fb.root();

        let g1 = fb.get_or_create_group(root, "RawData", "raw").await.unwrap();
        let g2 = fb.get_or_create_group(root, "rawdata", "other").await.unwrap();
        assert_eq!(g1, g2);
        // Original title survives the second call.
        let title = fb.get_attr(g1, "TITLE").await.unwrap().unwrap();
        assert_eq!(title, serde_json::Value::String("raw".to_string()));
    }

    #[tokio::test]
    async fn array_name_collision_returns_existing_node() {
        let dir = tempfile::tempdir().unwrap();
        let mut fb = FileBackend::open(&temp_path(&dir, "c.scan"), OpenMode::Write)
            .await
            .unwrap();
        let root = fb.root();

        let data = ArrayD::zeros(IxDyn(&[3]));
        let a1 = fb
            .create_array(root, "Data", data.clone(), AttrMap::new())
            .await
            .unwrap();
        let a2 = fb.create_array(root, "data", data, AttrMap::new()).await.unwrap();
        assert_eq!(a1, a2);
    }

    #[tokio::test]
    async fn group_and_array_names_collide_with_kind_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let mut fb = FileBackend::open(&temp_path(&dir, "c.scan"), OpenMode::Write)
            .await
            .unwrap();
        let root = fb.root();

        fb.get_or_create_group(root, "Data", "").await.unwrap();
        let err = fb
            .create_array(root, "Data", ArrayD::zeros(IxDyn(&[1])), AttrMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::KindMismatch(_)));
    }

    #[tokio::test]
    async fn write_at_fixes_leading_dims() {
        let dir = tempfile::tempdir().unwrap();
        let mut fb = FileBackend::open(&temp_path(&dir, "c.scan"), OpenMode::Write)
            .await
            .unwrap();
        let root = fb.root();

        let array = fb
            .create_array(root, "Data", ArrayD::zeros(IxDyn(&[2, 3])), AttrMap::new())
            .await
            .unwrap();
        let row = ArrayD::from_shape_vec(IxDyn(&[3]), vec![1.0, 2.0, 3.0]).unwrap();
        fb.write_at(array, &[1], row).await.unwrap();

        let back = fb.read(array).await.unwrap();
        assert_eq!(back[IxDyn(&[0, 0])], 0.0);
        assert_eq!(back[IxDyn(&[1, 2])], 3.0);
    }

    #[tokio::test]
    async fn write_at_scalar_slot() {
        let dir = tempfile::tempdir().unwrap();
        let mut fb = FileBackend::open(&temp_path(&dir, "c.scan"), OpenMode::Write)
            .await
            .unwrap();
        let root = fb.root();

        let array = fb
            .create_array(root, "Data", ArrayD::zeros(IxDyn(&[5])), AttrMap::new())
            .await
            .unwrap();
        fb.write_at(array, &[4], ArrayD::from_elem(IxDyn(&[]), 7.0))
            .await
            .unwrap();
        let back = fb.read(array).await.unwrap();
        assert_eq!(back[IxDyn(&[4])], 7.0);
    }

    #[tokio::test]
    async fn write_at_rejects_bad_shapes_and_bounds() {
        let dir = tempfile::tempdir().unwrap();
        let mut fb = FileBackend::open(&temp_path(&dir, "c.scan"), OpenMode::Write)
            .await
            .unwrap();
        let root = fb.root();

        let array = fb
            .create_array(root, "Data", ArrayD::zeros(IxDyn(&[2, 3])), AttrMap::new())
            .await
            .unwrap();
        let err = fb
            .write_at(array, &[2], ArrayD::zeros(IxDyn(&[3])))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::OutOfBounds { .. }));

        let err = fb
            .write_at(array, &[0], ArrayD::zeros(IxDyn(&[4])))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::ShapeMismatch { .. }));
    }

    #[tokio::test]
    async fn earray_grows_along_leading_dim() {
        let dir = tempfile::tempdir().unwrap();
        let mut fb = FileBackend::open(&temp_path(&dir, "c.scan"), OpenMode::Write)
            .await
            .unwrap();
        let root = fb.root();

        let ea = fb
            .create_earray(root, "rows", vec![2], AttrMap::new())
            .await
            .unwrap();
        fb.append(ea, ArrayD::from_shape_vec(IxDyn(&[2]), vec![1.0, 2.0]).unwrap())
            .await
            .unwrap();
        fb.append(
            ea,
            ArrayD::from_shape_vec(IxDyn(&[2, 2]), vec![3.0, 4.0, 5.0, 6.0]).unwrap(),
        )
        .await
        .unwrap();

        let back = fb.read(ea).await.unwrap();
        assert_eq!(back.shape(), &[3, 2]);
        assert_eq!(back[IxDyn(&[2, 1])], 6.0);
    }

    #[tokio::test]
    async fn vlarray_round_trips_text() {
        let dir = tempfile::tempdir().unwrap();
        let mut fb = FileBackend::open(&temp_path(&dir, "c.scan"), OpenMode::Write)
            .await
            .unwrap();
        let root = fb.root();

        let log = fb.create_vlarray(root, "Logger", AttrMap::new()).await.unwrap();
        fb.append_text(log, "scan started").await.unwrap();
        fb.append_text(log, "scan done").await.unwrap();
        assert_eq!(
            fb.read_text(log).await.unwrap(),
            vec!["scan started".to_string(), "scan done".to_string()]
        );
    }

    #[tokio::test]
    async fn read_mode_rejects_mutation() {
        let dir = tempfile::tempdir().unwrap();
        let path = temp_path(&dir, "c.scan");
        {
            let mut fb = FileBackend::open(&path, OpenMode::Write).await.unwrap();
            let root = fb.root();
            fb.get_or_create_group(root, "RawData", "").await.unwrap();
            fb.flush().await.unwrap();
        }
        let mut fb = FileBackend::open(&path, OpenMode::Read).await.unwrap();
        let root = fb.root();
        assert!(fb.find_child(root, "RawData").await.unwrap().is_some());
        let err = fb.get_or_create_group(root, "More", "").await.unwrap_err();
        assert!(matches!(err, StorageError::ReadOnly(_)));
    }
}
