//! The abstract storage backend trait and container-open dispatch.
//!
//! Everything above this module (scan hierarchy, saver, engine) depends
//! only on [`StorageBackend`]; which concrete backend serves a run is
//! decided once, from the url handed to [`Container::open`]:
//!
//! - a plain filesystem path opens a local [`FileBackend`];
//! - `scan://host:port/name` connects a [`RemoteBackend`] to a running
//!   [`StorageServer`](crate::remote::StorageServer).
//!
//! # Contract
//!
//! - Names are unique (case-insensitive) within a parent. Creating a
//!   group or array under a name that already exists returns the existing
//!   node instead of erroring, so an in-progress container can be
//!   re-opened idempotently.
//! - Fixed arrays never change shape after creation; enlargeable arrays
//!   grow only along their leading dimension via `append`.
//! - `flush` makes the tree durable; it must be called at least once per
//!   scan run and on close.

use std::collections::BTreeMap;

use async_trait::async_trait;
use ndarray::ArrayD;
use serde::{Deserialize, Serialize};

use crate::error::{StorageError, StorageResult};
use crate::file::FileBackend;
use crate::node::NodeId;
use crate::remote::RemoteBackend;

/// Attribute set passed at array creation.
pub type AttrMap = BTreeMap<String, serde_json::Value>;

/// How a container is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpenMode {
    /// Existing container, mutations rejected.
    Read,
    /// Fresh container; an existing one at the same location is replaced.
    Write,
    /// Existing container opened for further writing.
    Append,
}

/// Uniform Node/Group/Array operations over one open container.
///
/// Methods take `&mut self`: a container is exclusively owned by one
/// writer for the duration of a run, and the remote implementation
/// multiplexes everything over a single connection.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Root group of the container.
    fn root(&self) -> NodeId;

    /// Find or create a child group. The existing node is returned if the
    /// name (case-insensitive) is already taken by a group; `title` is
    /// stored as the `TITLE` attribute on creation only.
    async fn get_or_create_group(
        &mut self,
        parent: NodeId,
        name: &str,
        title: &str,
    ) -> StorageResult<NodeId>;

    /// Child lookup by case-insensitive name.
    async fn find_child(&mut self, parent: NodeId, name: &str) -> StorageResult<Option<NodeId>>;

    /// Child names of a group, in creation order.
    async fn children(&mut self, parent: NodeId) -> StorageResult<Vec<String>>;

    /// Create a fixed-shape array with initial contents and attributes.
    /// Returns the existing node if the name is already taken.
    async fn create_array(
        &mut self,
        parent: NodeId,
        name: &str,
        data: ArrayD<f64>,
        attrs: AttrMap,
    ) -> StorageResult<NodeId>;

    /// Create an enlargeable array with the given per-row shape and an
    /// empty leading dimension.
    async fn create_earray(
        &mut self,
        parent: NodeId,
        name: &str,
        row_shape: Vec<usize>,
        attrs: AttrMap,
    ) -> StorageResult<NodeId>;

    /// Append one row (shape = `row_shape`) or a batch of rows (shape =
    /// `[k] + row_shape`) to an enlargeable array.
    async fn append(&mut self, array: NodeId, rows: ArrayD<f64>) -> StorageResult<()>;

    /// Create a variable-length text array.
    async fn create_vlarray(
        &mut self,
        parent: NodeId,
        name: &str,
        attrs: AttrMap,
    ) -> StorageResult<NodeId>;

    /// Append one text entry to a variable-length array.
    async fn append_text(&mut self, array: NodeId, line: &str) -> StorageResult<()>;

    /// Indexed write: assign `values` at the slot selected by fixing the
    /// leading dimensions of the array to `index`. Never changes shape.
    async fn write_at(
        &mut self,
        array: NodeId,
        index: &[usize],
        values: ArrayD<f64>,
    ) -> StorageResult<()>;

    /// Read back a numeric array.
    async fn read(&mut self, array: NodeId) -> StorageResult<ArrayD<f64>>;

    /// Read back a variable-length text array.
    async fn read_text(&mut self, array: NodeId) -> StorageResult<Vec<String>>;

    /// Set one attribute on a node.
    async fn set_attr(
        &mut self,
        node: NodeId,
        key: &str,
        value: serde_json::Value,
    ) -> StorageResult<()>;

    /// Get one attribute, `None` if absent.
    async fn get_attr(&mut self, node: NodeId, key: &str)
        -> StorageResult<Option<serde_json::Value>>;

    /// Attribute keys present on a node.
    async fn attr_keys(&mut self, node: NodeId) -> StorageResult<Vec<String>>;

    /// Durable sync of the whole container.
    async fn flush(&mut self) -> StorageResult<()>;
}

/// One open container, backend selected from the url scheme.
pub struct Container {
    backend: Box<dyn StorageBackend>,
    url: String,
}

impl Container {
    /// Open a container.
    ///
    /// `scan://host:port/name` urls connect to a storage server; anything
    /// else is treated as a local file path.
    pub async fn open(url: &str, mode: OpenMode) -> StorageResult<Self> {
        if url.is_empty() {
            return Err(StorageError::InvalidUrl(url.to_string()));
        }
        let backend: Box<dyn StorageBackend> = if url.starts_with("scan://") {
            Box::new(RemoteBackend::connect(url, mode).await?)
        } else {
            Box::new(FileBackend::open(std::path::Path::new(url), mode).await?)
        };
        Ok(Self {
            backend,
            url: url.to_string(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// The backend as a trait object, for callers that need the unsized type.
    pub fn backend_mut(&mut self) -> &mut dyn StorageBackend {
        self.backend.as_mut()
    }
}

impl std::ops::Deref for Container {
    type Target = dyn StorageBackend;

    fn deref(&self) -> &Self::Target {
        self.backend.as_ref()
    }
}

impl std::ops::DerefMut for Container {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.backend.as_mut()
    }
}
