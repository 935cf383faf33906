//! Hierarchical structured storage for scan data.
//!
//! A scan run persists into a self-describing tree of groups and arrays
//! behind one abstract [`StorageBackend`] trait, with two interchangeable
//! implementations selected at container-open time:
//!
//! - [`FileBackend`] — a single-process local file, the whole node tree
//!   serialized with bincode and flushed atomically (temp file + rename);
//! - [`RemoteBackend`] — the same operations forwarded over TCP to a
//!   [`StorageServer`], which owns a `FileBackend` per served container.
//!
//! Above the trait sit the scan-specific layers: [`ScanFile`] maintains
//! the `/RawData/Scan{NNN}` hierarchy and navigation axes, and
//! [`DimensionSaver`] lazily builds each channel's array layout on the
//! first sample and performs pure indexed writes afterwards.

pub mod backend;
pub mod error;
pub mod file;
pub mod node;
pub mod remote;
pub mod saver;
pub mod scanfile;

pub use backend::{AttrMap, Container, OpenMode, StorageBackend};
pub use error::{StorageError, StorageResult};
pub use file::FileBackend;
pub use node::{NodeId, NodeKind, StoredNode};
pub use remote::{RemoteBackend, StorageServer};
pub use saver::{DimensionSaver, StepSaveOutcome};
pub use scanfile::{ScanContext, ScanFile};
