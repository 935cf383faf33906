//! Storage layer error type.

use thiserror::Error;

use crate::node::NodeId;
use scan_core::ScanError;

/// Convenience alias for results using the storage error type.
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Primary error type for the storage layer.
#[derive(Error, Debug)]
pub enum StorageError {
    /// File or network I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Container image or wire frame could not be encoded/decoded.
    #[error("Codec error: {0}")]
    Codec(#[from] Box<bincode::ErrorKind>),

    /// An attribute value could not be encoded/decoded as JSON.
    #[error("Attribute codec error: {0}")]
    Attr(#[from] serde_json::Error),

    /// The url does not name a known backend.
    #[error("Invalid storage url '{0}'")]
    InvalidUrl(String),

    /// A node id does not exist in this container.
    #[error("Unknown node id {0}")]
    UnknownNode(NodeId),

    /// The operation needs a group but the node is not one.
    #[error("Node '{0}' is not a group")]
    NotAGroup(String),

    /// The operation needs an array of a given flavour.
    #[error("Node '{name}' is not {expected}")]
    NotAnArray { name: String, expected: &'static str },

    /// An existing node has the right name but the wrong kind.
    #[error("Node '{0}' already exists with a different kind")]
    KindMismatch(String),

    /// Mutation attempted on a read-only container.
    #[error("Container '{0}' is opened read-only")]
    ReadOnly(String),

    /// Indexed write whose values do not fit the target slot.
    #[error("Shape mismatch at index {index:?}: array {array:?}, values {values:?}")]
    ShapeMismatch {
        index: Vec<usize>,
        array: Vec<usize>,
        values: Vec<usize>,
    },

    /// Indexed write outside the array bounds.
    #[error("Index {index:?} out of bounds for shape {shape:?}")]
    OutOfBounds { index: Vec<usize>, shape: Vec<usize> },

    /// Grid-cell index arity outside the supported 1D/2D addressing.
    #[error("Grid index arity {0} is not 1 or 2")]
    Dimensionality(usize),

    /// Remote backend protocol violation.
    #[error("Remote protocol error: {0}")]
    Protocol(String),

    /// The remote server refused or failed the request.
    #[error("Remote server error: {0}")]
    Remote(String),
}

impl From<StorageError> for ScanError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Dimensionality(arity) => ScanError::Dimensionality { arity },
            other => ScanError::Persistence(other.to_string()),
        }
    }
}
