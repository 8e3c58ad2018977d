//! Error types for the cache layer.

use commlog_store::StoreError;
use thiserror::Error;

use crate::tree::NodeId;

/// Errors returned by tree, grouping and model operations.
#[derive(Debug, Error)]
pub enum CacheError {
    /// Storage failure on a write path.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The operation is not supported under the current layout.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// A node handle that is stale or was never issued by this tree.
    #[error("invalid node {0:?}")]
    InvalidNode(NodeId),

    /// The dedicated query worker has shut down.
    #[error("query worker is not running")]
    WorkerGone,

    /// Background work was requested outside a tokio runtime.
    #[error("no tokio runtime available for background work")]
    NoRuntime,
}

/// Failure reported by a contact resolver for a single lookup.
#[derive(Clone, Debug, Error)]
#[error("contact resolution failed: {0}")]
pub struct ResolveError(pub String);

/// Convenience type alias for cache results.
pub type Result<T> = std::result::Result<T, CacheError>;
