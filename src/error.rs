use crate::types::{BoxError, CellIndex};
use std::sync::Arc;
use thiserror::Error;

/// Error kind for every fallible engine operation.
///
/// Structural errors (`NodeNotFound`, `CycleDetected`, `SelfDependency`,
/// `UnknownDependency`, `TypeMismatch`, `Disposed`) abort the enclosing call
/// and leave the graph untouched. Compute errors (`ComputeFailed`,
/// `ReentrancyDetected`) are captured in the node's memo and observed by
/// every consumer of that node until the memo is reset.
#[derive(Debug, Error, Clone)]
#[non_exhaustive]
pub enum EngineError {
    /// The operation references a cell index with no node behind it.
    #[error("no node exists for cell index {index}")]
    NodeNotFound {
        /// Index the operation referenced.
        index: CellIndex,
    },
    /// Adding the function cell would close a dependency cycle.
    #[error("adding the function cell would close a cycle through cell {through}")]
    CycleDetected {
        /// Dependency from which the new cell was reachable.
        through: CellIndex,
    },
    /// The function cell's dependencies include the cell being added.
    #[error("function cell {index} cannot depend on itself")]
    SelfDependency {
        /// Index of the cell being added.
        index: CellIndex,
    },
    /// A dependency references an index with no node behind it.
    #[error("dependency references missing cell index {index}")]
    UnknownDependency {
        /// The missing index.
        index: CellIndex,
    },
    /// A computation reentered a cell that is already being computed on the
    /// current task chain.
    #[error("reentrant computation detected: {chain}")]
    ReentrancyDetected {
        /// The in-flight dependency chain, innermost last.
        chain: String,
    },
    /// The requested value type does not match what the cell holds.
    #[error("requested {requested} but the cell holds {actual}")]
    TypeMismatch {
        /// Type the caller asked for.
        requested: &'static str,
        /// Type the cell actually holds.
        actual: &'static str,
    },
    /// The engine has been disposed; no further operations are possible.
    #[error("engine has been disposed")]
    Disposed,
    /// A user compute function failed; wraps the inner error.
    #[error("compute failed: {0}")]
    ComputeFailed(Arc<dyn std::error::Error + Send + Sync + 'static>),
}

impl EngineError {
    pub(crate) fn compute_failed(err: impl Into<BoxError>) -> Self {
        Self::ComputeFailed(Arc::from(err.into()))
    }
}
