use indexmap::{IndexMap as _IndexMap, IndexSet as _IndexSet};
use rustc_hash::FxBuildHasher;
use std::collections::HashSet as _HashSet;

/// Index of a cell in the graph.
///
/// Allocated by the engine from a strictly monotonic atomic counter and
/// stable for the lifetime of the cell.
pub type CellIndex = u64;

/// Boxed error type returned by user compute functions.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

pub(crate) type HashSet<T> = _HashSet<T, FxBuildHasher>;
pub(crate) type IndexMap<K, V> = _IndexMap<K, V, FxBuildHasher>;
pub(crate) type IndexSet<T> = _IndexSet<T, FxBuildHasher>;
