//! In-process reactive DAG engine.
//!
//! This crate describes a computation as a graph of typed cells: *input
//! cells* hold mutable values and *function cells* hold values derived
//! asynchronously from their dependencies. When an input changes, the
//! engine invalidates and, on demand, recomputes only the cells
//! transitively affected. It:
//! - Enforces acyclicity: every `add_function` proves the new cell closes
//!   no cycle, rolling the insertion back otherwise.
//! - Evaluates lazily with single-flight memoization: at most one
//!   computation per cell is in flight, and stable results are replayed
//!   without recomputing.
//! - Propagates input changes to transitive dependents in dependency
//!   order, serialized behind one engine-wide refresh lock.
//! - Detects reentrancy along the task chain, so a computation that
//!   reaches back into itself fails with the offending dependency path
//!   instead of deadlocking.
//!
//! Key modules:
//! - `engine`: the node table, reverse-dependency index, structural
//!   operations, propagation, and graph serialization.
//! - `cell`: typed cell handles, the opaque value box, and the per-cell
//!   change notifier with cancellable subscriptions.
//! - `stream`: a cell's values as an asynchronous sequence with
//!   freshest-value coalescing and cancellation.
//! - `builder`: a fluent facade that accumulates cells and wires each
//!   function cell to the cells created before it.
//!
//! Quick start:
//! ```
//! use celldag::{BoxError, Engine};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), celldag::EngineError> {
//! let engine = Engine::new();
//! let a = engine.add_input(6_i64)?;
//! let b = engine.add_input(4_i64)?;
//! let sum = engine.add_function(&[a, b], |values: Vec<i64>| async move {
//!     Ok::<_, BoxError>(values.iter().sum::<i64>())
//! })?;
//!
//! assert_eq!(engine.get_result(sum).await?, 10);
//! engine.update_input(b, 5).await?;
//! assert_eq!(engine.get_result(sum).await?, 11);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

/// Fluent construction facade over the engine.
pub mod builder;
/// Typed cell handles, the `CellValue` bound, the opaque `Value` box, and
/// the per-cell change notifier.
pub mod cell;
/// The reactive DAG engine: graph construction with cycle prevention,
/// lazy memoized evaluation, change propagation, removal, disposal, and
/// graph serialization.
pub mod engine;
/// The surface error taxonomy.
pub mod error;
mod node;
/// Consumer-facing asynchronous sequences of a cell's values.
pub mod stream;
/// Core type aliases used across the crate.
pub mod types;

pub use builder::GraphBuilder;
pub use cell::{AnyCell, Cell, CellKind, CellValue, Subscription, Value};
pub use engine::{Engine, EngineConfig};
pub use error::EngineError;
pub use node::NodeStatus;
pub use stream::CellStream;
pub use types::{BoxError, CellIndex};
