use super::Engine;
use crate::{
    cell::{Cell, CellValue, Value},
    error::EngineError,
    types::{CellIndex, HashSet},
};
use std::{collections::VecDeque, sync::Arc};

impl Engine {
    /// Replace the value of an input cell and propagate the change.
    ///
    /// An update to the current value is a no-op: no dependent computation
    /// runs. Otherwise the cell swaps previous ← current (notifying its
    /// change listeners), the node's memo is replaced with the new value,
    /// the node's update event fires, and every transitive dependent is
    /// invalidated and re-evaluated in dependency order before the call
    /// returns.
    ///
    /// # Errors
    /// `NodeNotFound` for a removed cell, `TypeMismatch` when the cell is
    /// not an input, `Disposed` after disposal. A dependent whose
    /// computation fails surfaces the first such error; all dependents are
    /// still invalidated, so a later retry observes fresh state.
    pub async fn update_input<T: CellValue>(
        &self,
        cell: Cell<T>,
        value: T,
    ) -> Result<(), EngineError> {
        self.inner.ensure_live()?;
        let node = self.inner.node(cell.index())?;
        if !node.set_input(Value::new(value))? {
            return Ok(());
        }
        tracing::debug!(index = cell.index(), "input changed");
        self.propagate(cell.index()).await
    }

    /// Walk the transitive dependents of `start` in reverse-dependency
    /// order: invalidate each one's memo, re-evaluate it, and fire its
    /// update event. Serialized engine-wide by the refresh lock, so a
    /// concurrent propagation observes this one's invalidations.
    ///
    /// The visited set bounds each node to one re-evaluation per walk;
    /// a node reachable along several paths is processed once.
    pub(crate) async fn propagate(&self, start: CellIndex) -> Result<(), EngineError> {
        let _guard = self.inner.refresh_lock.lock().await;
        let mut queue: VecDeque<CellIndex> = VecDeque::new();
        queue.push_back(start);
        let mut visited: HashSet<CellIndex> = HashSet::default();
        let mut first_err: Option<EngineError> = None;

        while let Some(index) = queue.pop_front() {
            if !visited.insert(index) {
                continue;
            }
            if index != start {
                // Dependents removed mid-walk are simply skipped.
                let Some(node) = self
                    .inner
                    .nodes
                    .get(&index)
                    .map(|entry| Arc::clone(entry.value()))
                else {
                    continue;
                };
                node.reset_computation();
                tracing::trace!(index, "re-evaluating dependent");
                if let Err(err) = node.evaluate().await {
                    if first_err.is_none() {
                        first_err = Some(err);
                    }
                }
                node.fire_update();
            }
            if let Some(dependents) = self.inner.dependents.get(&index) {
                queue.extend(dependents.iter().copied());
            }
        }

        match first_err {
            None => Ok(()),
            Some(err) => Err(err),
        }
    }
}
