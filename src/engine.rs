mod propagate;
mod serialize;

use crate::{
    cell::{AnyCell, Cell, CellKind, CellValue, Subscription, Value},
    error::EngineError,
    node::{chain_contains, compute_chain, recompute_callback, reentrancy_error, AnyNode,
        ComputeFn, Node, NodeStatus},
    types::{BoxError, CellIndex, HashSet, IndexSet},
};
use dashmap::DashMap;
use derive_more::Debug;
use futures::future::try_join_all;
use rustc_hash::FxBuildHasher;
use std::{
    future::Future,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Weak,
    },
};
use tokio::sync::broadcast;

type NodeMap = DashMap<CellIndex, Arc<dyn AnyNode>, FxBuildHasher>;
type DependentsMap = DashMap<CellIndex, IndexSet<CellIndex>, FxBuildHasher>;

/// Construction-time knobs for an [`Engine`].
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Capacity of each node's update-event channel. The default of 1 makes
    /// every consumer observe the freshest update: older pending events are
    /// superseded rather than queued.
    pub event_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self { event_capacity: 1 }
    }
}

/// Reactive DAG engine.
///
/// Owns the node table and the reverse-dependency index; issues cell
/// indices; enforces acyclicity; orchestrates updates and refreshes.
/// Cheap to clone; all clones share one graph. Safe to use from multiple
/// tasks concurrently.
///
/// Key responsibilities:
/// - Validates dependencies (`UnknownDependency`, `SelfDependency`) and
///   proves acyclicity on every `add_function`, rolling back on failure.
/// - Maintains `dependencies` and the dependents index in lockstep so the
///   reverse view is always the exact dual of the forward edges.
/// - Serializes overlapping propagations behind one engine-wide refresh
///   lock; serializes each node's own computation behind its compute lock.
#[must_use]
#[derive(Debug, Clone)]
pub struct Engine {
    pub(crate) inner: Arc<EngineInner>,
}

#[derive(Debug)]
pub(crate) struct EngineInner {
    #[debug(skip)]
    pub(crate) nodes: NodeMap,
    /// Reverse view of the per-node dependency sets: `dependents[d]`
    /// contains `n` iff node `n` depends on `d`. Never authoritative for
    /// forward edges.
    pub(crate) dependents: DependentsMap,
    pub(crate) next_index: AtomicU64,
    pub(crate) refresh_lock: tokio::sync::Mutex<()>,
    disposed: AtomicBool,
    config: EngineConfig,
}

impl EngineInner {
    pub(crate) fn ensure_live(&self) -> Result<(), EngineError> {
        if self.disposed.load(Ordering::Acquire) {
            Err(EngineError::Disposed)
        } else {
            Ok(())
        }
    }

    pub(crate) fn node(&self, index: CellIndex) -> Result<Arc<dyn AnyNode>, EngineError> {
        self.nodes
            .get(&index)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(EngineError::NodeNotFound { index })
    }

    fn allocate_index(&self) -> CellIndex {
        self.next_index.fetch_add(1, Ordering::Relaxed)
    }

    /// Resolve and force every dependency concurrently, in declaration
    /// order. A dependency already on the current task chain is a cycle
    /// that slipped past construction-time checks; fail it here instead of
    /// recursing forever.
    async fn dependency_values(&self, deps: &[CellIndex]) -> Result<Vec<Value>, EngineError> {
        let mut nodes = Vec::with_capacity(deps.len());
        for &dep in deps {
            if chain_contains(dep) {
                return Err(reentrancy_error(&compute_chain(), dep));
            }
            let node = self.nodes.get(&dep).map(|entry| Arc::clone(entry.value()));
            let node = node.ok_or_else(|| {
                EngineError::compute_failed(EngineError::NodeNotFound { index: dep })
            })?;
            nodes.push(node);
        }
        try_join_all(nodes.iter().map(|node| node.evaluate())).await
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine {
    /// Construct an engine with the default configuration.
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    /// Construct an engine with an explicit configuration.
    pub fn with_config(config: EngineConfig) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                nodes: NodeMap::with_hasher(FxBuildHasher),
                dependents: DependentsMap::with_hasher(FxBuildHasher),
                next_index: AtomicU64::new(0),
                refresh_lock: tokio::sync::Mutex::new(()),
                disposed: AtomicBool::new(false),
                config,
            }),
        }
    }

    /// Create an input cell holding `value`.
    ///
    /// Input cells are leaves: no dependencies, no cycle check.
    ///
    /// # Errors
    /// `Disposed` after [`Engine::dispose`].
    pub fn add_input<T: CellValue>(&self, value: T) -> Result<Cell<T>, EngineError> {
        self.inner.ensure_live()?;
        let index = self.inner.allocate_index();
        let node: Arc<dyn AnyNode> = Arc::new(Node::new_input(
            index,
            value,
            self.inner.config.event_capacity,
        ));
        self.inner.nodes.insert(index, node);
        tracing::debug!(index, "added input cell");
        Ok(Cell::new(index, CellKind::Input))
    }

    /// Create a function cell computing `f` over the values of `deps`.
    ///
    /// The computation awaits every dependency concurrently, passes the
    /// resolved values to `f` in declaration order, and memoizes the
    /// outcome (including failure) until the next invalidation.
    ///
    /// # Errors
    /// `UnknownDependency` when a dependency has no node,
    /// `SelfDependency`/`CycleDetected` when the new cell would break
    /// acyclicity (the insertion is rolled back), `Disposed` after
    /// disposal.
    pub fn add_function<D, T, F, Fut>(
        &self,
        deps: &[Cell<D>],
        f: F,
    ) -> Result<Cell<T>, EngineError>
    where
        D: CellValue,
        T: CellValue,
        F: Fn(Vec<D>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, BoxError>> + Send + 'static,
    {
        self.inner.ensure_live()?;
        let index = self.inner.allocate_index();
        let dep_indices: Vec<CellIndex> = deps.iter().map(|cell| cell.index()).collect();
        let weak = Arc::downgrade(&self.inner);
        let f = Arc::new(f);
        let closure_deps = dep_indices.clone();
        let compute: ComputeFn<T> = Arc::new(move || {
            let weak = Weak::clone(&weak);
            let dep_indices = closure_deps.clone();
            let f = Arc::clone(&f);
            Box::pin(async move {
                let inner = weak.upgrade().ok_or(EngineError::Disposed)?;
                let values = inner.dependency_values(&dep_indices).await?;
                let mut inputs = Vec::with_capacity(values.len());
                for value in &values {
                    inputs.push(value.downcast::<D>()?);
                }
                f(inputs).await.map_err(EngineError::compute_failed)
            })
        });
        self.insert_function(index, dep_indices, compute)
    }

    /// Like [`Engine::add_function`], but dependency value types may be
    /// mixed: `f` receives the resolved values as opaque [`Value`]s in
    /// declaration order.
    pub fn add_function_any<T, F, Fut>(
        &self,
        deps: &[AnyCell],
        f: F,
    ) -> Result<Cell<T>, EngineError>
    where
        T: CellValue,
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, BoxError>> + Send + 'static,
    {
        self.inner.ensure_live()?;
        let index = self.inner.allocate_index();
        let dep_indices: Vec<CellIndex> = deps.iter().map(AnyCell::index).collect();
        let weak = Arc::downgrade(&self.inner);
        let f = Arc::new(f);
        let closure_deps = dep_indices.clone();
        let compute: ComputeFn<T> = Arc::new(move || {
            let weak = Weak::clone(&weak);
            let dep_indices = closure_deps.clone();
            let f = Arc::clone(&f);
            Box::pin(async move {
                let inner = weak.upgrade().ok_or(EngineError::Disposed)?;
                let values = inner.dependency_values(&dep_indices).await?;
                f(values).await.map_err(EngineError::compute_failed)
            })
        });
        self.insert_function(index, dep_indices, compute)
    }

    /// Shared wiring behind both `add_function` variants:
    /// validate, insert, add forward and reverse edges, connect dependency
    /// subscriptions, then prove acyclicity, rolling everything back if
    /// the proof fails.
    fn insert_function<T: CellValue>(
        &self,
        index: CellIndex,
        dep_indices: Vec<CellIndex>,
        compute: ComputeFn<T>,
    ) -> Result<Cell<T>, EngineError> {
        if dep_indices.contains(&index) {
            return Err(EngineError::SelfDependency { index });
        }
        for &dep in &dep_indices {
            if !self.inner.nodes.contains_key(&dep) {
                return Err(EngineError::UnknownDependency { index: dep });
            }
        }

        let node: Arc<dyn AnyNode> = Arc::new(Node::new_function(
            index,
            compute,
            self.inner.config.event_capacity,
        ));
        self.inner.nodes.insert(index, Arc::clone(&node));

        // Duplicate dependencies collapse to one edge and one subscription;
        // the compute closure still receives one value per declared slot.
        let mut unique: IndexSet<CellIndex> = IndexSet::default();
        unique.extend(dep_indices.iter().copied());
        for &dep in &unique {
            node.add_dependency(dep);
            self.inner.dependents.entry(dep).or_default().insert(index);
        }

        if let Err(err) = self.connect_dependencies(&node, &unique) {
            self.rollback_insert(index, &unique, &node);
            return Err(err);
        }

        // The only freshly introduced edges start at `index`, so a cycle
        // can only appear as an already-present path from a dependency back
        // to `index`.
        for &dep in &unique {
            if self.is_cyclic_index(dep, index) {
                self.rollback_insert(index, &unique, &node);
                return Err(EngineError::CycleDetected { through: dep });
            }
        }

        tracing::debug!(index, dependencies = ?unique, "added function cell");
        Ok(Cell::new(index, CellKind::Function))
    }

    /// Subscribe the node to each dependency's change notifier. The
    /// callback schedules a background recomputation; it never enters the
    /// computation synchronously.
    fn connect_dependencies(
        &self,
        node: &Arc<dyn AnyNode>,
        deps: &IndexSet<CellIndex>,
    ) -> Result<(), EngineError> {
        for &dep in deps {
            let dep_node = self.inner.node(dep)?;
            let sub = dep_node.subscribe_cell(recompute_callback(node));
            node.store_dep_sub(dep, sub);
        }
        Ok(())
    }

    fn rollback_insert(
        &self,
        index: CellIndex,
        deps: &IndexSet<CellIndex>,
        node: &Arc<dyn AnyNode>,
    ) {
        node.dispose_subscriptions();
        self.inner.nodes.remove(&index);
        for &dep in deps {
            if let Some(mut dependents) = self.inner.dependents.get_mut(&dep) {
                dependents.shift_remove(&index);
            }
        }
    }

    /// Force the cell's memoized computation and return its value.
    ///
    /// Successive successful calls never observe an older result than an
    /// earlier call against the same or later input state.
    ///
    /// # Errors
    /// `NodeNotFound` for a removed cell, `ReentrancyDetected` when called
    /// from within the same cell's computation, `ComputeFailed` when the
    /// memoized computation failed, `Disposed` after disposal.
    pub async fn get_result<T: CellValue>(&self, cell: Cell<T>) -> Result<T, EngineError> {
        self.inner.ensure_live()?;
        let index = cell.index();
        if chain_contains(index) {
            return Err(reentrancy_error(&compute_chain(), index));
        }
        let node = self.inner.node(index)?;
        let value = node.evaluate().await?;
        value.downcast::<T>()
    }

    /// Whether the cell's current value differs from its previous one.
    pub fn has_changed<T: CellValue>(&self, cell: Cell<T>) -> Result<bool, EngineError> {
        self.inner.ensure_live()?;
        Ok(self.inner.node(cell.index())?.has_changed())
    }

    /// Lifecycle state of the cell's node. Background recompute workers
    /// surface their failures here.
    pub fn status<T: CellValue>(&self, cell: Cell<T>) -> Result<NodeStatus, EngineError> {
        self.inner.ensure_live()?;
        Ok(self.inner.node(cell.index())?.status())
    }

    /// Register `callback` on the cell's change notifier. It runs on every
    /// value change, in registration order, until the returned handle is
    /// dropped.
    ///
    /// The callback must not reentrantly update the same cell.
    pub fn subscribe<T: CellValue>(
        &self,
        cell: Cell<T>,
        callback: impl Fn(&Value) + Send + Sync + 'static,
    ) -> Result<Subscription, EngineError> {
        self.inner.ensure_live()?;
        Ok(self.inner.node(cell.index())?.subscribe_cell(Box::new(callback)))
    }

    /// Subscribe to the node's update event. An event fires after the
    /// node's cached value changes and after every re-evaluation during
    /// propagation; receivers that lag skip to the freshest event.
    pub fn update_events<T: CellValue>(
        &self,
        cell: Cell<T>,
    ) -> Result<broadcast::Receiver<()>, EngineError> {
        self.inner.ensure_live()?;
        Ok(self.inner.node(cell.index())?.update_receiver())
    }

    /// Remove the cell's node from the graph.
    ///
    /// Tears down the node's dependency subscriptions, detaches every
    /// dependent from the removed index, drops all edges touching it, and
    /// invalidates the former dependents so their next evaluation observes
    /// the missing dependency. Dependents are NOT removed: they remain as
    /// degenerate nodes that fail to compute.
    pub fn remove_node<T: CellValue>(&self, cell: Cell<T>) -> Result<(), EngineError> {
        self.inner.ensure_live()?;
        let index = cell.index();
        let (_, node) = self
            .inner
            .nodes
            .remove(&index)
            .ok_or(EngineError::NodeNotFound { index })?;
        node.dispose_subscriptions();

        let dependents: Vec<CellIndex> = self
            .inner
            .dependents
            .remove(&index)
            .map(|(_, set)| set.into_iter().collect())
            .unwrap_or_default();
        for &dependent in &dependents {
            if let Some(entry) = self.inner.nodes.get(&dependent) {
                entry.value().remove_dependency(index);
            }
        }
        for dep in node.dependencies() {
            if let Some(mut set) = self.inner.dependents.get_mut(&dep) {
                set.shift_remove(&index);
            }
        }
        for &dependent in &dependents {
            let entry = self.inner.nodes.get(&dependent).map(|e| Arc::clone(e.value()));
            if let Some(former) = entry {
                former.reset_computation();
            }
        }
        tracing::debug!(index, "removed cell");
        Ok(())
    }

    /// Whether `to` is reachable from `from` along dependency edges.
    ///
    /// A depth-first search over outgoing `dependencies`; the visited set
    /// keeps it terminating even on an already-corrupt graph.
    #[must_use]
    pub fn is_cyclic(&self, from: AnyCell, to: AnyCell) -> bool {
        self.is_cyclic_index(from.index(), to.index())
    }

    pub(crate) fn is_cyclic_index(&self, from: CellIndex, to: CellIndex) -> bool {
        let mut stack = vec![from];
        let mut visited: HashSet<CellIndex> = HashSet::default();
        while let Some(index) = stack.pop() {
            if index == to {
                return true;
            }
            if !visited.insert(index) {
                continue;
            }
            if let Some(entry) = self.inner.nodes.get(&index) {
                stack.extend(entry.value().dependencies());
            }
        }
        false
    }

    /// Dispose the engine. Every subsequent operation fails with
    /// `Disposed`. Tears down all dependency subscriptions and clears the
    /// node table and the dependents index, draining under the refresh
    /// lock so no propagation walk is in flight.
    pub async fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _guard = self.inner.refresh_lock.lock().await;
        for entry in self.inner.nodes.iter() {
            entry.value().dispose_subscriptions();
        }
        self.inner.nodes.clear();
        self.inner.dependents.clear();
        tracing::debug!("engine disposed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BoxError;
    use std::sync::atomic::AtomicUsize;
    use tokio::time::{sleep, Duration, Instant};

    fn plus_one(values: Vec<i64>) -> impl Future<Output = Result<i64, BoxError>> {
        async move { Ok(values[0] + 1) }
    }

    #[tokio::test]
    async fn add_function_rejects_unknown_dependency() {
        let engine = Engine::new();
        let a = engine.add_input(1_i64).unwrap();
        engine.remove_node(a).unwrap();
        let err = engine.add_function(&[a], plus_one).unwrap_err();
        assert!(
            matches!(err, EngineError::UnknownDependency { index } if index == a.index())
        );
        assert!(engine.inner.nodes.is_empty());
    }

    #[tokio::test]
    async fn cycle_detection_rolls_back_the_insertion() {
        let engine = Engine::new();
        let x = engine.add_input(1_i64).unwrap();
        let y = engine.add_function(&[x], plus_one).unwrap();

        // Corrupt the graph so `y` already depends on the index the next
        // function cell will receive: the post-insertion check must find
        // the path new -> y -> new and roll back.
        let next = engine.inner.next_index.load(Ordering::Relaxed);
        engine.inner.node(y.index()).unwrap().add_dependency(next);
        engine
            .inner
            .dependents
            .entry(next)
            .or_default()
            .insert(y.index());

        let err = engine.add_function(&[y], plus_one).unwrap_err();
        assert!(matches!(err, EngineError::CycleDetected { through } if through == y.index()));

        // No partial insertion: the node is gone and `y` has no new
        // dependent recorded.
        assert!(!engine.inner.nodes.contains_key(&next));
        let y_dependents = engine.inner.dependents.get(&y.index()).unwrap();
        assert!(!y_dependents.contains(&next));
    }

    #[tokio::test]
    async fn removal_clears_both_edge_directions() {
        let engine = Engine::new();
        let a = engine.add_input(1_i64).unwrap();
        let b = engine.add_input(2_i64).unwrap();
        let s = engine
            .add_function(&[a, b], |v: Vec<i64>| async move {
                Ok::<_, BoxError>(v.iter().sum::<i64>())
            })
            .unwrap();

        engine.remove_node(a).unwrap();
        assert!(engine.inner.dependents.get(&a.index()).is_none());
        let s_node = engine.inner.node(s.index()).unwrap();
        assert!(!s_node.dependencies().contains(&a.index()));
        // The edge from the surviving dependency is intact.
        assert!(engine
            .inner
            .dependents
            .get(&b.index())
            .unwrap()
            .contains(&s.index()));
    }

    #[tokio::test]
    async fn dependency_change_notification_drives_background_recompute() {
        let engine = Engine::new();
        let a = engine.add_input(1_i64).unwrap();
        let computes = Arc::new(AtomicUsize::new(0));
        let s = {
            let computes = Arc::clone(&computes);
            engine
                .add_function(&[a], move |v: Vec<i64>| {
                    let computes = Arc::clone(&computes);
                    async move {
                        computes.fetch_add(1, Ordering::SeqCst);
                        Ok::<_, BoxError>(v[0] * 10)
                    }
                })
                .unwrap()
        };
        assert_eq!(engine.get_result(s).await.unwrap(), 10);
        assert_eq!(computes.load(Ordering::SeqCst), 1);

        // Replace the input's value through the node alone: the per-cell
        // change notifier fires, but no propagation walk runs. Only the
        // counter-gated background worker can refresh `s`.
        engine
            .inner
            .node(a.index())
            .unwrap()
            .set_input(Value::new(7_i64))
            .unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while engine.get_result(s).await.unwrap() != 70 {
            assert!(
                Instant::now() < deadline,
                "background recompute never observed the change"
            );
            sleep(Duration::from_millis(10)).await;
        }
        assert!(computes.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn is_cyclic_is_false_on_every_node_of_a_valid_graph() {
        let engine = Engine::new();
        let a = engine.add_input(1_i64).unwrap();
        let b = engine.add_function(&[a], plus_one).unwrap();
        let c = engine.add_function(&[a, b], |v: Vec<i64>| async move {
            Ok::<_, BoxError>(v.iter().sum::<i64>())
        })
        .unwrap();
        for cell in [AnyCell::from(a), b.into(), c.into()] {
            assert!(!engine.is_cyclic(cell, cell));
        }
        assert!(engine.is_cyclic(c.into(), a.into()));
        assert!(!engine.is_cyclic(a.into(), c.into()));
    }
}
