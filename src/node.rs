use crate::{
    cell::{CellKind, CellState, CellValue, ChangeCallback, Subscription, Value},
    error::EngineError,
    types::{CellIndex, IndexMap, IndexSet},
};
use derive_more::Debug;
use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use std::sync::{
    atomic::{AtomicU8, AtomicUsize, Ordering},
    Arc, Weak,
};
use tokio::sync::{broadcast, OnceCell};

/// Lifecycle state of a node's computation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeStatus {
    /// No computation has run since creation or the last reset.
    Idle,
    /// A computation is currently in flight.
    Processing,
    /// The last computation completed and its result is memoized.
    Completed,
    /// The last computation failed; the error is memoized.
    Failed,
}

struct AtomicStatus(AtomicU8);

impl AtomicStatus {
    const IDLE: u8 = 0;
    const PROCESSING: u8 = 1;
    const COMPLETED: u8 = 2;
    const FAILED: u8 = 3;

    fn new(status: NodeStatus) -> Self {
        let this = Self(AtomicU8::new(Self::IDLE));
        this.store(status);
        this
    }

    fn store(&self, status: NodeStatus) {
        let raw = match status {
            NodeStatus::Idle => Self::IDLE,
            NodeStatus::Processing => Self::PROCESSING,
            NodeStatus::Completed => Self::COMPLETED,
            NodeStatus::Failed => Self::FAILED,
        };
        self.0.store(raw, Ordering::Release);
    }

    fn load(&self) -> NodeStatus {
        match self.0.load(Ordering::Acquire) {
            Self::PROCESSING => NodeStatus::Processing,
            Self::COMPLETED => NodeStatus::Completed,
            Self::FAILED => NodeStatus::Failed,
            _ => NodeStatus::Idle,
        }
    }
}

impl std::fmt::Debug for AtomicStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self.load())
    }
}

tokio::task_local! {
    /// Cell indices whose computations are in flight on the current task
    /// chain, outermost first. Pushed for the duration of each compute so
    /// reentry anywhere along the chain is detected.
    static COMPUTE_CHAIN: Vec<CellIndex>;
}

pub(crate) fn compute_chain() -> Vec<CellIndex> {
    COMPUTE_CHAIN.try_with(Clone::clone).unwrap_or_default()
}

pub(crate) fn chain_contains(index: CellIndex) -> bool {
    COMPUTE_CHAIN
        .try_with(|chain| chain.contains(&index))
        .unwrap_or(false)
}

pub(crate) fn reentrancy_error(chain: &[CellIndex], repeated: CellIndex) -> EngineError {
    let mut rendered: Vec<String> = chain.iter().map(ToString::to_string).collect();
    rendered.push(repeated.to_string());
    EngineError::ReentrancyDetected {
        chain: rendered.join(" -> "),
    }
}

/// Closure producing one computation of the node's value.
pub(crate) type ComputeFn<T> =
    Arc<dyn Fn() -> BoxFuture<'static, Result<T, EngineError>> + Send + Sync>;

enum Compute<T> {
    /// Input nodes replay the cell's current value.
    Input,
    Function(ComputeFn<T>),
}

impl<T> std::fmt::Debug for Compute<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Input => f.write_str("Input"),
            Self::Function(_) => f.write_str("Function"),
        }
    }
}

type Memo<T> = Arc<OnceCell<Result<T, EngineError>>>;

/// Per-cell execution unit.
///
/// Owns the cell state, the dependency set, the compute closure, the lazy
/// single-flight memo, the per-dependency change subscriptions, and the
/// update event external streams consume.
#[derive(Debug)]
pub(crate) struct Node<T: CellValue> {
    cell: CellState<T>,
    dependencies: RwLock<IndexSet<CellIndex>>,
    compute: Compute<T>,
    #[debug(skip)]
    memo: Mutex<Memo<T>>,
    status: AtomicStatus,
    #[debug(skip)]
    update_tx: broadcast::Sender<()>,
    #[debug(skip)]
    dep_subs: Mutex<IndexMap<CellIndex, Subscription>>,
    /// Dependency updates not yet consumed by the background worker. The
    /// 0→1 transition spawns the single worker for this node.
    pending: AtomicUsize,
    /// Serializes this node's evaluation. Lock order always follows
    /// dependency edges, which are acyclic.
    compute_lock: tokio::sync::Mutex<()>,
}

impl<T: CellValue> Node<T> {
    pub(crate) fn new_input(index: CellIndex, value: T, event_capacity: usize) -> Self {
        let (update_tx, _) = broadcast::channel(event_capacity);
        Self {
            cell: CellState::new_input(index, value),
            dependencies: RwLock::new(IndexSet::default()),
            compute: Compute::Input,
            memo: Mutex::new(Arc::new(OnceCell::new())),
            status: AtomicStatus::new(NodeStatus::Idle),
            update_tx,
            dep_subs: Mutex::new(IndexMap::default()),
            pending: AtomicUsize::new(0),
            compute_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub(crate) fn new_function(
        index: CellIndex,
        compute: ComputeFn<T>,
        event_capacity: usize,
    ) -> Self {
        let (update_tx, _) = broadcast::channel(event_capacity);
        Self {
            cell: CellState::new_function(index),
            dependencies: RwLock::new(IndexSet::default()),
            compute: Compute::Function(compute),
            memo: Mutex::new(Arc::new(OnceCell::new())),
            status: AtomicStatus::new(NodeStatus::Idle),
            update_tx,
            dep_subs: Mutex::new(IndexMap::default()),
            pending: AtomicUsize::new(0),
            compute_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Run one computation of this node's value.
    ///
    /// Pushes the node onto the task-chain for the duration of the user
    /// function, records status transitions, stores the new cached value on
    /// the cell (firing the change notifier on a different value), and fires
    /// the update event on change.
    async fn run_compute(&self) -> Result<T, EngineError> {
        let index = self.cell.index();
        let chain = compute_chain();
        if chain.contains(&index) {
            self.status.store(NodeStatus::Failed);
            return Err(reentrancy_error(&chain, index));
        }
        self.status.store(NodeStatus::Processing);
        tracing::trace!(index, "computing cell");
        let mut scoped = chain;
        scoped.push(index);
        let result = COMPUTE_CHAIN
            .scope(scoped, async {
                match &self.compute {
                    Compute::Input => self.cell.current().ok_or_else(|| {
                        EngineError::compute_failed("input cell has no stored value")
                    }),
                    Compute::Function(f) => f().await,
                }
            })
            .await;
        match &result {
            Ok(value) => {
                self.status.store(NodeStatus::Completed);
                if self.cell.store(value.clone()) {
                    let _ = self.update_tx.send(());
                }
            }
            Err(err) => {
                self.status.store(NodeStatus::Failed);
                tracing::trace!(index, error = %err, "compute failed");
            }
        }
        result
    }

    /// Force the memo: the first force per reset runs [`run_compute`]
    /// exactly once; concurrent and subsequent forces share its result.
    async fn force(&self) -> Result<T, EngineError> {
        let memo = self.memo.lock().clone();
        memo.get_or_init(|| self.run_compute()).await.clone()
    }

    async fn evaluate_locked(&self) -> Result<T, EngineError> {
        let _guard = self.compute_lock.lock().await;
        self.force().await
    }
}

/// Capability surface the engine's homogeneous node table requires of every
/// typed node.
pub(crate) trait AnyNode: Send + Sync + 'static {
    fn index(&self) -> CellIndex;
    fn kind(&self) -> CellKind;
    fn status(&self) -> NodeStatus;
    fn has_changed(&self) -> bool;
    fn dependencies(&self) -> Vec<CellIndex>;
    /// JSON rendering of the current value, if any.
    fn value_json(&self) -> Option<serde_json::Value>;

    /// Serialized evaluation: acquires the compute lock, then forces the
    /// memo.
    fn evaluate(&self) -> BoxFuture<'_, Result<Value, EngineError>>;
    /// Clear the memo so the next evaluation re-runs the computation.
    fn reset_computation(&self);
    /// Replace an input node's value: no-op on equal values, otherwise swap
    /// the slots, pre-resolve the memo with the new value, and fire the
    /// update event. Returns whether a change happened.
    fn set_input(&self, value: Value) -> Result<bool, EngineError>;

    fn subscribe_cell(&self, callback: ChangeCallback) -> Subscription;
    fn update_receiver(&self) -> broadcast::Receiver<()>;
    fn fire_update(&self);
    /// Record one pending dependency update; the 0→1 transition spawns the
    /// node's single background worker, which re-evaluates until the
    /// counter drains. Bursts coalesce; no update is lost.
    fn schedule_recompute(self: Arc<Self>);

    fn add_dependency(&self, dep: CellIndex);
    fn remove_dependency(&self, dep: CellIndex);
    fn store_dep_sub(&self, dep: CellIndex, sub: Subscription);
    fn dispose_subscriptions(&self);
}

impl<T: CellValue> AnyNode for Node<T> {
    fn index(&self) -> CellIndex {
        self.cell.index()
    }

    fn kind(&self) -> CellKind {
        self.cell.kind()
    }

    fn status(&self) -> NodeStatus {
        self.status.load()
    }

    fn has_changed(&self) -> bool {
        self.cell.has_changed()
    }

    fn dependencies(&self) -> Vec<CellIndex> {
        self.dependencies.read().iter().copied().collect()
    }

    fn value_json(&self) -> Option<serde_json::Value> {
        let value = self.cell.current()?;
        serde_json::to_value(&value).ok()
    }

    fn evaluate(&self) -> BoxFuture<'_, Result<Value, EngineError>> {
        Box::pin(async move { self.evaluate_locked().await.map(Value::new) })
    }

    fn reset_computation(&self) {
        *self.memo.lock() = Arc::new(OnceCell::new());
        self.status.store(NodeStatus::Idle);
    }

    fn set_input(&self, value: Value) -> Result<bool, EngineError> {
        if self.cell.kind() != CellKind::Input {
            return Err(EngineError::TypeMismatch {
                requested: "input cell",
                actual: "function cell",
            });
        }
        let value = value.downcast::<T>()?;
        if self.cell.current().as_ref() == Some(&value) {
            return Ok(false);
        }
        self.cell.store(value.clone());
        *self.memo.lock() = Arc::new(OnceCell::new_with(Some(Ok(value))));
        self.status.store(NodeStatus::Completed);
        let _ = self.update_tx.send(());
        Ok(true)
    }

    fn subscribe_cell(&self, callback: ChangeCallback) -> Subscription {
        self.cell.subscribe(callback)
    }

    fn update_receiver(&self) -> broadcast::Receiver<()> {
        self.update_tx.subscribe()
    }

    fn fire_update(&self) {
        let _ = self.update_tx.send(());
    }

    fn schedule_recompute(self: Arc<Self>) {
        if self.pending.fetch_add(1, Ordering::AcqRel) > 0 {
            // A worker is already draining the counter and will observe
            // this update before it exits.
            return;
        }
        let weak = Arc::downgrade(&self);
        drop(self);
        tokio::spawn(async move {
            loop {
                let Some(node) = weak.upgrade() else { break };
                // The memo still holds the pre-change result; swap it out
                // so the evaluation below re-runs the computation against
                // the changed dependency. Failures land in the node
                // status; the worker never panics the process.
                node.reset_computation();
                let _ = node.evaluate_locked().await;
                if node.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
                    break;
                }
            }
        });
    }

    fn add_dependency(&self, dep: CellIndex) {
        self.dependencies.write().insert(dep);
    }

    fn remove_dependency(&self, dep: CellIndex) {
        self.dependencies.write().shift_remove(&dep);
        self.dep_subs.lock().shift_remove(&dep);
    }

    fn store_dep_sub(&self, dep: CellIndex, sub: Subscription) {
        let mut subs = self.dep_subs.lock();
        // An existing subscription for this dependency is dropped first.
        subs.shift_remove(&dep);
        subs.insert(dep, sub);
    }

    fn dispose_subscriptions(&self) {
        self.dep_subs.lock().clear();
    }
}

pub(crate) fn recompute_callback(node: &Arc<dyn AnyNode>) -> ChangeCallback {
    let weak: Weak<dyn AnyNode> = Arc::downgrade(node);
    Box::new(move |_value| {
        if let Some(node) = weak.upgrade() {
            node.schedule_recompute();
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reentrancy_error_renders_the_chain() {
        let err = reentrancy_error(&[3, 5], 3);
        match err {
            EngineError::ReentrancyDetected { chain } => assert_eq!(chain, "3 -> 5 -> 3"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn memo_is_single_flight_until_reset() {
        let node = Node::new_input(0, 41_i64, 1);
        assert_eq!(node.evaluate_locked().await.unwrap(), 41);
        assert_eq!(node.status(), NodeStatus::Completed);
        // A second force replays the memo without recomputing.
        assert_eq!(node.evaluate_locked().await.unwrap(), 41);
        node.reset_computation();
        assert_eq!(node.status(), NodeStatus::Idle);
        assert_eq!(node.evaluate_locked().await.unwrap(), 41);
    }

    #[tokio::test]
    async fn set_input_is_a_noop_on_equal_value() {
        let node = Node::new_input(0, 7_i64, 1);
        let mut events = node.update_receiver();
        assert!(!node.set_input(Value::new(7_i64)).unwrap());
        assert!(events.try_recv().is_err());
        assert!(node.set_input(Value::new(8_i64)).unwrap());
        assert!(events.try_recv().is_ok());
        assert_eq!(node.evaluate_locked().await.unwrap(), 8);
    }
}
