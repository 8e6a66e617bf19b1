use crate::{error::EngineError, types::CellIndex};
use derive_more::Debug;
use parking_lot::RwLock;
use serde::Serialize;
use std::{
    any::{type_name, Any},
    fmt,
    marker::PhantomData,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Weak,
    },
};

/// Bound every cell element type must satisfy.
///
/// Blanket-implemented; callers never implement it by hand. `PartialEq`
/// drives change detection, `Clone` lets memoized results be handed out,
/// `Serialize` lets the graph serializer render input values.
pub trait CellValue:
    Any + Clone + fmt::Debug + PartialEq + Send + Sync + Serialize + 'static
{
}

impl<T> CellValue for T where
    T: Any + Clone + fmt::Debug + PartialEq + Send + Sync + Serialize + 'static
{
}

/// Discriminates input cells (caller-supplied values) from function cells
/// (values derived from dependencies).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum CellKind {
    /// Holds a mutable caller-supplied value.
    Input,
    /// Holds a value derived asynchronously from its dependencies.
    Function,
}

/// Typed handle identifying a node in the graph.
///
/// Handles are cheap to copy and compare by index; the value type is a
/// phantom so cells of different element types are distinct at compile time.
pub struct Cell<T> {
    index: CellIndex,
    kind: CellKind,
    _marker: PhantomData<fn(T) -> T>,
}

impl<T> Cell<T> {
    pub(crate) fn new(index: CellIndex, kind: CellKind) -> Self {
        Self {
            index,
            kind,
            _marker: PhantomData,
        }
    }

    /// The engine-allocated index of this cell.
    #[must_use]
    pub fn index(&self) -> CellIndex {
        self.index
    }

    /// Whether this is an input or a function cell.
    #[must_use]
    pub fn kind(&self) -> CellKind {
        self.kind
    }
}

impl<T> Clone for Cell<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Cell<T> {}

impl<T> PartialEq for Cell<T> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index
    }
}

impl<T> Eq for Cell<T> {}

impl<T> std::hash::Hash for Cell<T> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.index.hash(state);
    }
}

impl<T> fmt::Debug for Cell<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cell")
            .field("index", &self.index)
            .field("kind", &self.kind)
            .field("value_type", &type_name::<T>())
            .finish()
    }
}

/// Type-erased cell handle, used where dependencies of mixed element types
/// meet a single API (heterogeneous functions, the construction facade).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AnyCell {
    index: CellIndex,
    kind: CellKind,
}

impl AnyCell {
    /// The engine-allocated index of this cell.
    #[must_use]
    pub fn index(&self) -> CellIndex {
        self.index
    }

    /// Whether this is an input or a function cell.
    #[must_use]
    pub fn kind(&self) -> CellKind {
        self.kind
    }
}

impl<T> From<Cell<T>> for AnyCell {
    fn from(cell: Cell<T>) -> Self {
        Self {
            index: cell.index,
            kind: cell.kind,
        }
    }
}

/// Opaque boxed cell value crossing the type-erased node boundary.
///
/// Carries the source type name so a failed [`Value::downcast`] can report
/// both sides of the mismatch.
#[derive(Clone)]
pub struct Value {
    inner: Arc<dyn Any + Send + Sync>,
    type_name: &'static str,
}

impl Value {
    /// Box a concrete value.
    pub fn new<T: CellValue>(value: T) -> Self {
        Self {
            inner: Arc::new(value),
            type_name: type_name::<T>(),
        }
    }

    /// Borrow the contained value as `T`, if that is what it holds.
    #[must_use]
    pub fn downcast_ref<T: CellValue>(&self) -> Option<&T> {
        self.inner.downcast_ref::<T>()
    }

    /// Extract a clone of the contained value as `T`.
    ///
    /// # Errors
    /// `TypeMismatch` when the value holds a different type.
    pub fn downcast<T: CellValue>(&self) -> Result<T, EngineError> {
        self.inner
            .downcast_ref::<T>()
            .cloned()
            .ok_or(EngineError::TypeMismatch {
                requested: type_name::<T>(),
                actual: self.type_name,
            })
    }

    /// Name of the type the value was boxed from.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Value({})", self.type_name)
    }
}

pub(crate) type ChangeCallback = Box<dyn Fn(&Value) + Send + Sync>;

struct ListenerEntry {
    id: u64,
    callback: ChangeCallback,
}

type ListenerRegistry = RwLock<Vec<ListenerEntry>>;

/// Multi-subscriber broadcast of value-changed events for one cell.
///
/// Listeners are invoked in registration order. A dropped [`Subscription`]
/// unregisters its listener; dropped listeners are never invoked again.
#[derive(Debug, Default)]
pub(crate) struct ChangeNotifier {
    #[debug(skip)]
    listeners: Arc<ListenerRegistry>,
    next_id: AtomicU64,
}

impl ChangeNotifier {
    pub(crate) fn subscribe(&self, callback: ChangeCallback) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners
            .write()
            .push(ListenerEntry { id, callback });
        Subscription {
            id,
            listeners: Arc::downgrade(&self.listeners),
        }
    }

    pub(crate) fn emit(&self, value: &Value) {
        let listeners = self.listeners.read();
        for entry in listeners.iter() {
            (entry.callback)(value);
        }
    }

    #[cfg(test)]
    pub(crate) fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }
}

/// Handle to a registered change listener.
///
/// Dropping (or [`cancel`](Subscription::cancel)-ing) the handle
/// unregisters the listener. Safe to drop after the cell itself is gone.
#[must_use = "dropping a subscription cancels it"]
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    #[debug(skip)]
    listeners: Weak<ListenerRegistry>,
}

impl Subscription {
    /// Unregister the listener now. Equivalent to dropping the handle.
    pub fn cancel(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(listeners) = self.listeners.upgrade() {
            listeners.write().retain(|entry| entry.id != self.id);
        }
    }
}

#[derive(Debug)]
struct Slots<T> {
    current: Option<T>,
    previous: Option<T>,
}

/// Per-node value holder: index, kind, current/previous slots, and the
/// change notifier that wires dependency edges.
#[derive(Debug)]
pub(crate) struct CellState<T> {
    index: CellIndex,
    kind: CellKind,
    slots: RwLock<Slots<T>>,
    notifier: ChangeNotifier,
}

impl<T: CellValue> CellState<T> {
    pub(crate) fn new_input(index: CellIndex, value: T) -> Self {
        Self {
            index,
            kind: CellKind::Input,
            slots: RwLock::new(Slots {
                current: Some(value.clone()),
                previous: Some(value),
            }),
            notifier: ChangeNotifier::default(),
        }
    }

    pub(crate) fn new_function(index: CellIndex) -> Self {
        Self {
            index,
            kind: CellKind::Function,
            slots: RwLock::new(Slots {
                current: None,
                previous: None,
            }),
            notifier: ChangeNotifier::default(),
        }
    }

    pub(crate) fn index(&self) -> CellIndex {
        self.index
    }

    pub(crate) fn kind(&self) -> CellKind {
        self.kind
    }

    pub(crate) fn current(&self) -> Option<T> {
        self.slots.read().current.clone()
    }

    pub(crate) fn has_changed(&self) -> bool {
        let slots = self.slots.read();
        slots.current != slots.previous
    }

    /// Store a new value if it differs from the current one by value
    /// equality; on change, swap previous ← current and emit the change
    /// event to all listeners. Returns whether a change happened.
    pub(crate) fn store(&self, new: T) -> bool {
        let changed = {
            let mut slots = self.slots.write();
            if slots.current.as_ref() == Some(&new) {
                false
            } else {
                slots.previous = slots.current.take();
                slots.current = Some(new.clone());
                true
            }
        };
        if changed {
            // Listeners run outside the slot lock: they may read the cell.
            self.notifier.emit(&Value::new(new));
        }
        changed
    }

    pub(crate) fn subscribe(&self, callback: ChangeCallback) -> Subscription {
        self.notifier.subscribe(callback)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn store_detects_change_by_value_equality() {
        let cell = CellState::new_input(0, 5_i64);
        assert!(!cell.has_changed());
        assert!(!cell.store(5));
        assert!(!cell.has_changed());
        assert!(cell.store(7));
        assert!(cell.has_changed());
        assert_eq!(cell.current(), Some(7));
    }

    #[test]
    fn listeners_fire_in_registration_order() {
        let cell = CellState::new_input(0, 0_i64);
        let order = Arc::new(RwLock::new(Vec::new()));
        let first = {
            let order = Arc::clone(&order);
            cell.subscribe(Box::new(move |_| order.write().push(1)))
        };
        let second = {
            let order = Arc::clone(&order);
            cell.subscribe(Box::new(move |_| order.write().push(2)))
        };
        cell.store(1);
        assert_eq!(*order.read(), vec![1, 2]);
        drop(first);
        drop(second);
    }

    #[test]
    fn dropped_subscription_is_not_invoked() {
        let cell = CellState::new_input(0, 0_i64);
        let calls = Arc::new(AtomicUsize::new(0));
        let sub = {
            let calls = Arc::clone(&calls);
            cell.subscribe(Box::new(move |_| {
                calls.fetch_add(1, Ordering::SeqCst);
            }))
        };
        cell.store(1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        drop(sub);
        assert_eq!(cell.notifier.listener_count(), 0);
        cell.store(2);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn value_downcast_reports_both_types() {
        let value = Value::new(1.5_f64);
        assert_eq!(value.downcast::<f64>().unwrap(), 1.5);
        let err = value.downcast::<i64>().unwrap_err();
        match err {
            EngineError::TypeMismatch { requested, actual } => {
                assert!(requested.contains("i64"));
                assert!(actual.contains("f64"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn subscription_outlives_cell() {
        let cell = CellState::new_input(0, 0_i64);
        let sub = cell.subscribe(Box::new(|_| {}));
        drop(cell);
        // Drop after the registry is gone must be a no-op.
        sub.cancel();
    }
}
