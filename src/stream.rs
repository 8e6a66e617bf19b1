use crate::{
    cell::{Cell, CellValue},
    engine::Engine,
    error::EngineError,
};
use futures::stream::{BoxStream, Stream, StreamExt};
use std::{
    fmt,
    pin::Pin,
    task::{Context, Poll},
};
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;

/// Asynchronous sequence of a cell's values.
///
/// Yields the cell's current value on subscription, then one value per
/// update event. Consumers that lag are coalesced to the freshest value;
/// duplicates of an unchanged value are possible. The first failed result
/// is yielded as an error and terminates the sequence.
#[must_use = "streams do nothing unless polled"]
pub struct CellStream<T> {
    inner: BoxStream<'static, Result<T, EngineError>>,
}

impl<T> fmt::Debug for CellStream<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CellStream({})", std::any::type_name::<T>())
    }
}

impl<T> Stream for CellStream<T> {
    type Item = Result<T, EngineError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().inner.as_mut().poll_next(cx)
    }
}

struct StreamState<T> {
    engine: Engine,
    cell: Cell<T>,
    events: tokio::sync::broadcast::Receiver<()>,
    cancel: CancellationToken,
    initial: bool,
    done: bool,
}

impl Engine {
    /// Open a stream of the cell's values. See [`CellStream`].
    ///
    /// # Errors
    /// `NodeNotFound` for a removed cell, `Disposed` after disposal.
    pub fn stream<T: CellValue>(&self, cell: Cell<T>) -> Result<CellStream<T>, EngineError> {
        self.stream_with_cancel(cell, CancellationToken::new())
    }

    /// Like [`Engine::stream`], with a caller-supplied cancellation
    /// signal: cancelling the token ends the sequence and unsubscribes
    /// from the node's update event.
    pub fn stream_with_cancel<T: CellValue>(
        &self,
        cell: Cell<T>,
        cancel: CancellationToken,
    ) -> Result<CellStream<T>, EngineError> {
        self.inner.ensure_live()?;
        // Subscribe before the initial fetch so updates racing with it are
        // not missed.
        let events = self.inner.node(cell.index())?.update_receiver();
        let state = StreamState {
            engine: self.clone(),
            cell,
            events,
            cancel,
            initial: true,
            done: false,
        };
        let inner = futures::stream::unfold(state, |mut state| async move {
            if state.done {
                return None;
            }
            if state.initial {
                state.initial = false;
                let item = state.engine.get_result(state.cell).await;
                state.done = item.is_err();
                return Some((item, state));
            }
            let event = tokio::select! {
                () = state.cancel.cancelled() => return None,
                event = state.events.recv() => event,
            };
            match event {
                // A lagged receiver skipped stale events; the fetch below
                // observes the freshest value either way.
                Ok(()) | Err(RecvError::Lagged(_)) => {}
                // The node (or the engine) is gone.
                Err(RecvError::Closed) => return None,
            }
            let item = state.engine.get_result(state.cell).await;
            state.done = item.is_err();
            Some((item, state))
        })
        .boxed();
        Ok(CellStream { inner })
    }
}
