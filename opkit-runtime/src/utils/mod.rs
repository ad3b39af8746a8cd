//! Helpers for manipulating built-in streams

pub(crate) mod stream_backoff;

use crate::watcher;
use futures::{
    pin_mut,
    stream::{self, Fuse, IntoStream, Peekable},
    Future, FutureExt, Stream, StreamExt, TryStream, TryStreamExt,
};
use pin_project::pin_project;
use std::{
    fmt::Debug,
    pin::Pin,
    sync::{Arc, Mutex},
    task::{Context, Poll},
};
use tokio::{runtime::Handle, task::JoinHandle};

/// Flattens each item in the list following the rules of
/// [`watcher::Event::into_iter_applied`].
pub fn try_flatten_applied<K, S: TryStream<Ok = watcher::Event<K>>>(
    stream: S,
) -> impl Stream<Item = Result<K, S::Error>> {
    stream
        .map_ok(|event| stream::iter(event.into_iter_applied().map(Ok)))
        .try_flatten()
}

/// Flattens each item in the list following the rules of
/// [`watcher::Event::into_iter_touched`].
pub fn try_flatten_touched<K, S: TryStream<Ok = watcher::Event<K>>>(
    stream: S,
) -> impl Stream<Item = Result<K, S::Error>> {
    stream
        .map_ok(|event| stream::iter(event.into_iter_touched().map(Ok)))
        .try_flatten()
}

/// Stream extensions for the runtime
pub trait RuntimeStreamExt: Stream + Sized {
    /// Run `on_complete` after the stream has finished, before reporting completion
    fn on_complete<F: Future<Output = ()>>(self, on_complete: F) -> OnComplete<Self, F> {
        OnComplete {
            stream: self.fuse(),
            on_complete,
        }
    }
}

impl<S: Stream + Sized> RuntimeStreamExt for S {}

/// See [`RuntimeStreamExt::on_complete`]
#[pin_project]
pub struct OnComplete<S, F> {
    #[pin]
    stream: Fuse<S>,
    #[pin]
    on_complete: F,
}

impl<S: Stream, F: Future<Output = ()>> Stream for OnComplete<S, F> {
    type Item = S::Item;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();
        match this.stream.poll_next(cx) {
            Poll::Ready(None) => match this.on_complete.poll(cx) {
                Poll::Pending => Poll::Pending,
                Poll::Ready(()) => Poll::Ready(None),
            },
            x => x,
        }
    }
}

/// Allows splitting a `Stream` into several streams that each emit a disjoint
/// subset of the input stream's items, like a streaming variant of pattern
/// matching.
///
/// NOTE: The cases MUST be reunited into the same final stream (using
/// `futures::stream::select` or similar), since cases for rejected items will
/// *not* register wakeup correctly, and may otherwise lose items and/or
/// deadlock.
///
/// NOTE: The whole set of cases will deadlock if there is ever an item that no
/// live case wants to consume.
#[pin_project]
pub(crate) struct SplitCase<S: Stream, Case> {
    // Future-unaware `Mutex` is OK because it's only taken inside single poll()s
    inner: Arc<Mutex<Peekable<S>>>,
    /// Tests whether an item from the stream should be consumed
    ///
    /// NOTE: This MUST be total over all `SplitCase`s, otherwise the input
    /// stream will get stuck deadlocked because no candidate tries to consume
    /// the item.
    should_consume_item: fn(&S::Item) -> bool,
    /// Narrows the type of the consumed type, using the same precondition as
    /// `should_consume_item`.
    ///
    /// NOTE: This MUST return `Some` if `should_consume_item` returns `true`,
    /// since we can't put an item back into the input stream once consumed.
    try_extract_item_case: fn(S::Item) -> Option<Case>,
}

impl<S, Case> Stream for SplitCase<S, Case>
where
    S: Stream + Unpin,
    S::Item: Debug,
{
    type Item = Case;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();
        let mut inner = this.inner.lock().expect("split case poisoned");
        let mut inner = Pin::new(&mut *inner);
        let inner_peek = inner.as_mut().peek();
        pin_mut!(inner_peek);
        match inner_peek.poll(cx) {
            Poll::Ready(Some(x_ref)) => {
                if (this.should_consume_item)(x_ref) {
                    match inner.as_mut().poll_next(cx) {
                        Poll::Ready(Some(x)) => Poll::Ready(Some((this.try_extract_item_case)(x).expect(
                            "`try_extract_item_case` returned `None` despite `should_consume_item` returning `true`",
                        ))),
                        res => panic!(
                            "Peekable::poll_next() returned {res:?} when Peekable::peek() returned Ready(Some(_))"
                        ),
                    }
                } else {
                    // Handled by another SplitCase instead
                    Poll::Pending
                }
            }
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Splits a `TryStream` into separate `Ok` and `Error` streams.
///
/// Note: This will deadlock if one branch outlives the other
#[allow(clippy::type_complexity)]
fn trystream_split_result<S>(
    stream: S,
) -> (
    SplitCase<IntoStream<S>, S::Ok>,
    SplitCase<IntoStream<S>, S::Error>,
)
where
    S: TryStream + Unpin,
    S::Ok: Debug,
    S::Error: Debug,
{
    let stream = Arc::new(Mutex::new(stream.into_stream().peekable()));
    (
        SplitCase {
            inner: stream.clone(),
            should_consume_item: Result::is_ok,
            try_extract_item_case: Result::ok,
        },
        SplitCase {
            inner: stream,
            should_consume_item: Result::is_err,
            try_extract_item_case: Result::err,
        },
    )
}

/// Forwards Ok elements via a stream built from `make_via_stream`, while
/// passing errors through unmodified
pub(crate) fn trystream_try_via<S1, S2>(
    input_stream: S1,
    make_via_stream: impl FnOnce(SplitCase<IntoStream<S1>, S1::Ok>) -> S2,
) -> impl Stream<Item = Result<S2::Ok, S1::Error>>
where
    S1: TryStream + Unpin,
    S2: TryStream<Error = S1::Error>,
    S1::Ok: Debug,
    S1::Error: Debug,
{
    let (oks, errs) = trystream_split_result(input_stream);
    let via = make_via_stream(oks);
    stream::select(via.into_stream(), errs.map(Err))
}

/// Why a spawned task did not produce its value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinFailure {
    /// The task panicked; the payload has already been reported by tokio
    Panicked,
    /// The task was aborted before completing
    Cancelled,
}

/// A [`JoinHandle`] that cancels the task when dropped, rather than detaching
/// it, and reports panics as values instead of resuming the unwind
pub struct CancelableJoinHandle<T> {
    inner: JoinHandle<T>,
}

impl<T> CancelableJoinHandle<T>
where
    T: Send + 'static,
{
    pub fn spawn(future: impl Future<Output = T> + Send + 'static, runtime: &Handle) -> Self {
        CancelableJoinHandle {
            inner: runtime.spawn(future),
        }
    }
}

impl<T> Drop for CancelableJoinHandle<T> {
    fn drop(&mut self) {
        self.inner.abort()
    }
}

impl<T> Future for CancelableJoinHandle<T> {
    type Output = Result<T, JoinFailure>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.inner.poll_unpin(cx).map(|res| {
            res.map_err(|join_err| {
                if join_err.is_panic() {
                    JoinFailure::Panicked
                } else {
                    JoinFailure::Cancelled
                }
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{CancelableJoinHandle, JoinFailure, RuntimeStreamExt};
    use futures::{stream, StreamExt};
    use tokio::runtime::Handle;

    #[tokio::test]
    async fn on_complete_runs_after_stream_end() {
        let (tx, rx) = tokio::sync::oneshot::channel();
        let items = stream::iter([1, 2])
            .on_complete(async move {
                tx.send(()).ok();
            })
            .collect::<Vec<_>>()
            .await;
        assert_eq!(items, vec![1, 2]);
        rx.await.unwrap();
    }

    #[tokio::test]
    async fn join_handle_reports_panics_as_values() {
        let handle = CancelableJoinHandle::spawn(async { panic!("boom") }, &Handle::current());
        assert_eq!(handle.await, Err(JoinFailure::Panicked));
    }

    #[tokio::test]
    async fn join_handle_passes_values_through() {
        let handle = CancelableJoinHandle::spawn(async { 42 }, &Handle::current());
        assert_eq!(handle.await, Ok(42));
    }
}
