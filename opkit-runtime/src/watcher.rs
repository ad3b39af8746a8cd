//! Watches a resource kind for changes, with error recovery
//!
//! The watch loop is never blocked by slow consumers; backpressure is
//! absorbed downstream by the event queue.

use crate::utils::stream_backoff::StreamBackoff;
use backoff::{backoff::Backoff, ExponentialBackoff};
use futures::{stream, Stream, StreamExt};
use opkit_core::{
    client::{ApiClient, ClientError, WatchStream},
    error::ErrorResponse,
    params::ListParams,
    resource::{Resource, ResourceExt},
    watch::WatchEvent,
    GroupVersionResource,
};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use std::{sync::Arc, time::Duration};
use thiserror::Error;
use tokio::time::Instant;

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to perform initial object list: {0}")]
    InitialListFailed(#[source] ClientError),
    #[error("failed to start watching object: {0}")]
    WatchStartFailed(#[source] ClientError),
    #[error("error returned by apiserver during watch: {0}")]
    WatchError(#[source] ErrorResponse),
    #[error("watch stream failed: {0}")]
    WatchFailed(#[source] ClientError),
    #[error("failed to decode watch frame: {0}")]
    DecodeFailed(#[source] serde_json::Error),
}
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Watch events returned from the [`watcher`]
#[derive(Debug, Clone)]
pub enum Event<K> {
    /// An object was added or modified
    Applied(K),
    /// An object was deleted
    ///
    /// NOTE: This should not be used for managing persistent state elsewhere,
    /// since events may be lost if the watcher is unavailable. Use finalizers
    /// instead.
    Deleted(K),
    /// The watch stream was restarted (or initially started), so `Deleted`
    /// events may have been missed
    ///
    /// Should be used as a signal to replace the store contents atomically;
    /// every listed item is a synthetic `Applied`.
    Restarted(Vec<K>),
}

impl<K> Event<K> {
    /// Flattens out all objects that were added or modified in the event.
    ///
    /// `Deleted` objects are ignored, all objects mentioned by `Restarted`
    /// events are emitted individually.
    pub fn into_iter_applied(self) -> impl Iterator<Item = K> {
        match self {
            Event::Applied(obj) => vec![obj],
            Event::Deleted(_) => vec![],
            Event::Restarted(objs) => objs,
        }
        .into_iter()
    }

    /// Flattens out all objects that were added, modified, or deleted in the
    /// event.
    ///
    /// Note that `Deleted` events may be missed when restarting the stream.
    /// Use finalizers or owner references instead if you care about cleaning
    /// up external resources after deleted objects.
    pub fn into_iter_touched(self) -> impl Iterator<Item = K> {
        match self {
            Event::Applied(obj) | Event::Deleted(obj) => vec![obj],
            Event::Restarted(objs) => objs,
        }
        .into_iter()
    }
}

/// Liveness bookkeeping shared between a watcher and the manager's probes
#[derive(Debug, Default)]
pub struct WatchHealth {
    disconnected_since: RwLock<Option<Instant>>,
}

impl WatchHealth {
    /// How long the watch has been disconnected, if it currently is
    pub fn disconnected_for(&self) -> Option<Duration> {
        self.disconnected_since.read().map(|t| t.elapsed())
    }

    fn mark_connected(&self) {
        *self.disconnected_since.write() = None;
    }

    fn mark_disconnected(&self) {
        let mut since = self.disconnected_since.write();
        if since.is_none() {
            *since = Some(Instant::now());
        }
    }
}

/// The internal finite state machine driving the [`watcher`]
enum State<K> {
    /// Next poll will start an initial LIST to get all existing objects
    Empty,
    /// The initial LIST was successful, so we should move on to starting the
    /// actual watch.
    InitListed { resource_version: String },
    /// The watch is in progress, from this point we just return events from
    /// the server.
    ///
    /// If the connection is disrupted we propagate the error but try to
    /// restart the watch stream from the held resourceVersion by returning to
    /// `InitListed`. If we fall out of the watch window we propagate the
    /// error and fall back to a full relist with `Empty`.
    Watching {
        resource_version: String,
        stream: WatchStream,
        marker: std::marker::PhantomData<K>,
    },
}

struct WatchParams {
    client: Arc<dyn ApiClient>,
    gvr: GroupVersionResource,
    namespace: Option<String>,
    list_params: ListParams,
    expected_kind: String,
    health: Arc<WatchHealth>,
}

/// Decode one raw frame object into `K`.
///
/// Frames whose kind does not match the watched kind are dropped with a
/// warning rather than poisoning the stream.
fn decode<K: DeserializeOwned>(raw: serde_json::Value, expected_kind: &str) -> Result<Option<K>> {
    if let Some(kind) = raw.get("kind").and_then(|k| k.as_str()) {
        if kind != expected_kind {
            tracing::warn!(kind, expected_kind, "dropping watch frame with unexpected kind");
            return Ok(None);
        }
    }
    serde_json::from_value(raw).map(Some).map_err(Error::DecodeFailed)
}

/// Progresses the watcher a single step, returning (event, state)
///
/// This function should be trampolined: if event == `None` then the function
/// should be called again until it returns a Some.
async fn step_trampolined<K>(params: &WatchParams, state: State<K>) -> (Option<Result<Event<K>>>, State<K>)
where
    K: Resource + DeserializeOwned + Clone + Send + 'static,
{
    match state {
        State::Empty => {
            match params
                .client
                .list(&params.gvr, params.namespace.as_deref(), &params.list_params, "")
                .await
            {
                Ok(list) => {
                    let mut objs = Vec::with_capacity(list.items.len());
                    for item in list.items {
                        match decode::<K>(item, &params.expected_kind) {
                            Ok(Some(obj)) => objs.push(obj),
                            Ok(None) => {}
                            Err(err) => return (Some(Err(err)), State::Empty),
                        }
                    }
                    params.health.mark_connected();
                    (Some(Ok(Event::Restarted(objs))), State::InitListed {
                        resource_version: list.resource_version,
                    })
                }
                Err(err) => {
                    params.health.mark_disconnected();
                    (Some(Err(Error::InitialListFailed(err))), State::Empty)
                }
            }
        }
        State::InitListed { resource_version } => {
            match params
                .client
                .watch(
                    &params.gvr,
                    params.namespace.as_deref(),
                    &params.list_params,
                    &resource_version,
                    params.list_params.bookmarks,
                )
                .await
            {
                Ok(stream) => {
                    params.health.mark_connected();
                    (None, State::Watching {
                        resource_version,
                        stream,
                        marker: std::marker::PhantomData,
                    })
                }
                Err(err) => {
                    params.health.mark_disconnected();
                    let next_state = if err.is_expired() {
                        State::Empty
                    } else {
                        State::InitListed { resource_version }
                    };
                    (Some(Err(Error::WatchStartFailed(err))), next_state)
                }
            }
        }
        State::Watching {
            resource_version,
            mut stream,
            marker,
        } => match stream.next().await {
            Some(Ok(WatchEvent::Added(raw))) | Some(Ok(WatchEvent::Modified(raw))) => {
                match decode::<K>(raw, &params.expected_kind) {
                    Ok(Some(obj)) => {
                        let resource_version = obj.resource_version().unwrap_or(resource_version);
                        (Some(Ok(Event::Applied(obj))), State::Watching {
                            resource_version,
                            stream,
                            marker,
                        })
                    }
                    Ok(None) => (None, State::Watching {
                        resource_version,
                        stream,
                        marker,
                    }),
                    Err(err) => (Some(Err(err)), State::Watching {
                        resource_version,
                        stream,
                        marker,
                    }),
                }
            }
            Some(Ok(WatchEvent::Deleted(raw))) => match decode::<K>(raw, &params.expected_kind) {
                Ok(Some(obj)) => {
                    let resource_version = obj.resource_version().unwrap_or(resource_version);
                    (Some(Ok(Event::Deleted(obj))), State::Watching {
                        resource_version,
                        stream,
                        marker,
                    })
                }
                Ok(None) => (None, State::Watching {
                    resource_version,
                    stream,
                    marker,
                }),
                Err(err) => (Some(Err(err)), State::Watching {
                    resource_version,
                    stream,
                    marker,
                }),
            },
            Some(Ok(WatchEvent::Bookmark(bm))) => {
                // Bookmarks carry no reconcile intent; only the rv moves
                (None, State::Watching {
                    resource_version: bm.metadata.resource_version,
                    stream,
                    marker,
                })
            }
            Some(Ok(WatchEvent::Error(err))) => {
                // 410 Gone means we have desynced and need to start over with a relist
                let new_state = if err.is_expired() {
                    State::Empty
                } else {
                    State::Watching {
                        resource_version,
                        stream,
                        marker,
                    }
                };
                (Some(Err(Error::WatchError(err))), new_state)
            }
            Some(Err(err)) => {
                params.health.mark_disconnected();
                let new_state = if err.is_expired() {
                    State::Empty
                } else {
                    State::InitListed { resource_version }
                };
                (Some(Err(Error::WatchFailed(err))), new_state)
            }
            None => (None, State::InitListed { resource_version }),
        },
    }
}

/// Trampoline helper for [`step_trampolined`]
async fn step<K>(params: &WatchParams, mut state: State<K>) -> (Result<Event<K>>, State<K>)
where
    K: Resource + DeserializeOwned + Clone + Send + 'static,
{
    loop {
        match step_trampolined(params, state).await {
            (Some(result), new_state) => return (result, new_state),
            (None, new_state) => state = new_state,
        }
    }
}

/// Watches a resource kind for changes continuously
///
/// Errors from the underlying calls are propagated, after which the stream
/// goes into recovery mode on the next poll. Apply a backoff with
/// [`backoff_watch`] to avoid busy-looping while the apiserver is away.
///
/// The watcher holds the last seen `resourceVersion`; an interrupted watch is
/// resumed from it, and an expired one falls back to a fresh LIST that is
/// surfaced as [`Event::Restarted`].
pub fn watcher<K>(
    client: Arc<dyn ApiClient>,
    dyntype: K::DynamicType,
    namespace: Option<String>,
    list_params: ListParams,
) -> impl Stream<Item = Result<Event<K>>> + Send
where
    K: Resource + DeserializeOwned + Clone + Send + 'static,
{
    watcher_with_health(client, dyntype, namespace, list_params, Default::default())
}

/// [`watcher`], reporting connection state through the supplied [`WatchHealth`]
pub fn watcher_with_health<K>(
    client: Arc<dyn ApiClient>,
    dyntype: K::DynamicType,
    namespace: Option<String>,
    list_params: ListParams,
    health: Arc<WatchHealth>,
) -> impl Stream<Item = Result<Event<K>>> + Send
where
    K: Resource + DeserializeOwned + Clone + Send + 'static,
{
    let params = WatchParams {
        client,
        gvr: K::gvr(&dyntype),
        expected_kind: K::kind(&dyntype).into_owned(),
        namespace,
        list_params,
        health,
    };
    stream::unfold((params, State::Empty), |(params, state)| async {
        let (event, state) = step(&params, state).await;
        Some((event, (params, state)))
    })
}

/// The recommended watch backoff: a fixed delay between restarts
///
/// Kept deliberately simple since the watcher already resumes from its held
/// resourceVersion; nothing is gained by hammering a recovering apiserver.
#[must_use]
pub fn fixed_backoff(delay: Duration) -> backoff::backoff::Constant {
    backoff::backoff::Constant::new(delay)
}

/// A client-go-ish exponential backoff for watch restarts
#[must_use]
pub fn default_backoff() -> ExponentialBackoff {
    ExponentialBackoff {
        initial_interval: Duration::from_millis(800),
        max_interval: Duration::from_secs(30),
        randomization_factor: 1.0,
        multiplier: 2.0,
        max_elapsed_time: None,
        ..ExponentialBackoff::default()
    }
}

/// Apply a backoff policy to a watch stream, pausing after each error item
pub fn backoff_watch<K, S>(stream: S, backoff: impl Backoff) -> impl Stream<Item = Result<Event<K>>>
where
    S: Stream<Item = Result<Event<K>>>,
{
    StreamBackoff::new(stream, backoff)
}

#[cfg(test)]
mod tests {
    use super::{decode, Event};
    use opkit_core::DynamicObject;
    use serde_json::json;

    #[test]
    fn decode_drops_mismatched_kinds() {
        let raw = json!({
            "apiVersion": "example.io/v1",
            "kind": "Gadget",
            "metadata": { "name": "g" },
        });
        assert!(decode::<DynamicObject>(raw, "Widget").unwrap().is_none());
    }

    #[test]
    fn event_flattening() {
        let objs = vec![1, 2, 3];
        assert_eq!(
            Event::Restarted(objs.clone()).into_iter_applied().collect::<Vec<_>>(),
            objs
        );
        assert_eq!(Event::<i32>::Deleted(7).into_iter_applied().count(), 0);
        assert_eq!(Event::<i32>::Deleted(7).into_iter_touched().count(), 1);
    }
}
