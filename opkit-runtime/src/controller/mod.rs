//! Runs a user-supplied reconciler function on objects when they are updated

use crate::{
    event_queue::{EventQueue, QueueRequest},
    rate_limit::RateLimiter,
    reflector::{reflector, store::Writer, ObjectRef, Store},
    utils::{trystream_try_via, CancelableJoinHandle, JoinFailure, RuntimeStreamExt},
    watcher::{self, watcher_with_health, WatchHealth},
};
use backoff::backoff::Backoff;
use futures::{
    channel,
    future::{self, BoxFuture},
    stream, FutureExt, SinkExt, Stream, StreamExt, TryFuture, TryFutureExt, TryStream, TryStreamExt,
};
use opkit_core::{client::ApiClient, dynamic::DynamicObject, params::ListParams, resource::Resource};
use serde::de::DeserializeOwned;
use std::{
    fmt::{Debug, Display},
    hash::Hash,
    sync::Arc,
    time::Duration,
};
use stream::BoxStream;
use thiserror::Error;
use tokio::{runtime::Handle, sync::Semaphore, time::Instant};
use tracing::{info_span, Instrument, Span};

#[derive(Debug, Error)]
pub enum Error<ReconcilerErr: std::error::Error + 'static, QueueErr: std::error::Error + 'static> {
    #[error("reconciler for object {1} failed")]
    ReconcilerFailed(#[source] ReconcilerErr, ObjectRef<DynamicObject>),
    #[error("reconciler for object {0} panicked")]
    ReconcilerPanicked(ObjectRef<DynamicObject>),
    #[error("reconciler for object {0} exceeded the reconcile timeout")]
    ReconcilerTimedOut(ObjectRef<DynamicObject>),
    #[error("event queue error")]
    QueueError(#[source] QueueErr),
}

/// Results of a reconciliation attempt
///
/// Expressed as a value rather than a distinguished failure so that requeue
/// intent is part of the reconciler's normal return path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Action {
    inner: ActionInner,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum ActionInner {
    /// Trigger the reconciliation again after this delay, keeping the
    /// attempt counter
    Requeue(Duration),
    /// Trigger the reconciliation again after the per-key backoff delay,
    /// advancing the attempt counter
    RateLimited,
    /// Do nothing until a change is detected
    AwaitChange,
}

impl Action {
    /// Trigger the reconciliation again after `duration`
    ///
    /// This is the best-practice action that ensures eventual consistency of
    /// your controller even in the case of missed changes (which can happen).
    ///
    /// Watch events are not normally missed, so running this once per hour as
    /// a fallback is reasonable.
    #[must_use]
    pub fn requeue(duration: Duration) -> Self {
        Self {
            inner: ActionInner::Requeue(duration),
        }
    }

    /// Trigger the reconciliation again after the exponential per-key backoff
    ///
    /// Each use advances the key's attempt counter; the counter resets when a
    /// reconcile finishes without requesting a requeue.
    #[must_use]
    pub fn rate_limited() -> Self {
        Self {
            inner: ActionInner::RateLimited,
        }
    }

    /// Do nothing until a change is detected
    ///
    /// This stops the controller periodically reconciling this object until a
    /// relevant watch event was **detected**.
    ///
    /// **Warning**: If you have watch desyncs, it is possible to miss changes
    /// entirely. It is therefore not recommended to disable requeuing this
    /// way, unless you have frequent changes to the underlying object, or
    /// some other hook to retain eventual consistency.
    #[must_use]
    pub fn await_change() -> Self {
        Self {
            inner: ActionInner::AwaitChange,
        }
    }
}

/// A context data type that's passed through to the controller's callbacks
///
/// `Context` gets passed to both the `reconciler` and the `error_policy`
/// callbacks, allowing a read-only view of the world without creating a big
/// nested lambda.
#[derive(Debug)]
pub struct Context<T>(Arc<T>);

// manual impl so `T: Clone` is not required
impl<T> Clone for Context<T> {
    fn clone(&self) -> Self {
        Context(self.0.clone())
    }
}

impl<T> Context<T> {
    /// Create new `Context` instance.
    #[must_use]
    pub fn new(state: T) -> Context<T> {
        Context(Arc::new(state))
    }

    /// Get reference to inner controller data.
    #[must_use]
    pub fn get_ref(&self) -> &T {
        self.0.as_ref()
    }

    /// Convert to the internal `Arc<T>`.
    #[must_use]
    pub fn into_inner(self) -> Arc<T> {
        self.0
    }
}

/// A request to reconcile an object, annotated with why that request was made.
///
/// NOTE: The reason is ignored for comparison purposes. This means that, for
/// example, an object can only occupy one event queue slot, even if it has
/// been scheduled for multiple reasons.
pub struct ReconcileRequest<K: Resource> {
    pub obj_ref: ObjectRef<K>,
    pub reason: ReconcileReason,
}

impl<K: Resource> Clone for ReconcileRequest<K>
where
    K::DynamicType: Clone,
{
    fn clone(&self) -> Self {
        Self {
            obj_ref: self.obj_ref.clone(),
            reason: self.reason.clone(),
        }
    }
}

impl<K: Resource> Debug for ReconcileRequest<K>
where
    K::DynamicType: Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReconcileRequest")
            .field("obj_ref", &self.obj_ref)
            .field("reason", &self.reason)
            .finish()
    }
}

impl<K: Resource> PartialEq for ReconcileRequest<K>
where
    K::DynamicType: PartialEq,
{
    fn eq(&self, other: &Self) -> bool {
        self.obj_ref == other.obj_ref
    }
}

impl<K: Resource> Eq for ReconcileRequest<K> where K::DynamicType: Eq {}

impl<K: Resource> Hash for ReconcileRequest<K>
where
    K::DynamicType: Hash,
{
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.obj_ref.hash(state);
    }
}

impl<K: Resource> From<ObjectRef<K>> for ReconcileRequest<K> {
    fn from(obj_ref: ObjectRef<K>) -> Self {
        ReconcileRequest {
            obj_ref,
            reason: ReconcileReason::Unknown,
        }
    }
}

#[derive(Debug, Clone)]
pub enum ReconcileReason {
    Unknown,
    ObjectUpdated,
    ObjectDeleted,
    ReconcilerRequestedRetry,
    ErrorPolicyRequestedRetry,
    BulkReconcile,
    Custom { reason: String },
}

impl Display for ReconcileReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReconcileReason::Unknown => f.write_str("unknown"),
            ReconcileReason::ObjectUpdated => f.write_str("object updated"),
            ReconcileReason::ObjectDeleted => f.write_str("object deleted"),
            ReconcileReason::BulkReconcile => f.write_str("bulk reconcile requested"),
            ReconcileReason::ReconcilerRequestedRetry => f.write_str("reconciler requested retry"),
            ReconcileReason::ErrorPolicyRequestedRetry => f.write_str("error policy requested retry"),
            ReconcileReason::Custom { reason } => f.write_str(reason),
        }
    }
}

/// Runtime knobs for one controller's reconcile loop
#[derive(Debug, Clone)]
pub struct Config {
    /// Upper bound on reconciles running at the same time, across all keys
    pub max_concurrent_reconciles: usize,
    /// Extra settling time added to instantly-eligible queue items so bursts
    /// for one key collapse into a single reconcile
    pub debounce: Duration,
    /// Wall-clock bound on a single reconcile invocation; exceeding it counts
    /// as a failure with default backoff
    pub reconcile_timeout: Option<Duration>,
    /// First error requeue delay
    pub error_min_requeue_interval: Duration,
    /// Error requeue delay ceiling
    pub error_max_requeue_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_concurrent_reconciles: 1,
            debounce: Duration::from_millis(1),
            reconcile_timeout: None,
            error_min_requeue_interval: Duration::from_secs(1),
            error_max_requeue_interval: Duration::from_secs(600),
        }
    }
}

/// Invoked when a `Deleted` event arrives for an object that has already
/// left the cache (i.e. after its finalizers drained)
pub type DeleteHook<K> = Arc<dyn Fn(ObjectRef<K>) -> BoxFuture<'static, ()> + Send + Sync>;

/// How a single guarded reconcile invocation ended
enum ReconcileFailure<E> {
    Failed(E),
    Panicked,
    TimedOut,
}

/// Enqueues the object itself for reconciliation, tagging each request with
/// the kind of change that triggered it
pub fn trigger_self<K, S>(
    stream: S,
    dyntype: K::DynamicType,
) -> impl Stream<Item = Result<ReconcileRequest<K>, S::Error>>
where
    S: TryStream<Ok = watcher::Event<K>>,
    K: Resource,
    K::DynamicType: Clone,
{
    stream
        .map_ok(move |event| {
            let dyntype = dyntype.clone();
            let requests = match event {
                watcher::Event::Applied(obj) => vec![ReconcileRequest {
                    obj_ref: ObjectRef::from_obj_with(&obj, dyntype),
                    reason: ReconcileReason::ObjectUpdated,
                }],
                watcher::Event::Deleted(obj) => vec![ReconcileRequest {
                    obj_ref: ObjectRef::from_obj_with(&obj, dyntype),
                    reason: ReconcileReason::ObjectDeleted,
                }],
                watcher::Event::Restarted(objs) => objs
                    .iter()
                    .map(|obj| ReconcileRequest {
                        obj_ref: ObjectRef::from_obj_with(obj, dyntype.clone()),
                        reason: ReconcileReason::ObjectUpdated,
                    })
                    .collect(),
            };
            stream::iter(requests.into_iter().map(Ok))
        })
        .try_flatten()
}

/// Apply a reconciler to an input stream of [`ReconcileRequest`]s, with a
/// given retry policy
///
/// Takes a `store` parameter for the core objects, which should usually be
/// kept up to date by a [`reflector`].
///
/// The `queue` indicates which objects should be reconciled. For the core
/// objects this will usually be the [`reflector`] piped through
/// [`trigger_self`].
///
/// This is the "hard-mode" version of [`Controller`], which allows you some
/// more customization (such as triggering from arbitrary [`Stream`]s), at the
/// cost of being a bit more verbose.
///
/// Per-key guarantees: at most one reconcile per key is in flight at any
/// time, requests arriving while a key is in flight coalesce into at most one
/// follow-up run, and the user future is spawned on the runtime so that a
/// panic inside it is caught and treated as a failed attempt.
#[allow(clippy::needless_pass_by_value)]
pub fn applier<K, QueueStream, ReconcilerFut, T>(
    mut reconciler: impl FnMut(Arc<K>, Context<T>) -> ReconcilerFut,
    mut error_policy: impl FnMut(&ReconcilerFut::Error, Context<T>) -> Action,
    context: Context<T>,
    store: Store<K>,
    queue: QueueStream,
    config: Config,
    delete_hook: Option<DeleteHook<K>>,
) -> impl Stream<Item = Result<(ObjectRef<K>, Action), Error<ReconcilerFut::Error, QueueStream::Error>>>
where
    K: Clone + Resource + Send + Sync + 'static,
    K::DynamicType: Debug + Eq + Hash + Clone + Unpin + Send + Sync,
    ReconcilerFut: TryFuture<Ok = Action> + Send + 'static,
    ReconcilerFut::Error: std::error::Error + Send + 'static,
    QueueStream: TryStream,
    QueueStream::Ok: Into<ReconcileRequest<K>>,
    QueueStream::Error: std::error::Error + 'static,
    T: Send + Sync + 'static,
{
    let (requeue_shutdown_tx, requeue_shutdown_rx) = channel::oneshot::channel();
    let err_context = context.clone();
    let (requeue_tx, requeue_rx) = channel::mpsc::channel::<QueueRequest<K>>(100);
    let limiter = Arc::new(RateLimiter::<ObjectRef<K>>::new(
        config.error_min_requeue_interval,
        config.error_max_requeue_interval,
    ));
    let semaphore = Arc::new(Semaphore::new(config.max_concurrent_reconciles.max(1)));
    let reconcile_timeout = config.reconcile_timeout;
    let debounce = config.debounce;
    // Create a stream of requests that need to be reconciled
    trystream_try_via(
        // input: stream combining requeues and user specified input events
        Box::pin(stream::select(
            // 1. inputs from the watcher-fed queue stream
            queue
                .map_err(Error::QueueError)
                .map_ok(|request| QueueRequest {
                    request: request.into(),
                    run_at: Instant::now(),
                })
                .on_complete(async move {
                    // On error: the event queue has already been shut down and there is nothing for us to do
                    let _ = requeue_shutdown_tx.send(());
                    tracing::debug!("applier queue terminated, starting graceful shutdown")
                }),
            // 2. requeues sent by the outcome handler below
            requeue_rx
                .map(Ok)
                .take_until(requeue_shutdown_rx)
                .on_complete(async { tracing::debug!("applier requeue consumer terminated") }),
        )),
        // all the Oks from the select run through the event queue, which
        // dedupes per object and never dispatches a key already in flight
        move |s| {
            EventQueue::new(s, debounce, move |request| {
                match store.get(&request.obj_ref) {
                    Some(obj) => {
                        let reconciler_span = info_span!(
                            "reconciling object",
                            "object.ref" = %request.obj_ref,
                            object.reason = %request.reason
                        );
                        let user_fut =
                            reconciler_span.in_scope(|| reconciler(obj, context.clone()));
                        let semaphore = semaphore.clone();
                        // the user future runs on its own task so a panic is
                        // contained to this attempt; the permit bounds
                        // cross-key parallelism
                        let guarded = CancelableJoinHandle::spawn(
                            async move {
                                let _permit = semaphore.acquire_owned().await.ok();
                                match reconcile_timeout {
                                    Some(limit) => {
                                        match tokio::time::timeout(limit, user_fut.into_future()).await {
                                            Ok(res) => res.map_err(ReconcileFailure::Failed),
                                            Err(_elapsed) => Err(ReconcileFailure::TimedOut),
                                        }
                                    }
                                    None => user_fut.into_future().await.map_err(ReconcileFailure::Failed),
                                }
                            }
                            .instrument(reconciler_span.clone()),
                            &Handle::current(),
                        );
                        guarded
                            .map(move |joined| {
                                let outcome = match joined {
                                    Ok(outcome) => outcome,
                                    // abort only happens on forceful shutdown, where the
                                    // result is discarded anyway
                                    Err(JoinFailure::Panicked) | Err(JoinFailure::Cancelled) => {
                                        Err(ReconcileFailure::Panicked)
                                    }
                                };
                                Ok((request.obj_ref, outcome, reconciler_span))
                            })
                            .left_future()
                    }
                    None => {
                        let hook = delete_hook.clone();
                        async move {
                            if matches!(request.reason, ReconcileReason::ObjectDeleted) {
                                if let Some(hook) = hook {
                                    hook(request.obj_ref.clone()).await;
                                }
                            } else {
                                tracing::debug!(object = %request.obj_ref, "object absent from store, skipping reconcile");
                            }
                            Ok((request.obj_ref, Ok(Action::await_change()), Span::none()))
                        }
                        .boxed()
                        .right_future()
                    }
                }
            })
            .on_complete(async { tracing::debug!("applier event queue terminated") })
        },
    )
    .on_complete(async { tracing::debug!("applier queue-merge terminated") })
    // finally, for each completed reconcile call:
    .and_then(move |(obj_ref, outcome, reconciler_span)| {
        // translate the outcome into a requeue decision and a stream item
        let (requeue, result) = match outcome {
            Ok(action) => {
                let requeue = match &action.inner {
                    ActionInner::Requeue(delay) => {
                        // explicit delay keeps the attempt counter
                        Some((*delay, ReconcileReason::ReconcilerRequestedRetry))
                    }
                    ActionInner::RateLimited => Some((
                        limiter.fail(&obj_ref),
                        ReconcileReason::ReconcilerRequestedRetry,
                    )),
                    ActionInner::AwaitChange => {
                        limiter.forget(&obj_ref);
                        None
                    }
                };
                (requeue, Ok((obj_ref.clone(), action)))
            }
            Err(failure) => {
                let (action, err) = match failure {
                    ReconcileFailure::Failed(err) => {
                        let action = reconciler_span
                            .in_scope(|| error_policy(&err, err_context.clone()));
                        (action, Error::ReconcilerFailed(err, obj_ref.clone().erase()))
                    }
                    ReconcileFailure::Panicked => (
                        Action::rate_limited(),
                        Error::ReconcilerPanicked(obj_ref.clone().erase()),
                    ),
                    ReconcileFailure::TimedOut => (
                        Action::rate_limited(),
                        Error::ReconcilerTimedOut(obj_ref.clone().erase()),
                    ),
                };
                let requeue = match &action.inner {
                    // an explicitly chosen delay is not counted as a failure
                    // toward the backoff
                    ActionInner::Requeue(delay) => {
                        Some((*delay, ReconcileReason::ErrorPolicyRequestedRetry))
                    }
                    ActionInner::RateLimited => Some((
                        limiter.fail(&obj_ref),
                        ReconcileReason::ErrorPolicyRequestedRetry,
                    )),
                    // non-retryable: drop the key unless a watch event revives it
                    ActionInner::AwaitChange => {
                        limiter.forget(&obj_ref);
                        None
                    }
                };
                (requeue, Err(err))
            }
        };
        let mut requeue_tx = requeue_tx.clone();
        async move {
            // Transmit the requeue intent to the event queue (picked up again at top)
            if let Some((delay, reason)) = requeue {
                // Failure to requeue = in graceful shutdown mode, ignore
                let _ = requeue_tx
                    .send(QueueRequest {
                        request: ReconcileRequest { obj_ref, reason },
                        run_at: Instant::now() + delay,
                    })
                    .await;
            }
            result
        }
    })
    .on_complete(async { tracing::debug!("applier terminated") })
}

/// A single-kind controller: watcher → reflector → event queue → reconciler
///
/// A controller is made up of:
/// - 1 watcher feeding a reflector (cache) for the reconciled kind
/// - user defined `reconcile` + `error_policy` callbacks
/// - a generated trigger stream considering all sources
///
/// All reconcile requests flow through the internal [`EventQueue`], which
/// deduplicates per object and never dispatches a key already in flight.
pub struct Controller<K>
where
    K: Clone + Resource + Debug + 'static,
    K::DynamicType: Eq + Hash,
{
    // NB: Need to Unpin for stream::select_all
    trigger: BoxStream<'static, Result<ReconcileRequest<K>, watcher::Error>>,
    trigger_backoff: Box<dyn Backoff + Send>,
    /// [`run`](crate::Controller::run) starts a graceful shutdown when any of
    /// these [`Future`](futures::Future)s complete, refusing to start any new
    /// reconciliations but letting any existing ones finish.
    graceful_shutdown_selector: Vec<BoxFuture<'static, ()>>,
    /// [`run`](crate::Controller::run) terminates immediately when any of
    /// these [`Future`](futures::Future)s complete, requesting that all
    /// running reconciliations be aborted.
    forceful_shutdown_selector: Vec<BoxFuture<'static, ()>>,
    dyntype: K::DynamicType,
    reader: Store<K>,
    health: Arc<WatchHealth>,
    config: Config,
    delete_hook: Option<DeleteHook<K>>,
}

impl<K> Controller<K>
where
    K: Clone + Resource + DeserializeOwned + Debug + Send + Sync + 'static,
    K::DynamicType: Debug + Eq + Hash + Clone + Unpin + Send + Sync,
{
    /// Create a Controller on a type `K` watched through `client`
    ///
    /// The [`ListParams`] control the subset of objects of `K` that you want
    /// to manage and receive reconcile events for; cluster scope unless
    /// restricted with [`Controller::within`].
    #[must_use]
    pub fn new(client: Arc<dyn ApiClient>, lp: ListParams) -> Self
    where
        K::DynamicType: Default,
    {
        Self::new_with(client, lp, Default::default())
    }

    /// Create a Controller on a type `K`, with a runtime type descriptor
    ///
    /// This variant constructor is for dynamic types found through discovery.
    /// Prefer [`Controller::new`] for static types.
    pub fn new_with(client: Arc<dyn ApiClient>, lp: ListParams, dyntype: K::DynamicType) -> Self {
        Self::scoped(client, lp, None, dyntype)
    }

    /// Create a Controller restricted to one namespace
    pub fn namespaced(
        client: Arc<dyn ApiClient>,
        lp: ListParams,
        namespace: &str,
        dyntype: K::DynamicType,
    ) -> Self {
        Self::scoped(client, lp, Some(namespace.to_string()), dyntype)
    }

    fn scoped(
        client: Arc<dyn ApiClient>,
        lp: ListParams,
        namespace: Option<String>,
        dyntype: K::DynamicType,
    ) -> Self {
        let writer = Writer::<K>::new(dyntype.clone());
        let reader = writer.as_reader();
        let health = Arc::new(WatchHealth::default());
        let self_watcher = trigger_self(
            reflector(
                writer,
                watcher_with_health(client, dyntype.clone(), namespace, lp, health.clone()),
            ),
            dyntype.clone(),
        )
        .boxed();
        Self {
            trigger: self_watcher,
            trigger_backoff: Box::new(watcher::fixed_backoff(Duration::from_secs(30))),
            graceful_shutdown_selector: vec![
                // Fallback future, ensuring that we never terminate if no additional futures are added to the selector
                future::pending().boxed(),
            ],
            forceful_shutdown_selector: vec![
                // Fallback future, ensuring that we never terminate if no additional futures are added to the selector
                future::pending().boxed(),
            ],
            dyntype,
            reader,
            health,
            config: Config::default(),
            delete_hook: None,
        }
    }

    /// Specify the backoff policy for watch restarts
    ///
    /// The default sleeps for a fixed 30s between restarts; pass
    /// [`watcher::fixed_backoff`] with the configured watch retry delay, or
    /// any other [`Backoff`].
    #[must_use]
    pub fn trigger_backoff(mut self, backoff: impl Backoff + Send + 'static) -> Self {
        self.trigger_backoff = Box::new(backoff);
        self
    }

    /// Replace the runtime knobs for this controller
    #[must_use]
    pub fn with_config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Retrieve a copy of the reader before starting the controller
    pub fn store(&self) -> Store<K> {
        self.reader.clone()
    }

    /// The watch liveness shared with the manager's probes
    pub fn health(&self) -> Arc<WatchHealth> {
        self.health.clone()
    }

    /// Run `hook` when a `Deleted` event arrives for an object that is gone
    /// from the cache
    ///
    /// The apiserver only emits that event once the object's finalizers have
    /// drained, so the hook observes fully deleted objects.
    #[must_use]
    pub fn on_delete(
        mut self,
        hook: impl Fn(ObjectRef<K>) -> BoxFuture<'static, ()> + Send + Sync + 'static,
    ) -> Self {
        self.delete_hook = Some(Arc::new(hook));
        self
    }

    /// Trigger a reconciliation for all managed objects whenever `trigger`
    /// emits a value
    ///
    /// For example, this can be used to reconcile all objects whenever the
    /// controller's configuration changes.
    ///
    /// This can be called multiple times, in which case they are additive;
    /// reconciles are scheduled whenever *any* [`Stream`] emits a new item.
    #[must_use]
    pub fn reconcile_all_on(mut self, trigger: impl Stream<Item = ()> + Send + 'static) -> Self {
        let store = self.store();
        let dyntype = self.dyntype.clone();
        let bulk = trigger
            .flat_map(move |()| {
                let dyntype = dyntype.clone();
                stream::iter(store.state().into_iter().map(move |obj| {
                    Ok(ReconcileRequest {
                        obj_ref: ObjectRef::from_obj_with(&*obj, dyntype.clone()),
                        reason: ReconcileReason::BulkReconcile,
                    })
                }))
            })
            .boxed();
        self.trigger = stream::select(self.trigger, bulk).boxed();
        self
    }

    /// Start a graceful shutdown when `trigger` resolves. Once a graceful
    /// shutdown has been initiated:
    ///
    /// - No new reconciliations are started from the event queue
    /// - The underlying watch is terminated
    /// - All running reconciliations are allowed to finish
    /// - [`Controller::run`]'s [`Stream`] terminates once all running
    ///   reconciliations are done.
    ///
    /// This can be called multiple times, in which case they are additive;
    /// the [`Controller`] starts to terminate as soon as *any* `trigger`
    /// resolves.
    #[must_use]
    pub fn graceful_shutdown_on(
        mut self,
        trigger: impl futures::Future<Output = ()> + Send + 'static,
    ) -> Self {
        self.graceful_shutdown_selector.push(trigger.boxed());
        self
    }

    /// Initiate graceful shutdown on Ctrl+C or SIGTERM (on Unix), waiting for
    /// all reconcilers to finish.
    ///
    /// Once a graceful shutdown has been initiated, Ctrl+C (or SIGTERM) can be
    /// sent again to request a forceful shutdown (requesting that all
    /// reconcilers abort on the next yield point).
    #[must_use]
    pub fn shutdown_on_signal(mut self) -> Self {
        async fn shutdown_signal() {
            futures::future::select(
                tokio::signal::ctrl_c().map(|_| ()).boxed(),
                #[cfg(unix)]
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("failed to register SIGTERM handler")
                    .recv()
                    .map(|_| ())
                    .boxed(),
                // Assume that ctrl_c is enough on non-Unix platforms (such as Windows)
                #[cfg(not(unix))]
                futures::future::pending::<()>(),
            )
            .await;
        }

        let (graceful_tx, graceful_rx) = channel::oneshot::channel();
        self.graceful_shutdown_selector
            .push(graceful_rx.map(|_| ()).boxed());
        self.forceful_shutdown_selector.push(
            async {
                tracing::info!("press ctrl+c to shut down gracefully");
                shutdown_signal().await;
                if let Ok(()) = graceful_tx.send(()) {
                    tracing::info!("graceful shutdown requested, press ctrl+c again to force shutdown");
                } else {
                    tracing::info!(
                        "graceful shutdown already requested, press ctrl+c again to force shutdown"
                    );
                }
                shutdown_signal().await;
                tracing::info!("forced shutdown requested");
            }
            .boxed(),
        );
        self
    }

    /// Consume all the parameters of the Controller and start the applier stream
    ///
    /// This creates a stream from all builder calls and starts an applier
    /// with the specified `reconciler` and `error_policy` callbacks. Each of
    /// these will be called with a configurable [`Context`].
    pub fn run<ReconcilerFut, T>(
        self,
        reconciler: impl FnMut(Arc<K>, Context<T>) -> ReconcilerFut,
        error_policy: impl FnMut(&ReconcilerFut::Error, Context<T>) -> Action,
        context: Context<T>,
    ) -> impl Stream<Item = Result<(ObjectRef<K>, Action), Error<ReconcilerFut::Error, watcher::Error>>>
    where
        K::DynamicType: Debug + Unpin,
        ReconcilerFut: TryFuture<Ok = Action> + Send + 'static,
        ReconcilerFut::Error: std::error::Error + Send + 'static,
        T: Send + Sync + 'static,
    {
        applier(
            reconciler,
            error_policy,
            context,
            self.reader,
            crate::utils::stream_backoff::StreamBackoff::new(self.trigger, self.trigger_backoff)
                .take_until(future::select_all(self.graceful_shutdown_selector)),
            self.config,
            self.delete_hook,
        )
        .take_until(futures::future::select_all(self.forceful_shutdown_selector))
    }
}

/// The default error policy: requeue with per-key exponential backoff
pub fn default_error_policy<E, T>(_error: &E, _ctx: Context<T>) -> Action {
    Action::rate_limited()
}

#[cfg(test)]
mod tests {
    use super::{applier, Action, Config, Context, ReconcileReason, ReconcileRequest};
    use crate::reflector::{store::Writer, ObjectRef};
    use futures::{pin_mut, stream, StreamExt};
    use opkit_core::{ApiResource, DynamicObject, GroupVersionKind};
    use serde_json::json;
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
        time::Duration,
    };
    use tokio::time::Instant;

    fn widget_type() -> ApiResource {
        ApiResource::from_gvk(&GroupVersionKind::gvk("example.io", "v1", "Widget"))
    }

    fn widget(name: &str, rv: &str) -> DynamicObject {
        serde_json::from_value(json!({
            "apiVersion": "example.io/v1",
            "kind": "Widget",
            "metadata": { "name": name, "namespace": "ns", "resourceVersion": rv, "uid": name },
        }))
        .unwrap()
    }

    fn request(name: &str) -> Result<ReconcileRequest<DynamicObject>, std::convert::Infallible> {
        Ok(ReconcileRequest {
            obj_ref: ObjectRef::new_with(name, widget_type()).within("ns"),
            reason: ReconcileReason::ObjectUpdated,
        })
    }

    #[derive(Debug, thiserror::Error)]
    #[error("reconcile blew up")]
    struct TestError;

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn applier_reconciles_and_requeues_after_delay() {
        let mut writer = Writer::<DynamicObject>::new(widget_type());
        writer.apply_watcher_event(&crate::watcher::Event::Applied(widget("a", "1")));
        let store = writer.as_reader();

        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        let started = Instant::now();
        let queue = stream::iter(vec![request("a")]).chain(stream::pending());
        let outputs = applier(
            move |_obj, _ctx| {
                let n = calls2.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Ok::<_, TestError>(Action::requeue(Duration::from_secs(30)))
                    } else {
                        Ok(Action::await_change())
                    }
                }
            },
            super::default_error_policy,
            Context::new(()),
            store,
            queue,
            Config::default(),
            None,
        );
        pin_mut!(outputs);

        let (_, first) = outputs.next().await.unwrap().unwrap();
        assert_eq!(first, Action::requeue(Duration::from_secs(30)));
        assert!(started.elapsed() < Duration::from_secs(1));

        let (_, second) = outputs.next().await.unwrap().unwrap();
        assert_eq!(second, Action::await_change());
        assert!(started.elapsed() >= Duration::from_secs(30));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn applier_retries_errors_with_backoff() {
        let mut writer = Writer::<DynamicObject>::new(widget_type());
        writer.apply_watcher_event(&crate::watcher::Event::Applied(widget("a", "1")));
        let store = writer.as_reader();

        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        let queue = stream::iter(vec![request("a")]).chain(stream::pending());
        let outputs = applier(
            move |_obj, _ctx| {
                let n = calls2.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Err(TestError)
                    } else {
                        Ok(Action::await_change())
                    }
                }
            },
            super::default_error_policy,
            Context::new(()),
            store,
            queue,
            Config::default(),
            None,
        );
        pin_mut!(outputs);

        assert!(outputs.next().await.unwrap().is_err());
        let (_, action) = outputs.next().await.unwrap().unwrap();
        assert_eq!(action, Action::await_change());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn applier_catches_reconciler_panics() {
        let mut writer = Writer::<DynamicObject>::new(widget_type());
        writer.apply_watcher_event(&crate::watcher::Event::Applied(widget("a", "1")));
        let store = writer.as_reader();

        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        let queue = stream::iter(vec![request("a")]).chain(stream::pending());
        let outputs = applier(
            move |_obj, _ctx| {
                let n = calls2.fetch_add(1, Ordering::SeqCst);
                async move {
                    assert!(n > 0, "first attempt panics");
                    Ok::<_, TestError>(Action::await_change())
                }
            },
            super::default_error_policy,
            Context::new(()),
            store,
            queue,
            Config::default(),
            None,
        );
        pin_mut!(outputs);

        let first = outputs.next().await.unwrap();
        assert!(matches!(first, Err(super::Error::ReconcilerPanicked(_))));
        // the panicked attempt is retried with backoff
        let (_, action) = outputs.next().await.unwrap().unwrap();
        assert_eq!(action, Action::await_change());
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn applier_times_out_slow_reconciles() {
        let mut writer = Writer::<DynamicObject>::new(widget_type());
        writer.apply_watcher_event(&crate::watcher::Event::Applied(widget("a", "1")));
        let store = writer.as_reader();

        let queue = stream::iter(vec![request("a")]).chain(stream::pending());
        let outputs = applier(
            |_obj, _ctx| async move {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok::<_, TestError>(Action::await_change())
            },
            super::default_error_policy,
            Context::new(()),
            store,
            queue,
            Config {
                reconcile_timeout: Some(Duration::from_secs(5)),
                ..Config::default()
            },
            None,
        );
        pin_mut!(outputs);

        let first = outputs.next().await.unwrap();
        assert!(matches!(first, Err(super::Error::ReconcilerTimedOut(_))));
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn delete_hook_runs_for_objects_gone_from_the_store() {
        let writer = Writer::<DynamicObject>::new(widget_type());
        let store = writer.as_reader();

        let deleted = Arc::new(AtomicUsize::new(0));
        let deleted2 = deleted.clone();
        let hook: super::DeleteHook<DynamicObject> = Arc::new(move |_obj_ref| {
            let deleted = deleted2.clone();
            Box::pin(async move {
                deleted.fetch_add(1, Ordering::SeqCst);
            })
        });

        let queue = stream::iter(vec![Ok::<_, std::convert::Infallible>(ReconcileRequest {
            obj_ref: ObjectRef::new_with("gone", widget_type()).within("ns"),
            reason: ReconcileReason::ObjectDeleted,
        })])
        .chain(stream::pending());
        let outputs = applier(
            |_obj, _ctx| async move { Ok::<_, TestError>(Action::await_change()) },
            super::default_error_policy,
            Context::new(()),
            store,
            queue,
            Config::default(),
            Some(hook),
        );
        pin_mut!(outputs);

        let (_, action) = outputs.next().await.unwrap().unwrap();
        assert_eq!(action, Action::await_change());
        assert_eq!(deleted.load(Ordering::SeqCst), 1);
    }
}
