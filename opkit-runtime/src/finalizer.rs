//! Finalizer helpers for [`Controller`](crate::Controller) reconcilers
//!
//! Finalizers block server-side deletion until the controller has finished
//! its cleanup and removed its token from `metadata.finalizers`.

use crate::controller::Action;
use futures::{future::BoxFuture, TryFuture, TryFutureExt};
use json_patch::{jsonptr::PointerBuf, AddOperation, PatchOperation, RemoveOperation, TestOperation};
use opkit_core::{
    client::{ApiClient, ClientError},
    params::Patch,
    resource::{Resource, ResourceExt},
};
use serde_json::json;
use std::{error::Error as StdError, fmt::Debug, sync::Arc};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error<ReconcileErr>
where
    ReconcileErr: StdError + 'static,
{
    #[error("failed to apply object: {0}")]
    ApplyFailed(#[source] ReconcileErr),
    #[error("failed to clean up object (finalizer {identifier}): {source}")]
    CleanupFailed {
        identifier: String,
        #[source]
        source: ReconcileErr,
    },
    #[error("failed to add finalizer: {0}")]
    AddFinalizer(#[source] ClientError),
    #[error("failed to remove finalizer: {0}")]
    RemoveFinalizer(#[source] ClientError),
    #[error("object has no name")]
    UnnamedObject,
    #[error("invalid finalizer identifier {0:?}")]
    InvalidIdentifier(String),
}

/// Validates a finalizer identifier.
///
/// Identifiers are persisted into object metadata and must be stable across
/// operator restarts: canonical form `<group>/<finalizer-name>`, at most 63
/// characters, URL-safe characters only. Over-long or malformed identifiers
/// are rejected outright; truncating one would orphan tokens already written
/// to the cluster by an earlier deployment.
pub fn validate_identifier(identifier: &str) -> Result<(), InvalidIdentifier> {
    let err = || InvalidIdentifier(identifier.to_string());
    if identifier.is_empty() || identifier.len() > 63 {
        return Err(err());
    }
    let mut parts = identifier.splitn(2, '/');
    let (group, name) = (parts.next().unwrap_or(""), parts.next().unwrap_or(""));
    if group.is_empty() || name.is_empty() {
        return Err(err());
    }
    if !identifier
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/'))
    {
        return Err(err());
    }
    Ok(())
}

/// See [`validate_identifier`]
#[derive(Debug, Error)]
#[error("invalid finalizer identifier {0:?}")]
pub struct InvalidIdentifier(pub String);

struct FinalizerState {
    finalizer_index: Option<usize>,
    is_deleting: bool,
}

impl FinalizerState {
    fn for_object<K: Resource>(obj: &K, finalizer_name: &str) -> Self {
        Self {
            finalizer_index: obj
                .finalizers()
                .iter()
                .enumerate()
                .find(|(_, fin)| *fin == finalizer_name)
                .map(|(i, _)| i),
            is_deleting: obj.meta().deletion_timestamp.is_some(),
        }
    }
}

fn finalizer_path_tokens(index: usize) -> PointerBuf {
    PointerBuf::from_tokens(["metadata".to_string(), "finalizers".to_string(), index.to_string()])
}

/// test+remove patch for the finalizer at `index`
///
/// All finalizers run concurrently and we use an integer index. `test`
/// ensures that we fail instead of deleting someone else's finalizer (in
/// which case a new cleanup event will be sent).
fn remove_finalizer_patch(finalizer_name: &str, index: usize) -> json_patch::Patch {
    json_patch::Patch(vec![
        PatchOperation::Test(TestOperation {
            path: finalizer_path_tokens(index),
            value: finalizer_name.into(),
        }),
        PatchOperation::Remove(RemoveOperation {
            path: finalizer_path_tokens(index),
        }),
    ])
}

/// test+add patch appending `finalizer_name` to the current finalizer list
///
/// The apiserver doesn't deduplicate finalizers, so the `test` makes the
/// patch fail and retry if anyone else modified the list in the meantime.
fn add_finalizer_patch<K: Resource>(obj: &K, finalizer_name: &str) -> json_patch::Patch {
    if obj.finalizers().is_empty() {
        json_patch::Patch(vec![
            PatchOperation::Test(TestOperation {
                path: PointerBuf::from_tokens(["metadata", "finalizers"]),
                value: serde_json::Value::Null,
            }),
            PatchOperation::Add(AddOperation {
                path: PointerBuf::from_tokens(["metadata", "finalizers"]),
                value: vec![finalizer_name].into(),
            }),
        ])
    } else {
        json_patch::Patch(vec![
            PatchOperation::Test(TestOperation {
                path: PointerBuf::from_tokens(["metadata", "finalizers"]),
                value: obj.finalizers().into(),
            }),
            PatchOperation::Add(AddOperation {
                path: PointerBuf::from_tokens(["metadata", "finalizers", "-"]),
                value: finalizer_name.into(),
            }),
        ])
    }
}

/// Reconcile an object in a way that requires cleanup before the object can
/// be deleted.
///
/// It does this by managing an entry in `metadata.finalizers`, which prevents
/// the object from being deleted before the cleanup is done.
///
/// In typical usage, if you use `finalizer` then it should be the only
/// top-level "action" in your [`applier`](crate::applier)/[`Controller`](crate::Controller)'s
/// `reconcile` function.
///
/// # Expected Flow
///
/// 1. User creates object
/// 2. Reconciler sees object
/// 3. `finalizer` adds `finalizer_name` to `metadata.finalizers`
/// 4. Reconciler sees updated object
/// 5. `finalizer` runs [`Event::Apply`]
/// 6. User deletes object
/// 7. Reconciler sees deleting object
/// 8. `finalizer` runs [`Event::Cleanup`]
/// 9. `finalizer` removes `finalizer_name` from `metadata.finalizers`
/// 10. The apiserver sees that all finalizers are gone and finally deletes
///     the object
///
/// # Guarantees
///
/// If [`Event::Apply`] is ever started then [`Event::Cleanup`] must succeed
/// before the object deletion completes.
///
/// # Assumptions
///
/// `finalizer_name` must be unique among the controllers interacting with the
/// object.
///
/// [`Event::Apply`] and [`Event::Cleanup`] must both be idempotent, and
/// tolerate being executed several times (even if previously cancelled).
///
/// [`Event::Cleanup`] must tolerate [`Event::Apply`] never having ran at all,
/// or never having succeeded. Keep in mind that even infallible `.await`s are
/// cancellation points.
///
/// # Caveats
///
/// Object deletes will get stuck while the controller is not running, or if
/// `cleanup` fails for some reason.
///
/// `reconcile` should take the object that the [`Event`] contains, rather
/// than trying to reuse `obj`, since it may have been updated.
pub async fn finalizer<K, ReconcileFut>(
    client: &Arc<dyn ApiClient>,
    finalizer_name: &str,
    dyntype: &K::DynamicType,
    obj: Arc<K>,
    reconcile: impl FnOnce(Event<K>) -> ReconcileFut,
) -> Result<Action, Error<ReconcileFut::Error>>
where
    K: Resource + Clone + Debug,
    ReconcileFut: TryFuture<Ok = Action>,
    ReconcileFut::Error: StdError + 'static,
{
    validate_identifier(finalizer_name)
        .map_err(|InvalidIdentifier(id)| Error::InvalidIdentifier(id))?;
    let gvr = K::gvr(dyntype);
    match FinalizerState::for_object(&*obj, finalizer_name) {
        FinalizerState {
            finalizer_index: Some(_),
            is_deleting: false,
        } => reconcile(Event::Apply(obj))
            .into_future()
            .await
            .map_err(Error::ApplyFailed),
        FinalizerState {
            finalizer_index: Some(finalizer_i),
            is_deleting: true,
        } => {
            // Cleanup reconciliation must succeed before it's safe to remove
            // the finalizer
            let name = obj.meta().name.clone().ok_or(Error::UnnamedObject)?;
            let namespace = obj.namespace();
            let action = reconcile(Event::Cleanup(obj))
                .into_future()
                .await
                // Short-circuit, so that we keep the finalizer if cleanup fails
                .map_err(|err| Error::CleanupFailed {
                    identifier: finalizer_name.to_string(),
                    source: err,
                })?;
            // Cleanup was successful, remove the finalizer so that deletion can continue
            client
                .patch(
                    &gvr,
                    namespace.as_deref(),
                    &name,
                    &Patch::Json(remove_finalizer_patch(finalizer_name, finalizer_i)),
                )
                .await
                .map_err(Error::RemoveFinalizer)?;
            Ok(action)
        }
        FinalizerState {
            finalizer_index: None,
            is_deleting: false,
        } => {
            // Finalizer must be added before it's safe to run an `Apply`
            // reconciliation
            let name = obj.meta().name.clone().ok_or(Error::UnnamedObject)?;
            client
                .patch(
                    &gvr,
                    obj.namespace().as_deref(),
                    &name,
                    &Patch::Json(add_finalizer_patch(&*obj, finalizer_name)),
                )
                .await
                .map_err(Error::AddFinalizer)?;
            // No point applying here, since the patch will cause a new reconciliation
            Ok(Action::await_change())
        }
        FinalizerState {
            finalizer_index: None,
            is_deleting: true,
        } => {
            // Our work here is done
            Ok(Action::await_change())
        }
    }
}

/// A representation of an action that should be taken by a reconciler.
pub enum Event<K> {
    /// The reconciler should ensure that the actual state matches the state
    /// desired in the object.
    ///
    /// This must be idempotent, since it may be recalled if, for example
    /// (this list is non-exhaustive):
    ///
    /// - The controller is restarted
    /// - The object is updated
    /// - The reconciliation fails
    Apply(Arc<K>),
    /// The object is being deleted, and the reconciler should remove all
    /// resources that it owns.
    ///
    /// This must be idempotent, since it may be recalled if, for example
    /// (this list is non-exhaustive):
    ///
    /// - The controller is restarted while the deletion is in progress
    /// - The reconciliation fails
    /// - Another finalizer was removed in the meantime
    Cleanup(Arc<K>),
}

/// Whether a registered finalizer is attached to objects automatically
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterMode {
    /// The identifier is added to any reconciled object that lacks it
    Auto,
    /// The identifier is only honored during cleanup; attaching it is the
    /// application's responsibility
    Manual,
}

type Handler<K, E> = Arc<dyn Fn(Arc<K>) -> BoxFuture<'static, Result<(), E>> + Send + Sync>;

struct RegisteredFinalizer<K, E> {
    identifier: String,
    mode: RegisterMode,
    handler: Handler<K, E>,
}

/// An ordered registry of finalizers for one resource kind.
///
/// Each reconcile starts with [`FinalizerSet::reconcile`]: while the object
/// is live the set keeps every auto-registered identifier attached; once the
/// object carries a `deletionTimestamp` the handlers run in registration
/// order, each successful handler removing its identifier, until the server
/// can complete the deletion.
pub struct FinalizerSet<K: Resource, E> {
    client: Arc<dyn ApiClient>,
    dyntype: K::DynamicType,
    finalizers: Vec<RegisteredFinalizer<K, E>>,
}

impl<K, E> FinalizerSet<K, E>
where
    K: Resource + Clone + Debug,
    K::DynamicType: Clone,
    E: StdError + 'static,
{
    pub fn new(client: Arc<dyn ApiClient>, dyntype: K::DynamicType) -> Self {
        Self {
            client,
            dyntype,
            finalizers: Vec::new(),
        }
    }

    /// Register a finalizer handler under `identifier`.
    ///
    /// Handlers run in registration order during deletion. Registration
    /// fails if the identifier is malformed or longer than 63 characters.
    pub fn register(
        mut self,
        identifier: &str,
        mode: RegisterMode,
        handler: impl Fn(Arc<K>) -> BoxFuture<'static, Result<(), E>> + Send + Sync + 'static,
    ) -> Result<Self, InvalidIdentifier> {
        validate_identifier(identifier)?;
        self.finalizers.push(RegisteredFinalizer {
            identifier: identifier.to_string(),
            mode,
            handler: Arc::new(handler),
        });
        Ok(self)
    }

    /// The registered identifiers, in registration order
    pub fn identifiers(&self) -> impl Iterator<Item = &str> {
        self.finalizers.iter().map(|f| f.identifier.as_str())
    }

    /// Run the finalizer lifecycle for `obj`, deferring to `apply` while the
    /// object is live and all auto-registered identifiers are attached.
    pub async fn reconcile<ReconcileFut>(
        &self,
        obj: Arc<K>,
        apply: impl FnOnce(Arc<K>) -> ReconcileFut,
    ) -> Result<Action, Error<E>>
    where
        ReconcileFut: TryFuture<Ok = Action, Error = E>,
    {
        if obj.meta().deletion_timestamp.is_some() {
            self.cleanup(obj).await
        } else if self.ensure_attached(&obj).await? {
            // the patch produces a fresh watch event which resumes reconciliation
            Ok(Action::await_change())
        } else {
            apply(obj).into_future().await.map_err(Error::ApplyFailed)
        }
    }

    /// Attach missing auto-registered identifiers.
    ///
    /// Returns true when a patch was issued. The patch carries the full
    /// desired list, making a double application a no-op.
    async fn ensure_attached(&self, obj: &K) -> Result<bool, Error<E>> {
        let current = obj.finalizers();
        let missing = self
            .finalizers
            .iter()
            .filter(|f| f.mode == RegisterMode::Auto && !current.iter().any(|c| *c == f.identifier))
            .map(|f| f.identifier.clone())
            .collect::<Vec<_>>();
        if missing.is_empty() {
            return Ok(false);
        }
        let name = obj.meta().name.clone().ok_or(Error::UnnamedObject)?;
        let desired = current.iter().cloned().chain(missing).collect::<Vec<_>>();
        self.client
            .patch(
                &K::gvr(&self.dyntype),
                obj.namespace().as_deref(),
                &name,
                &Patch::Strategic(json!({ "metadata": { "finalizers": desired } })),
            )
            .await
            .map_err(Error::AddFinalizer)?;
        Ok(true)
    }

    /// Run handlers for every still-attached identifier, in registration
    /// order, removing each identifier as its handler succeeds.
    ///
    /// A failing handler keeps its identifier attached and surfaces the
    /// error, so the reconcile is requeued and deletion stays blocked.
    async fn cleanup(&self, obj: Arc<K>) -> Result<Action, Error<E>> {
        let name = obj.meta().name.clone().ok_or(Error::UnnamedObject)?;
        let namespace = obj.namespace();
        let gvr = K::gvr(&self.dyntype);
        // indices are maintained against this local copy; the `test` ops in
        // each removal patch guard against concurrent modification
        let mut remaining: Vec<String> = obj.finalizers().to_vec();
        for registered in &self.finalizers {
            let Some(index) = remaining.iter().position(|f| *f == registered.identifier) else {
                continue;
            };
            (registered.handler)(obj.clone())
                .await
                .map_err(|err| Error::CleanupFailed {
                    identifier: registered.identifier.clone(),
                    source: err,
                })?;
            self.client
                .patch(
                    &gvr,
                    namespace.as_deref(),
                    &name,
                    &Patch::Json(remove_finalizer_patch(&registered.identifier, index)),
                )
                .await
                .map_err(Error::RemoveFinalizer)?;
            remaining.remove(index);
        }
        Ok(Action::await_change())
    }
}
