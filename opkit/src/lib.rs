//! opkit is the core runtime of a Kubernetes operator framework: the library
//! an application links against to continuously reconcile observed cluster
//! state toward a declared desired state.
//!
//! The crate is a facade over the two layers of the workspace:
//!
//! - [`core`] ([`opkit_core`]) contains the apimachinery-shaped vocabulary:
//!   group/version identifiers, metadata accessors, dynamic objects,
//!   list/watch/patch parameters, admission types, and the [`ApiClient`]
//!   capability the runtime consumes instead of shipping an HTTP client.
//! - [`runtime`] ([`opkit_runtime`]) contains the machinery: watcher,
//!   reflector cache, the deduplicating per-object event queue and its
//!   reconcile loop, finalizer lifecycle, lease-based leader election,
//!   the admission webhook server, and the controller manager.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use opkit::{
//!     runtime::controller::{default_error_policy, Action, Context, Controller},
//!     ApiClient, ApiResource, DynamicObject, GroupVersionKind, ListParams,
//! };
//! use futures::StreamExt;
//!
//! async fn run(client: Arc<dyn ApiClient>) {
//!     let widgets = ApiResource::from_gvk(&GroupVersionKind::gvk("example.io", "v1", "Widget"));
//!     Controller::<DynamicObject>::new_with(client, ListParams::default(), widgets)
//!         .shutdown_on_signal()
//!         .run(
//!             |obj, _ctx| async move {
//!                 println!("reconciling {:?}", obj.metadata.name);
//!                 Ok::<_, std::io::Error>(Action::requeue(Duration::from_secs(3600)))
//!             },
//!             default_error_policy,
//!             Context::new(()),
//!         )
//!         .for_each(|res| async move {
//!             if let Err(err) = res {
//!                 eprintln!("reconcile failed: {err}");
//!             }
//!         })
//!         .await;
//! }
//! ```

pub use opkit_core as core;
pub use opkit_runtime as runtime;

pub use opkit_core::{
    admission, ApiClient, ApiResource, ClientError, DynamicObject, ErrorResponse, GroupVersion,
    GroupVersionKind, GroupVersionResource, ListParams, ObjectList, ObjectMeta, Patch, Resource,
    ResourceExt, TypeMeta, WatchEvent,
};
pub use opkit_runtime::{
    controller::{Action, Context},
    finalizer,
    manager::{ControllerManager, ManagerConfig},
    reflector::{ObjectRef, Store},
    watcher,
    webhook::WebhookServer,
    Controller, LeaderElector, LeaderState,
};

/// Commonly used types, for glob imports
pub mod prelude {
    pub use crate::{
        Action, ApiClient, ApiResource, Context, Controller, ControllerManager, DynamicObject,
        GroupVersionKind, GroupVersionResource, ListParams, ManagerConfig, ObjectRef, Patch,
        Resource, ResourceExt, Store,
    };
}
