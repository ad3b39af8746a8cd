//! Client-less core types for the opkit operator runtime.
//!
//! This crate defines the apimachinery-shaped vocabulary the runtime is built
//! from: group/version identifiers, object metadata accessors, dynamic
//! objects, list/watch/patch parameters, the watch wire protocol, admission
//! review envelopes, and the [`ApiClient`](client::ApiClient) capability the
//! runtime consumes instead of carrying its own HTTP client.

pub mod admission;
pub mod client;
pub mod dynamic;
pub mod error;
pub mod gvk;
pub mod metadata;
pub mod params;
pub mod resource;
pub mod watch;

pub use client::{ApiClient, ClientError, ObjectList};
pub use dynamic::{ApiResource, DynamicObject};
pub use error::{ErrorResponse, Status};
pub use gvk::{GroupVersion, GroupVersionKind, GroupVersionResource};
pub use metadata::{ObjectMeta, TypeMeta};
pub use params::{ListParams, Patch};
pub use resource::{Resource, ResourceExt};
pub use watch::WatchEvent;
