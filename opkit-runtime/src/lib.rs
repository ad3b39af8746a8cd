//! Controller runtime for the opkit operator framework.
//!
//! Layered loosely on the shape of client-go's controller machinery:
//!
//! - [`watcher`] — resilient LIST+WATCH streams over an
//!   [`ApiClient`](opkit_core::client::ApiClient) capability
//! - [`reflector`] — an in-memory cache of watched objects with monotonic
//!   resourceVersion handling
//! - [`event_queue`] + [`controller`] — the deduplicating, per-object
//!   serialized reconcile loop
//! - [`finalizer`] — pre-deletion hooks that provably run to completion
//! - [`elector`] — lease-based leader election gating controller activity
//! - [`webhook`] + [`patch`] — admission webhook dispatch with JSON-patch
//!   synthesis
//! - [`manager`] — lifecycle orchestration, probes and graceful shutdown

pub mod controller;
pub mod elector;
pub mod event_queue;
pub mod finalizer;
pub mod manager;
pub mod metrics;
pub mod patch;
pub mod rate_limit;
pub mod reflector;
pub mod utils;
pub mod watcher;
pub mod webhook;

pub use controller::{applier, Action, Context, Controller};
pub use elector::{LeaderElector, LeaderState};
pub use event_queue::EventQueue;
pub use finalizer::{finalizer, FinalizerSet};
pub use manager::{ControllerManager, ManagerConfig};
pub use reflector::{reflector, ObjectRef, Store};
pub use watcher::watcher;
pub use webhook::WebhookServer;
