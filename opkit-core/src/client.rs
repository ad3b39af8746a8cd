//! The API client capability the runtime consumes.
//!
//! opkit does not ship an HTTP client; the embedding application supplies one
//! by implementing [`ApiClient`]. The trait is deliberately narrow: the five
//! operations the runtime needs, expressed over raw JSON values so the trait
//! stays object-safe while the runtime layers typed deserialization on top.

use crate::{error::ErrorResponse, gvk::GroupVersionResource, params::ListParams, params::Patch, watch::WatchEvent};
use async_trait::async_trait;
use futures::stream::BoxStream;
use k8s_openapi::api::coordination::v1::Lease;
use thiserror::Error;

/// Errors surfaced by an [`ApiClient`] implementation.
///
/// The runtime routes on the *kind* of failure rather than the transport:
/// expiry restarts a list, conflicts and transients requeue, rejections do not.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The apiserver returned an error status
    #[error("api error: {0}")]
    Api(#[source] ErrorResponse),
    /// The request did not complete within the client's deadline
    #[error("request timed out")]
    Timeout,
    /// Connection-level failure before a status was received
    #[error("transport error: {0}")]
    Transport(String),
}

impl ClientError {
    /// The HTTP status code, when one was received
    pub fn status_code(&self) -> Option<u16> {
        match self {
            ClientError::Api(e) => Some(e.code),
            _ => None,
        }
    }

    /// The supplied resourceVersion is too old and a relist is required (410 / "Expired")
    pub fn is_expired(&self) -> bool {
        matches!(self, ClientError::Api(e) if e.is_expired())
    }

    /// Optimistic-concurrency conflict (409); retry after re-reading
    pub fn is_conflict(&self) -> bool {
        self.status_code() == Some(409)
    }

    /// A non-retryable rejection: validation or permission failure (4xx other
    /// than 409, 410 and 429)
    pub fn is_rejection(&self) -> bool {
        match self.status_code() {
            Some(code) => (400..500).contains(&code) && !matches!(code, 409 | 410 | 429),
            None => false,
        }
    }

    /// Anything worth retrying with backoff: 5xx, 429, timeouts, transport errors
    pub fn is_transient(&self) -> bool {
        !self.is_rejection() && !self.is_expired() && !self.is_conflict()
    }
}

/// The result of a collection list: raw items plus the collection's
/// resourceVersion, which a subsequent watch resumes from.
#[derive(Debug, Clone)]
pub struct ObjectList {
    /// Serialized objects in the collection
    pub items: Vec<serde_json::Value>,
    /// The resourceVersion of the collection at list time
    pub resource_version: String,
}

/// A stream of raw watch frames from the apiserver
pub type WatchStream = BoxStream<'static, Result<WatchEvent<serde_json::Value>, ClientError>>;

/// The Kubernetes API operations the runtime requires.
///
/// `namespace: None` addresses the cluster scope. Implementations are expected
/// to retry transient transport hiccups internally where cheap; anything
/// surfaced here is handled by the runtime's own error routing.
#[async_trait]
pub trait ApiClient: Send + Sync + 'static {
    /// List a collection, optionally from a specific resourceVersion
    /// (empty string means "most recent").
    async fn list(
        &self,
        gvr: &GroupVersionResource,
        namespace: Option<&str>,
        params: &ListParams,
        resource_version: &str,
    ) -> Result<ObjectList, ClientError>;

    /// Open a watch on a collection from the given resourceVersion.
    async fn watch(
        &self,
        gvr: &GroupVersionResource,
        namespace: Option<&str>,
        params: &ListParams,
        resource_version: &str,
        allow_bookmarks: bool,
    ) -> Result<WatchStream, ClientError>;

    /// Patch a named object, returning the updated object.
    async fn patch(
        &self,
        gvr: &GroupVersionResource,
        namespace: Option<&str>,
        name: &str,
        patch: &Patch,
    ) -> Result<serde_json::Value, ClientError>;

    /// Replace a named object, returning the updated object.
    async fn update(
        &self,
        gvr: &GroupVersionResource,
        namespace: Option<&str>,
        name: &str,
        object: &serde_json::Value,
    ) -> Result<serde_json::Value, ClientError>;

    /// Fetch a coordination Lease, `None` if it does not exist.
    async fn get_lease(&self, namespace: &str, name: &str) -> Result<Option<Lease>, ClientError>;

    /// Create the Lease if absent, otherwise update it.
    ///
    /// Implementations must preserve apiserver optimistic concurrency: an
    /// update racing another holder surfaces as a 409 conflict.
    async fn create_or_update_lease(&self, lease: &Lease) -> Result<Lease, ClientError>;
}

#[cfg(test)]
mod tests {
    use super::ClientError;
    use crate::error::ErrorResponse;

    fn api_err(code: u16, reason: &str) -> ClientError {
        ClientError::Api(ErrorResponse {
            status: "Failure".into(),
            message: String::new(),
            reason: reason.into(),
            code,
        })
    }

    #[test]
    fn error_routing_predicates_partition() {
        assert!(api_err(410, "Expired").is_expired());
        assert!(api_err(409, "Conflict").is_conflict());
        assert!(api_err(403, "Forbidden").is_rejection());
        assert!(api_err(422, "Invalid").is_rejection());
        assert!(api_err(429, "TooManyRequests").is_transient());
        assert!(api_err(500, "InternalError").is_transient());
        assert!(ClientError::Timeout.is_transient());
        assert!(ClientError::Transport("reset".into()).is_transient());
        // each error belongs to exactly one route
        for e in [api_err(410, "Expired"), api_err(409, ""), api_err(404, "")] {
            let routes = [e.is_expired(), e.is_conflict(), e.is_rejection(), e.is_transient()];
            assert_eq!(routes.iter().filter(|r| **r).count(), 1, "{e:?}");
        }
    }
}
