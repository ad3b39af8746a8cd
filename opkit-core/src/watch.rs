//! Types for the watch wire protocol
//!
//! See <https://kubernetes.io/docs/reference/using-api/api-concepts/#efficient-detection-of-changes>

use crate::{error::ErrorResponse, metadata::TypeMeta};
use serde::{Deserialize, Serialize};
use std::fmt::Debug;

/// A raw event returned from a watch query
///
/// Note that a watch query returns many of these as newline separated JSON.
#[derive(Deserialize, Serialize, Clone)]
#[serde(tag = "type", content = "object", rename_all = "UPPERCASE")]
pub enum WatchEvent<K> {
    /// Resource was added
    Added(K),
    /// Resource was modified
    Modified(K),
    /// Resource was deleted
    Deleted(K),
    /// Resource bookmark. `Bookmark` is a slimmed down `K`; only its
    /// resourceVersion can be relied upon.
    ///
    /// From [Watch bookmarks](https://kubernetes.io/docs/reference/using-api/api-concepts/#watch-bookmarks).
    Bookmark(Bookmark),
    /// There was some kind of error
    Error(ErrorResponse),
}

impl<K> Debug for WatchEvent<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match &self {
            WatchEvent::Added(_) => write!(f, "Added event"),
            WatchEvent::Modified(_) => write!(f, "Modified event"),
            WatchEvent::Deleted(_) => write!(f, "Deleted event"),
            WatchEvent::Bookmark(_) => write!(f, "Bookmark event"),
            WatchEvent::Error(e) => write!(f, "Error event: {e:?}"),
        }
    }
}

/// Slimmed down K for [`WatchEvent::Bookmark`].
///
/// Bookmarks contain apiVersion + kind + basically empty metadata.
#[derive(Serialize, Deserialize, Clone)]
pub struct Bookmark {
    /// apiVersion + kind
    #[serde(flatten)]
    pub types: TypeMeta,

    /// Basically empty metadata
    pub metadata: BookmarkMeta,
}

/// Slimmed down metadata for [`WatchEvent::Bookmark`]
#[derive(Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct BookmarkMeta {
    /// The only field we need from a Bookmark event.
    pub resource_version: String,
}

#[cfg(test)]
mod tests {
    use super::WatchEvent;
    use serde_json::json;

    #[test]
    fn watch_frames_deserialize_by_tag() {
        let added: WatchEvent<serde_json::Value> = serde_json::from_value(json!({
            "type": "ADDED",
            "object": { "metadata": { "name": "a", "resourceVersion": "1" } },
        }))
        .unwrap();
        assert!(matches!(added, WatchEvent::Added(_)));

        let bookmark: WatchEvent<serde_json::Value> = serde_json::from_value(json!({
            "type": "BOOKMARK",
            "object": {
                "apiVersion": "example.io/v1",
                "kind": "Widget",
                "metadata": { "resourceVersion": "42" },
            },
        }))
        .unwrap();
        match bookmark {
            WatchEvent::Bookmark(bm) => assert_eq!(bm.metadata.resource_version, "42"),
            other => panic!("expected bookmark, got {other:?}"),
        }

        let error: WatchEvent<serde_json::Value> = serde_json::from_value(json!({
            "type": "ERROR",
            "object": { "status": "Failure", "message": "too old", "reason": "Expired", "code": 410 },
        }))
        .unwrap();
        match error {
            WatchEvent::Error(e) => assert!(e.is_expired()),
            other => panic!("expected error, got {other:?}"),
        }
    }
}
