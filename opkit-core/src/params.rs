//! Request parameters for list/watch/patch calls

/// Common query parameters used in list/watch calls on collections
#[derive(Clone, Debug)]
pub struct ListParams {
    /// A selector to restrict the list of returned objects by their labels.
    ///
    /// Defaults to everything if `None`.
    pub label_selector: Option<String>,

    /// A selector to restrict the list of returned objects by their fields.
    ///
    /// Defaults to everything if `None`.
    pub field_selector: Option<String>,

    /// Timeout for the list/watch call.
    ///
    /// This limits the duration of the call, regardless of any activity or inactivity.
    /// If unset for a watch call the client picks its own default.
    /// We limit this to 295s due to [inherent watch limitations](https://github.com/kubernetes/kubernetes/issues/6513).
    pub timeout: Option<u32>,

    /// Enables watch events with type "BOOKMARK".
    ///
    /// Servers that do not implement bookmarks ignore this flag and
    /// bookmarks are sent at the server's discretion. Clients should not
    /// assume bookmarks are returned at any specific interval, nor may they
    /// assume the server will send any BOOKMARK event during a session.
    pub bookmarks: bool,
}

impl Default for ListParams {
    /// Default `ListParams` without any constricting selectors
    fn default() -> Self {
        Self {
            // bookmarks stable since 1.17, and backwards compatible
            bookmarks: true,

            label_selector: None,
            field_selector: None,
            timeout: None,
        }
    }
}

/// Builder interface to ListParams
///
/// Usage:
/// ```
/// use opkit_core::params::ListParams;
/// let lp = ListParams::default()
///     .timeout(60)
///     .labels("kubernetes.io/lifecycle=spot");
/// ```
impl ListParams {
    /// Configure the timeout for list/watch calls
    ///
    /// This limits the duration of the call, regardless of any activity or inactivity.
    #[must_use]
    pub fn timeout(mut self, timeout_secs: u32) -> Self {
        self.timeout = Some(timeout_secs);
        self
    }

    /// Configure the selector to restrict the list of returned objects by their fields.
    ///
    /// Defaults to everything.
    /// Supports `=`, `==`, `!=`, and can be comma separated: `key1=value1,key2=value2`.
    /// The server only supports a limited number of field queries per type.
    #[must_use]
    pub fn fields(mut self, field_selector: &str) -> Self {
        self.field_selector = Some(field_selector.to_string());
        self
    }

    /// Configure the selector to restrict the list of returned objects by their labels.
    ///
    /// Defaults to everything.
    /// Supports `=`, `==`, `!=`, and can be comma separated: `key1=value1,key2=value2`.
    #[must_use]
    pub fn labels(mut self, label_selector: &str) -> Self {
        self.label_selector = Some(label_selector.to_string());
        self
    }

    /// Disables watch bookmarks to simplify watch handling
    ///
    /// This is not recommended to use with production watchers as it can cause desyncs.
    #[must_use]
    pub fn disable_bookmarks(mut self) -> Self {
        self.bookmarks = false;
        self
    }
}

/// The payload of a patch call, selecting one of the supported patch
/// strategies.
///
/// The apiserver dispatches on the request content type, which
/// [`Patch::content_type`] supplies.
#[derive(Debug, Clone)]
pub enum Patch {
    /// A [JSON patch](https://kubernetes.io/docs/tasks/manage-kubernetes-objects/update-api-object-kubectl-patch/#use-a-json-patch-to-update-a-deployment)
    ///
    /// Using this variant will require you to explicitly provide a list of
    /// RFC 6902 operations.
    Json(json_patch::Patch),
    /// A regular merge patch (RFC 7386)
    Merge(serde_json::Value),
    /// A [strategic merge patch](https://kubernetes.io/docs/tasks/manage-kubernetes-objects/update-api-object-kubectl-patch/#use-a-strategic-merge-patch-to-update-a-deployment)
    Strategic(serde_json::Value),
}

impl Patch {
    /// The mime type the apiserver expects for this patch strategy
    #[must_use]
    pub fn content_type(&self) -> &'static str {
        match &self {
            Self::Json(_) => "application/json-patch+json",
            Self::Merge(_) => "application/merge-patch+json",
            Self::Strategic(_) => "application/strategic-merge-patch+json",
        }
    }

    /// Serialize the patch body
    pub fn to_value(&self) -> Result<serde_json::Value, serde_json::Error> {
        match self {
            Self::Json(p) => serde_json::to_value(p),
            Self::Merge(v) | Self::Strategic(v) => Ok(v.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{ListParams, Patch};

    #[test]
    fn listparams_builders_compose() {
        let lp = ListParams::default().labels("app=x").fields("metadata.name=y");
        assert_eq!(lp.label_selector.as_deref(), Some("app=x"));
        assert_eq!(lp.field_selector.as_deref(), Some("metadata.name=y"));
        assert!(lp.bookmarks);
    }

    #[test]
    fn patch_content_types() {
        assert_eq!(
            Patch::Merge(serde_json::json!({})).content_type(),
            "application/merge-patch+json"
        );
        assert_eq!(
            Patch::Json(json_patch::Patch(vec![])).content_type(),
            "application/json-patch+json"
        );
    }
}
