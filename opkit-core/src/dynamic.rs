//! Contains types for using resource kinds not known at compile-time.

use crate::{
    gvk::{GroupVersionKind, GroupVersionResource},
    metadata::{ObjectMeta, TypeMeta},
    resource::Resource,
};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;

/// Information about a Kubernetes API resource
///
/// Enough information to use it like a `Resource` by passing it to the
/// dynamic `Api` surface and the runtime constructors.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ApiResource {
    /// Resource group, empty for core group.
    pub group: String,
    /// group version
    pub version: String,
    /// apiVersion of the resource (v1 for core group,
    /// groupName/groupVersions for other).
    pub api_version: String,
    /// Singular PascalCase name of the resource
    pub kind: String,
    /// Plural name of the resource
    pub plural: String,
}

impl ApiResource {
    /// Creates an ApiResource by type-erasing a statically known `Resource`
    pub fn erase<K: Resource>(dt: &K::DynamicType) -> ApiResource {
        ApiResource {
            group: K::group(dt).to_string(),
            version: K::version(dt).to_string(),
            api_version: K::api_version(dt).to_string(),
            kind: K::kind(dt).to_string(),
            plural: K::plural(dt).to_string(),
        }
    }

    /// Creates an ApiResource from group, version, kind and plural name.
    pub fn from_gvk_with_plural(gvk: &GroupVersionKind, plural: &str) -> Self {
        ApiResource {
            api_version: gvk.api_version(),
            group: gvk.group.clone(),
            version: gvk.version.clone(),
            kind: gvk.kind.clone(),
            plural: plural.to_string(),
        }
    }

    /// Creates an ApiResource from group, version and kind.
    ///
    /// If the plural name is known, prefer [`ApiResource::from_gvk_with_plural`];
    /// pluralization otherwise goes through the same inference the static
    /// `Resource` default uses, which can be wrong for exotic kinds.
    pub fn from_gvk(gvk: &GroupVersionKind) -> Self {
        ApiResource::from_gvk_with_plural(
            gvk,
            &crate::resource::to_plural(&gvk.kind.to_ascii_lowercase()),
        )
    }

    /// The group-version-resource triple for this resource
    pub fn to_gvr(&self) -> GroupVersionResource {
        GroupVersionResource::gvr(&self.group, &self.version, &self.plural)
    }
}

/// A dynamic representation of a kubernetes object
///
/// This will work with any non-list type object.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct DynamicObject {
    /// The type fields, not always present
    #[serde(flatten, default)]
    pub types: Option<TypeMeta>,
    /// Object metadata
    #[serde(default)]
    pub metadata: ObjectMeta,

    /// All other keys
    #[serde(flatten)]
    pub data: serde_json::Value,
}

impl DynamicObject {
    /// Create a DynamicObject with minimal values set from ApiResource.
    #[must_use]
    pub fn new(name: &str, resource: &ApiResource) -> Self {
        Self {
            types: Some(TypeMeta {
                api_version: resource.api_version.to_string(),
                kind: resource.kind.to_string(),
            }),
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            data: serde_json::Value::Null,
        }
    }

    /// Attach dynamic data to a DynamicObject
    #[must_use]
    pub fn data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }

    /// Attach a namespace to a DynamicObject
    #[must_use]
    pub fn within(mut self, ns: &str) -> Self {
        self.metadata.namespace = Some(ns.into());
        self
    }
}

impl Resource for DynamicObject {
    type DynamicType = ApiResource;

    fn group(dt: &ApiResource) -> Cow<'_, str> {
        dt.group.as_str().into()
    }

    fn version(dt: &ApiResource) -> Cow<'_, str> {
        dt.version.as_str().into()
    }

    fn kind(dt: &ApiResource) -> Cow<'_, str> {
        dt.kind.as_str().into()
    }

    fn api_version(dt: &ApiResource) -> Cow<'_, str> {
        dt.api_version.as_str().into()
    }

    fn plural(dt: &ApiResource) -> Cow<'_, str> {
        dt.plural.as_str().into()
    }

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

#[cfg(test)]
mod tests {
    use super::{ApiResource, DynamicObject};
    use crate::{gvk::GroupVersionKind, resource::ResourceExt};
    use serde_json::json;

    #[test]
    fn dynamic_object_round_trips_unknown_fields() {
        let obj: DynamicObject = serde_json::from_value(json!({
            "apiVersion": "example.io/v1",
            "kind": "Widget",
            "metadata": { "name": "w1", "namespace": "ns", "resourceVersion": "5" },
            "spec": { "replicas": 3 },
        }))
        .unwrap();
        assert_eq!(obj.name_any(), "w1");
        assert_eq!(obj.resource_version().as_deref(), Some("5"));
        assert_eq!(obj.data["spec"]["replicas"], json!(3));
        let out = serde_json::to_value(&obj).unwrap();
        assert_eq!(out["spec"]["replicas"], json!(3));
        assert_eq!(out["kind"], json!("Widget"));
    }

    #[test]
    fn api_resource_pluralizes_from_gvk() {
        let gvk = GroupVersionKind::gvk("example.io", "v1", "NetworkPolicy");
        let ar = ApiResource::from_gvk(&gvk);
        assert_eq!(ar.plural, "networkpolicies");
        assert_eq!(ar.to_gvr().resource, "networkpolicies");
    }
}
