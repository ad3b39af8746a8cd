//! Metadata structs used in traits and dynamic objects.
pub use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ListMeta, ObjectMeta};
use serde::{Deserialize, Serialize};

/// Type information that is flattened into every kubernetes object
#[derive(Deserialize, Serialize, Clone, Default, Debug, Eq, PartialEq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct TypeMeta {
    /// The version of the API
    pub api_version: String,

    /// The name of the API
    pub kind: String,
}

impl TypeMeta {
    /// Construct a new `TypeMeta` for the object from the [`Resource`](crate::Resource) trait.
    pub fn resource<K: crate::Resource>(dt: &K::DynamicType) -> Self {
        TypeMeta {
            api_version: K::api_version(dt).into(),
            kind: K::kind(dt).into(),
        }
    }
}
