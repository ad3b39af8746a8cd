//! Type information structs for API discovery
use std::str::FromStr;

use crate::metadata::TypeMeta;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
#[error("failed to parse group version: {0}")]
/// Failed to parse group version
pub struct ParseGroupVersionError(pub String);

/// Core information about an API Resource.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct GroupVersionKind {
    /// API group
    pub group: String,
    /// Version
    pub version: String,
    /// Kind
    pub kind: String,
}

impl GroupVersionKind {
    /// Construct from explicit group, version, and kind
    pub fn gvk(group_: &str, version_: &str, kind_: &str) -> Self {
        Self {
            group: group_.to_string(),
            version: version_.to_string(),
            kind: kind_.to_string(),
        }
    }

    /// Generate the apiVersion string used in a kind's yaml
    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }
}

impl TryFrom<&TypeMeta> for GroupVersionKind {
    type Error = ParseGroupVersionError;

    fn try_from(tm: &TypeMeta) -> Result<Self, Self::Error> {
        Ok(GroupVersion::from_str(&tm.api_version)?.with_kind(&tm.kind))
    }
}

/// Core information about a family of API Resources
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct GroupVersion {
    /// API group
    pub group: String,
    /// Version
    pub version: String,
}

impl GroupVersion {
    /// Construct from explicit group and version
    pub fn gv(group_: &str, version_: &str) -> Self {
        Self {
            group: group_.to_string(),
            version: version_.to_string(),
        }
    }

    /// Upgrade a GroupVersion to a GroupVersionKind
    pub fn with_kind(self, kind: &str) -> GroupVersionKind {
        GroupVersionKind {
            group: self.group,
            version: self.version,
            kind: kind.into(),
        }
    }

    /// Generate the apiVersion string used in a kind's yaml
    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }
}

impl FromStr for GroupVersion {
    type Err = ParseGroupVersionError;

    fn from_str(gv: &str) -> Result<Self, Self::Err> {
        let gvsplit = gv.splitn(2, '/').collect::<Vec<_>>();
        let (group, version) = match *gvsplit.as_slice() {
            [g, v] => (g.to_string(), v.to_string()), // standard case
            [v] => ("".to_string(), v.to_string()),   // core v1 case
            _ => return Err(ParseGroupVersionError(gv.into())),
        };
        Ok(Self { group, version })
    }
}

/// Represents a type-erased resource surface, the unit a watch or patch targets.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct GroupVersionResource {
    /// API group
    pub group: String,
    /// Version
    pub version: String,
    /// Resource (plural name)
    pub resource: String,
    /// Concatenation of group and version
    #[serde(default)]
    api_version: String,
}

impl GroupVersionResource {
    /// Set the api group, version, and the plural resource name.
    pub fn gvr(group_: &str, version_: &str, resource_: &str) -> Self {
        let group = group_.to_string();
        let version = version_.to_string();
        let api_version = if group.is_empty() {
            version.clone()
        } else {
            format!("{group}/{version}")
        };
        Self {
            group,
            version,
            resource: resource_.to_string(),
            api_version,
        }
    }

    /// Generate the apiVersion string used in a kind's yaml
    pub fn api_version(&self) -> &str {
        &self.api_version
    }
}

#[cfg(test)]
mod tests {
    use super::{GroupVersion, GroupVersionKind, GroupVersionResource};
    use std::str::FromStr;

    #[test]
    fn gv_parses_both_formats() {
        let gv = GroupVersion::from_str("apps/v1").unwrap();
        assert_eq!((gv.group.as_str(), gv.version.as_str()), ("apps", "v1"));
        let core = GroupVersion::from_str("v1").unwrap();
        assert_eq!((core.group.as_str(), core.version.as_str()), ("", "v1"));
        assert_eq!(core.api_version(), "v1");
    }

    #[test]
    fn gvk_api_version_elides_core_group() {
        let gvk = GroupVersionKind::gvk("", "v1", "Pod");
        assert_eq!(gvk.api_version(), "v1");
        let gvk = GroupVersionKind::gvk("example.io", "v1alpha1", "Widget");
        assert_eq!(gvk.api_version(), "example.io/v1alpha1");
    }

    #[test]
    fn gvr_tracks_api_version() {
        let gvr = GroupVersionResource::gvr("example.io", "v1", "widgets");
        assert_eq!(gvr.api_version(), "example.io/v1");
    }
}
