use opkit_core::{
    dynamic::{ApiResource, DynamicObject},
    resource::{Resource, ResourceExt},
};
use std::{
    fmt::{Debug, Display},
    hash::{Hash, Hasher},
};

/// A typed and namespaced (if relevant) reference to an object
///
/// `K` may be either the object type or `DynamicObject`, in which case the
/// type is stored at runtime. Erased `ObjectRef`s pointing to different types
/// are still considered different.
///
/// ```
/// use opkit_runtime::reflector::ObjectRef;
/// use k8s_openapi::api::coordination::v1::Lease;
/// use k8s_openapi::api::core::v1::ConfigMap;
/// assert_ne!(
///     ObjectRef::<Lease>::new("a").erase(),
///     ObjectRef::<ConfigMap>::new("a").erase(),
/// );
/// ```
pub struct ObjectRef<K: Resource> {
    /// The type descriptor of the object
    pub dyntype: K::DynamicType,
    /// The name of the object
    pub name: String,
    /// The namespace of the object
    ///
    /// May only be `None` if the kind is cluster-scoped (not located in a
    /// namespace). Note that it *is* acceptable for an `ObjectRef` to a
    /// cluster-scoped resource to have a namespace. These are, however, not
    /// considered equal.
    pub namespace: Option<String>,
}

impl<K: Resource> ObjectRef<K>
where
    K::DynamicType: Default,
{
    /// Reference an object by name, with the default type descriptor
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self::new_with(name, Default::default())
    }

    /// Reference `obj`, with the default type descriptor
    #[must_use]
    pub fn from_obj(obj: &K) -> Self {
        Self::from_obj_with(obj, Default::default())
    }
}

impl<K: Resource> ObjectRef<K> {
    /// Reference an object by name and type descriptor
    #[must_use]
    pub fn new_with(name: &str, dyntype: K::DynamicType) -> Self {
        Self {
            dyntype,
            name: name.into(),
            namespace: None,
        }
    }

    /// Scope the reference to a namespace
    #[must_use]
    pub fn within(mut self, namespace: &str) -> Self {
        self.namespace = Some(namespace.to_string());
        self
    }

    /// Creates an `ObjectRef` from the resource and its type descriptor.
    ///
    /// Falls back to `name_any` since objects received from the apiserver
    /// always carry a name.
    #[must_use]
    pub fn from_obj_with(obj: &K, dyntype: K::DynamicType) -> Self {
        Self {
            dyntype,
            name: obj.name_any(),
            namespace: obj.namespace(),
        }
    }

    /// Convert into a reference to `K2`
    ///
    /// Note that no checking is done on whether this conversion makes sense.
    #[must_use]
    pub fn into_kind_unchecked<K2: Resource>(self, dt2: K2::DynamicType) -> ObjectRef<K2> {
        ObjectRef {
            dyntype: dt2,
            name: self.name,
            namespace: self.namespace,
        }
    }

    /// Erase the type of this reference, moving the type identity into the
    /// runtime descriptor
    pub fn erase(self) -> ObjectRef<DynamicObject> {
        ObjectRef {
            dyntype: ApiResource::erase::<K>(&self.dyntype),
            name: self.name,
            namespace: self.namespace,
        }
    }
}

impl<K: Resource> Clone for ObjectRef<K>
where
    K::DynamicType: Clone,
{
    fn clone(&self) -> Self {
        Self {
            dyntype: self.dyntype.clone(),
            name: self.name.clone(),
            namespace: self.namespace.clone(),
        }
    }
}

impl<K: Resource> Debug for ObjectRef<K>
where
    K::DynamicType: Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectRef")
            .field("dyntype", &self.dyntype)
            .field("name", &self.name)
            .field("namespace", &self.namespace)
            .finish()
    }
}

impl<K: Resource> PartialEq for ObjectRef<K>
where
    K::DynamicType: PartialEq,
{
    fn eq(&self, other: &Self) -> bool {
        self.dyntype == other.dyntype && self.name == other.name && self.namespace == other.namespace
    }
}

impl<K: Resource> Eq for ObjectRef<K> where K::DynamicType: Eq {}

impl<K: Resource> Hash for ObjectRef<K>
where
    K::DynamicType: Hash,
{
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.dyntype.hash(state);
        self.name.hash(state);
        self.namespace.hash(state);
    }
}

impl<K: Resource> Display for ObjectRef<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}.{}.{}/{}",
            K::kind(&self.dyntype),
            K::version(&self.dyntype),
            K::group(&self.dyntype),
            self.name
        )?;
        if let Some(namespace) = &self.namespace {
            write!(f, ".{namespace}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::ObjectRef;
    use k8s_openapi::api::coordination::v1::Lease;

    #[test]
    fn display_follows_expected_format() {
        assert_eq!(
            format!("{}", ObjectRef::<Lease>::new("mylease").within("ns")),
            "Lease.v1.coordination.k8s.io/mylease.ns"
        );
    }

    #[test]
    fn display_is_transparent_to_erasure() {
        let leaseref = ObjectRef::<Lease>::new("mylease").within("ns");
        assert_eq!(format!("{leaseref}"), format!("{}", leaseref.clone().erase()));
    }

    #[test]
    fn namespace_participates_in_identity() {
        assert_ne!(
            ObjectRef::<Lease>::new("a"),
            ObjectRef::<Lease>::new("a").within("ns")
        );
    }
}
