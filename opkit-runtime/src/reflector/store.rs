use super::ObjectRef;
use crate::watcher;
use ahash::AHashMap;
use opkit_core::resource::{Resource, ResourceExt};
use parking_lot::RwLock;
use std::{fmt::Debug, hash::Hash, sync::Arc};
use tokio::sync::watch as watch_channel;

/// A cached object together with its local bookkeeping.
///
/// `sequence` is a store-local monotonic counter bumped on every accepted
/// write, usable to order observations without parsing resourceVersions.
#[derive(Debug, Clone)]
pub struct CachedEntry<K> {
    /// The last accepted state of the object
    pub current: Arc<K>,
    /// The state the object had before `current` was accepted, if any
    pub previous: Option<Arc<K>>,
    /// Store-local write counter
    pub sequence: u64,
}

struct Shared<K: Resource>
where
    K::DynamicType: Eq + Hash,
{
    entries: RwLock<AHashMap<ObjectRef<K>, CachedEntry<K>>>,
    // uid -> primary key, so identity survives name reuse lookups
    uids: RwLock<AHashMap<String, ObjectRef<K>>>,
}

/// A writable handle to a reflector store
///
/// This is exclusive since it's not safe to share a single `Writer` between
/// multiple reflectors. In particular, `Restarted` events will clobber the
/// state of other connected reflectors.
pub struct Writer<K: Resource>
where
    K::DynamicType: Eq + Hash,
{
    shared: Arc<Shared<K>>,
    sequence: u64,
    ready_tx: watch_channel::Sender<bool>,
    ready_rx: watch_channel::Receiver<bool>,
    dyntype: K::DynamicType,
}

impl<K: Resource> Writer<K>
where
    K: Clone,
    K::DynamicType: Eq + Hash + Clone,
{
    /// Creates a new Writer with the specified dynamic type.
    ///
    /// For statically known types the dynamic type is `()`.
    pub fn new(dyntype: K::DynamicType) -> Self {
        let (ready_tx, ready_rx) = watch_channel::channel(false);
        Writer {
            shared: Arc::new(Shared {
                entries: RwLock::new(AHashMap::new()),
                uids: RwLock::new(AHashMap::new()),
            }),
            sequence: 0,
            ready_tx,
            ready_rx,
            dyntype,
        }
    }

    /// Return a read handle to the store
    ///
    /// Multiple read handles may be obtained, by either calling `as_reader`
    /// multiple times, or by calling `Store::clone()` afterwards.
    #[must_use]
    pub fn as_reader(&self) -> Store<K> {
        Store {
            shared: self.shared.clone(),
            ready_rx: self.ready_rx.clone(),
        }
    }

    /// Applies a single watcher event to the store
    pub fn apply_watcher_event(&mut self, event: &watcher::Event<K>) {
        match event {
            watcher::Event::Applied(obj) => {
                self.upsert(obj);
            }
            watcher::Event::Deleted(obj) => {
                let key = ObjectRef::from_obj_with(obj, self.dyntype.clone());
                self.shared.entries.write().remove(&key);
                if let Some(uid) = obj.uid() {
                    self.shared.uids.write().remove(&uid);
                }
            }
            watcher::Event::Restarted(new_objs) => {
                for obj in new_objs {
                    self.upsert(obj);
                }
                let keep = new_objs
                    .iter()
                    .map(|obj| ObjectRef::from_obj_with(obj, self.dyntype.clone()))
                    .collect::<ahash::AHashSet<_>>();
                self.shared
                    .entries
                    .write()
                    .retain(|key, _entry| keep.contains(key));
                self.shared.uids.write().retain(|_uid, key| keep.contains(key));
                // a relist means the initial LIST completed
                self.ready_tx.send_replace(true);
            }
        }
    }

    /// Upsert one object, enforcing resourceVersion monotonicity.
    ///
    /// Returns the replaced entry, which carries the `previous` snapshot a
    /// reconciler can diff against. A write whose numeric resourceVersion is
    /// older than the cached one is dropped silently; opaque non-numeric
    /// versions are always accepted.
    pub fn upsert(&mut self, obj: &K) -> Option<CachedEntry<K>> {
        let key = ObjectRef::from_obj_with(obj, self.dyntype.clone());
        let mut entries = self.shared.entries.write();
        if let Some(existing) = entries.get(&key) {
            if is_older(obj.resource_version(), existing.current.resource_version()) {
                tracing::trace!(object = %key, "dropping stale cache write");
                return None;
            }
        }
        self.sequence += 1;
        let current = Arc::new(obj.clone());
        let previous = entries.get(&key).map(|e| e.current.clone());
        let replaced = entries.insert(key.clone(), CachedEntry {
            current,
            previous,
            sequence: self.sequence,
        });
        drop(entries);
        if let Some(uid) = obj.uid() {
            self.shared.uids.write().insert(uid, key);
        }
        replaced
    }
}

/// Returns whether `candidate` is a strictly older resourceVersion than `held`.
///
/// resourceVersions are opaque, but every production apiserver hands out
/// etcd revisions, which parse as integers. When either side does not parse
/// we cannot order them and accept the write.
fn is_older(candidate: Option<String>, held: Option<String>) -> bool {
    match (
        candidate.as_deref().and_then(|rv| rv.parse::<u64>().ok()),
        held.as_deref().and_then(|rv| rv.parse::<u64>().ok()),
    ) {
        (Some(new), Some(old)) => new < old,
        _ => false,
    }
}

/// A readable cache of objects of kind `K`
///
/// Cloning will produce a new reference to the same backing store.
///
/// Cannot be constructed directly since one writer handle is required,
/// use `Writer::as_reader()` instead.
pub struct Store<K: Resource>
where
    K::DynamicType: Eq + Hash,
{
    shared: Arc<Shared<K>>,
    ready_rx: watch_channel::Receiver<bool>,
}

impl<K: Resource> Clone for Store<K>
where
    K::DynamicType: Eq + Hash,
{
    fn clone(&self) -> Self {
        Store {
            shared: self.shared.clone(),
            ready_rx: self.ready_rx.clone(),
        }
    }
}

impl<K: Resource> Store<K>
where
    K: Clone,
    K::DynamicType: Eq + Hash + Clone,
{
    /// Wait for the initial LIST to complete
    ///
    /// Objects looked up before this resolves may spuriously be missing.
    pub async fn wait_until_ready(&self) {
        let mut rx = self.ready_rx.clone();
        // sender lives as long as the writer; a dropped writer unblocks too
        let _ = rx.wait_for(|ready| *ready).await;
    }

    /// Whether the initial LIST has completed
    #[must_use]
    pub fn is_ready(&self) -> bool {
        *self.ready_rx.borrow()
    }

    /// Retrieve a `clone()` of the entry referred to by `key`, if it is in
    /// the cache.
    ///
    /// `key.namespace` is ignored for cluster-scoped resources.
    ///
    /// Note that this is a cache and may be stale. Deleted objects may still
    /// exist in the cache despite having been deleted in the cluster, and new
    /// objects may not yet exist in the cache. If any of these are a problem
    /// for you then you should abort your reconciler and retry later.
    #[must_use]
    pub fn get(&self, key: &ObjectRef<K>) -> Option<Arc<K>> {
        self.entry(key).map(|entry| entry.current)
    }

    /// Retrieve the full cache entry for `key`, exposing the `previous`
    /// snapshot alongside the current object.
    #[must_use]
    pub fn entry(&self, key: &ObjectRef<K>) -> Option<CachedEntry<K>> {
        let entries = self.shared.entries.read();
        entries
            .get(key)
            .or_else(|| {
                // fall back to the cluster-scoped key in case the object is cluster-scoped
                entries.get(&{
                    let mut cluster_key = key.clone();
                    cluster_key.namespace = None;
                    cluster_key
                })
            })
            // Clone to let go of the read lock ASAP
            .cloned()
    }

    /// Retrieve an object by its server-assigned UID
    #[must_use]
    pub fn get_by_uid(&self, uid: &str) -> Option<Arc<K>> {
        let key = self.shared.uids.read().get(uid).cloned()?;
        self.get(&key)
    }

    /// Return a full snapshot of the current values
    #[must_use]
    pub fn state(&self) -> Vec<Arc<K>> {
        self.shared
            .entries
            .read()
            .values()
            .map(|entry| entry.current.clone())
            .collect()
    }

    /// The number of cached objects
    #[must_use]
    pub fn len(&self) -> usize {
        self.shared.entries.read().len()
    }

    /// Whether the cache is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.shared.entries.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::Writer;
    use crate::{reflector::ObjectRef, watcher};
    use opkit_core::{ApiResource, DynamicObject, GroupVersionKind};
    use serde_json::json;

    fn widget_type() -> ApiResource {
        ApiResource::from_gvk(&GroupVersionKind::gvk("example.io", "v1", "Widget"))
    }

    fn widget(name: &str, ns: Option<&str>, rv: &str, uid: &str) -> DynamicObject {
        let mut obj: DynamicObject = serde_json::from_value(json!({
            "apiVersion": "example.io/v1",
            "kind": "Widget",
            "metadata": { "name": name, "resourceVersion": rv, "uid": uid },
        }))
        .unwrap();
        obj.metadata.namespace = ns.map(String::from);
        obj
    }

    #[test]
    fn upsert_is_monotonic_in_resource_version() {
        let mut writer = Writer::<DynamicObject>::new(widget_type());
        let store = writer.as_reader();
        let key = ObjectRef::new_with("w", widget_type()).within("ns");

        writer.apply_watcher_event(&watcher::Event::Applied(widget("w", Some("ns"), "5", "u1")));
        assert_eq!(store.get(&key).unwrap().metadata.resource_version.as_deref(), Some("5"));

        // stale write is dropped silently
        writer.apply_watcher_event(&watcher::Event::Applied(widget("w", Some("ns"), "3", "u1")));
        assert_eq!(store.get(&key).unwrap().metadata.resource_version.as_deref(), Some("5"));

        writer.apply_watcher_event(&watcher::Event::Applied(widget("w", Some("ns"), "9", "u1")));
        assert_eq!(store.get(&key).unwrap().metadata.resource_version.as_deref(), Some("9"));
    }

    #[test]
    fn entry_tracks_previous_snapshot() {
        let mut writer = Writer::<DynamicObject>::new(widget_type());
        let store = writer.as_reader();
        let key = ObjectRef::new_with("w", widget_type()).within("ns");

        writer.apply_watcher_event(&watcher::Event::Applied(widget("w", Some("ns"), "1", "u1")));
        assert!(store.entry(&key).unwrap().previous.is_none());

        writer.apply_watcher_event(&watcher::Event::Applied(widget("w", Some("ns"), "2", "u1")));
        let entry = store.entry(&key).unwrap();
        assert_eq!(entry.current.metadata.resource_version.as_deref(), Some("2"));
        assert_eq!(
            entry.previous.unwrap().metadata.resource_version.as_deref(),
            Some("1")
        );
    }

    #[test]
    fn uid_index_follows_lifecycle() {
        let mut writer = Writer::<DynamicObject>::new(widget_type());
        let store = writer.as_reader();
        let obj = widget("w", Some("ns"), "1", "u1");

        writer.apply_watcher_event(&watcher::Event::Applied(obj.clone()));
        assert!(store.get_by_uid("u1").is_some());

        writer.apply_watcher_event(&watcher::Event::Deleted(obj));
        assert!(store.get_by_uid("u1").is_none());
    }

    #[test]
    fn restart_replaces_contents_and_marks_ready() {
        let mut writer = Writer::<DynamicObject>::new(widget_type());
        let store = writer.as_reader();
        writer.apply_watcher_event(&watcher::Event::Applied(widget("old", Some("ns"), "1", "u0")));
        assert!(!store.is_ready());

        writer.apply_watcher_event(&watcher::Event::Restarted(vec![
            widget("a", Some("ns"), "2", "u1"),
            widget("b", Some("ns"), "3", "u2"),
        ]));
        assert!(store.is_ready());
        assert_eq!(store.len(), 2);
        assert!(store.get(&ObjectRef::new_with("old", widget_type()).within("ns")).is_none());
    }

    #[test]
    fn cluster_scoped_objects_found_by_namespaced_ref() {
        let mut writer = Writer::<DynamicObject>::new(widget_type());
        let store = writer.as_reader();
        writer.apply_watcher_event(&watcher::Event::Applied(widget("c", None, "1", "u1")));
        assert!(store
            .get(&ObjectRef::new_with("c", widget_type()).within("anything"))
            .is_some());
    }
}
