//! Caches objects in memory (the "ResourceCache")

mod object_ref;
pub mod store;

pub use self::object_ref::ObjectRef;
use crate::watcher;
use futures::{Stream, TryStreamExt};
use opkit_core::resource::Resource;
use std::hash::Hash;
pub use store::{CachedEntry, Store, Writer};

/// Caches objects from `watcher::Event`s to a local store
///
/// Observes the raw `Stream` of `watcher::Event`s, and updates the `Writer`
/// before passing the event on to the stream's consumer, which is usually a
/// controller trigger. The [`Store`] is the authoritative "previous state"
/// source during a reconcile.
pub fn reflector<K, W>(mut writer: Writer<K>, stream: W) -> impl Stream<Item = W::Item>
where
    K: Resource + Clone,
    K::DynamicType: Eq + Hash + Clone,
    W: Stream<Item = watcher::Result<watcher::Event<K>>>,
{
    stream.inspect_ok(move |event| writer.apply_watcher_event(event))
}

#[cfg(test)]
mod tests {
    use super::{reflector, ObjectRef, Writer};
    use crate::watcher;
    use futures::{stream, StreamExt, TryStreamExt};
    use opkit_core::{ApiResource, DynamicObject, GroupVersionKind};
    use serde_json::json;

    fn widget_type() -> ApiResource {
        ApiResource::from_gvk(&GroupVersionKind::gvk("example.io", "v1", "Widget"))
    }

    fn widget(name: &str, rv: &str) -> DynamicObject {
        serde_json::from_value(json!({
            "apiVersion": "example.io/v1",
            "kind": "Widget",
            "metadata": { "name": name, "namespace": "ns", "resourceVersion": rv, "uid": name },
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn reflector_applies_events_while_passing_them_through() {
        let writer = Writer::<DynamicObject>::new(widget_type());
        let store = writer.as_reader();
        let events = stream::iter([
            Ok(watcher::Event::Applied(widget("a", "1"))),
            Ok(watcher::Event::Applied(widget("b", "2"))),
            Ok(watcher::Event::Deleted(widget("a", "3"))),
        ]);
        let seen = reflector(writer, events)
            .try_collect::<Vec<_>>()
            .await
            .unwrap();
        assert_eq!(seen.len(), 3);
        assert!(store.get(&ObjectRef::new_with("a", widget_type()).within("ns")).is_none());
        assert!(store.get(&ObjectRef::new_with("b", widget_type()).within("ns")).is_some());
    }
}
