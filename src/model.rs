//! Object and key model.
//!
//! Notifications carry objects; the queue carries keys. The default key of an
//! object is `namespace/name` (or just `name` when cluster-scoped), so every
//! notification for the same object collapses onto the same key.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use std::sync::Arc;

use crate::error::{Error, Result};

// ---------------------------------------------------------------------------
// Object
// ---------------------------------------------------------------------------

/// Anything with object metadata: a namespace (optional) and a name.
pub trait Object {
    fn namespace(&self) -> Option<&str>;
    fn name(&self) -> &str;
}

impl<T: Object + ?Sized> Object for &T {
    fn namespace(&self) -> Option<&str> {
        (**self).namespace()
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}

impl<T: Object + ?Sized> Object for Box<T> {
    fn namespace(&self) -> Option<&str> {
        (**self).namespace()
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}

impl<T: Object + ?Sized> Object for Arc<T> {
    fn namespace(&self) -> Option<&str> {
        (**self).namespace()
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}

// ---------------------------------------------------------------------------
// ObjectKey
// ---------------------------------------------------------------------------

/// Resource-scoped identity of an object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: Option<impl Into<String>>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.map(Into::into),
            name: name.into(),
        }
    }

    /// Key for a cluster-scoped object.
    pub fn cluster(name: impl Into<String>) -> Self {
        Self {
            namespace: None,
            name: name.into(),
        }
    }

    /// Key for a namespaced object.
    pub fn namespaced(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            name: name.into(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{ns}/{}", self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

impl FromStr for ObjectKey {
    type Err = Error;

    /// Split `namespace/name` or `name` into its parts.
    fn from_str(key: &str) -> Result<Self> {
        let invalid = |reason| Error::InvalidKey {
            key: key.to_string(),
            reason,
        };

        let mut parts = key.split('/');
        let (namespace, name) = match (parts.next(), parts.next(), parts.next()) {
            (Some(name), None, None) => (None, name),
            (Some(ns), Some(name), None) => (Some(ns), name),
            _ => return Err(invalid("unexpected key format")),
        };

        if name.is_empty() {
            return Err(invalid("name must not be empty"));
        }
        // "/name" is treated as cluster-scoped.
        let namespace = namespace.filter(|ns| !ns.is_empty());
        Ok(ObjectKey::new(namespace, name))
    }
}

/// Derive the `namespace/name` key of an object.
pub fn meta_namespace_key<T: Object + ?Sized>(obj: &T) -> Result<ObjectKey> {
    let name = obj.name();
    if name.is_empty() {
        return Err(Error::key::<T>("object has no name"));
    }
    let namespace = obj.namespace().filter(|ns| !ns.is_empty());
    Ok(ObjectKey::new(namespace, name))
}

// ---------------------------------------------------------------------------
// Deletion tombstones
// ---------------------------------------------------------------------------

/// Final state of a deleted object whose delete event was missed.
///
/// `key` is the key the object was stored under; `last_state` may be stale.
#[derive(Debug, Clone)]
pub struct Tombstone<T> {
    pub key: String,
    pub last_state: Option<T>,
}

/// A change notification: either a live object or a deletion tombstone.
#[derive(Debug, Clone)]
pub enum Notification<T> {
    Object(T),
    Deleted(Tombstone<T>),
}

impl<T> From<T> for Notification<T> {
    fn from(obj: T) -> Self {
        Notification::Object(obj)
    }
}

/// Types the default key function can derive an [`ObjectKey`] from.
pub trait ToObjectKey {
    fn to_object_key(&self) -> Result<ObjectKey>;
}

impl<T: Object + ?Sized> ToObjectKey for T {
    fn to_object_key(&self) -> Result<ObjectKey> {
        meta_namespace_key(self)
    }
}

impl<T: Object> ToObjectKey for Notification<T> {
    /// Tombstones keep the key they were stored under.
    fn to_object_key(&self) -> Result<ObjectKey> {
        match self {
            Notification::Object(obj) => meta_namespace_key(obj),
            Notification::Deleted(tombstone) => tombstone.key.parse(),
        }
    }
}

// ---------------------------------------------------------------------------
// ObjectHandle
// ---------------------------------------------------------------------------

/// A shared object compared and hashed by identity rather than by value.
///
/// Lets the passthrough key function queue the notified object itself: two
/// handles are the same key only if they point at the same allocation.
#[derive(Debug)]
pub struct ObjectHandle<T: ?Sized>(Arc<T>);

impl<T> ObjectHandle<T> {
    pub fn new(value: T) -> Self {
        Self(Arc::new(value))
    }
}

impl<T: ?Sized> ObjectHandle<T> {
    pub fn from_arc(inner: Arc<T>) -> Self {
        Self(inner)
    }
}

impl<T: ?Sized> Clone for ObjectHandle<T> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<T: ?Sized> std::ops::Deref for ObjectHandle<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.0
    }
}

impl<T: ?Sized> PartialEq for ObjectHandle<T> {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl<T: ?Sized> Eq for ObjectHandle<T> {}

impl<T: ?Sized> Hash for ObjectHandle<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        Arc::as_ptr(&self.0).cast::<()>().hash(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Pod {
        namespace: Option<String>,
        name: String,
    }

    impl Object for Pod {
        fn namespace(&self) -> Option<&str> {
            self.namespace.as_deref()
        }

        fn name(&self) -> &str {
            &self.name
        }
    }

    fn pod(namespace: Option<&str>, name: &str) -> Pod {
        Pod {
            namespace: namespace.map(String::from),
            name: name.to_string(),
        }
    }

    #[test]
    fn key_of_namespaced_object() {
        let key = meta_namespace_key(&pod(Some("default"), "web")).unwrap();
        assert_eq!(key, ObjectKey::namespaced("default", "web"));
        assert_eq!(key.to_string(), "default/web");
    }

    #[test]
    fn key_of_cluster_scoped_object() {
        let key = meta_namespace_key(&pod(None, "node-1")).unwrap();
        assert_eq!(key.to_string(), "node-1");

        // Empty namespace is the same as none.
        let key = meta_namespace_key(&pod(Some(""), "node-1")).unwrap();
        assert_eq!(key, ObjectKey::cluster("node-1"));
    }

    #[test]
    fn nameless_object_has_no_key() {
        let err = meta_namespace_key(&pod(Some("default"), "")).unwrap_err();
        assert!(matches!(err, Error::Key { .. }));
        assert!(err.to_string().contains("Pod"));
    }

    #[test]
    fn split_keys() {
        assert_eq!(
            "default/web".parse::<ObjectKey>().unwrap(),
            ObjectKey::namespaced("default", "web")
        );
        assert_eq!(
            "node-1".parse::<ObjectKey>().unwrap(),
            ObjectKey::cluster("node-1")
        );
        assert_eq!(
            "/node-1".parse::<ObjectKey>().unwrap(),
            ObjectKey::cluster("node-1")
        );
        assert!("a/b/c".parse::<ObjectKey>().is_err());
        assert!("default/".parse::<ObjectKey>().is_err());
        assert!("".parse::<ObjectKey>().is_err());
    }

    #[test]
    fn tombstone_uses_stored_key() {
        let deleted: Notification<Pod> = Notification::Deleted(Tombstone {
            key: "default/gone".to_string(),
            last_state: None,
        });
        assert_eq!(
            deleted.to_object_key().unwrap(),
            ObjectKey::namespaced("default", "gone")
        );

        let live: Notification<Pod> = pod(Some("default"), "web").into();
        assert_eq!(live.to_object_key().unwrap().to_string(), "default/web");
    }

    #[test]
    fn handles_compare_by_identity() {
        let a = ObjectHandle::new(pod(None, "same"));
        let b = ObjectHandle::new(pod(None, "same"));
        assert_eq!(a, a.clone());
        assert_ne!(a, b);

        let mut set = std::collections::HashSet::new();
        set.insert(a.clone());
        set.insert(a.clone());
        set.insert(b);
        assert_eq!(set.len(), 2);
    }
}
