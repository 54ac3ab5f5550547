use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use kube_core::DynamicObject;
use kube_runtime::watcher;
use parking_lot::RwLock;

use crate::{
    config::IndexFn,
    fanout::EventKind,
    types::{QualifiedName, ResourceTypeKey},
};

type Objects = HashMap<QualifiedName, Arc<DynamicObject>>;

/// A change applied to a cache, to be passed on to listeners.
pub(crate) struct Change {
    pub(crate) kind: EventKind,
    pub(crate) old: Option<Arc<DynamicObject>>,
    pub(crate) new: Option<Arc<DynamicObject>>,
}

/// The local copy of all objects of one type.
///
/// Keyed by [`QualifiedName`], which includes the tenant,
/// so equal names listed from different tenants stay distinct.
pub(crate) struct Cache {
    objects: RwLock<Objects>,
    synced: AtomicBool,
    indexers: Vec<(String, IndexFn)>,
}

impl Cache {
    pub(crate) fn new(indexers: Vec<(String, IndexFn)>) -> Self {
        Self {
            objects: RwLock::new(HashMap::new()),
            synced: AtomicBool::new(false),
            indexers,
        }
    }

    pub(crate) fn has_synced(&self) -> bool {
        self.synced.load(Ordering::Acquire)
    }

    /// Swaps in the result of a fresh list and marks the cache as synced.
    ///
    /// Objects missing from the list are deleted,
    /// objects with a changed resource version are updated.
    fn replace(&self, listed: Vec<DynamicObject>) -> Vec<Change> {
        let mut next = Objects::with_capacity(listed.len());
        for object in listed {
            match QualifiedName::from_object(&object) {
                Some(name) => {
                    next.insert(name, Arc::new(object));
                }
                None => log::warn!("ignoring listed object without name"),
            }
        }

        let mut changes = Vec::new();
        {
            let mut objects = self.objects.write();
            for (name, new) in &next {
                match objects.get(name) {
                    None => changes.push(Change {
                        kind: EventKind::Add,
                        old: None,
                        new: Some(Arc::clone(new)),
                    }),
                    Some(old) if is_changed(old, new) => changes.push(Change {
                        kind: EventKind::Update,
                        old: Some(Arc::clone(old)),
                        new: Some(Arc::clone(new)),
                    }),
                    Some(_) => {}
                }
            }
            for (name, old) in objects.iter() {
                if !next.contains_key(name) {
                    changes.push(Change {
                        kind: EventKind::Delete,
                        old: Some(Arc::clone(old)),
                        new: None,
                    });
                }
            }
            *objects = next;
        }

        self.synced.store(true, Ordering::Release);
        changes
    }

    /// Applies one event of a watcher stream.
    pub(crate) fn apply(&self, event: watcher::Event<DynamicObject>) -> Vec<Change> {
        match event {
            watcher::Event::Restarted(listed) => self.replace(listed),
            watcher::Event::Applied(object) => self.upsert(object).into_iter().collect(),
            watcher::Event::Deleted(object) => self.remove(object).into_iter().collect(),
        }
    }

    fn upsert(&self, object: DynamicObject) -> Option<Change> {
        let Some(name) = QualifiedName::from_object(&object) else {
            log::warn!("ignoring watch event for object without name");
            return None;
        };
        let object = Arc::new(object);
        let old = self.objects.write().insert(name, Arc::clone(&object));
        Some(Change {
            kind: if old.is_some() {
                EventKind::Update
            } else {
                EventKind::Add
            },
            old,
            new: Some(object),
        })
    }

    fn remove(&self, object: DynamicObject) -> Option<Change> {
        let Some(name) = QualifiedName::from_object(&object) else {
            log::warn!("ignoring watch event for object without name");
            return None;
        };
        let old = self
            .objects
            .write()
            .remove(&name)
            .unwrap_or_else(|| Arc::new(object));
        Some(Change {
            kind: EventKind::Delete,
            old: Some(old),
            new: None,
        })
    }

    /// An update for every cached object, with the same object as old and new.
    ///
    /// Empty until the first list was applied.
    pub(crate) fn resync(&self) -> Vec<Change> {
        if !self.has_synced() {
            return Vec::new();
        }
        self.objects
            .read()
            .values()
            .map(|object| Change {
                kind: EventKind::Update,
                old: Some(Arc::clone(object)),
                new: Some(Arc::clone(object)),
            })
            .collect()
    }

    /// Keeps the content but reports the cache as not synced until the next list.
    pub(crate) fn unsync(&self) {
        self.synced.store(false, Ordering::Release);
    }
}

fn is_changed(old: &DynamicObject, new: &DynamicObject) -> bool {
    match (&old.metadata.resource_version, &new.metadata.resource_version) {
        (Some(old), Some(new)) => old != new,
        _ => true,
    }
}

/// A read-only view into the cache of one watch.
///
/// Every call observes the cache at a single point in time;
/// a resync replaces the content in one step.
#[derive(Clone)]
pub struct Snapshot {
    key: ResourceTypeKey,
    cache: Arc<Cache>,
}

impl Snapshot {
    pub(crate) fn new(key: ResourceTypeKey, cache: Arc<Cache>) -> Self {
        Self { key, cache }
    }

    pub fn key(&self) -> &ResourceTypeKey {
        &self.key
    }

    pub fn has_synced(&self) -> bool {
        self.cache.has_synced()
    }

    pub fn get(&self, name: &QualifiedName) -> Option<Arc<DynamicObject>> {
        self.cache.objects.read().get(name).cloned()
    }

    pub fn list(&self) -> Vec<Arc<DynamicObject>> {
        self.cache.objects.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.cache.objects.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Objects that `name` indexes under `value`, or `None` if there is no such index.
    pub fn by_index(&self, name: &str, value: &str) -> Option<Vec<Arc<DynamicObject>>> {
        let (_, index) = self.cache.indexers.iter().find(|(index, _)| index == name)?;
        let objects = self.cache.objects.read();
        Some(
            objects
                .values()
                .filter(|object| index(object).iter().any(|v| v == value))
                .cloned()
                .collect(),
        )
    }

    pub fn by_namespace(&self, namespace: &str) -> Vec<Arc<DynamicObject>> {
        self.by_index(crate::config::NAMESPACE_INDEX, namespace)
            .unwrap_or_default()
    }
}

impl std::fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Snapshot")
            .field("key", &self.key)
            .field("synced", &self.has_synced())
            .field("len", &self.len())
            .finish()
    }
}
