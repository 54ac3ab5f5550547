use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Weak,
    },
};

use futures::{
    channel::mpsc,
    future::BoxFuture,
    stream::{self, BoxStream},
    FutureExt, StreamExt,
};
use kube_core::{ApiResource, DynamicObject};
use kube_runtime::watcher;
use parking_lot::Mutex;
use tokio::sync::Semaphore;

use crate::{
    fanout::{EventKind, Listener},
    source::{BoxError, DiscoverySource, ListWatcher, TenantCatalog},
    types::{ResourceTypeDescriptor, ResourceTypeKey, TenantId},
};

type Event = watcher::Event<DynamicObject>;

/// An in-memory apiserver with tenants, discovery and per-type object stores.
#[derive(Default)]
pub(crate) struct FakeCluster {
    this: Weak<Self>,
    tenants: Mutex<Vec<TenantId>>,
    types: Mutex<HashMap<TenantId, Vec<ResourceTypeDescriptor>>>,
    failing: Mutex<Option<TenantId>>,
    objects: Mutex<HashMap<ResourceTypeKey, BTreeMap<String, DynamicObject>>>,
    streams: Mutex<HashMap<ResourceTypeKey, Vec<mpsc::UnboundedSender<Event>>>>,
    gates: Mutex<HashMap<ResourceTypeKey, Arc<Semaphore>>>,
    opens: Mutex<HashMap<ResourceTypeKey, usize>>,
    discoveries: AtomicUsize,
    version: AtomicUsize,
}

pub(crate) fn key(resource: &str) -> ResourceTypeKey {
    ResourceTypeKey::new("example.io", "v1", resource)
}

pub(crate) fn watchable(key: &ResourceTypeKey) -> ResourceTypeDescriptor {
    ResourceTypeDescriptor {
        key: key.clone(),
        kind: key.resource.clone(),
        namespaced: true,
        verbs: vec!["get".into(), "list".into(), "watch".into()],
    }
}

impl FakeCluster {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            ..Self::default()
        })
    }

    pub(crate) fn set_types(&self, tenant: &str, types: Vec<ResourceTypeDescriptor>) {
        let tenant = TenantId::new(tenant);
        {
            let mut tenants = self.tenants.lock();
            if !tenants.contains(&tenant) {
                tenants.push(tenant.clone());
            }
        }
        self.types.lock().insert(tenant, types);
    }

    pub(crate) fn serve(&self, tenant: &str, keys: &[&ResourceTypeKey]) {
        self.set_types(tenant, keys.iter().map(|key| watchable(key)).collect());
    }

    pub(crate) fn fail_discovery(&self, tenant: Option<&str>) {
        *self.failing.lock() = tenant.map(TenantId::new);
    }

    pub(crate) fn discoveries(&self) -> usize {
        self.discoveries.load(Ordering::SeqCst)
    }

    /// Blocks every list of `key` until [`release`](Self::release) is called.
    pub(crate) fn hold(&self, key: &ResourceTypeKey) {
        self.gates.lock().insert(key.clone(), Arc::new(Semaphore::new(0)));
    }

    pub(crate) fn release(&self, key: &ResourceTypeKey) {
        if let Some(gate) = self.gates.lock().remove(key) {
            gate.close();
        }
    }

    pub(crate) fn opens(&self, key: &ResourceTypeKey) -> usize {
        self.opens.lock().get(key).copied().unwrap_or(0)
    }

    pub(crate) fn open_streams(&self, key: &ResourceTypeKey) -> usize {
        self.streams
            .lock()
            .get(key)
            .map_or(0, |senders| senders.iter().filter(|tx| !tx.is_closed()).count())
    }

    /// Ends all watch streams of `key`, as if the connection dropped.
    pub(crate) fn drop_streams(&self, key: &ResourceTypeKey) {
        self.streams.lock().remove(key);
    }

    pub(crate) fn object(
        &self,
        key: &ResourceTypeKey,
        namespace: &str,
        name: &str,
    ) -> DynamicObject {
        let resource = ApiResource {
            group: key.group.clone(),
            version: key.version.clone(),
            api_version: format!("{}/{}", key.group, key.version),
            kind: key.resource.clone(),
            plural: key.resource.clone(),
        };
        let mut object = DynamicObject::new(name, &resource).within(namespace);
        object.metadata.resource_version =
            Some(self.version.fetch_add(1, Ordering::SeqCst).to_string());
        object
    }

    fn broadcast(&self, key: &ResourceTypeKey, object: &DynamicObject, deleted: bool) {
        if let Some(senders) = self.streams.lock().get(key) {
            for tx in senders {
                let object = object.clone();
                _ = tx.unbounded_send(if deleted {
                    Event::Deleted(object)
                } else {
                    Event::Applied(object)
                });
            }
        }
    }

    /// Creates or replaces an object, with or without the `keep` label.
    pub(crate) fn upsert(&self, key: &ResourceTypeKey, namespace: &str, name: &str, keep: bool) {
        let mut object = self.object(key, namespace, name);
        if keep {
            object.metadata.labels = Some([("keep".to_string(), String::new())].into());
        }
        self.store(key, namespace, name, object.clone());
        self.broadcast(key, &object, false);
    }

    pub(crate) fn create(&self, key: &ResourceTypeKey, namespace: &str, name: &str) {
        let object = self.object(key, namespace, name);
        self.store(key, namespace, name, object.clone());
        self.broadcast(key, &object, false);
    }

    pub(crate) fn update(&self, key: &ResourceTypeKey, namespace: &str, name: &str) {
        let object = self.object(key, namespace, name);
        self.store(key, namespace, name, object.clone());
        self.broadcast(key, &object, false);
    }

    pub(crate) fn delete(&self, key: &ResourceTypeKey, namespace: &str, name: &str) {
        let removed = self
            .objects
            .lock()
            .get_mut(key)
            .and_then(|objects| objects.remove(&format!("{namespace}/{name}")));
        if let Some(object) = removed {
            self.broadcast(key, &object, true);
        }
    }

    /// Changes the stored objects without notifying watchers.
    pub(crate) fn create_silently(&self, key: &ResourceTypeKey, namespace: &str, name: &str) {
        let object = self.object(key, namespace, name);
        self.store(key, namespace, name, object);
    }

    pub(crate) fn delete_silently(&self, key: &ResourceTypeKey, namespace: &str, name: &str) {
        if let Some(objects) = self.objects.lock().get_mut(key) {
            objects.remove(&format!("{namespace}/{name}"));
        }
    }

    /// Sends an event to watchers without touching the stored objects.
    pub(crate) fn force_event(&self, key: &ResourceTypeKey, namespace: &str, name: &str) {
        let object = self.object(key, namespace, name);
        self.broadcast(key, &object, false);
    }

    fn store(&self, key: &ResourceTypeKey, namespace: &str, name: &str, object: DynamicObject) {
        self.objects
            .lock()
            .entry(key.clone())
            .or_default()
            .insert(format!("{namespace}/{name}"), object);
    }
}

impl TenantCatalog for FakeCluster {
    fn list_tenants(&self) -> BoxFuture<'_, Result<Vec<TenantId>, BoxError>> {
        futures::future::ready(Ok(self.tenants.lock().clone())).boxed()
    }
}

impl DiscoverySource for FakeCluster {
    fn discover<'a>(
        &'a self,
        tenant: &'a TenantId,
    ) -> BoxFuture<'a, Result<Vec<ResourceTypeDescriptor>, BoxError>> {
        self.discoveries.fetch_add(1, Ordering::SeqCst);
        let result: Result<Vec<ResourceTypeDescriptor>, BoxError> =
            if self.failing.lock().as_ref() == Some(tenant) {
                Err(format!("tenant {tenant} is unreachable").into())
            } else {
                Ok(self.types.lock().get(tenant).cloned().unwrap_or_default())
            };
        futures::future::ready(result).boxed()
    }
}

impl FakeCluster {
    /// Lists `key` and subscribes to its later changes.
    async fn list(
        &self,
        key: &ResourceTypeKey,
    ) -> (Vec<DynamicObject>, mpsc::UnboundedReceiver<Event>) {
        *self.opens.lock().entry(key.clone()).or_default() += 1;

        let gate = self.gates.lock().get(key).cloned();
        if let Some(gate) = gate {
            // closed on release
            _ = gate.acquire().await;
        }

        let objects = self
            .objects
            .lock()
            .get(key)
            .map(|objects| objects.values().cloned().collect())
            .unwrap_or_default();
        let (tx, rx) = mpsc::unbounded();
        self.streams.lock().entry(key.clone()).or_default().push(tx);
        (objects, rx)
    }
}

enum Stage {
    List,
    Watch(mpsc::UnboundedReceiver<Event>),
}

/// Behaves like `watcher`: lists first, and lists again after the stream broke.
impl ListWatcher for FakeCluster {
    fn watch(&self, key: &ResourceTypeKey) -> BoxStream<'static, Result<Event, BoxError>> {
        let cluster = self.this.upgrade().expect("cluster dropped while watched");
        let key = key.clone();
        stream::unfold(Stage::List, move |stage| {
            let cluster = Arc::clone(&cluster);
            let key = key.clone();
            async move {
                let item: (Result<Event, BoxError>, Stage) = match stage {
                    Stage::List => {
                        let (objects, rx) = cluster.list(&key).await;
                        (Ok(Event::Restarted(objects)), Stage::Watch(rx))
                    }
                    Stage::Watch(mut rx) => match rx.next().await {
                        Some(event) => (Ok(event), Stage::Watch(rx)),
                        None => (Err("watch stream closed".into()), Stage::List),
                    },
                };
                Some(item)
            }
        })
        .boxed()
    }
}

/// A delivered event, reduced to what tests compare.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Seen {
    pub(crate) key: ResourceTypeKey,
    pub(crate) kind: EventKind,
    pub(crate) name: String,
}

/// Records every event it receives.
#[derive(Default)]
pub(crate) struct Recorder {
    this: Weak<Self>,
    seen: Mutex<Vec<Seen>>,
}

impl Recorder {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            ..Self::default()
        })
    }

    pub(crate) fn seen(&self) -> Vec<Seen> {
        self.seen.lock().clone()
    }

    pub(crate) fn seen_for(&self, key: &ResourceTypeKey) -> Vec<(EventKind, String)> {
        self.seen
            .lock()
            .iter()
            .filter(|seen| seen.key == *key)
            .map(|seen| (seen.kind, seen.name.clone()))
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.seen.lock().len()
    }
}

impl Listener for Recorder {
    fn on_event(
        &self,
        key: &ResourceTypeKey,
        kind: EventKind,
        old: Option<&DynamicObject>,
        new: Option<&DynamicObject>,
    ) {
        let object = new.or(old).expect("event without object");
        self.seen.lock().push(Seen {
            key: key.clone(),
            kind,
            name: object.metadata.name.clone().unwrap_or_default(),
        });
    }
}
