//! Delivery of watch events to registered listeners.

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use arc_swap::ArcSwap;
use kube_core::DynamicObject;

use crate::types::ResourceTypeKey;

/// The kind of change a listener is notified about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Add,
    Update,
    Delete,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Add => "add",
            Self::Update => "update",
            Self::Delete => "delete",
        })
    }
}

/// Receives every event of every watch.
///
/// Called synchronously on the task of the watch producing the event,
/// so a slow listener delays further events of that resource type.
pub trait Listener: Send + Sync {
    /// `old` is set for updates and deletes, `new` for adds and updates.
    fn on_event(
        &self,
        key: &ResourceTypeKey,
        kind: EventKind,
        old: Option<&DynamicObject>,
        new: Option<&DynamicObject>,
    );
}

impl<F> Listener for F
where
    F: Fn(&ResourceTypeKey, EventKind, Option<&DynamicObject>, Option<&DynamicObject>)
        + Send
        + Sync,
{
    fn on_event(
        &self,
        key: &ResourceTypeKey,
        kind: EventKind,
        old: Option<&DynamicObject>,
        new: Option<&DynamicObject>,
    ) {
        self(key, kind, old, new)
    }
}

type AddFn = Box<dyn Fn(&ResourceTypeKey, &DynamicObject) + Send + Sync>;
type UpdateFn = Box<dyn Fn(&ResourceTypeKey, &DynamicObject, &DynamicObject) + Send + Sync>;
type DeleteFn = Box<dyn Fn(&ResourceTypeKey, &DynamicObject) + Send + Sync>;

/// A [`Listener`] assembled from per-kind callbacks. Missing callbacks ignore their events.
#[derive(Default)]
pub struct ListenerFuncs {
    add: Option<AddFn>,
    update: Option<UpdateFn>,
    delete: Option<DeleteFn>,
}

impl ListenerFuncs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_add(
        mut self,
        f: impl Fn(&ResourceTypeKey, &DynamicObject) + Send + Sync + 'static,
    ) -> Self {
        self.add = Some(Box::new(f));
        self
    }

    pub fn on_update(
        mut self,
        f: impl Fn(&ResourceTypeKey, &DynamicObject, &DynamicObject) + Send + Sync + 'static,
    ) -> Self {
        self.update = Some(Box::new(f));
        self
    }

    pub fn on_delete(
        mut self,
        f: impl Fn(&ResourceTypeKey, &DynamicObject) + Send + Sync + 'static,
    ) -> Self {
        self.delete = Some(Box::new(f));
        self
    }
}

impl Listener for ListenerFuncs {
    fn on_event(
        &self,
        key: &ResourceTypeKey,
        kind: EventKind,
        old: Option<&DynamicObject>,
        new: Option<&DynamicObject>,
    ) {
        match (kind, old, new) {
            (EventKind::Add, _, Some(new)) => {
                if let Some(f) = &self.add {
                    f(key, new)
                }
            }
            (EventKind::Update, Some(old), Some(new)) => {
                if let Some(f) = &self.update {
                    f(key, old, new)
                }
            }
            (EventKind::Delete, Some(old), _) => {
                if let Some(f) = &self.delete {
                    f(key, old)
                }
            }
            _ => {}
        }
    }
}

/// A copy-on-write list of listeners.
///
/// Registration publishes a new list; dispatch works on whichever list was current when it started.
pub struct Fanout {
    listeners: ArcSwap<Vec<Arc<dyn Listener>>>,
    closed: AtomicBool,
}

impl Default for Fanout {
    fn default() -> Self {
        Self {
            listeners: ArcSwap::from_pointee(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }
}

impl Fanout {
    pub fn add_listener(&self, listener: Arc<dyn Listener>) {
        // rcu retries the copy if another registration was published in between
        self.listeners.rcu(|current| {
            let mut next = Vec::with_capacity(current.len() + 1);
            next.extend(current.iter().cloned());
            next.push(Arc::clone(&listener));
            next
        });
    }

    pub fn len(&self) -> usize {
        self.listeners.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dispatch(
        &self,
        key: &ResourceTypeKey,
        kind: EventKind,
        old: Option<&DynamicObject>,
        new: Option<&DynamicObject>,
    ) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let listeners = self.listeners.load_full();
        for listener in listeners.iter() {
            listener.on_event(key, kind, old, new);
        }
    }

    /// Stops all further deliveries.
    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}
