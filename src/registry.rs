//! The authoritative map of running watches and its reconciliation against discovery.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use parking_lot::RwLock;

use crate::{
    config::WatchSettings,
    fanout::Fanout,
    source::ListWatcher,
    task::CancellableTask,
    types::{DiscoveredSet, ResourceTypeKey},
    watch::{Phase, ResourceWatch, Snapshot, WatchContext},
};

/// Owns the lifecycle of every [`ResourceWatch`].
pub struct WatchRegistry {
    ctx: WatchContext,
    pinned: HashSet<ResourceTypeKey>,
    inner: RwLock<Inner>,
}

#[derive(Default)]
struct Inner {
    watches: HashMap<ResourceTypeKey, ResourceWatch>,
    /// Tasks of removed watches that may still be exiting.
    stopping: Vec<CancellableTask<()>>,
    terminating: bool,
}

/// The actions taken by one [`WatchRegistry::reconcile`] call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reconciled {
    pub added: Vec<ResourceTypeKey>,
    pub removed: Vec<ResourceTypeKey>,
    /// Watches restarted after their task exited unexpectedly.
    pub restarted: Vec<ResourceTypeKey>,
}

impl Reconciled {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.restarted.is_empty()
    }
}

struct Plan {
    to_add: Vec<ResourceTypeKey>,
    to_remove: Vec<ResourceTypeKey>,
    to_restart: Vec<ResourceTypeKey>,
}

impl Plan {
    fn is_empty(&self) -> bool {
        self.to_add.is_empty() && self.to_remove.is_empty() && self.to_restart.is_empty()
    }
}

impl WatchRegistry {
    pub(crate) fn new(
        list_watcher: Arc<dyn ListWatcher>,
        fanout: Arc<Fanout>,
        settings: WatchSettings,
        pinned: HashSet<ResourceTypeKey>,
    ) -> Self {
        Self {
            ctx: WatchContext {
                list_watcher,
                fanout,
                settings: Arc::new(settings),
            },
            pinned,
            inner: RwLock::new(Inner::default()),
        }
    }

    fn plan(&self, inner: &Inner, discovered: &DiscoveredSet) -> Plan {
        // pinned keys count as discovered in every pass
        let mut to_add: Vec<_> = discovered
            .iter()
            .chain(self.pinned.iter().filter(|key| !discovered.contains(key)))
            .filter(|key| !inner.watches.contains_key(*key))
            .cloned()
            .collect();
        to_add.sort();

        let mut to_remove = Vec::new();
        let mut to_restart = Vec::new();
        for (key, watch) in &inner.watches {
            if !self.pinned.contains(key) && !discovered.contains(key) {
                to_remove.push(key.clone());
            } else if watch.phase() == Phase::Failed {
                to_restart.push(key.clone());
            }
        }
        to_remove.sort();
        to_restart.sort();

        Plan {
            to_add,
            to_remove,
            to_restart,
        }
    }

    /// Starts watches for newly discovered keys and stops watches for keys no longer discovered.
    ///
    /// Pinned keys are always treated as discovered.
    ///
    /// Watches whose task exited without being stopped are restarted.
    ///
    /// Keys that fail validation are skipped and reported together
    /// after all other keys were processed; they are retried on the next call.
    ///
    /// Must be called within a Tokio runtime, since watches are spawned as tasks.
    pub fn reconcile(&self, discovered: &DiscoveredSet) -> Result<Reconciled, RegistryError> {
        {
            let inner = self.inner.read();
            if inner.terminating {
                return Ok(Reconciled::default());
            }
            if self.plan(&inner, discovered).is_empty() {
                return Ok(Reconciled::default());
            }
        }

        let mut inner = self.inner.write();
        if inner.terminating {
            return Ok(Reconciled::default());
        }
        // another reconciliation may have converged between the two locks
        let Plan {
            to_add,
            to_remove,
            to_restart,
        } = self.plan(&inner, discovered);
        inner.stopping.retain(|task| !task.is_finished());

        let mut outcome = Reconciled::default();
        let mut errors = Vec::new();

        for key in to_add {
            if let Err(reason) = key.validate() {
                log::error!("Cannot watch {key}: {reason}");
                errors.push(RegistryError::InvalidKey { key, reason });
                continue;
            }

            log::info!("Adding dynamic watch for {key}");
            let mut watch = ResourceWatch::new(key.clone(), &self.ctx.settings);
            watch.start(&self.ctx);
            inner.watches.insert(key.clone(), watch);
            outcome.added.push(key);
        }

        for key in to_remove {
            log::info!("Removing dynamic watch for {key}");
            if let Some(task) = inner.watches.remove(&key).and_then(|mut watch| watch.stop()) {
                inner.stopping.push(task);
            }
            outcome.removed.push(key);
        }

        for key in to_restart {
            if let Some(watch) = inner.watches.get_mut(&key) {
                if watch.restart(&self.ctx) {
                    outcome.restarted.push(key);
                }
            }
        }

        match errors.len() {
            0 => Ok(outcome),
            1 => Err(errors.remove(0)),
            _ => Err(RegistryError::Start(errors)),
        }
    }

    /// Returns the snapshot for `key`, creating a watch that is not started yet if there is none.
    pub fn watch_for(&self, key: &ResourceTypeKey) -> Result<Snapshot, RegistryError> {
        if let Some(watch) = self.inner.read().watches.get(key) {
            return Ok(watch.snapshot());
        }

        let mut inner = self.inner.write();
        // created between the read and the write lock
        if let Some(watch) = inner.watches.get(key) {
            return Ok(watch.snapshot());
        }
        if inner.terminating {
            return Err(RegistryError::Terminating);
        }
        key.validate().map_err(|reason| RegistryError::InvalidKey {
            key: key.clone(),
            reason,
        })?;

        log::info!("Adding dynamic watch for {key}");
        let watch = ResourceWatch::new(key.clone(), &self.ctx.settings);
        let snapshot = watch.snapshot();
        inner.watches.insert(key.clone(), watch);
        Ok(snapshot)
    }

    /// Starts every watch created by [`watch_for`](Self::watch_for) that is not running yet,
    /// and restarts every watch whose task exited without being stopped.
    ///
    /// Must be called within a Tokio runtime.
    pub fn start_pending(&self) -> usize {
        let mut inner = self.inner.write();
        if inner.terminating {
            return 0;
        }
        inner
            .watches
            .values_mut()
            .map(|watch| watch.start(&self.ctx) || watch.restart(&self.ctx))
            .filter(|&started| started)
            .count()
    }

    /// Snapshots of all synced watches, and the keys of all other watches.
    ///
    /// Both are empty once the registry is shutting down.
    pub fn ready_snapshots(
        &self,
    ) -> (HashMap<ResourceTypeKey, Snapshot>, Vec<ResourceTypeKey>) {
        let mut ready = HashMap::new();
        let mut not_synced = Vec::new();

        let inner = self.inner.read();
        if inner.terminating {
            return (ready, not_synced);
        }
        for (key, watch) in &inner.watches {
            if watch.phase() == Phase::Synced {
                ready.insert(key.clone(), watch.snapshot());
            } else {
                not_synced.push(key.clone());
            }
        }
        (ready, not_synced)
    }

    pub fn phase(&self, key: &ResourceTypeKey) -> Option<Phase> {
        self.inner.read().watches.get(key).map(ResourceWatch::phase)
    }

    /// The keys of all watches, started or not.
    pub fn keys(&self) -> Vec<ResourceTypeKey> {
        self.inner.read().watches.keys().cloned().collect()
    }

    pub fn is_terminating(&self) -> bool {
        self.inner.read().terminating
    }

    /// Stops every watch and waits for all of their tasks to exit.
    ///
    /// A task that panicked is logged and does not interrupt the shutdown.
    ///
    /// No watch can be added afterwards. Calling this again is a no-op.
    pub async fn shutdown(&self) {
        let tasks: Vec<CancellableTask<()>> = {
            let mut inner = self.inner.write();
            inner.terminating = true;
            let mut tasks: Vec<_> = inner
                .watches
                .drain()
                .filter_map(|(_, mut watch)| watch.stop())
                .collect();
            tasks.append(&mut inner.stopping);
            tasks
        };

        if !tasks.is_empty() {
            log::info!("Stopping {} dynamic watches", tasks.len());
        }
        for task in tasks {
            task.join().await;
        }
    }
}

/// Errors from [`WatchRegistry`].
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("cannot watch {key}: {reason}")]
    InvalidKey {
        key: ResourceTypeKey,
        reason: &'static str,
    },
    #[error("{} watches failed to start: {}", .0.len(), display_all(.0))]
    Start(Vec<RegistryError>),
    #[error("the registry is shutting down")]
    Terminating,
}

fn display_all(errors: &[RegistryError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
