//! A list+watch of one resource type feeding a local cache.

use std::{fmt, sync::Arc};

use futures::{future, StreamExt};
use kube_runtime::{watcher, WatchStreamExt};
use tokio::time::{self, Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::{
    config::WatchSettings,
    fanout::{EventKind, Fanout},
    source::ListWatcher,
    task::CancellableTask,
    types::ResourceTypeKey,
};

mod cache;
use cache::{Cache, Change};
pub use cache::Snapshot;

/// The lifecycle of a resource watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Not started yet.
    Created,
    /// Running, but the first list has not been applied.
    Syncing,
    /// Running with a complete cache.
    Synced,
    /// The task exited without being stopped, e.g. because a listener panicked.
    ///
    /// The next reconciliation restarts it.
    Failed,
    /// Stopped for good.
    Stopped,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

enum Task {
    NotStarted,
    Running(CancellableTask<()>),
    Stopped,
}

/// Shared by the watches of one registry.
#[derive(Clone)]
pub(crate) struct WatchContext {
    pub(crate) list_watcher: Arc<dyn ListWatcher>,
    pub(crate) fanout: Arc<Fanout>,
    pub(crate) settings: Arc<WatchSettings>,
}

/// A background task keeping the cache of one resource type in sync.
pub(crate) struct ResourceWatch {
    key: ResourceTypeKey,
    cache: Arc<Cache>,
    task: Task,
}

impl ResourceWatch {
    pub(crate) fn new(key: ResourceTypeKey, settings: &WatchSettings) -> Self {
        Self {
            key,
            cache: Arc::new(Cache::new(settings.indexers.clone())),
            task: Task::NotStarted,
        }
    }

    pub(crate) fn phase(&self) -> Phase {
        match &self.task {
            Task::NotStarted => Phase::Created,
            Task::Running(task) if task.is_finished() => Phase::Failed,
            Task::Running(_) if self.cache.has_synced() => Phase::Synced,
            Task::Running(_) => Phase::Syncing,
            Task::Stopped => Phase::Stopped,
        }
    }

    pub(crate) fn snapshot(&self) -> Snapshot {
        Snapshot::new(self.key.clone(), Arc::clone(&self.cache))
    }

    /// Spawns the list+watch task. Returns `false` if the watch was started before.
    pub(crate) fn start(&mut self, ctx: &WatchContext) -> bool {
        if !matches!(self.task, Task::NotStarted) {
            return false;
        }

        let key = self.key.clone();
        let cache = Arc::clone(&self.cache);
        let ctx = ctx.clone();
        self.task = Task::Running(CancellableTask::spawn(move |token| {
            run(key, cache, ctx, token)
        }));
        true
    }

    /// Starts the watch again if its task exited without being stopped.
    ///
    /// The cache keeps its content but is not synced until the next list.
    pub(crate) fn restart(&mut self, ctx: &WatchContext) -> bool {
        if self.phase() != Phase::Failed {
            return false;
        }
        log::warn!("Watch for {} exited unexpectedly, restarting", self.key);
        self.task = Task::NotStarted;
        self.cache.unsync();
        self.start(ctx)
    }

    /// Signals the task to exit and hands out its handle for awaiting.
    ///
    /// Returns `None` if the watch is not running.
    pub(crate) fn stop(&mut self) -> Option<CancellableTask<()>> {
        match std::mem::replace(&mut self.task, Task::Stopped) {
            Task::Running(task) => {
                task.signal();
                Some(task)
            }
            Task::NotStarted | Task::Stopped => None,
        }
    }
}

async fn run(key: ResourceTypeKey, cache: Arc<Cache>, ctx: WatchContext, token: CancellationToken) {
    let events = ctx.list_watcher.watch(&key).backoff(ctx.settings.backoff());
    futures::pin_mut!(events);
    let mut resync = ctx.settings.resync_period.map(|period| {
        let mut interval = time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval
    });

    loop {
        let event = tokio::select! {
            biased;
            () = token.cancelled() => break,
            () = tick(&mut resync) => {
                for change in cache.resync() {
                    deliver(&key, &ctx, &token, change);
                }
                continue;
            }
            event = events.next() => event,
        };
        match event {
            Some(Ok(event)) => {
                let listed = matches!(event, watcher::Event::Restarted(_));
                let changes = cache.apply(event);
                if listed {
                    log::debug!("Listed {key}: {} changes", changes.len());
                }
                for change in changes {
                    deliver(&key, &ctx, &token, change);
                }
            }
            Some(Err(err)) => log::warn!("Watch for {key} interrupted, listing again: {err}"),
            None => {
                log::warn!("Watch stream for {key} ended");
                break;
            }
        }
    }

    log::debug!("Stopped watch for {key}");
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => future::pending().await,
    }
}

fn deliver(key: &ResourceTypeKey, ctx: &WatchContext, token: &CancellationToken, change: Change) {
    if token.is_cancelled() {
        return;
    }

    let settings = &ctx.settings;
    let old = change.old.as_deref().filter(|object| settings.accepts(object));
    let new = change.new.as_deref().filter(|object| settings.accepts(object));

    let kind = match (change.kind, old, new) {
        (EventKind::Add, _, Some(_)) => EventKind::Add,
        (EventKind::Update, Some(_), Some(_)) => EventKind::Update,
        (EventKind::Update, None, Some(_)) => EventKind::Add,
        (EventKind::Update, Some(_), None) => EventKind::Delete,
        (EventKind::Delete, Some(_), _) => EventKind::Delete,
        _ => return,
    };
    let (old, new) = match kind {
        EventKind::Add => (None, new),
        EventKind::Update => (old, new),
        EventKind::Delete => (old, None),
    };
    ctx.fanout.dispatch(key, kind, old, new);
}
