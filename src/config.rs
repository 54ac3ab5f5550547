use std::{collections::HashSet, fmt, sync::Arc, time::Duration};

use backoff::ExponentialBackoff;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube_core::DynamicObject;

use crate::types::ResourceTypeKey;

/// Name of the index that is always present on snapshots.
pub const NAMESPACE_INDEX: &str = "namespace";

/// Decides whether an object is passed on to listeners.
pub type FilterFn = Arc<dyn Fn(&DynamicObject) -> bool + Send + Sync>;

/// Computes the values an object is indexed under.
pub type IndexFn = Arc<dyn Fn(&DynamicObject) -> Vec<String> + Send + Sync>;

/// Parameters for [`DynamicInformer`](crate::DynamicInformer).
#[derive(Clone)]
pub struct Config {
    /// The period between two discovery passes.
    pub poll_interval: Duration,
    /// The delay between failed attempts of the first discovery pass.
    pub initial_retry: Duration,
    /// The first delay before a watch lists again after a failure.
    pub watch_backoff: Duration,
    /// The upper bound of the exponential watch backoff.
    pub watch_backoff_max: Duration,
    /// If set, every synced watch re-delivers each cached object as an update at this period.
    pub resync_period: Option<Duration>,
    /// Keys that reconciliation never removes.
    pub pinned: HashSet<ResourceTypeKey>,
    pub(crate) filter: Option<FilterFn>,
    pub(crate) indexers: Vec<(String, IndexFn)>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(60),
            initial_retry: Duration::from_secs(1),
            watch_backoff: Duration::from_secs(1),
            watch_backoff_max: Duration::from_secs(30),
            resync_period: None,
            pinned: HashSet::new(),
            filter: None,
            indexers: vec![(NAMESPACE_INDEX.to_string(), Arc::new(namespace_index) as IndexFn)],
        }
    }
}

impl Config {
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn initial_retry(mut self, delay: Duration) -> Self {
        self.initial_retry = delay;
        self
    }

    pub fn watch_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.watch_backoff = initial;
        self.watch_backoff_max = max.max(initial);
        self
    }

    pub fn resync_period(mut self, period: Duration) -> Self {
        self.resync_period = Some(period);
        self
    }

    /// Keeps a watch for `key` regardless of discovery results.
    pub fn pin(mut self, key: ResourceTypeKey) -> Self {
        self.pinned.insert(key);
        self
    }

    /// Pins the schema types other controllers rely on:
    /// custom resource definitions and API bindings.
    pub fn pin_schema_types(self) -> Self {
        self.pin(ResourceTypeKey::of::<CustomResourceDefinition>())
            .pin(ResourceTypeKey::new("apis.kcp.dev", "v1alpha1", "apibindings"))
    }

    /// Only objects accepted by `f` are passed on to listeners.
    pub fn filter(mut self, f: impl Fn(&DynamicObject) -> bool + Send + Sync + 'static) -> Self {
        self.filter = Some(Arc::new(f));
        self
    }

    /// Adds a named index available through [`Snapshot::by_index`](crate::Snapshot::by_index).
    pub fn indexer(
        mut self,
        name: impl Into<String>,
        f: impl Fn(&DynamicObject) -> Vec<String> + Send + Sync + 'static,
    ) -> Result<Self, ConfigError> {
        let name = name.into();
        if self.indexers.iter().any(|(existing, _)| *existing == name) {
            return Err(ConfigError::DuplicateIndexer(name));
        }
        self.indexers.push((name, Arc::new(f)));
        Ok(self)
    }

    pub(crate) fn watch_settings(&self) -> WatchSettings {
        WatchSettings {
            backoff: self.watch_backoff,
            backoff_max: self.watch_backoff_max,
            resync_period: self.resync_period,
            filter: self.filter.clone(),
            indexers: self.indexers.clone(),
        }
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("poll_interval", &self.poll_interval)
            .field("initial_retry", &self.initial_retry)
            .field("watch_backoff", &self.watch_backoff)
            .field("watch_backoff_max", &self.watch_backoff_max)
            .field("resync_period", &self.resync_period)
            .field("pinned", &self.pinned)
            .field("filter", &self.filter.is_some())
            .field(
                "indexers",
                &self.indexers.iter().map(|(name, _)| name).collect::<Vec<_>>(),
            )
            .finish()
    }
}

/// The part of [`Config`] shared by every resource watch.
#[derive(Clone)]
pub(crate) struct WatchSettings {
    pub(crate) backoff: Duration,
    pub(crate) backoff_max: Duration,
    pub(crate) resync_period: Option<Duration>,
    pub(crate) filter: Option<FilterFn>,
    pub(crate) indexers: Vec<(String, IndexFn)>,
}

impl WatchSettings {
    pub(crate) fn accepts(&self, object: &DynamicObject) -> bool {
        self.filter.as_ref().map_or(true, |filter| filter(object))
    }

    /// The backoff between failed list+watch attempts of one watch. It never gives up.
    pub(crate) fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            current_interval: self.backoff,
            initial_interval: self.backoff,
            max_interval: self.backoff_max,
            max_elapsed_time: None,
            ..ExponentialBackoff::default()
        }
    }
}

fn namespace_index(object: &DynamicObject) -> Vec<String> {
    object.metadata.namespace.iter().cloned().collect()
}

/// Errors building a [`Config`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("indexer {0:?} already exists")]
    DuplicateIndexer(String),
}
