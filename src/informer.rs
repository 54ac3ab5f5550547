use std::{collections::HashMap, sync::Arc};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::{
    config::Config,
    fanout::{Fanout, Listener},
    registry::{Reconciled, WatchRegistry},
    runner::{DiscoveryError, DiscoveryLoop},
    source::{DiscoverySource, ListWatcher, TenantCatalog},
    task::CancellableTask,
    types::ResourceTypeKey,
    watch::Snapshot,
};

/// Discovers resource types across all tenants and keeps a synced watch for each of them.
pub struct DynamicInformer {
    config: Config,
    pub(crate) fanout: Arc<Fanout>,
    registry: Arc<WatchRegistry>,
    discovery: Arc<DiscoveryLoop>,
    cancel: CancellationToken,
    poller: Mutex<Option<CancellableTask<()>>>,
}

impl DynamicInformer {
    pub fn new(
        config: Config,
        catalog: Arc<dyn TenantCatalog>,
        source: Arc<dyn DiscoverySource>,
        list_watcher: Arc<dyn ListWatcher>,
    ) -> Self {
        let fanout = Arc::new(Fanout::default());
        let registry = Arc::new(WatchRegistry::new(
            list_watcher,
            Arc::clone(&fanout),
            config.watch_settings(),
            config.pinned.clone(),
        ));
        let discovery = Arc::new(DiscoveryLoop {
            catalog,
            source,
            registry: Arc::clone(&registry),
        });

        Self {
            config,
            fanout,
            registry,
            discovery,
            cancel: CancellationToken::new(),
            poller: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Direct access to the watches, e.g. to request a watch before discovery finds its type.
    pub fn registry(&self) -> &Arc<WatchRegistry> {
        &self.registry
    }

    /// Registers a listener for all future events of all watches.
    pub fn add_event_listener(&self, listener: Arc<dyn Listener>) {
        self.fanout.add_listener(listener);
    }

    pub fn ready_snapshots(&self) -> (HashMap<ResourceTypeKey, Snapshot>, Vec<ResourceTypeKey>) {
        self.registry.ready_snapshots()
    }

    /// Runs a single discovery pass outside the periodic schedule.
    pub async fn discover_once(&self) -> Result<Reconciled, DiscoveryError> {
        self.discovery.run_pass().await
    }

    /// Runs discovery until the first pass succeeds, then keeps polling in the background.
    ///
    /// Watches created through the registry before this call are started as well.
    /// Calling this while already started only starts pending watches.
    pub async fn start(&self) -> Result<(), StartError> {
        if self.poller.lock().is_some() {
            self.registry.start_pending();
            return Ok(());
        }

        if !self
            .discovery
            .run_initial(self.config.initial_retry, &self.cancel)
            .await
        {
            return Err(StartError::Cancelled);
        }
        self.registry.start_pending();

        let mut poller = self.poller.lock();
        if poller.is_none() && !self.cancel.is_cancelled() {
            let discovery = Arc::clone(&self.discovery);
            let interval = self.config.poll_interval;
            *poller = Some(CancellableTask::spawn_with(
                self.cancel.child_token(),
                move |cancel| discovery.run_periodic(interval, cancel),
            ));
        }
        Ok(())
    }

    /// Stops discovery, then stops every watch and waits for their tasks to exit.
    ///
    /// No event is delivered after this returns.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let poller = self.poller.lock().take();
        if let Some(poller) = poller {
            poller.join().await;
        }
        self.registry.shutdown().await;
        self.fanout.close();
        log::info!("Dynamic informer stopped");
    }
}

/// The error type returned by [`DynamicInformer::start`].
#[derive(Debug, thiserror::Error)]
pub enum StartError {
    #[error("shut down before the first discovery pass succeeded")]
    Cancelled,
}
