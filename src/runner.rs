use std::{sync::Arc, time::Duration};

use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::{
    registry::{Reconciled, RegistryError, WatchRegistry},
    source::{BoxError, DiscoverySource, TenantCatalog},
    types::{DiscoveredSet, TenantId},
};

/// Drives periodic discovery and hands every discovered set to the registry.
pub(crate) struct DiscoveryLoop {
    pub(crate) catalog: Arc<dyn TenantCatalog>,
    pub(crate) source: Arc<dyn DiscoverySource>,
    pub(crate) registry: Arc<WatchRegistry>,
}

impl DiscoveryLoop {
    /// Unions the watchable types of all tenants.
    ///
    /// Fails as a whole if any tenant fails, so a partial set never reaches the registry.
    pub(crate) async fn discover_types(&self) -> Result<DiscoveredSet, DiscoveryError> {
        let tenants = self
            .catalog
            .list_tenants()
            .await
            .map_err(DiscoveryError::Tenants)?;

        let mut latest = DiscoveredSet::default();
        for tenant in tenants {
            log::info!("Discovering types for tenant {tenant}");
            let descriptors = self
                .source
                .discover(&tenant)
                .await
                .map_err(|source| DiscoveryError::Tenant {
                    tenant: tenant.clone(),
                    source,
                })?;

            for descriptor in descriptors {
                if !descriptor.is_watchable() {
                    log::debug!(
                        "Skipping {} in tenant {tenant}: namespaced={} verbs={:?}",
                        descriptor.key,
                        descriptor.namespaced,
                        descriptor.verbs,
                    );
                    continue;
                }
                latest.insert(descriptor.key);
            }
        }
        Ok(latest)
    }

    /// Runs one discovery pass and reconciles the registry with its result.
    pub(crate) async fn run_pass(&self) -> Result<Reconciled, DiscoveryError> {
        let latest = self.discover_types().await?;
        Ok(self.registry.reconcile(&latest)?)
    }

    /// Retries the first pass every `retry` until it succeeds.
    ///
    /// Returns `false` if cancelled first.
    pub(crate) async fn run_initial(&self, retry: Duration, cancel: &CancellationToken) -> bool {
        loop {
            let result = tokio::select! {
                biased;
                () = cancel.cancelled() => return false,
                result = self.run_pass() => result,
            };
            match result {
                Ok(_) => return true,
                // the discovered set was applied, only some watches could not be created
                Err(DiscoveryError::Registry(err)) => {
                    log::error!("Error starting initial watches: {err}");
                    return true;
                }
                Err(err) => log::error!("Error discovering initial types: {err}"),
            }
            tokio::select! {
                biased;
                () = cancel.cancelled() => return false,
                () = tokio::time::sleep(retry) => {}
            }
        }
    }

    /// Runs a pass every `interval` until cancelled, then stops every watch.
    pub(crate) async fn run_periodic(
        self: Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) {
        let mut ticker = interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                result = self.run_pass() => {
                    // a failed pass keeps the state of the last successful one
                    if let Err(err) = result {
                        log::error!("Error discovering types: {err}");
                    }
                }
            }
        }

        self.registry.shutdown().await;
        log::debug!("Discovery loop stopped");
    }
}

/// Errors from a discovery pass.
#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("listing tenants: {0}")]
    Tenants(#[source] BoxError),
    #[error("discovering types for tenant {tenant}: {source}")]
    Tenant {
        tenant: TenantId,
        #[source]
        source: BoxError,
    },
    #[error(transparent)]
    Registry(#[from] RegistryError),
}
