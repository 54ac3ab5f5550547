//! Capabilities the informer consumes from the surrounding server.
//!
//! The informer never talks to storage directly.
//! It enumerates tenants through a [`TenantCatalog`],
//! asks a [`DiscoverySource`] which types each tenant serves,
//! and watches every type through a [`ListWatcher`].

use futures::{future::BoxFuture, stream::BoxStream, FutureExt};
use kube_core::DynamicObject;
use kube_runtime::watcher;

use crate::types::{ResourceTypeDescriptor, ResourceTypeKey, TenantId};

/// The error type returned by collaborators.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Read-only view over the set of active tenants.
pub trait TenantCatalog: Send + Sync {
    fn list_tenants(&self) -> BoxFuture<'_, Result<Vec<TenantId>, BoxError>>;
}

/// Lists the resource types currently served for a tenant.
pub trait DiscoverySource: Send + Sync {
    fn discover<'a>(
        &'a self,
        tenant: &'a TenantId,
    ) -> BoxFuture<'a, Result<Vec<ResourceTypeDescriptor>, BoxError>>;
}

/// Lists and watches all objects of a type across tenants.
pub trait ListWatcher: Send + Sync {
    /// Returns a stream with [`watcher`] semantics for `key`.
    ///
    /// The stream starts with [`watcher::Event::Restarted`] holding the full list,
    /// followed by `Applied` and `Deleted` events.
    /// After an error item the next poll starts over with a fresh list,
    /// so the stream is polled again after a backoff instead of being reopened.
    fn watch(
        &self,
        key: &ResourceTypeKey,
    ) -> BoxStream<'static, Result<watcher::Event<DynamicObject>, BoxError>>;
}

/// A catalog with a fixed set of tenants.
#[derive(Debug, Clone, Default)]
pub struct StaticCatalog(pub Vec<TenantId>);

impl TenantCatalog for StaticCatalog {
    fn list_tenants(&self) -> BoxFuture<'_, Result<Vec<TenantId>, BoxError>> {
        futures::future::ready(Ok(self.0.clone())).boxed()
    }
}

pub mod kube;
