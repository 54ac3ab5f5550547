//! Adapters backing the informer with a kcp-style apiserver.

use futures::{future::BoxFuture, stream::BoxStream, FutureExt, StreamExt, TryStreamExt};
use kube_client::{api::ListParams, discovery::Scope, Api, Client, Config, Discovery};
use kube_core::{ApiResource, DynamicObject, GroupVersionKind};
use kube_runtime::watcher::{self, watcher};

use super::{BoxError, DiscoverySource, ListWatcher, TenantCatalog};
use crate::types::{ResourceTypeDescriptor, ResourceTypeKey, TenantId, CLUSTER_ANNOTATION};

fn workspace_resource() -> ApiResource {
    ApiResource::from_gvk_with_plural(
        &GroupVersionKind::gvk("tenancy.kcp.dev", "v1alpha1", "ClusterWorkspace"),
        "clusterworkspaces",
    )
}

/// Lists tenants from the `ClusterWorkspace` objects visible to a wildcard client.
#[derive(Clone)]
pub struct KubeWorkspaces {
    api: Api<DynamicObject>,
}

impl KubeWorkspaces {
    pub fn new(client: Client) -> Self {
        Self {
            api: Api::all_with(client, &workspace_resource()),
        }
    }
}

impl TenantCatalog for KubeWorkspaces {
    fn list_tenants(&self) -> BoxFuture<'_, Result<Vec<TenantId>, BoxError>> {
        async move {
            let list = self.api.list(&ListParams::default()).await?;
            let tenants = list
                .items
                .iter()
                .filter_map(|workspace| {
                    let name = workspace.metadata.name.as_deref()?;
                    let parent = workspace
                        .metadata
                        .annotations
                        .as_ref()
                        .and_then(|annotations| annotations.get(CLUSTER_ANNOTATION));
                    Some(match parent {
                        Some(parent) => TenantId(format!("{parent}:{name}")),
                        None => TenantId::new(name),
                    })
                })
                .collect();
            Ok(tenants)
        }
        .boxed()
    }
}

/// Runs apiserver discovery against `<server>/clusters/<tenant>`.
#[derive(Clone)]
pub struct KubeDiscovery {
    config: Config,
}

impl KubeDiscovery {
    /// `config` should point at the server root, not at a specific workspace.
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    fn client_for(&self, tenant: &TenantId) -> Result<Client, BoxError> {
        let mut config = self.config.clone();
        let base = config.cluster_url.to_string();
        config.cluster_url =
            format!("{}/clusters/{}", base.trim_end_matches('/'), tenant).parse()?;
        Ok(Client::try_from(config)?)
    }
}

impl DiscoverySource for KubeDiscovery {
    fn discover<'a>(
        &'a self,
        tenant: &'a TenantId,
    ) -> BoxFuture<'a, Result<Vec<ResourceTypeDescriptor>, BoxError>> {
        async move {
            let client = self.client_for(tenant)?;
            let discovery = Discovery::new(client).run().await?;

            let descriptors = discovery
                .groups()
                .flat_map(|group| group.recommended_resources())
                .map(|(resource, capab)| ResourceTypeDescriptor {
                    key: ResourceTypeKey::new(resource.group, resource.version, resource.plural),
                    kind: resource.kind,
                    namespaced: matches!(capab.scope, Scope::Namespaced),
                    verbs: capab.operations,
                })
                .collect();
            Ok(descriptors)
        }
        .boxed()
    }
}

/// Watches a type across all tenants through a wildcard client.
///
/// Bookmarks are handled by [`watcher()`]; API errors end up as stream errors.
#[derive(Clone)]
pub struct KubeListWatcher {
    client: Client,
}

impl KubeListWatcher {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, key: &ResourceTypeKey) -> Api<DynamicObject> {
        // the kind is not part of list or watch URLs
        let gvk = GroupVersionKind::gvk(&key.group, &key.version, "");
        Api::all_with(
            self.client.clone(),
            &ApiResource::from_gvk_with_plural(&gvk, &key.resource),
        )
    }
}

impl ListWatcher for KubeListWatcher {
    fn watch(
        &self,
        key: &ResourceTypeKey,
    ) -> BoxStream<'static, Result<watcher::Event<DynamicObject>, BoxError>> {
        watcher(self.api(key), watcher::Config::default())
            .map_err(|err| -> BoxError { Box::new(err) })
            .boxed()
    }
}
