//! The seam through which sessions reach the Kubernetes API
//!
//! Sessions only ever list and watch [`DynamicObject`]s of one resource in one scope, so
//! [`ObjectApi`] is all they need. It is implemented for [`kube::Client`].
use async_trait::async_trait;
use futures::{stream::BoxStream, StreamExt};
use kube::{
    core::{
        params::{ListParams, WatchParams},
        DynamicObject, WatchEvent,
    },
    discovery::{ApiResource, Discovery},
    Api, Client,
};

use crate::config::DiscoveredResources;

/// The outcome of a successful list call
#[derive(Clone, Debug, Default)]
pub struct Listing {
    pub items: Vec<DynamicObject>,
    /// The resource version of the collection as a whole
    pub resource_version: Option<String>,
}

/// A raw watch stream, as returned by the API server
pub type EventStream = BoxStream<'static, kube::Result<WatchEvent<DynamicObject>>>;

/// List and watch access to any resource
///
/// A `namespace` of `None` addresses the resource across all namespaces.
#[async_trait]
pub trait ObjectApi: Send + Sync + 'static {
    async fn list(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        params: &ListParams,
    ) -> kube::Result<Listing>;

    /// Opens a watch starting after `resource_version`
    async fn watch(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        params: &WatchParams,
        resource_version: &str,
    ) -> kube::Result<EventStream>;
}

fn dynamic_api(client: &Client, resource: &ApiResource, namespace: Option<&str>) -> Api<DynamicObject> {
    match namespace {
        Some(ns) => Api::namespaced_with(client.clone(), ns, resource),
        None => Api::all_with(client.clone(), resource),
    }
}

#[async_trait]
impl ObjectApi for Client {
    async fn list(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        params: &ListParams,
    ) -> kube::Result<Listing> {
        let list = dynamic_api(self, resource, namespace).list(params).await?;
        Ok(Listing {
            items: list.items,
            resource_version: list.metadata.resource_version,
        })
    }

    async fn watch(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        params: &WatchParams,
        resource_version: &str,
    ) -> kube::Result<EventStream> {
        let stream = dynamic_api(self, resource, namespace)
            .watch(params, resource_version)
            .await?;
        Ok(stream.boxed())
    }
}

/// Runs API discovery and indexes the recommended version of every served resource
///
/// # Errors
/// Fails when the API server's discovery endpoints cannot be queried.
pub async fn discover(client: &Client) -> kube::Result<DiscoveredResources> {
    let discovery = Discovery::new(client.clone()).run().await?;
    let mut resources = DiscoveredResources::default();
    for group in discovery.groups_alphabetical() {
        for (resource, _caps) in group.recommended_resources() {
            resources.insert(resource);
        }
    }
    tracing::debug!("discovered api resources");
    Ok(resources)
}
