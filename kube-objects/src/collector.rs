//! Fan-out of configured resources to one session per namespace
use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::{
    client::ObjectApi,
    logs::LogsConsumer,
    obsreport::ObsReport,
    registry::Registry,
    session::Session,
    ResourceSelector,
};

pub(crate) struct Collector {
    api: Arc<dyn ObjectApi>,
    consumer: Arc<dyn LogsConsumer>,
    obsreport: Arc<ObsReport>,
    registry: Arc<Registry>,
    selectors: Vec<Arc<ResourceSelector>>,
}

impl Collector {
    pub(crate) fn new(
        api: Arc<dyn ObjectApi>,
        consumer: Arc<dyn LogsConsumer>,
        obsreport: Arc<ObsReport>,
        registry: Arc<Registry>,
        selectors: Vec<ResourceSelector>,
    ) -> Self {
        Self {
            api,
            consumer,
            obsreport,
            registry,
            selectors: selectors.into_iter().map(Arc::new).collect(),
        }
    }

    /// Starts sessions for every configured resource
    pub(crate) fn start_all(&self) -> Vec<JoinHandle<()>> {
        self.selectors.iter().flat_map(|selector| self.start(selector)).collect()
    }

    /// Starts the sessions of one resource: one per namespace, or one across all namespaces
    pub(crate) fn start(&self, selector: &Arc<ResourceSelector>) -> Vec<JoinHandle<()>> {
        tracing::info!(
            resource = %selector.id(),
            mode = ?selector.mode,
            namespaces = ?selector.namespaces,
            "started collecting"
        );
        if selector.namespaces.is_empty() {
            vec![self.spawn(selector, None)]
        } else {
            selector
                .namespaces
                .iter()
                .map(|ns| self.spawn(selector, Some(ns.clone())))
                .collect()
        }
    }

    fn spawn(&self, selector: &Arc<ResourceSelector>, namespace: Option<String>) -> JoinHandle<()> {
        // registered before spawning, so a shutdown racing the spawn still reaches the session
        let registration = self.registry.register();
        let span = tracing::info_span!(
            "session",
            resource = %selector.id(),
            namespace = namespace.as_deref().unwrap_or("*"),
        );
        let session = Session {
            api: self.api.clone(),
            selector: selector.clone(),
            namespace,
            consumer: self.consumer.clone(),
            obsreport: self.obsreport.clone(),
            cancel: registration.token().clone(),
        };
        tokio::spawn(
            async move {
                session.run().await;
                drop(registration);
            }
            .instrument(span),
        )
    }

    /// Cancels every running session, leaving the collector ready to start again
    pub(crate) fn stop_all(&self) -> usize {
        self.registry.cancel_all()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::CollectionMode,
        test_utils::{selector, FakeCluster, RecordingConsumer},
    };
    use std::time::Duration;

    fn collector(cluster: &Arc<FakeCluster>, selectors: Vec<ResourceSelector>) -> (Collector, Arc<Registry>) {
        let registry = Arc::new(Registry::default());
        let collector = Collector::new(
            cluster.clone(),
            Arc::new(RecordingConsumer::default()),
            Arc::new(ObsReport::new("k8sobjects", "http")),
            registry.clone(),
            selectors,
        );
        (collector, registry)
    }

    #[tokio::test(start_paused = true)]
    async fn spawns_one_session_per_namespace() {
        let cluster = Arc::new(FakeCluster::default());
        let (collector, registry) = collector(&cluster, vec![
            selector(CollectionMode::Watch, &["a", "b", "c"]),
            selector(CollectionMode::Pull { interval: Duration::from_secs(60) }, &[]),
        ]);

        let handles = collector.start_all();
        assert_eq!(handles.len(), 4);
        assert_eq!(registry.len(), 4);

        assert_eq!(collector.stop_all(), 4);
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(registry.len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn finished_sessions_leave_the_registry() {
        let cluster = Arc::new(FakeCluster::default());
        cluster.fail_lists(1);
        let (collector, registry) = collector(&cluster, vec![selector(CollectionMode::Watch, &["default"])]);

        let handles = collector.start_all();
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(cluster.list_calls(), 1);
        assert_eq!(registry.len(), 0);
    }
}
