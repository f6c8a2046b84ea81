//! Collection sessions: one task per collected resource and namespace
//!
//! A session lists ([`pull`]) or watches ([`watch`]) its resource until its cancellation
//! token fires or it hits an error it cannot recover from. Errors never leave the session;
//! they are logged under the span the [`Collector`](crate::collector::Collector) runs it in.
use std::sync::Arc;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::{
    client::ObjectApi,
    config::{CollectionMode, ResourceSelector},
    logs::{Logs, LogsConsumer},
    obsreport::ObsReport,
    watcher,
};

mod pull;
mod watch;

/// Conditions ending a watch session for good
#[derive(Debug, Error)]
pub(crate) enum SessionError {
    #[error("failed to list objects for initial resource version: {0}")]
    InitialList(#[source] kube::Error),
    #[error("failed to start watch: {0}")]
    WatchStart(#[source] watcher::Error),
    #[error("watch channel closed unexpectedly")]
    StreamClosed,
}

pub(crate) struct Session {
    pub(crate) api: Arc<dyn ObjectApi>,
    pub(crate) selector: Arc<ResourceSelector>,
    /// `None` for a cluster-wide session
    pub(crate) namespace: Option<String>,
    pub(crate) consumer: Arc<dyn LogsConsumer>,
    pub(crate) obsreport: Arc<ObsReport>,
    pub(crate) cancel: CancellationToken,
}

impl Session {
    /// Runs the session to completion
    pub(crate) async fn run(self) {
        match self.selector.mode {
            CollectionMode::Pull { interval } => pull::run(&self, interval).await,
            CollectionMode::Watch => watch::run(&self).await,
        }
        tracing::debug!("session stopped");
    }

    fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    /// Hands a batch to the consumer, returning `false` if cancelled first
    ///
    /// Consumer errors are recorded by the [`ObsReport`] and otherwise ignored.
    async fn deliver(&self, logs: Logs, items: usize) -> bool {
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => false,
            _ = self.obsreport.consume(self.consumer.as_ref(), logs, items) => true,
        }
    }
}
