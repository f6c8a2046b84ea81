//! Gating collection on leadership
//!
//! An [`Election`] produces a stream of [`LeaderState`]s; [`run_gate`] turns its transitions
//! into [`LeadershipHandler`] calls.
use std::{sync::Arc, time::Duration};

use kube::Client;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::{
    config::LeaderElectionConfig,
    coordination::{self, LeaderElector, LeaseConfig, LeaderState},
};

/// Field manager used for server-side apply of the Lease
const FIELD_MANAGER: &str = "kube-objects";
const API_TIMEOUT: Duration = Duration::from_secs(5);

/// Callbacks run when this replica becomes or stops being the leader
///
/// Both are called from the gate task and should not block.
pub trait LeadershipHandler: Send + Sync + 'static {
    fn on_acquire(&self);
    fn on_lose(&self);
}

/// A source of leadership transitions
pub trait Election: Send + 'static {
    /// Starts competing for `lock_name` until `cancel` fires
    ///
    /// # Errors
    /// Fails if the election could not be set up.
    fn campaign(
        self: Box<Self>,
        lock_name: &str,
        cancel: CancellationToken,
    ) -> coordination::Result<watch::Receiver<LeaderState>>;
}

/// Leadership decided elsewhere, e.g. by a test or an embedding application
impl Election for watch::Receiver<LeaderState> {
    fn campaign(
        self: Box<Self>,
        _lock_name: &str,
        _cancel: CancellationToken,
    ) -> coordination::Result<watch::Receiver<LeaderState>> {
        Ok(*self)
    }
}

/// An [`Election`] over a `coordination.k8s.io/v1` Lease, see [`LeaderElector`]
pub struct LeaseElection {
    client: Client,
    namespace: String,
    identity: String,
    lease_duration: Duration,
    renew_deadline: Duration,
    retry_period: Duration,
}

impl LeaseElection {
    /// Competes as this host, in the configured namespace or else `$POD_NAMESPACE` or `default`
    #[must_use]
    pub fn new(client: Client, config: &LeaderElectionConfig) -> Self {
        let namespace = config
            .lease_namespace
            .clone()
            .or_else(|| std::env::var("POD_NAMESPACE").ok())
            .unwrap_or_else(|| "default".to_string());
        let identity = hostname::get()
            .ok()
            .and_then(|name| name.into_string().ok())
            .unwrap_or_else(|| FIELD_MANAGER.to_string());
        Self {
            client,
            namespace,
            identity,
            lease_duration: config.lease_duration.into(),
            renew_deadline: config.renew_deadline.into(),
            retry_period: config.retry_period.into(),
        }
    }
}

impl Election for LeaseElection {
    fn campaign(
        self: Box<Self>,
        lock_name: &str,
        cancel: CancellationToken,
    ) -> coordination::Result<watch::Receiver<LeaderState>> {
        let config = LeaseConfig {
            lock_name: lock_name.to_string(),
            namespace: self.namespace,
            identity: self.identity,
            manager: FIELD_MANAGER.to_string(),
            lease_duration: self.lease_duration,
            renew_deadline: self.renew_deadline,
            retry_period: self.retry_period,
            api_timeout: API_TIMEOUT,
        };
        LeaderElector::spawn(config, self.client, cancel)
    }
}

/// Calls `handler` on every transition into or out of [`LeaderState::Leading`]
///
/// Runs until `cancel` fires or the election goes away; leadership held at that point
/// is given up with a final [`LeadershipHandler::on_lose`].
pub async fn run_gate(
    mut state: watch::Receiver<LeaderState>,
    handler: Arc<dyn LeadershipHandler>,
    cancel: CancellationToken,
) {
    let mut leading = false;
    loop {
        let now_leading = state.borrow_and_update().is_leader();
        if now_leading && !leading {
            tracing::info!("this instance was selected as the current leader");
            handler.on_acquire();
        } else if leading && !now_leading {
            tracing::error!("this instance was previously the leader but was removed as such");
            handler.on_lose();
        }
        leading = now_leading;

        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            changed = state.changed() => {
                if changed.is_err() {
                    tracing::warn!("leader election ended");
                    break;
                }
            }
        }
    }
    if leading {
        handler.on_lose();
    }
}
