//! The receiver: configured collection, optionally gated on leadership
use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use kube::Client;
use parking_lot::Mutex;
use tracing::Instrument;

use crate::{
    client::{self, ObjectApi},
    collector::Collector,
    config::{Config, LeaderElectionConfig, ResourceSelector},
    error::{Error, Result},
    leader::{self, Election, LeadershipHandler, LeaseElection},
    logs::LogsConsumer,
    obsreport::ObsReport,
    registry::Registry,
};

/// Component type of the receiver, shared by its default lock name
const COMPONENT_TYPE: &str = "k8sobjects";
/// Transport reported for every collected batch
pub const TRANSPORT: &str = "http";

/// Identifies one receiver instance within a pipeline
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReceiverId {
    pub name: Option<String>,
}

impl ReceiverId {
    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        Self { name: Some(name.into()) }
    }

    /// The Lease competed for unless configured otherwise
    #[must_use]
    pub fn lock_name(&self) -> String {
        match self.name.as_deref() {
            Some(name) if !name.is_empty() => format!("{COMPONENT_TYPE}-{name}"),
            _ => COMPONENT_TYPE.to_string(),
        }
    }
}

impl fmt::Display for ReceiverId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name.as_deref() {
            Some(name) if !name.is_empty() => write!(f, "{COMPONENT_TYPE}/{name}"),
            _ => f.write_str(COMPONENT_TYPE),
        }
    }
}

/// The lock name to compete for, or `None` when leader election is disabled
fn resolve_lock_name(id: &ReceiverId, config: &LeaderElectionConfig) -> Result<Option<String>> {
    if !config.enabled {
        return Ok(None);
    }
    let lock_name = config.lock_name.clone().unwrap_or_else(|| id.lock_name());
    if lock_name.is_empty() {
        return Err(Error::MissingLockName);
    }
    Ok(Some(lock_name))
}

struct Leadership {
    lock_name: String,
    election: Mutex<Option<Box<dyn Election>>>,
}

/// Starts and stops all sessions as leadership comes and goes
struct Collecting {
    collector: Arc<Collector>,
}

impl LeadershipHandler for Collecting {
    fn on_acquire(&self) {
        self.collector.start_all();
    }

    fn on_lose(&self) {
        let stopped = self.collector.stop_all();
        tracing::debug!(stopped, "stopped collecting");
    }
}

/// Collects the configured resources into log records for a consumer
///
/// Nothing runs until [`start`](Self::start); [`shutdown`](Self::shutdown) stops every session
/// without waiting for them to exit.
pub struct ObjectsReceiver {
    id: ReceiverId,
    collector: Arc<Collector>,
    registry: Arc<Registry>,
    leadership: Option<Leadership>,
    started: AtomicBool,
}

impl ObjectsReceiver {
    /// Connects to the cluster from the ambient configuration and validates `config` against
    /// the resources it serves
    ///
    /// # Errors
    /// Fails if leader election is enabled with an empty lock name, if no client can be
    /// created, if discovery fails or if the configuration does not validate.
    pub async fn try_new(id: ReceiverId, config: &Config, consumer: Arc<dyn LogsConsumer>) -> Result<Self> {
        let lock_name = resolve_lock_name(&id, &config.leader_election)?;
        let client = Client::try_default().await.map_err(Error::Client)?;
        let discovered = client::discover(&client).await.map_err(Error::Discovery)?;
        let selectors = config.validate(&discovered)?;

        let receiver = Self::new(id, selectors, Arc::new(client.clone()), consumer);
        match lock_name {
            Some(lock_name) => {
                receiver.with_leader_election(lock_name, LeaseElection::new(client, &config.leader_election))
            }
            None => Ok(receiver),
        }
    }

    /// A receiver collecting already validated resources through `api`
    #[must_use]
    pub fn new(
        id: ReceiverId,
        selectors: Vec<ResourceSelector>,
        api: Arc<dyn ObjectApi>,
        consumer: Arc<dyn LogsConsumer>,
    ) -> Self {
        let registry = Arc::new(Registry::default());
        let obsreport = Arc::new(ObsReport::new(id.to_string(), TRANSPORT));
        let collector = Collector::new(api, consumer, obsreport, registry.clone(), selectors);
        Self {
            id,
            collector: Arc::new(collector),
            registry,
            leadership: None,
            started: AtomicBool::new(false),
        }
    }

    /// Only collects while `election` reports this replica as the leader of `lock_name`
    ///
    /// # Errors
    /// Fails with [`Error::MissingLockName`] if `lock_name` is empty.
    pub fn with_leader_election(
        mut self,
        lock_name: impl Into<String>,
        election: impl Election,
    ) -> Result<Self> {
        let lock_name = lock_name.into();
        if lock_name.is_empty() {
            return Err(Error::MissingLockName);
        }
        self.leadership = Some(Leadership {
            lock_name,
            election: Mutex::new(Some(Box::new(election))),
        });
        Ok(self)
    }

    #[must_use]
    pub fn id(&self) -> &ReceiverId {
        &self.id
    }

    /// Starts collecting, or campaigning for leadership first when configured
    ///
    /// Must be called from within a tokio runtime. A failure to set up the election is
    /// logged and leaves the receiver idle.
    ///
    /// # Errors
    /// Fails with [`Error::AlreadyStarted`] on every call but the first.
    pub fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyStarted);
        }
        let Some(leadership) = &self.leadership else {
            self.collector.start_all();
            return Ok(());
        };
        let Some(election) = leadership.election.lock().take() else {
            return Err(Error::AlreadyStarted);
        };

        let lock_name = leadership.lock_name.as_str();
        let cancel = self.registry.child_token();
        match election.campaign(lock_name, cancel.clone()) {
            Ok(state) => {
                let handler = Arc::new(Collecting {
                    collector: self.collector.clone(),
                });
                tokio::spawn(
                    leader::run_gate(state, handler, cancel)
                        .instrument(tracing::info_span!("leader_election", lock_name)),
                );
            }
            Err(err) => tracing::error!(lock_name, error = %err, "create leader elector failed"),
        }
        Ok(())
    }

    /// Stops every session and the election; does not wait for them to exit
    ///
    /// # Errors
    /// Never fails; the signature leaves room for fallible teardown.
    pub fn shutdown(&self) -> Result<()> {
        let cancelled = self.registry.shutdown();
        tracing::debug!(receiver = %self.id, cancelled, "receiver shut down");
        Ok(())
    }
}
