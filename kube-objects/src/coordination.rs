//! Leader election over a `coordination.k8s.io/v1` Lease
//!
//! Every replica runs a [`LeaderElector`] competing for the same Lease. The holder renews it
//! every `retry_period`; the others keep a watch on the Lease and only try to take it over
//! once it went `lease_duration` without a renewal they observed.
//!
//! The current [`LeaderState`] is published over a [`watch`] channel, which closes once the
//! elector stopped:
//!
//! ```rust,ignore
//! let mut state = LeaderElector::spawn(config, client, cancel.clone())?;
//! while state.changed().await.is_ok() {
//!     if state.borrow().is_leader() {
//!         // start leader-only work
//!     }
//! }
//! ```
//!
//! Like the client-go elector this follows, no fencing is provided: two replicas may
//! briefly both believe they lead. Only locally captured timestamps are compared, which
//! makes the elector tolerant to clock skew between nodes but not to skew rate.
use std::time::Duration;

use futures::{Future, StreamExt};
use k8s_openapi::{
    api::coordination::v1::Lease,
    apimachinery::pkg::apis::meta::v1::MicroTime,
    chrono::Utc,
};
use kube::{
    api::{Api, Patch, PatchParams, PostParams},
    runtime::{
        watcher::{self, watcher, Event},
        WatchStreamExt,
    },
    Client,
};
use rand::Rng;
use thiserror::Error;
use tokio::{sync::watch, time::Instant};
use tokio_util::sync::CancellationToken;

/// Upper bound of the random factor applied to delays while not leading
const JITTER_FACTOR: f64 = 1.2;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid leader election config: {0}")]
    Config(String),
    #[error("timeout while updating lease")]
    Timeout,
    #[error("lease api call failed: {0}")]
    Api(#[source] kube::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Parameters of a [`LeaderElector`]
#[derive(Clone, Debug)]
pub struct LeaseConfig {
    /// Name of the Lease object
    pub lock_name: String,
    pub namespace: String,
    /// Holder identity written to the Lease while leading, usually the pod name
    pub identity: String,
    /// Server-side apply field manager, shared by all replicas
    pub manager: String,
    /// How long followers wait without observing a renewal before taking over
    pub lease_duration: Duration,
    /// How long the leader keeps retrying failed renewals before stepping down
    pub renew_deadline: Duration,
    /// Time between two acquisition or renewal attempts
    pub retry_period: Duration,
    /// Timeout of every call to the API server
    pub api_timeout: Duration,
}

impl LeaseConfig {
    /// Checks the durations are consistent with each other
    ///
    /// # Errors
    /// Fails with [`Error::Config`] when the identity, lock name or manager is empty,
    /// when any duration is below a second, when `lease_duration` does not exceed
    /// `renew_deadline`, or when `renew_deadline` does not exceed the jittered
    /// `retry_period`.
    pub fn validate(&self) -> Result<()> {
        for (field, value) in [
            ("lock_name", &self.lock_name),
            ("identity", &self.identity),
            ("manager", &self.manager),
        ] {
            if value.is_empty() {
                return Err(Error::Config(format!("{field} may not be empty")));
            }
        }
        for (field, value) in [
            ("lease_duration", self.lease_duration),
            ("renew_deadline", self.renew_deadline),
            ("retry_period", self.retry_period),
            ("api_timeout", self.api_timeout),
        ] {
            if value < Duration::from_secs(1) {
                return Err(Error::Config(format!("{field} must be at least 1 second")));
            }
        }
        if self.lease_duration <= self.renew_deadline {
            return Err(Error::Config(
                "lease_duration must be greater than renew_deadline".into(),
            ));
        }
        if self.renew_deadline <= self.retry_period.mul_f64(JITTER_FACTOR) {
            return Err(Error::Config(format!(
                "renew_deadline must be greater than retry_period*{JITTER_FACTOR}"
            )));
        }
        Ok(())
    }
}

/// Leadership as observed by one replica
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LeaderState {
    /// This replica holds the Lease
    Leading,
    /// Another replica holds the Lease
    Following,
    /// The Lease is vacant or unknown, or the elector is starting or stopping
    Standby,
}

impl LeaderState {
    #[must_use]
    pub fn is_leader(self) -> bool {
        matches!(self, Self::Leading)
    }

    /// How a replica named `identity` relates to the current holder of `lease`
    fn of(lease: &Lease, identity: &str) -> Self {
        match holder(lease) {
            "" => Self::Standby,
            holder if holder == identity => Self::Leading,
            _ => Self::Following,
        }
    }
}

fn holder(lease: &Lease) -> &str {
    lease
        .spec
        .as_ref()
        .and_then(|spec| spec.holder_identity.as_deref())
        .unwrap_or_default()
}

/// What the elector last saw of the Lease
#[derive(Debug)]
enum Observed {
    /// Held by someone, seen changing at `at`
    Held {
        lease: Lease,
        role: LeaderState,
        at: Instant,
    },
    /// Vacant, or not known to exist
    Vacant { lease: Option<Lease> },
}

impl Observed {
    fn lease(&self) -> Option<&Lease> {
        match self {
            Self::Held { lease, .. } => Some(lease),
            Self::Vacant { lease } => lease.as_ref(),
        }
    }

    fn role(&self) -> LeaderState {
        match self {
            Self::Held { role, .. } => *role,
            Self::Vacant { .. } => LeaderState::Standby,
        }
    }
}

/// A task acquiring and renewing a Lease; see the [module docs](self)
pub struct LeaderElector {
    api: Api<Lease>,
    config: LeaseConfig,
    observed: Observed,
    state_tx: watch::Sender<LeaderState>,
    last_attempt_failed: bool,
}

impl LeaderElector {
    /// Validates `config` and spawns the elector onto the runtime
    ///
    /// The task runs until `cancel` fires, after which the published state returns to
    /// [`LeaderState::Standby`] and the channel closes.
    ///
    /// # Errors
    /// Returns the [`LeaseConfig::validate`] error without spawning anything.
    pub fn spawn(
        config: LeaseConfig,
        client: Client,
        cancel: CancellationToken,
    ) -> Result<watch::Receiver<LeaderState>> {
        config.validate()?;
        let (elector, state) = Self::new(config, client);
        tokio::spawn(elector.run(cancel));
        Ok(state)
    }

    fn new(config: LeaseConfig, client: Client) -> (Self, watch::Receiver<LeaderState>) {
        let (state_tx, state) = watch::channel(LeaderState::Standby);
        let elector = LeaderElector {
            api: Api::namespaced(client, &config.namespace),
            config,
            observed: Observed::Vacant { lease: None },
            state_tx,
            last_attempt_failed: false,
        };
        (elector, state)
    }

    async fn run(mut self, cancel: CancellationToken) {
        tracing::info!(
            lease = %self.config.lock_name,
            identity = %self.config.identity,
            "leader elector started"
        );
        self.attempt().await;

        let lease_events = watcher(
            self.api.clone(),
            watcher::Config::default().fields(&format!("metadata.name={}", self.config.lock_name)),
        )
        .default_backoff();
        tokio::pin!(lease_events);

        loop {
            let delay = self.next_attempt_in();
            tracing::trace!(delay_ms = delay.as_millis(), "waiting for next lease attempt");
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                Some(event) = lease_events.next() => self.handle_lease_event(event),
                () = tokio::time::sleep(delay) => self.attempt().await,
            }
        }

        self.state_tx.send_replace(LeaderState::Standby);
        tracing::info!(lease = %self.config.lock_name, "leader elector stopped");
    }

    async fn attempt(&mut self) {
        match self.try_acquire_or_renew().await {
            Ok(()) => self.last_attempt_failed = false,
            Err(err) => {
                tracing::error!(
                    lease = %self.config.lock_name,
                    error = %err,
                    "failed to acquire or renew lease"
                );
                self.last_attempt_failed = true;
                let renewal_overdue = matches!(
                    &self.observed,
                    Observed::Held { role: LeaderState::Leading, at, .. }
                        if at.elapsed() >= self.config.renew_deadline
                );
                if renewal_overdue || !self.observed.role().is_leader() {
                    self.observe(None);
                }
            }
        }
    }

    fn handle_lease_event(&mut self, event: watcher::Result<Event<Lease>>) {
        match event {
            Ok(Event::Apply(lease) | Event::InitApply(lease)) => self.observe(Some(lease)),
            Ok(Event::Delete(_)) => {
                tracing::warn!(
                    lease = %self.config.lock_name,
                    namespace = %self.config.namespace,
                    "lease deleted, will re-create"
                );
                self.observe(None);
            }
            Ok(Event::Init | Event::InitDone) => {}
            Err(err) => tracing::warn!(error = %err, "lease watch failed"),
        }
    }

    async fn call<T>(&self, request: impl Future<Output = kube::Result<T>>) -> Result<T> {
        tokio::time::timeout(self.config.api_timeout, request)
            .await
            .map_err(|_elapsed| Error::Timeout)?
            .map_err(Error::Api)
    }

    #[tracing::instrument(level = "debug", skip_all, fields(lease = %self.config.lock_name))]
    #[allow(clippy::cast_possible_truncation)]
    async fn try_acquire_or_renew(&mut self) -> Result<()> {
        if !self.observed.role().is_leader() {
            let current = self.call(self.api.get_opt(&self.config.lock_name)).await?;
            self.observe(current);
            let lease_live = matches!(
                &self.observed,
                Observed::Held { role: LeaderState::Following, at, .. }
                    if at.elapsed() < self.config.lease_duration
            );
            if lease_live {
                return Ok(());
            }
        }

        let acquiring = !self.observed.role().is_leader();
        let existing = self.observed.lease().cloned();
        let mut lease = existing.clone().unwrap_or_default();
        lease.metadata.name = Some(self.config.lock_name.clone());
        lease.metadata.namespace = Some(self.config.namespace.clone());
        lease.metadata.managed_fields = None;
        let now = MicroTime(Utc::now());
        let spec = lease.spec.get_or_insert_with(Default::default);
        spec.lease_duration_seconds = Some(self.config.lease_duration.as_secs() as i32);
        spec.renew_time = Some(now.clone());
        if acquiring {
            spec.holder_identity = Some(self.config.identity.clone());
            spec.acquire_time = Some(now);
            spec.lease_transitions = Some(spec.lease_transitions.map_or(0, |n| n + 1));
        }

        let updated = if existing.is_some() {
            // resourceVersion is kept, so the apply conflicts when someone else updated first
            let params = PatchParams::apply(&self.config.manager).force();
            self.call(self.api.patch(&self.config.lock_name, &params, &Patch::Apply(&lease)))
                .await?
        } else {
            self.call(self.api.create(&PostParams::default(), &lease)).await?
        };
        if acquiring {
            tracing::info!(
                lease = %self.config.lock_name,
                identity = %self.config.identity,
                "acquired lease"
            );
        }
        self.observe(Some(updated));
        Ok(())
    }

    /// Records the latest known version of the Lease and publishes the resulting state
    fn observe(&mut self, lease: Option<Lease>) {
        match lease {
            None => self.observed = Observed::Vacant { lease: None },
            Some(lease) if self.observed.lease() == Some(&lease) => return,
            Some(lease) => {
                self.observed = match LeaderState::of(&lease, &self.config.identity) {
                    LeaderState::Standby => Observed::Vacant { lease: Some(lease) },
                    role => Observed::Held {
                        lease,
                        role,
                        at: Instant::now(),
                    },
                };
            }
        }
        let role = self.observed.role();
        self.state_tx.send_if_modified(|current| {
            let changed = *current != role;
            *current = role;
            changed
        });
    }

    /// A jittered `retry_period`, used after failed attempts
    fn retry_in(&self, rng: &mut impl Rng) -> Duration {
        self.config
            .retry_period
            .mul_f64(rng.random_range(0.5..1.5) * JITTER_FACTOR)
    }

    fn next_attempt_in(&self) -> Duration {
        let mut rng = rand::rng();
        let (since, wait) = match &self.observed {
            // still inside the renew deadline, so `at` is the last successful renewal
            Observed::Held {
                role: LeaderState::Leading,
                ..
            } if self.last_attempt_failed => return self.retry_in(&mut rng),
            Observed::Held {
                role: LeaderState::Leading,
                at,
                ..
            } => (*at, self.config.retry_period),
            Observed::Held { at, .. } => {
                let jitter = self
                    .config
                    .lease_duration
                    .mul_f64(rng.random_range(0.01..1.0) * JITTER_FACTOR);
                (*at, self.config.lease_duration + jitter)
            }
            Observed::Vacant { .. } if self.last_attempt_failed => return self.retry_in(&mut rng),
            Observed::Vacant { .. } => return Duration::ZERO,
        };
        (since + wait).saturating_duration_since(Instant::now())
    }
}
