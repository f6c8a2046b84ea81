//! Receiver configuration, and its validation into [`ResourceSelector`]s
//!
//! The raw [`Config`] mirrors what a pipeline operator writes:
//!
//! ```yaml
//! objects:
//!   - name: pods
//!     mode: pull
//!     interval: 30s
//!     label_selector: environment=production
//!   - name: events
//!     group: events.k8s.io
//!     mode: watch
//!     namespaces: [default]
//!     exclude_watch_type: [DELETED]
//! leader_election:
//!   enabled: true
//! ```
//!
//! Before anything runs, every [`ObjectsConfig`] is resolved against the resources the API server
//! advertises and frozen into a [`ResourceSelector`].
use std::{
    collections::{HashMap, HashSet},
    fmt,
    time::Duration,
};

use kube::{
    core::{
        params::{ListParams, VersionMatch, WatchParams},
        Duration as KubeDuration, WatchEvent,
    },
    discovery::ApiResource,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Interval used for `pull` mode when none is configured.
pub const DEFAULT_PULL_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Errors found while validating a [`Config`]
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// No served resource has the configured name
    #[error("resource {0} not found")]
    ResourceNotFound(String),
    /// The resource exists, but not in the configured group
    #[error("group {group} not found for resource {resource}")]
    GroupNotFound { resource: String, group: String },
    /// `exclude_watch_type` was given for a resource collected in `pull` mode
    #[error("the exclude_watch_type option can only be used with watch mode (resource {0})")]
    ExcludeRequiresWatch(String),
    /// `interval` was zero or negative
    #[error("interval must be a positive duration (resource {0})")]
    InvalidInterval(String),
}

/// Top level receiver configuration
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// The resources to collect
    pub objects: Vec<ObjectsConfig>,
    /// Leader election across receiver replicas
    pub leader_election: LeaderElectionConfig,
}

impl Config {
    /// Validates every configured resource against the discovered API resources
    ///
    /// # Errors
    /// Returns the first [`ConfigError`] found, in configuration order.
    pub fn validate(&self, discovered: &DiscoveredResources) -> Result<Vec<ResourceSelector>, ConfigError> {
        self.objects.iter().map(|object| object.validate(discovered)).collect()
    }
}

/// How a resource is collected
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Periodically list every object
    #[default]
    Pull,
    /// Follow the change stream of the resource
    Watch,
}

/// The kind of a watch event, as named on the wire
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum WatchEventType {
    /// An object was created
    Added,
    /// An object was updated
    Modified,
    /// An object was deleted
    Deleted,
    /// A resource version checkpoint
    Bookmark,
    /// The server reported an error on the stream
    Error,
}

impl WatchEventType {
    /// Classifies a watch event
    #[must_use]
    pub fn of<K>(event: &WatchEvent<K>) -> Self {
        match event {
            WatchEvent::Added(_) => Self::Added,
            WatchEvent::Modified(_) => Self::Modified,
            WatchEvent::Deleted(_) => Self::Deleted,
            WatchEvent::Bookmark(_) => Self::Bookmark,
            WatchEvent::Error(_) => Self::Error,
        }
    }

    /// The wire name of the event type
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Added => "ADDED",
            Self::Modified => "MODIFIED",
            Self::Deleted => "DELETED",
            Self::Bookmark => "BOOKMARK",
            Self::Error => "ERROR",
        }
    }
}

impl fmt::Display for WatchEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configuration of one collected resource
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct ObjectsConfig {
    /// Plural resource name, e.g. `pods`
    pub name: String,
    /// API group of the resource; the first served group is used when empty
    pub group: String,
    /// Namespaces to collect from; all namespaces when empty
    pub namespaces: Vec<String>,
    pub mode: Mode,
    /// Time between two listings in `pull` mode
    pub interval: Option<KubeDuration>,
    pub field_selector: String,
    pub label_selector: String,
    /// Resource version to list at (`pull`) or to start watching from (`watch`)
    pub resource_version: String,
    /// Watch event types that are never emitted
    pub exclude_watch_type: Vec<WatchEventType>,
}

impl ObjectsConfig {
    /// Resolves this resource and freezes it into a [`ResourceSelector`]
    ///
    /// # Errors
    /// Fails when the resource (or its group) is not served, when `exclude_watch_type` is
    /// used outside of `watch` mode, or when `interval` is not positive.
    pub fn validate(&self, discovered: &DiscoveredResources) -> Result<ResourceSelector, ConfigError> {
        let resource = discovered.lookup(&self.name, &self.group)?.clone();
        let mode = match self.mode {
            Mode::Pull => {
                if !self.exclude_watch_type.is_empty() {
                    return Err(ConfigError::ExcludeRequiresWatch(self.name.clone()));
                }
                let interval = match self.interval {
                    None => DEFAULT_PULL_INTERVAL,
                    Some(interval) if interval.is_negative() => {
                        return Err(ConfigError::InvalidInterval(self.name.clone()))
                    }
                    Some(interval) => Duration::from(interval),
                };
                if interval.is_zero() {
                    return Err(ConfigError::InvalidInterval(self.name.clone()));
                }
                CollectionMode::Pull { interval }
            }
            Mode::Watch => CollectionMode::Watch,
        };

        Ok(ResourceSelector {
            resource,
            namespaces: self.namespaces.clone(),
            mode,
            field_selector: self.field_selector.clone(),
            label_selector: self.label_selector.clone(),
            resource_version: self.resource_version.clone(),
            exclude: self.exclude_watch_type.iter().copied().collect(),
        })
    }
}

/// The API resources served by a cluster, indexed by plural name
#[derive(Clone, Debug, Default)]
pub struct DiscoveredResources {
    by_name: HashMap<String, Vec<ApiResource>>,
}

impl DiscoveredResources {
    /// Records a served resource
    ///
    /// Resources sharing a plural name are kept in insertion order, which decides the group
    /// picked for an [`ObjectsConfig`] without one.
    pub fn insert(&mut self, resource: ApiResource) {
        self.by_name.entry(resource.plural.clone()).or_default().push(resource);
    }

    fn lookup(&self, name: &str, group: &str) -> Result<&ApiResource, ConfigError> {
        let candidates = self
            .by_name
            .get(name)
            .filter(|found| !found.is_empty())
            .ok_or_else(|| ConfigError::ResourceNotFound(name.to_string()))?;
        if group.is_empty() {
            return Ok(&candidates[0]);
        }
        candidates
            .iter()
            .find(|resource| resource.group == group)
            .ok_or_else(|| ConfigError::GroupNotFound {
                resource: name.to_string(),
                group: group.to_string(),
            })
    }
}

impl FromIterator<ApiResource> for DiscoveredResources {
    fn from_iter<I: IntoIterator<Item = ApiResource>>(iter: I) -> Self {
        let mut discovered = Self::default();
        for resource in iter {
            discovered.insert(resource);
        }
        discovered
    }
}

/// How a validated resource is collected
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CollectionMode {
    /// List every `interval`, starting immediately
    Pull { interval: Duration },
    /// Follow the change stream
    Watch,
}

/// A validated, immutable description of one collected resource
#[derive(Clone, Debug)]
pub struct ResourceSelector {
    pub resource: ApiResource,
    pub namespaces: Vec<String>,
    pub mode: CollectionMode,
    pub field_selector: String,
    pub label_selector: String,
    pub resource_version: String,
    pub exclude: HashSet<WatchEventType>,
}

impl ResourceSelector {
    /// A `group/version/plural` identifier for logging
    #[must_use]
    pub fn id(&self) -> String {
        let ar = &self.resource;
        if ar.group.is_empty() {
            format!("{}/{}", ar.version, ar.plural)
        } else {
            format!("{}/{}/{}", ar.group, ar.version, ar.plural)
        }
    }

    #[must_use]
    pub fn is_excluded(&self, event_type: WatchEventType) -> bool {
        self.exclude.contains(&event_type)
    }

    /// List parameters carrying only the field and label selectors
    #[must_use]
    pub fn list_params(&self) -> ListParams {
        let mut lp = ListParams::default();
        if !self.field_selector.is_empty() {
            lp = lp.fields(&self.field_selector);
        }
        if !self.label_selector.is_empty() {
            lp = lp.labels(&self.label_selector);
        }
        lp
    }

    /// List parameters for a `pull` tick, pinned to the configured resource version when set
    #[must_use]
    pub fn pull_params(&self) -> ListParams {
        let lp = self.list_params();
        if self.resource_version.is_empty() {
            lp
        } else {
            lp.at(&self.resource_version).matching(VersionMatch::Exact)
        }
    }

    #[must_use]
    pub fn watch_params(&self) -> WatchParams {
        let mut wp = WatchParams::default();
        if !self.field_selector.is_empty() {
            wp = wp.fields(&self.field_selector);
        }
        if !self.label_selector.is_empty() {
            wp = wp.labels(&self.label_selector);
        }
        wp
    }
}

/// Leader election across replicas of the receiver
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct LeaderElectionConfig {
    pub enabled: bool,
    /// Name of the Lease competed for; derived by [`ReceiverId::lock_name`](crate::ReceiverId::lock_name)
    /// when unset
    pub lock_name: Option<String>,
    /// Namespace of the Lease; `$POD_NAMESPACE` or `default` when unset
    pub lease_namespace: Option<String>,
    pub lease_duration: KubeDuration,
    pub renew_deadline: KubeDuration,
    pub retry_period: KubeDuration,
}

impl Default for LeaderElectionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            lock_name: None,
            lease_namespace: None,
            lease_duration: Duration::from_secs(15).into(),
            renew_deadline: Duration::from_secs(10).into(),
            retry_period: Duration::from_secs(2).into(),
        }
    }
}
