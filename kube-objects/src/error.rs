//! Error handling in [`kube_objects`][crate]
use thiserror::Error;

use crate::config::ConfigError;

/// Errors returned while constructing or starting an [`ObjectsReceiver`](crate::ObjectsReceiver)
///
/// Errors that happen while collecting are never returned; they are logged against the
/// resource and namespace of the session that hit them.
#[derive(Error, Debug)]
pub enum Error {
    /// Leader election was enabled without a lock to compete for
    #[error("lock_name must not be empty if leader election is enabled")]
    MissingLockName,

    /// The receiver configuration did not validate against the cluster's resources
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    /// A client for the Kubernetes API could not be created
    #[error("failed to create kubernetes client: {0}")]
    Client(#[source] kube::Error),

    /// The cluster's API resources could not be discovered
    #[error("failed to discover api resources: {0}")]
    Discovery(#[source] kube::Error),

    /// [`start`](crate::ObjectsReceiver::start) was called more than once
    #[error("receiver was already started")]
    AlreadyStarted,
}

/// Convenient alias for `Result<T, Error>`
pub type Result<T, E = Error> = std::result::Result<T, E>;
