//! Kubernetes objects receiver
//!
//! This crate collects Kubernetes objects of the configured resource types and turns them into
//! log records for a downstream [`LogsConsumer`]. Each configured resource is collected either by
//! periodically listing it (`pull` mode) or by following its change stream (`watch` mode), with
//! one session per namespace.
//!
//! When leader election is enabled, collection only runs while this replica holds the
//! configured `coordination.k8s.io/v1` Lease, so a horizontally scaled deployment does not
//! emit duplicate records.
//!
//! Most users will want to start with [`ObjectsReceiver::try_new`].

#![deny(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod client;
pub mod config;
pub mod coordination;
pub mod error;
pub mod leader;
pub mod logs;
pub mod obsreport;
pub mod receiver;
pub mod watcher;

mod collector;
mod registry;
mod session;

#[cfg(test)] mod test_utils;

pub use client::{Listing, ObjectApi};
pub use coordination::LeaderState;
pub use config::{Config, LeaderElectionConfig, Mode, ObjectsConfig, ResourceSelector, WatchEventType};
pub use error::{Error, Result};
pub use leader::{Election, LeaseElection, LeadershipHandler};
pub use logs::{ConsumerError, Logs, LogsConsumer};
pub use receiver::{ObjectsReceiver, ReceiverId};
