//! Mapping of Kubernetes objects to log records, and the consumer they are handed to
use std::{collections::BTreeMap, collections::HashMap, time::SystemTime};

use async_trait::async_trait;
use kube::core::{DynamicObject, WatchEvent};
use serde_json::{json, Value};
use thiserror::Error;

use crate::config::{ResourceSelector, WatchEventType};

/// Resource attribute naming the namespace of the records in a [`ResourceLogs`]
pub const NAMESPACE_ATTRIBUTE: &str = "k8s.namespace.name";
/// Record attribute naming the collected resource
pub const RESOURCE_NAME_ATTRIBUTE: &str = "k8s.resource.name";
pub const EVENT_DOMAIN_ATTRIBUTE: &str = "event.domain";
pub const EVENT_NAME_ATTRIBUTE: &str = "event.name";

/// The error type returned by a [`LogsConsumer`]
pub type ConsumerError = Box<dyn std::error::Error + Send + Sync>;

/// The downstream receiver of collected log records
///
/// Calls happen on the session that produced the batch, so a slow consumer throttles that
/// session only.
#[async_trait]
pub trait LogsConsumer: Send + Sync + 'static {
    async fn consume_logs(&self, logs: Logs) -> Result<(), ConsumerError>;
}

/// A batch of log records, grouped by the namespace of the objects they came from
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Logs {
    pub resource_logs: Vec<ResourceLogs>,
}

impl Logs {
    #[must_use]
    pub fn log_record_count(&self) -> usize {
        self.resource_logs.iter().map(|rl| rl.records.len()).sum()
    }

    /// All records of the batch, in order
    pub fn records(&self) -> impl Iterator<Item = &LogRecord> {
        self.resource_logs.iter().flat_map(|rl| rl.records.iter())
    }
}

/// Log records sharing resource attributes
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ResourceLogs {
    pub attributes: BTreeMap<String, String>,
    pub records: Vec<LogRecord>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct LogRecord {
    pub observed_timestamp: SystemTime,
    pub attributes: BTreeMap<String, String>,
    pub body: Value,
}

/// Errors converting an object to a log record
#[derive(Debug, Error)]
pub enum MappingError {
    #[error("watch event of type {0} carries no object")]
    NoObject(WatchEventType),
    #[error("failed to serialize object: {0}")]
    Serialize(#[source] serde_json::Error),
}

/// Maps the result of one listing to a single batch, one record per object
///
/// # Errors
/// Fails if an object cannot be serialized.
pub fn pull_objects_to_logs(
    objects: &[DynamicObject],
    observed_at: SystemTime,
    selector: &ResourceSelector,
) -> Result<Logs, MappingError> {
    let mut batch = Batch::new(observed_at, selector);
    for object in objects {
        let body = serde_json::to_value(object).map_err(MappingError::Serialize)?;
        batch.push(object.metadata.namespace.as_deref(), body, BTreeMap::new());
    }
    Ok(batch.finish())
}

/// Maps a single watch event to a batch holding one record
///
/// The record body wraps the object with the event type, and the object name is recorded as
/// the event name.
///
/// # Errors
/// Fails for bookmark and error events, which carry no object, and if the object cannot
/// be serialized.
pub fn watch_event_to_logs(
    event: &WatchEvent<DynamicObject>,
    observed_at: SystemTime,
    selector: &ResourceSelector,
) -> Result<Logs, MappingError> {
    let event_type = WatchEventType::of(event);
    let object = match event {
        WatchEvent::Added(obj) | WatchEvent::Modified(obj) | WatchEvent::Deleted(obj) => obj,
        WatchEvent::Bookmark(_) | WatchEvent::Error(_) => return Err(MappingError::NoObject(event_type)),
    };
    let body = json!({
        "type": event_type.as_str(),
        "object": serde_json::to_value(object).map_err(MappingError::Serialize)?,
    });

    let mut attributes = BTreeMap::new();
    if let Some(name) = object.metadata.name.as_deref().filter(|name| !name.is_empty()) {
        attributes.insert(EVENT_DOMAIN_ATTRIBUTE.to_string(), "k8s".to_string());
        attributes.insert(EVENT_NAME_ATTRIBUTE.to_string(), name.to_string());
    }

    let mut batch = Batch::new(observed_at, selector);
    batch.push(object.metadata.namespace.as_deref(), body, attributes);
    Ok(batch.finish())
}

/// Accumulates records into per-namespace [`ResourceLogs`], in first-seen order
struct Batch<'a> {
    observed_at: SystemTime,
    selector: &'a ResourceSelector,
    by_namespace: HashMap<String, usize>,
    logs: Logs,
}

impl<'a> Batch<'a> {
    fn new(observed_at: SystemTime, selector: &'a ResourceSelector) -> Self {
        Self {
            observed_at,
            selector,
            by_namespace: HashMap::new(),
            logs: Logs::default(),
        }
    }

    fn push(&mut self, namespace: Option<&str>, body: Value, mut attributes: BTreeMap<String, String>) {
        let namespace = namespace.unwrap_or_default();
        let idx = *self.by_namespace.entry(namespace.to_string()).or_insert_with(|| {
            let mut resource = ResourceLogs::default();
            if !namespace.is_empty() {
                resource
                    .attributes
                    .insert(NAMESPACE_ATTRIBUTE.to_string(), namespace.to_string());
            }
            self.logs.resource_logs.push(resource);
            self.logs.resource_logs.len() - 1
        });
        attributes.insert(
            RESOURCE_NAME_ATTRIBUTE.to_string(),
            self.selector.resource.plural.clone(),
        );
        self.logs.resource_logs[idx].records.push(LogRecord {
            observed_timestamp: self.observed_at,
            attributes,
            body,
        });
    }

    fn finish(self) -> Logs {
        self.logs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{pod, pods_selector};
    use kube::core::ErrorResponse;

    #[test]
    fn pulled_objects_are_grouped_by_namespace() {
        let selector = pods_selector();
        let objects = [
            pod("pod1", "default", &[("environment", "production")]),
            pod("pod2", "kube-system", &[]),
            pod("pod3", "default", &[]),
        ];
        let logs = pull_objects_to_logs(&objects, SystemTime::UNIX_EPOCH, &selector).unwrap();

        assert_eq!(logs.log_record_count(), 3);
        assert_eq!(logs.resource_logs.len(), 2);
        assert_eq!(logs.resource_logs[0].attributes[NAMESPACE_ATTRIBUTE], "default");
        assert_eq!(logs.resource_logs[0].records.len(), 2);
        assert_eq!(logs.resource_logs[1].attributes[NAMESPACE_ATTRIBUTE], "kube-system");

        let first = &logs.resource_logs[0].records[0];
        assert_eq!(first.attributes[RESOURCE_NAME_ATTRIBUTE], "pods");
        assert_eq!(first.body["metadata"]["name"], "pod1");
        assert_eq!(first.body["metadata"]["labels"]["environment"], "production");
        assert_eq!(first.observed_timestamp, SystemTime::UNIX_EPOCH);
    }

    #[test]
    fn cluster_scoped_objects_carry_no_namespace_attribute() {
        let selector = pods_selector();
        let mut object = pod("node-a", "", &[]);
        object.metadata.namespace = None;
        let logs = pull_objects_to_logs(&[object], SystemTime::now(), &selector).unwrap();
        assert!(logs.resource_logs[0].attributes.is_empty());
    }

    #[test]
    fn watch_events_wrap_the_object_with_its_type() {
        let selector = pods_selector();
        let event = WatchEvent::Deleted(pod("pod1", "default", &[]));
        let logs = watch_event_to_logs(&event, SystemTime::now(), &selector).unwrap();

        assert_eq!(logs.log_record_count(), 1);
        let record = logs.records().next().unwrap();
        assert_eq!(record.body["type"], "DELETED");
        assert_eq!(record.body["object"]["metadata"]["name"], "pod1");
        assert_eq!(record.attributes[EVENT_DOMAIN_ATTRIBUTE], "k8s");
        assert_eq!(record.attributes[EVENT_NAME_ATTRIBUTE], "pod1");
        assert_eq!(record.attributes[RESOURCE_NAME_ATTRIBUTE], "pods");
    }

    #[test]
    fn error_events_are_not_mappable() {
        let selector = pods_selector();
        let status: ErrorResponse = serde_json::from_value(json!({
            "status": "Failure",
            "message": "internal error",
            "reason": "InternalError",
            "code": 500
        }))
        .unwrap();
        let err = watch_event_to_logs(&WatchEvent::Error(status), SystemTime::now(), &selector).unwrap_err();
        assert!(matches!(err, MappingError::NoObject(WatchEventType::Error)));
    }
}
