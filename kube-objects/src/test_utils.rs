//! An in-memory cluster and consumer for exercising sessions without an API server
use std::{
    collections::{BTreeMap, HashSet, VecDeque},
    time::Duration,
};

use async_trait::async_trait;
use futures::{channel::mpsc, StreamExt};
use kube::{
    core::{
        params::{ListParams, WatchParams},
        DynamicObject, ErrorResponse, GroupVersionKind, WatchEvent,
    },
    discovery::ApiResource,
};
use parking_lot::Mutex;
use serde_json::json;

use crate::{
    client::{EventStream, Listing, ObjectApi},
    config::{CollectionMode, ResourceSelector, WatchEventType},
    logs::{ConsumerError, Logs, LogsConsumer},
};

pub(crate) fn pods_resource() -> ApiResource {
    ApiResource::from_gvk_with_plural(&GroupVersionKind::gvk("", "v1", "Pod"), "pods")
}

pub(crate) fn deployments_resource() -> ApiResource {
    ApiResource::from_gvk_with_plural(&GroupVersionKind::gvk("apps", "v1", "Deployment"), "deployments")
}

pub(crate) fn pod(name: &str, namespace: &str, labels: &[(&str, &str)]) -> DynamicObject {
    let mut obj = DynamicObject::new(name, &pods_resource())
        .within(namespace)
        .data(json!({ "spec": { "containers": [{ "name": "main", "image": "busybox" }] } }));
    if !labels.is_empty() {
        obj.metadata.labels = Some(
            labels
                .iter()
                .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                .collect(),
        );
    }
    obj
}

pub(crate) fn selector(mode: CollectionMode, namespaces: &[&str]) -> ResourceSelector {
    ResourceSelector {
        resource: pods_resource(),
        namespaces: namespaces.iter().map(ToString::to_string).collect(),
        mode,
        field_selector: String::new(),
        label_selector: String::new(),
        resource_version: String::new(),
        exclude: HashSet::new(),
    }
}

pub(crate) fn pods_selector() -> ResourceSelector {
    selector(CollectionMode::Watch, &[])
}

pub(crate) fn pull_selector(interval: Duration) -> ResourceSelector {
    selector(CollectionMode::Pull { interval }, &[])
}

pub(crate) fn excluding(mut selector: ResourceSelector, types: &[WatchEventType]) -> ResourceSelector {
    selector.exclude.extend(types.iter().copied());
    selector
}

pub(crate) fn api_error(code: u16, reason: &str) -> ErrorResponse {
    serde_json::from_value(json!({
        "status": "Failure",
        "message": format!("fake api error {code}"),
        "reason": reason,
        "code": code,
    }))
    .unwrap()
}

pub(crate) fn gone() -> ErrorResponse {
    api_error(410, "Expired")
}

/// A canned response for the next watch call
pub(crate) enum WatchScript {
    /// A stream yielding these items, then closing
    Events(Vec<kube::Result<WatchEvent<DynamicObject>>>),
    /// The watch request itself fails
    Fail(kube::Error),
}

struct LiveWatch {
    namespace: Option<String>,
    label_selector: Option<String>,
    tx: mpsc::UnboundedSender<kube::Result<WatchEvent<DynamicObject>>>,
}

#[derive(Default)]
struct State {
    objects: BTreeMap<(String, String), DynamicObject>,
    version: u64,
    watchers: Vec<LiveWatch>,
    scripts: VecDeque<WatchScript>,
    failing_lists: usize,
    list_version: Option<Option<String>>,
    list_calls: usize,
    watch_versions: Vec<String>,
}

/// A namespaced store of objects that serves list and watch calls
///
/// Watch calls are answered from queued [`WatchScript`]s first; once those run out, they
/// follow the live store and see every later [`create`](Self::create) and
/// [`delete`](Self::delete).
#[derive(Default)]
pub(crate) struct FakeCluster {
    state: Mutex<State>,
}

fn matches_labels(obj: &DynamicObject, selector: Option<&str>) -> bool {
    let Some(selector) = selector.filter(|s| !s.is_empty()) else {
        return true;
    };
    let labels = obj.metadata.labels.clone().unwrap_or_default();
    selector.split(',').all(|requirement| match requirement.split_once('=') {
        Some((key, value)) => labels.get(key.trim()).map(String::as_str) == Some(value.trim()),
        None => labels.contains_key(requirement.trim()),
    })
}

fn in_scope(obj: &DynamicObject, namespace: Option<&str>) -> bool {
    namespace.is_none_or(|ns| obj.metadata.namespace.as_deref() == Some(ns))
}

impl FakeCluster {
    pub(crate) fn with_objects(objects: impl IntoIterator<Item = DynamicObject>) -> Self {
        let cluster = Self::default();
        for obj in objects {
            cluster.create(obj);
        }
        cluster
    }

    pub(crate) fn create(&self, obj: DynamicObject) {
        self.apply(obj, WatchEvent::Added);
    }

    pub(crate) fn delete(&self, namespace: &str, name: &str) {
        let mut state = self.state.lock();
        let key = (namespace.to_string(), name.to_string());
        if let Some(obj) = state.objects.remove(&key) {
            drop(state);
            self.apply_removed(obj);
        }
    }

    fn apply_removed(&self, obj: DynamicObject) {
        let mut state = self.state.lock();
        state.version += 1;
        let mut obj = obj;
        obj.metadata.resource_version = Some(state.version.to_string());
        Self::notify(&mut state, &obj, WatchEvent::Deleted(obj.clone()));
    }

    fn apply(&self, mut obj: DynamicObject, event: fn(DynamicObject) -> WatchEvent<DynamicObject>) {
        let mut state = self.state.lock();
        state.version += 1;
        obj.metadata.resource_version = Some(state.version.to_string());
        let key = (
            obj.metadata.namespace.clone().unwrap_or_default(),
            obj.metadata.name.clone().unwrap_or_default(),
        );
        state.objects.insert(key, obj.clone());
        let ev = event(obj.clone());
        Self::notify(&mut state, &obj, ev);
    }

    fn notify(state: &mut State, obj: &DynamicObject, event: WatchEvent<DynamicObject>) {
        state.watchers.retain(|w| !w.tx.is_closed());
        for watcher in &state.watchers {
            if in_scope(obj, watcher.namespace.as_deref())
                && matches_labels(obj, watcher.label_selector.as_deref())
            {
                let _ = watcher.tx.unbounded_send(Ok(event.clone()));
            }
        }
    }

    pub(crate) fn script_watch(&self, script: WatchScript) {
        self.state.lock().scripts.push_back(script);
    }

    /// Fails the next `count` list calls with an internal error
    pub(crate) fn fail_lists(&self, count: usize) {
        self.state.lock().failing_lists = count;
    }

    /// Overrides the collection resource version returned by list calls
    pub(crate) fn set_list_version(&self, version: Option<&str>) {
        self.state.lock().list_version = Some(version.map(ToString::to_string));
    }

    pub(crate) fn list_calls(&self) -> usize {
        self.state.lock().list_calls
    }

    pub(crate) fn watch_calls(&self) -> usize {
        self.state.lock().watch_versions.len()
    }

    /// The resource versions watch calls were made from, in order
    pub(crate) fn watch_versions(&self) -> Vec<String> {
        self.state.lock().watch_versions.clone()
    }

    /// Live watch streams that are still held open by a client
    pub(crate) fn open_watches(&self) -> usize {
        let mut state = self.state.lock();
        state.watchers.retain(|w| !w.tx.is_closed());
        state.watchers.len()
    }
}

#[async_trait]
impl ObjectApi for FakeCluster {
    async fn list(
        &self,
        _resource: &ApiResource,
        namespace: Option<&str>,
        params: &ListParams,
    ) -> kube::Result<Listing> {
        let mut state = self.state.lock();
        state.list_calls += 1;
        if state.failing_lists > 0 {
            state.failing_lists -= 1;
            return Err(kube::Error::Api(api_error(500, "InternalError")));
        }
        let items = state
            .objects
            .values()
            .filter(|obj| in_scope(obj, namespace) && matches_labels(obj, params.label_selector.as_deref()))
            .cloned()
            .collect();
        let resource_version = state
            .list_version
            .clone()
            .unwrap_or_else(|| Some(state.version.to_string()));
        Ok(Listing {
            items,
            resource_version,
        })
    }

    async fn watch(
        &self,
        _resource: &ApiResource,
        namespace: Option<&str>,
        params: &WatchParams,
        resource_version: &str,
    ) -> kube::Result<EventStream> {
        let mut state = self.state.lock();
        state.watch_versions.push(resource_version.to_string());
        match state.scripts.pop_front() {
            Some(WatchScript::Events(events)) => Ok(futures::stream::iter(events).boxed()),
            Some(WatchScript::Fail(err)) => Err(err),
            None => {
                let (tx, rx) = mpsc::unbounded();
                state.watchers.push(LiveWatch {
                    namespace: namespace.map(ToString::to_string),
                    label_selector: params.label_selector.clone(),
                    tx,
                });
                Ok(rx.boxed())
            }
        }
    }
}

/// A [`LogsConsumer`] keeping every batch it accepted
#[derive(Default)]
pub(crate) struct RecordingConsumer {
    batches: Mutex<Vec<Logs>>,
    failure: Mutex<Option<String>>,
    refused: Mutex<usize>,
}

impl RecordingConsumer {
    /// Makes every later call fail with `message`
    pub(crate) fn fail_with(&self, message: &str) {
        *self.failure.lock() = Some(message.to_string());
    }

    /// Accepts every later call again
    pub(crate) fn recover(&self) {
        *self.failure.lock() = None;
    }

    /// Number of failed consumer calls
    pub(crate) fn refusals(&self) -> usize {
        *self.refused.lock()
    }

    pub(crate) fn batches(&self) -> Vec<Logs> {
        self.batches.lock().clone()
    }

    /// Number of successful consumer calls
    pub(crate) fn invocations(&self) -> usize {
        self.batches.lock().len()
    }

    pub(crate) fn record_count(&self) -> usize {
        self.batches.lock().iter().map(Logs::log_record_count).sum()
    }
}

#[async_trait]
impl LogsConsumer for RecordingConsumer {
    async fn consume_logs(&self, logs: Logs) -> Result<(), ConsumerError> {
        if let Some(message) = self.failure.lock().clone() {
            *self.refused.lock() += 1;
            return Err(message.into());
        }
        self.batches.lock().push(logs);
        Ok(())
    }
}
