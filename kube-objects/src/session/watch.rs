use std::time::{Duration, SystemTime};

use backon::{BackoffBuilder, ExponentialBackoff, ExponentialBuilder};
use futures::StreamExt;
use kube::core::WatchEvent;

use super::{Session, SessionError};
use crate::{
    config::WatchEventType,
    logs::watch_event_to_logs,
    watcher::{is_gone, retry_watcher},
};

/// Watched from when the server returns no usable collection version
const DEFAULT_RESOURCE_VERSION: &str = "1";
const MAX_RESTART_DELAY: Duration = Duration::from_secs(60);

/// How one watch attempt ended
#[derive(Debug)]
enum Outcome {
    /// The remembered version expired, list and watch again
    Restart,
    Fatal(SessionError),
    Cancelled,
}

fn restart_backoff() -> ExponentialBackoff {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_secs(1))
        .with_max_delay(MAX_RESTART_DELAY)
        .with_jitter()
        .without_max_times()
        .build()
}

/// Cursor of a watch session, owned by its task
#[derive(Debug, Default)]
struct SessionState {
    /// Version to resume from; empty to list first
    resource_version: String,
    /// Set after an expiry until the next watch is established
    restarting: bool,
}

/// Follows the resource, starting over whenever the server expired our version
pub(super) async fn run(session: &Session) {
    let mut state = SessionState {
        resource_version: session.selector.resource_version.clone(),
        restarting: false,
    };
    let mut backoff = restart_backoff();
    loop {
        let (outcome, delivered) = stream(session, &mut state).await;
        match outcome {
            Outcome::Cancelled => return,
            Outcome::Fatal(err) => {
                tracing::error!(error = %err, "stopped watching");
                return;
            }
            Outcome::Restart => {
                state.resource_version.clear();
                state.restarting = true;
                if delivered {
                    backoff = restart_backoff();
                }
                let delay = backoff.next().unwrap_or(MAX_RESTART_DELAY);
                tracing::info!(delay_ms = delay.as_millis(), "resource version expired, restarting watch");
                tokio::select! {
                    biased;
                    () = session.cancel.cancelled() => return,
                    () = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}

/// The version to start watching from, listing the resource if `hint` is not one
async fn resolve_version(session: &Session, hint: &str) -> Result<String, Outcome> {
    if !hint.is_empty() && hint != "0" {
        return Ok(hint.to_string());
    }
    let params = session.selector.list_params();
    let listed = tokio::select! {
        biased;
        () = session.cancel.cancelled() => return Err(Outcome::Cancelled),
        res = session.api.list(&session.selector.resource, session.namespace(), &params) => res,
    };
    let listing = listed.map_err(|err| Outcome::Fatal(SessionError::InitialList(err)))?;
    Ok(listing
        .resource_version
        .filter(|version| !version.is_empty() && version != "0")
        .unwrap_or_else(|| DEFAULT_RESOURCE_VERSION.to_string()))
}

/// Delivers events of one watch until it ends, also reporting whether anything was delivered
async fn stream(session: &Session, state: &mut SessionState) -> (Outcome, bool) {
    let version = match resolve_version(session, &state.resource_version).await {
        Ok(version) => version,
        Err(outcome) => return (outcome, false),
    };
    let selector = &session.selector;
    let events = match retry_watcher(
        session.api.clone(),
        selector.resource.clone(),
        session.namespace.clone(),
        selector.watch_params(),
        &version,
    ) {
        Ok(events) => events,
        Err(err) => return (Outcome::Fatal(SessionError::WatchStart(err)), false),
    };
    futures::pin_mut!(events);
    if std::mem::take(&mut state.restarting) {
        tracing::info!(resource_version = %version, "watch re-established");
    } else {
        tracing::debug!(resource_version = %version, "watching");
    }
    state.resource_version = version;

    let mut delivered = false;
    loop {
        let next = tokio::select! {
            biased;
            () = session.cancel.cancelled() => return (Outcome::Cancelled, delivered),
            next = events.next() => next,
        };
        let Some(event) = next else {
            tracing::warn!("watch channel closed unexpectedly");
            return (Outcome::Fatal(SessionError::StreamClosed), delivered);
        };
        if let WatchEvent::Error(err) = &event {
            if is_gone(err) {
                return (Outcome::Restart, delivered);
            }
        }

        let event_type = WatchEventType::of(&event);
        if selector.is_excluded(event_type) {
            tracing::debug!(%event_type, "dropping excluded event");
            continue;
        }
        match watch_event_to_logs(&event, SystemTime::now(), selector) {
            Ok(logs) => {
                if !session.deliver(logs, 1).await {
                    return (Outcome::Cancelled, delivered);
                }
                delivered = true;
            }
            Err(err) => tracing::error!(%event_type, error = %err, "failed to convert watch event"),
        }
    }
}
