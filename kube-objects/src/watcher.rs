//! A watch stream that resumes itself from the last seen resource version
//!
//! The API server ends every watch request after a while, and connections fail for all sorts of
//! transient reasons. [`retry_watcher`] hides both: it re-opens the watch from the resource version
//! of the last event it saw, so consumers observe one continuous stream of events.
//!
//! Transport failures, throttling and server errors are retried with a capped backoff for as long
//! as it takes. The stream only ends after yielding a [`WatchEvent::Error`]:
//! - with code `410 Gone`, when the remembered version fell out of the server's watch window and
//!   the caller needs to list again;
//! - when the server rejected opening the watch in a way retrying cannot fix, e.g. `404` for a
//!   resource that no longer exists.
use std::{sync::Arc, time::Duration};

use backon::{BackoffBuilder, ExponentialBackoff, ExponentialBuilder};
use futures::{Stream, StreamExt};
use kube::{
    core::{params::WatchParams, DynamicObject, ErrorResponse, WatchEvent},
    discovery::ApiResource,
};
use thiserror::Error;
use tokio::time::Instant;

use crate::client::{EventStream, ObjectApi};

/// Minimum time between the starts of two consecutive watch requests
const MIN_RESTART_DELAY: Duration = Duration::from_secs(1);
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum Error {
    #[error("initial resource version {0:?} is not supported by watch, list first to obtain one")]
    UnsupportedResourceVersion(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Whether the error indicates the resource version is too old to resume from
#[must_use]
pub fn is_gone(err: &ErrorResponse) -> bool {
    err.code == 410
}

/// Errors the server expects the client to simply retry
fn is_retryable(err: &ErrorResponse) -> bool {
    matches!(err.code, 429 | 500..=599) || err.reason == "TooManyRequests" || err.reason == "Timeout"
}

/// Credentials may be rotated or permissions granted while we wait
fn is_unauthorized(err: &ErrorResponse) -> bool {
    matches!(err.code, 401 | 403)
}

fn reconnect_backoff() -> ExponentialBackoff {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(800))
        .with_max_delay(MAX_RECONNECT_DELAY)
        .with_factor(2.0)
        .with_jitter()
        .without_max_times()
        .build()
}

struct Context {
    api: Arc<dyn ObjectApi>,
    resource: ApiResource,
    namespace: Option<String>,
    params: WatchParams,
    resource_version: String,
    backoff: ExponentialBackoff,
    last_start: Option<Instant>,
}

impl Context {
    fn reconnect_after_failure(&mut self) -> State {
        State::Connecting {
            delay: self.backoff.next().unwrap_or(MAX_RECONNECT_DELAY),
        }
    }

    fn remember_version(&mut self, obj: &DynamicObject) {
        if let Some(version) = &obj.metadata.resource_version {
            self.resource_version.clone_from(version);
        }
    }
}

/// The internal finite state machine driving the [`retry_watcher`]
enum State {
    /// Open a new watch request after `delay`
    Connecting { delay: Duration },
    /// Relay events from an open watch request
    Watching { stream: EventStream },
    /// The stream is finished
    Done,
}

/// Progresses the watcher a single step, returning (event, state)
///
/// This function should be trampolined: if event == `None`
/// then the function should be called again until it returns a Some.
async fn step_trampolined(ctx: &mut Context, state: State) -> (Option<WatchEvent<DynamicObject>>, State) {
    match state {
        State::Connecting { delay } => {
            let since_last = ctx.last_start.map_or(MIN_RESTART_DELAY, |started| started.elapsed());
            let delay = delay.max(MIN_RESTART_DELAY.saturating_sub(since_last));
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            ctx.last_start = Some(Instant::now());
            let opened = ctx
                .api
                .watch(&ctx.resource, ctx.namespace.as_deref(), &ctx.params, &ctx.resource_version)
                .await;
            match opened {
                Ok(stream) => {
                    ctx.backoff = reconnect_backoff();
                    (None, State::Watching { stream })
                }
                Err(kube::Error::Api(err)) if is_gone(&err) => (Some(WatchEvent::Error(err)), State::Done),
                Err(kube::Error::Api(err)) if is_unauthorized(&err) => {
                    tracing::error!(
                        resource = %ctx.resource.plural,
                        error = %err,
                        "watch failed: ensure the client has valid credentials \
                         and watch permissions on the resource"
                    );
                    let state = ctx.reconnect_after_failure();
                    (Some(WatchEvent::Error(err)), state)
                }
                Err(kube::Error::Api(err)) if !is_retryable(&err) => {
                    tracing::error!(
                        resource = %ctx.resource.plural,
                        error = %err,
                        "watch rejected by api server"
                    );
                    (Some(WatchEvent::Error(err)), State::Done)
                }
                Err(err) => {
                    tracing::warn!(resource = %ctx.resource.plural, error = %err, "watch failed");
                    (None, ctx.reconnect_after_failure())
                }
            }
        }
        State::Watching { mut stream } => match stream.next().await {
            Some(Ok(event @ (WatchEvent::Added(_) | WatchEvent::Modified(_) | WatchEvent::Deleted(_)))) => {
                if let WatchEvent::Added(obj) | WatchEvent::Modified(obj) | WatchEvent::Deleted(obj) =
                    &event
                {
                    ctx.remember_version(obj);
                }
                (Some(event), State::Watching { stream })
            }
            Some(Ok(WatchEvent::Bookmark(bm))) => {
                ctx.resource_version = bm.metadata.resource_version;
                (None, State::Watching { stream })
            }
            // HTTP GONE, means we have desynced and the caller needs to start over and re-list
            Some(Ok(WatchEvent::Error(err))) if is_gone(&err) => (Some(WatchEvent::Error(err)), State::Done),
            Some(Ok(WatchEvent::Error(err))) if is_retryable(&err) => {
                tracing::debug!(error = %err, "watch interrupted by api server, reconnecting");
                (None, ctx.reconnect_after_failure())
            }
            Some(Ok(WatchEvent::Error(err))) => (Some(WatchEvent::Error(err)), State::Watching { stream }),
            Some(Err(err)) => {
                tracing::warn!(resource = %ctx.resource.plural, error = %err, "watch stream failed");
                (None, ctx.reconnect_after_failure())
            }
            None => {
                tracing::debug!(
                    resource = %ctx.resource.plural,
                    resource_version = %ctx.resource_version,
                    "watch closed by server, resuming"
                );
                (None, State::Connecting { delay: Duration::ZERO })
            }
        },
        State::Done => (None, State::Done),
    }
}

/// Trampoline helper for `step_trampolined`
async fn step(ctx: &mut Context, mut state: State) -> Option<(WatchEvent<DynamicObject>, State)> {
    loop {
        if matches!(state, State::Done) {
            return None;
        }
        match step_trampolined(ctx, state).await {
            (Some(event), new_state) => return Some((event, new_state)),
            (None, new_state) => state = new_state,
        }
    }
}

/// Watches a resource in one scope from `resource_version` onwards, resuming on interruption
///
/// Bookmarks are consumed to advance the remembered version and never yielded. Error events
/// the server expects to be retried (`429` and `5xx`) re-open the watch without being yielded;
/// other error events are yielded and the watch carries on. See the [module docs](self) for
/// when the stream ends.
///
/// # Errors
/// An empty or `"0"` `resource_version` is rejected: those ask the server for a synthetic
/// initial state, which a resumed watch cannot reproduce.
pub fn retry_watcher(
    api: Arc<dyn ObjectApi>,
    resource: ApiResource,
    namespace: Option<String>,
    params: WatchParams,
    resource_version: &str,
) -> Result<impl Stream<Item = WatchEvent<DynamicObject>> + Send + 'static> {
    if resource_version.is_empty() || resource_version == "0" {
        return Err(Error::UnsupportedResourceVersion(resource_version.to_string()));
    }
    let ctx = Context {
        api,
        resource,
        namespace,
        params,
        resource_version: resource_version.to_string(),
        backoff: reconnect_backoff(),
        last_start: None,
    };
    Ok(futures::stream::unfold(
        (ctx, State::Connecting { delay: Duration::ZERO }),
        |(mut ctx, state)| async move {
            let (event, state) = step(&mut ctx, state).await?;
            Some((event, (ctx, state)))
        },
    ))
}
