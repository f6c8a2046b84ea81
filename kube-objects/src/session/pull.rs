use std::time::{Duration, SystemTime};

use tokio::time::MissedTickBehavior;

use super::Session;
use crate::logs::pull_objects_to_logs;

/// Lists the resource every `period`, starting right away
pub(super) async fn run(session: &Session, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let params = session.selector.pull_params();

    loop {
        tokio::select! {
            biased;
            () = session.cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }

        let listed = tokio::select! {
            biased;
            () = session.cancel.cancelled() => return,
            res = session.api.list(&session.selector.resource, session.namespace(), &params) => res,
        };
        let objects = match listed {
            Ok(listing) => listing.items,
            Err(err) => {
                tracing::error!(error = %err, "error in pulling objects");
                continue;
            }
        };
        if objects.is_empty() {
            tracing::trace!("no objects listed");
            continue;
        }

        match pull_objects_to_logs(&objects, SystemTime::now(), &session.selector) {
            Ok(logs) => {
                let count = logs.log_record_count();
                if !session.deliver(logs, count).await {
                    return;
                }
            }
            Err(err) => tracing::error!(error = %err, "failed to convert listed objects"),
        }
    }
}
