//! NOTIFY delivery: the initial post-SUBSCRIBE event and the periodic
//! change-draining tick that fans batched state changes out to subscribers.
//!
//! Grounded in the reference renderer's `ObserveClient`: a background loop
//! drains queued property changes and POSTs a NOTIFY per subscriber,
//! evicting subscribers once they cross a consecutive-failure threshold.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::registry::ServiceKind;
use crate::state::AppState;
use crate::templates;

const NOTIFY_TIMEOUT: Duration = Duration::from_secs(5);
const TICK_INTERVAL: Duration = Duration::from_secs(1);

async fn deliver(state: &AppState, sid: &str, callback: &url::Url, body: String) -> bool {
    let seq = match state.subscriptions.next_seq(sid) {
        Ok(seq) => seq,
        Err(_) => return false,
    };

    let client = reqwest::Client::new();
    let method = reqwest::Method::from_bytes(b"NOTIFY").expect("NOTIFY is a valid HTTP method token");
    let result = client
        .request(method, callback.clone())
        .header("NT", "upnp:event")
        .header("NTS", "upnp:propchange")
        .header("SID", sid)
        .header("SEQ", seq.to_string())
        .header(reqwest::header::CONTENT_TYPE, crate::constants::CONTENT_TYPE_XML_UTF8)
        .timeout(NOTIFY_TIMEOUT)
        .body(body)
        .send()
        .await;

    match result {
        Ok(resp) if resp.status().is_success() => {
            state.subscriptions.reset_error(sid);
            true
        }
        Ok(resp) => {
            debug!(status=%resp.status(), sid, "NOTIFY rejected by subscriber");
            !state.subscriptions.record_error(sid)
        }
        Err(e) => {
            debug!(error=?e, sid, "error delivering NOTIFY");
            !state.subscriptions.record_error(sid)
        }
    }
}

/// Sends the one-shot initial event a new SUBSCRIBE is owed, carrying every
/// currently-observed variable for the service.
pub async fn send_initial_event(state: &AppState, kind: ServiceKind, sid: &str, callback: url::Url) {
    let changes = state.registry.service(kind).get_all_observed();
    if changes.is_empty() {
        return;
    }
    let body = templates::render_event_body(kind, &changes);
    deliver(state, sid, &callback, body).await;
}

/// Runs until `state.cancellation_token` fires: every second, drains the
/// state-change queue into a per-service change-set (last write per
/// variable name wins within the window) and fans a NOTIFY out to every
/// subscriber of that service.
pub async fn run_forever(state: AppState, mut change_rx: mpsc::UnboundedReceiver<(ServiceKind, String, String)>) {
    let mut pending: HashMap<ServiceKind, HashMap<String, String>> = HashMap::new();
    let mut interval = tokio::time::interval(TICK_INTERVAL);

    loop {
        tokio::select! {
            _ = state.cancellation_token.cancelled() => return,
            _ = interval.tick() => {
                for sid in state.subscriptions.expire() {
                    trace!(sid, "subscription expired");
                }
                for (kind, changes) in pending.drain() {
                    if changes.is_empty() {
                        continue;
                    }
                    let changes: Vec<(String, String)> = changes.into_iter().collect();
                    let body = templates::render_event_body(kind, &changes);
                    for (sid, callback) in state.subscriptions.for_service(kind) {
                        deliver(&state, &sid, &callback, body.clone()).await;
                    }
                }
            }
            Some((kind, name, value)) = change_rx.recv() => {
                pending.entry(kind).or_default().insert(name, value);
            }
        }
    }
}
