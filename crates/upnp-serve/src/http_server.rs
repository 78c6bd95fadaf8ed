//! The renderer's HTTP surface: device/service description, the single
//! control endpoint shared by all three services, and SUBSCRIBE/UNSUBSCRIBE
//! on the event endpoint.
//!
//! `SUBSCRIBE`/`UNSUBSCRIBE` aren't in axum's [`MethodFilter`], so the event
//! route is mounted with [`axum::routing::any`] and dispatched on the
//! extracted [`Method`] inside the handler instead of at the router layer.

use std::time::Duration;

use axum::extract::{Path, State};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get, post};
use http::{header::CONTENT_TYPE, HeaderMap, Method, StatusCode};
use tracing::debug;

use crate::constants::{CONTENT_TYPE_XML_UTF8, DEFAULT_SUBSCRIPTION_TIMEOUT_SECS};
use crate::dispatcher::control_http_handler;
use crate::notify;
use crate::registry::ServiceKind;
use crate::state::AppState;

async fn description_xml(State(state): State<AppState>) -> impl IntoResponse {
    ([(CONTENT_TYPE, CONTENT_TYPE_XML_UTF8)], state.rendered_root_description.clone())
}

async fn scpd_xml(Path(service): Path<String>) -> Response {
    match service.as_str() {
        "AVTransport.xml" => (
            [(CONTENT_TYPE, CONTENT_TYPE_XML_UTF8)],
            include_str!("../resources/xml/AVTransport.xml"),
        )
            .into_response(),
        "RenderingControl.xml" => (
            [(CONTENT_TYPE, CONTENT_TYPE_XML_UTF8)],
            include_str!("../resources/xml/RenderingControl.xml"),
        )
            .into_response(),
        "ConnectionManager.xml" => (
            [(CONTENT_TYPE, CONTENT_TYPE_XML_UTF8)],
            include_str!("../resources/xml/ConnectionManager.xml"),
        )
            .into_response(),
        _ => StatusCode::NOT_FOUND.into_response(),
    }
}

fn parse_timeout_header(headers: &HeaderMap) -> Duration {
    headers
        .get("timeout")
        .and_then(|v| v.to_str().ok())
        .and_then(|raw| raw.strip_prefix("Second-"))
        .and_then(|secs| secs.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(Duration::from_secs(DEFAULT_SUBSCRIPTION_TIMEOUT_SECS))
}

fn parse_callback_header(headers: &HeaderMap) -> Option<url::Url> {
    let raw = headers.get("callback")?.to_str().ok()?;
    let inner = raw.split('>').next()?.trim().trim_start_matches('<').trim();
    url::Url::parse(inner).ok()
}

fn subscribe_response(sid: &str, timeout: Duration) -> Response {
    (
        StatusCode::OK,
        [
            ("SID", sid.to_owned()),
            ("TIMEOUT", format!("Second-{}", timeout.as_secs())),
        ],
    )
        .into_response()
}

async fn handle_subscribe(kind: ServiceKind, headers: HeaderMap, state: AppState) -> Response {
    let timeout = parse_timeout_header(&headers);

    if let Some(sid) = headers.get("sid").and_then(|v| v.to_str().ok()) {
        let sid = sid.to_owned();
        return match state.subscriptions.renew_by_sid(&sid, timeout) {
            Ok(()) => subscribe_response(&sid, timeout),
            Err(_) => (StatusCode::PRECONDITION_FAILED, "no such subscription").into_response(),
        };
    }

    let callback = match parse_callback_header(&headers) {
        Some(url) => url,
        None => return (StatusCode::PRECONDITION_FAILED, "missing CALLBACK").into_response(),
    };

    let (sid, is_new) = state.subscriptions.subscribe(kind, callback.clone(), timeout);
    if is_new {
        let state = state.clone();
        let sid_for_event = sid.clone();
        tokio::spawn(async move {
            notify::send_initial_event(&state, kind, &sid_for_event, callback).await;
        });
    }
    subscribe_response(&sid, timeout)
}

async fn handle_unsubscribe(headers: HeaderMap, state: AppState) -> Response {
    let sid = match headers.get("sid").and_then(|v| v.to_str().ok()) {
        Some(sid) => sid.to_owned(),
        None => return (StatusCode::PRECONDITION_FAILED, "missing SID").into_response(),
    };
    match state.subscriptions.remove(&sid) {
        Ok(_) => StatusCode::OK.into_response(),
        Err(_) => (StatusCode::PRECONDITION_FAILED, "no such subscription").into_response(),
    }
}

async fn event_handler(
    Path(service): Path<String>,
    method: Method,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Response {
    let kind: ServiceKind = match service.parse() {
        Ok(k) => k,
        Err(_) => return StatusCode::NOT_FOUND.into_response(),
    };
    match method.as_str() {
        "SUBSCRIBE" => handle_subscribe(kind, headers, state).await,
        "UNSUBSCRIBE" => handle_unsubscribe(headers, state).await,
        _ => {
            debug!(%method, "unsupported method on event endpoint");
            StatusCode::METHOD_NOT_ALLOWED.into_response()
        }
    }
}

pub fn make_router(state: AppState) -> axum::Router {
    axum::Router::new()
        .route("/description.xml", get(description_xml))
        .route("/dlna/{service}", get(scpd_xml))
        .route("/{service}/action", post(control_http_handler))
        .route("/{service}/event", any(event_handler))
        .with_state(state)
}
