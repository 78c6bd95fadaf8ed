//! SOAP envelope parsing/building and the generic action-dispatch algorithm.
//!
//! Mirrors the reference renderer's `call(rawbody)`: parse the envelope,
//! derive `(service, action)` from the sole body child's tag/namespace,
//! look up a bespoke handler, and fall back to echoing the registry's
//! declared output arguments when none is registered.

use std::collections::HashMap;

use anyhow::{bail, Context};
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::response::IntoResponse;
use http::{header::CONTENT_TYPE, HeaderMap, StatusCode};
use quick_xml::events::Event;
use quick_xml::reader::Reader;
use tracing::{debug, trace, warn};

use crate::constants::{CONTENT_TYPE_XML_UTF8, EXT_HEADER_NAME, EXT_HEADER_VALUE};
use crate::registry::{Registry, ServiceKind};
use crate::services;
use crate::state::AppState;

#[derive(Debug)]
pub struct SoapRequest {
    pub action: String,
    pub args: HashMap<String, String>,
}

/// A player-control command decoded out of a SOAP action, handed to the
/// renderer driver over an outgoing channel. Dispatch never blocks waiting
/// for the player to act on it.
#[derive(Debug, Clone)]
pub enum RendererCommand {
    SetAvTransportUri { uri: String, metadata: String },
    SetNextAvTransportUri { uri: String, metadata: String },
    Play { speed: String },
    Pause,
    Stop,
    Seek { unit: String, target: String },
    Next,
    Previous,
    SetVolume { value: u16 },
    SetMute { value: bool },
}

fn local_name(name: quick_xml::name::QName<'_>) -> anyhow::Result<String> {
    Ok(std::str::from_utf8(name.local_name().as_ref())?.to_owned())
}

fn find_xmlns(e: &quick_xml::events::BytesStart<'_>) -> Option<String> {
    for attr in e.attributes().flatten() {
        let key = attr.key.as_ref();
        if key == b"xmlns" || key.starts_with(b"xmlns:") {
            if let Ok(value) = attr.unescape_value() {
                return Some(value.into_owned());
            }
        }
    }
    None
}

pub fn service_kind_from_namespace(ns: &str) -> anyhow::Result<ServiceKind> {
    match ns {
        crate::constants::SERVICE_TYPE_AV_TRANSPORT => Ok(ServiceKind::AvTransport),
        crate::constants::SERVICE_TYPE_RENDERING_CONTROL => Ok(ServiceKind::RenderingControl),
        crate::constants::SERVICE_TYPE_CONNECTION_MANAGER => Ok(ServiceKind::ConnectionManager),
        other => bail!("unrecognized service namespace {other}"),
    }
}

/// Parses a SOAP request body into the dispatched service and a flat
/// name→text-content map of the action's input arguments.
pub fn parse_soap_request(body: &str) -> anyhow::Result<(ServiceKind, SoapRequest)> {
    let mut reader = Reader::from_str(body);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();

    let mut depth: u32 = 0;
    let mut action_name: Option<String> = None;
    let mut namespace: Option<String> = None;
    let mut current_arg: Option<String> = None;
    let mut args = HashMap::new();

    loop {
        match reader.read_event_into(&mut buf).context("xml parse error")? {
            Event::Start(e) => {
                depth += 1;
                let local = local_name(e.name())?;
                if depth == 3 && action_name.is_none() {
                    namespace = find_xmlns(&e);
                    action_name = Some(local);
                } else if depth == 4 {
                    current_arg = Some(local);
                }
            }
            Event::Empty(e) => {
                depth += 1;
                let local = local_name(e.name())?;
                if depth == 3 && action_name.is_none() {
                    namespace = find_xmlns(&e);
                    action_name = Some(local);
                } else if depth == 4 {
                    args.insert(local, String::new());
                }
                depth -= 1;
            }
            Event::Text(t) => {
                if depth == 4 {
                    if let Some(name) = current_arg.clone() {
                        let text = t.unescape().context("xml text decode error")?.into_owned();
                        args.insert(name, text);
                    }
                }
            }
            Event::End(_) => {
                if depth == 4 {
                    current_arg = None;
                }
                depth = depth.saturating_sub(1);
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    let action = action_name.context("no action element found in SOAP body")?;
    let namespace = namespace.context("action element carries no namespace")?;
    let service = service_kind_from_namespace(&namespace)?;
    Ok((service, SoapRequest { action, args }))
}

/// Builds a `u:{action}Response` envelope in `kind`'s namespace.
pub fn render_soap_response(kind: ServiceKind, action: &str, outputs: &[(String, String)]) -> String {
    let body: String = outputs
        .iter()
        .map(|(name, value)| {
            format!(
                "<{name}>{value}</{name}>",
                name = name,
                value = quick_xml::escape::escape(value)
            )
        })
        .collect();
    format!(
        r#"<?xml version="1.0" encoding="utf-8"?>
<s:Envelope xmlns:s="http://schemas.xmlsoap.org/soap/envelope/" s:encodingStyle="http://schemas.xmlsoap.org/soap/encoding/">
  <s:Body>
    <u:{action}Response xmlns:u="{ns}">{body}</u:{action}Response>
  </s:Body>
</s:Envelope>"#,
        action = action,
        ns = kind.namespace(),
        body = body
    )
}

pub fn render_soap_fault(message: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="utf-8"?>
<s:Envelope xmlns:s="http://schemas.xmlsoap.org/soap/envelope/" s:encodingStyle="http://schemas.xmlsoap.org/soap/encoding/">
  <s:Body>
    <s:Fault>
      <faultcode>s:Client</faultcode>
      <faultstring>UPnPError</faultstring>
      <detail>
        <UPnPError xmlns="urn:schemas-upnp-org:control-1-0">
          <errorCode>402</errorCode>
          <errorDescription>{message}</errorDescription>
        </UPnPError>
      </detail>
    </s:Fault>
  </s:Body>
</s:Envelope>"#,
        message = quick_xml::escape::escape(message)
    )
}

/// Validates and commits each input argument that names a known related
/// state variable; arguments referencing unknown variables are ignored
/// (they carry instance/channel selectors the registry doesn't track).
pub fn commit_inputs(
    registry: &Registry,
    kind: ServiceKind,
    action_name: &str,
    args: &HashMap<String, String>,
) -> anyhow::Result<()> {
    let service = registry.service(kind);
    let action = service
        .actions
        .get(action_name)
        .with_context(|| format!("unknown action {action_name}"))?;
    for input in &action.input {
        if let Some(value) = args.get(&input.name) {
            if service.get_state(&input.related_state_variable).is_some() {
                service
                    .set_state(&input.related_state_variable, value.clone())
                    .with_context(|| format!("invalid value for {}", input.name))?;
            }
        }
    }
    Ok(())
}

/// The default "echo declared outputs" behavior for actions with no bespoke
/// handler: read the current value of each output argument's related state
/// variable.
pub fn default_outputs(registry: &Registry, kind: ServiceKind, action_name: &str) -> anyhow::Result<Vec<(String, String)>> {
    let service = registry.service(kind);
    let action = service
        .actions
        .get(action_name)
        .with_context(|| format!("unknown action {action_name}"))?;
    Ok(action
        .output
        .iter()
        .map(|arg| {
            let value = service.get_state(&arg.related_state_variable).unwrap_or_default();
            (arg.name.clone(), value)
        })
        .collect())
}

/// `POST /{service}/action`: the single control endpoint for all three
/// services, dispatched on the path's service name rather than three
/// hardcoded routes.
pub async fn control_http_handler(
    Path(service): Path<String>,
    headers: HeaderMap,
    State(state): State<AppState>,
    body: Bytes,
) -> impl IntoResponse {
    let path_kind: ServiceKind = match service.parse() {
        Ok(k) => k,
        Err(_) => return (StatusCode::NOT_FOUND, "unknown service").into_response(),
    };

    if headers.get("soapaction").is_none() {
        debug!("missing SOAPACTION header");
        return (StatusCode::BAD_REQUEST, "missing SOAPACTION").into_response();
    }

    let body = match std::str::from_utf8(&body) {
        Ok(b) => b,
        Err(_) => return (StatusCode::BAD_REQUEST, "body is not utf8").into_response(),
    };

    let (parsed_kind, req) = match parse_soap_request(body) {
        Ok(v) => v,
        Err(e) => {
            debug!(error=?e, "error parsing SOAP request");
            return (
                StatusCode::BAD_REQUEST,
                [(CONTENT_TYPE, CONTENT_TYPE_XML_UTF8)],
                render_soap_fault(&format!("{e:#}")),
            )
                .into_response();
        }
    };
    if parsed_kind != path_kind {
        trace!(?parsed_kind, ?path_kind, "SOAP body namespace disagrees with route, using route");
    }

    if !state.registry.service(path_kind).actions.contains_key(&req.action) {
        return (StatusCode::NOT_IMPLEMENTED, "unknown action").into_response();
    }

    if let Err(e) = commit_inputs(&state.registry, path_kind, &req.action, &req.args) {
        debug!(error=?e, action=%req.action, "invalid action input");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            [(CONTENT_TYPE, CONTENT_TYPE_XML_UTF8)],
            render_soap_fault(&format!("{e:#}")),
        )
            .into_response();
    }

    let outputs = match services::dispatch_bespoke(path_kind, &req.action, &req.args, &state) {
        Some(Ok(outputs)) => outputs,
        Some(Err(e)) => {
            warn!(error=?e, action=%req.action, "bespoke action handler failed");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                [(CONTENT_TYPE, CONTENT_TYPE_XML_UTF8)],
                render_soap_fault(&format!("{e:#}")),
            )
                .into_response();
        }
        None => match default_outputs(&state.registry, path_kind, &req.action) {
            Ok(outputs) => outputs,
            Err(e) => {
                warn!(error=?e, action=%req.action, "error building default outputs");
                return (StatusCode::INTERNAL_SERVER_ERROR, "").into_response();
            }
        },
    };

    let response_body = render_soap_response(path_kind, &req.action, &outputs);
    (
        [
            (CONTENT_TYPE.as_str(), CONTENT_TYPE_XML_UTF8),
            (EXT_HEADER_NAME, EXT_HEADER_VALUE),
        ],
        response_body,
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_play_request() {
        let body = r#"<?xml version="1.0"?>
<s:Envelope xmlns:s="http://schemas.xmlsoap.org/soap/envelope/" s:encodingStyle="http://schemas.xmlsoap.org/soap/encoding/">
  <s:Body>
    <u:Play xmlns:u="urn:schemas-upnp-org:service:AVTransport:1">
      <InstanceID>0</InstanceID>
      <Speed>1</Speed>
    </u:Play>
  </s:Body>
</s:Envelope>"#;
        let (kind, req) = parse_soap_request(body).unwrap();
        assert_eq!(kind, ServiceKind::AvTransport);
        assert_eq!(req.action, "Play");
        assert_eq!(req.args.get("Speed").unwrap(), "1");
        assert_eq!(req.args.get("InstanceID").unwrap(), "0");
    }

    #[test]
    fn test_parse_set_volume_request() {
        let body = r#"<s:Envelope xmlns:s="http://schemas.xmlsoap.org/soap/envelope/">
  <s:Body>
    <u:SetVolume xmlns:u="urn:schemas-upnp-org:service:RenderingControl:1">
      <InstanceID>0</InstanceID>
      <Channel>Master</Channel>
      <DesiredVolume>42</DesiredVolume>
    </u:SetVolume>
  </s:Body>
</s:Envelope>"#;
        let (kind, req) = parse_soap_request(body).unwrap();
        assert_eq!(kind, ServiceKind::RenderingControl);
        assert_eq!(req.action, "SetVolume");
        assert_eq!(req.args.get("DesiredVolume").unwrap(), "42");
    }

    #[test]
    fn test_render_soap_response_roundtrip() {
        let xml = render_soap_response(
            ServiceKind::AvTransport,
            "Play",
            &[("InstanceID".to_owned(), "0".to_owned())],
        );
        let (kind, req) = parse_soap_request(&xml).unwrap();
        assert_eq!(kind, ServiceKind::AvTransport);
        assert_eq!(req.action, "PlayResponse");
        assert_eq!(req.args.get("InstanceID").unwrap(), "0");
    }
}
