//! XML rendering helpers: root device description and NOTIFY event bodies.
//!
//! AVTransport/RenderingControl wrap changed variables in a `LastChange`
//! event document; ConnectionManager sends flat properties instead. This
//! mirrors `ObserveClient.send_event_callback`'s branch on service name in
//! the reference renderer this crate's wire format is modelled on.

use crate::registry::ServiceKind;

pub struct RootDescriptionInputs<'a> {
    pub friendly_name: &'a str,
    pub manufacturer: &'a str,
    pub model_name: &'a str,
    pub unique_id: &'a str,
    pub http_prefix: &'a str,
}

pub fn render_root_description_xml(input: &RootDescriptionInputs<'_>) -> String {
    format!(
        include_str!("../resources/xml/root_desc.tmpl.xml"),
        friendly_name = input.friendly_name,
        manufacturer = input.manufacturer,
        model_name = input.model_name,
        unique_id = input.unique_id,
        http_prefix = input.http_prefix
    )
}

fn last_change_namespace(kind: ServiceKind) -> &'static str {
    match kind {
        ServiceKind::AvTransport => "urn:schemas-upnp-org:metadata-1-0/AVT/",
        ServiceKind::RenderingControl => "urn:schemas-upnp-org:metadata-1-0/RCS/",
        ServiceKind::ConnectionManager => "",
    }
}

/// Renders the body of a NOTIFY for a batch of changed `(name, value)` pairs,
/// picking the LastChange-wrapped form or the flat-property form per service.
pub fn render_event_body(kind: ServiceKind, changes: &[(String, String)]) -> String {
    if kind.uses_last_change_wrapper() {
        let vars: String = changes
            .iter()
            .map(|(name, value)| {
                format!(
                    r#"<{name} val="{value}"/>"#,
                    name = name,
                    value = quick_xml::escape::escape(value)
                )
            })
            .collect();
        let event = format!(
            include_str!("../resources/templates/event/last_change_event.tmpl.xml"),
            ns = last_change_namespace(kind),
            vars = vars
        );
        let escaped = quick_xml::escape::escape(event);
        format!(
            include_str!("../resources/templates/event/propertyset_last_change.tmpl.xml"),
            last_change_escaped = escaped
        )
    } else {
        let properties: String = changes
            .iter()
            .map(|(name, value)| {
                format!(
                    "<e:property><{name}>{value}</{name}></e:property>",
                    name = name,
                    value = quick_xml::escape::escape(value)
                )
            })
            .collect();
        format!(
            include_str!("../resources/templates/event/propertyset_direct.tmpl.xml"),
            properties = properties
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_root_description() {
        let xml = render_root_description_xml(&RootDescriptionInputs {
            friendly_name: "Living Room",
            manufacturer: "renderer developers",
            model_name: "1.0.0",
            unique_id: "uuid:abc",
            http_prefix: "http://192.168.1.5:4004",
        });
        assert!(xml.contains("Living Room"));
        assert!(xml.contains("uuid:abc"));
        assert!(xml.contains("MediaRenderer"));
    }

    #[test]
    fn test_render_event_body_last_change() {
        let body = render_event_body(
            ServiceKind::AvTransport,
            &[("TransportState".to_owned(), "PLAYING".to_owned())],
        );
        assert!(body.contains("LastChange"));
        assert!(body.contains("TransportState"));
        assert!(body.contains("PLAYING"));
    }

    #[test]
    fn test_render_event_body_direct_properties() {
        let body = render_event_body(
            ServiceKind::ConnectionManager,
            &[("CurrentConnectionIDs".to_owned(), "0,1".to_owned())],
        );
        assert!(!body.contains("LastChange"));
        assert!(body.contains("<CurrentConnectionIDs>0,1</CurrentConnectionIDs>"));
    }
}
