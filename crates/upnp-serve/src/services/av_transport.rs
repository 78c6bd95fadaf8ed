//! AVTransport bespoke action handlers: everything that must reach the
//! player driver instead of just reading back registry state.
//!
//! The state-variable commits for plain `in` arguments (CurrentURI,
//! Speed, Unit, Target, ...) already happened in
//! [`crate::dispatcher::commit_inputs`] before this runs.

use std::collections::HashMap;

use quick_xml::events::Event;
use quick_xml::reader::Reader;

use super::HandlerResult;
use crate::dispatcher::RendererCommand;
use crate::registry::ServiceKind;
use crate::state::AppStateInner;

/// Pulls `dc:title` (or any element locally named `title`) out of a
/// DIDL-Lite metadata fragment, the way a renderer surfaces "now playing"
/// text without understanding the rest of the document.
fn extract_didl_title(didl: &str) -> Option<String> {
    let mut reader = Reader::from_str(didl);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    let mut in_title = false;
    loop {
        match reader.read_event_into(&mut buf).ok()? {
            Event::Start(e) => {
                if e.local_name().as_ref() == b"title" {
                    in_title = true;
                }
            }
            Event::Text(t) if in_title => {
                return t.unescape().ok().map(|s| s.into_owned());
            }
            Event::End(e) if e.local_name().as_ref() == b"title" => in_title = false,
            Event::Eof => return None,
            _ => {}
        }
        buf.clear();
    }
}

pub fn handle(action: &str, args: &HashMap<String, String>, state: &AppStateInner) -> Option<HandlerResult> {
    match action {
        "SetAVTransportURI" => Some((|| {
            let uri = args.get("CurrentURI").cloned().unwrap_or_default();
            let metadata = args.get("CurrentURIMetaData").cloned().unwrap_or_default();
            let title = extract_didl_title(&metadata).unwrap_or_else(|| uri.clone());
            state.commit_state(ServiceKind::AvTransport, "CurrentTrackURI", uri.clone())?;
            state.commit_state(ServiceKind::AvTransport, "CurrentTrackMetaData", metadata.clone())?;
            state.commit_state(ServiceKind::AvTransport, "CurrentTrackTitle", title.clone())?;
            state.commit_state(ServiceKind::AvTransport, "RelativeTimePosition", "00:00:00")?;
            state.commit_state(ServiceKind::AvTransport, "AbsoluteTimePosition", "00:00:00")?;
            state.commit_state(ServiceKind::AvTransport, "TransportState", "TRANSITIONING")?;
            tracing::debug!(%title, "SetAVTransportURI");
            state.commands.send(RendererCommand::SetAvTransportUri { uri, metadata });
            Ok(Vec::new())
        })()),
        "SetNextAVTransportURI" => Some((|| {
            let uri = args.get("NextURI").cloned().unwrap_or_default();
            let metadata = args.get("NextURIMetaData").cloned().unwrap_or_default();
            state.commands.send(RendererCommand::SetNextAvTransportUri { uri, metadata });
            Ok(Vec::new())
        })()),
        "Play" => Some((|| {
            let speed = args.get("Speed").cloned().unwrap_or_else(|| "1".to_owned());
            state.commands.send(RendererCommand::Play { speed });
            Ok(Vec::new())
        })()),
        "Pause" => Some((|| {
            state.commands.send(RendererCommand::Pause);
            Ok(Vec::new())
        })()),
        "Stop" => Some((|| {
            state.commit_state(ServiceKind::AvTransport, "TransportState", "STOPPED")?;
            state.commit_state(ServiceKind::AvTransport, "TransportStatus", "OK")?;
            state.commands.send(RendererCommand::Stop);
            Ok(Vec::new())
        })()),
        "Seek" => Some((|| {
            let unit = args.get("Unit").cloned().unwrap_or_default();
            let target = args.get("Target").cloned().unwrap_or_default();
            state.commands.send(RendererCommand::Seek { unit, target });
            Ok(Vec::new())
        })()),
        "Next" => Some((|| {
            state.commands.send(RendererCommand::Next);
            Ok(Vec::new())
        })()),
        "Previous" => Some((|| {
            state.commands.send(RendererCommand::Previous);
            Ok(Vec::new())
        })()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;

    use axum::body::Bytes;
    use tokio_util::sync::CancellationToken;

    use crate::registry::Registry;
    use crate::state::{AppStateInner, RendererCommandSink};

    use super::*;

    struct NoopCommandSink;
    impl RendererCommandSink for NoopCommandSink {
        fn send(&self, _command: RendererCommand) {}
    }

    fn test_state() -> Arc<AppStateInner> {
        let registry = Registry::from_scpd(
            include_str!("../../resources/xml/AVTransport.xml"),
            include_str!("../../resources/xml/RenderingControl.xml"),
            include_str!("../../resources/xml/ConnectionManager.xml"),
        )
        .unwrap();
        let (state, _change_rx) = AppStateInner::new(
            registry,
            Arc::new(NoopCommandSink),
            Bytes::new(),
            "uuid:test".to_owned(),
            "http://127.0.0.1:0".to_owned(),
            CancellationToken::new(),
        );
        state
    }

    #[test]
    fn test_set_av_transport_uri_commits_title_and_resets_position() {
        let state = test_state();
        state
            .registry
            .av_transport
            .set_state("RelativeTimePosition", "00:01:23")
            .unwrap();

        let mut args = HashMap::new();
        args.insert("CurrentURI".to_owned(), "http://example.com/a.mp4".to_owned());
        args.insert(
            "CurrentURIMetaData".to_owned(),
            r#"<DIDL-Lite xmlns:dc="http://purl.org/dc/elements/1.1/"><item><dc:title>Demo</dc:title></item></DIDL-Lite>"#
                .to_owned(),
        );

        handle("SetAVTransportURI", &args, &state).unwrap().unwrap();

        assert_eq!(state.registry.av_transport.get_state("CurrentTrackURI").as_deref(), Some("http://example.com/a.mp4"));
        assert_eq!(state.registry.av_transport.get_state("CurrentTrackTitle").as_deref(), Some("Demo"));
        assert_eq!(state.registry.av_transport.get_state("RelativeTimePosition").as_deref(), Some("00:00:00"));
        assert_eq!(state.registry.av_transport.get_state("AbsoluteTimePosition").as_deref(), Some("00:00:00"));
        assert_eq!(state.registry.av_transport.get_state("TransportState").as_deref(), Some("TRANSITIONING"));
    }

    #[test]
    fn test_stop_commits_stopped_synchronously() {
        let state = test_state();
        state
            .registry
            .av_transport
            .set_state("TransportState", "PLAYING")
            .unwrap();

        handle("Stop", &HashMap::new(), &state).unwrap().unwrap();

        assert_eq!(state.registry.av_transport.get_state("TransportState").as_deref(), Some("STOPPED"));
        assert_eq!(state.registry.av_transport.get_state("TransportStatus").as_deref(), Some("OK"));
    }

    #[test]
    fn test_extract_didl_title() {
        let didl = r#"<DIDL-Lite xmlns="urn:schemas-upnp-org:metadata-1-0/DIDL-Lite/" xmlns:dc="http://purl.org/dc/elements/1.1/">
<item id="0" parentID="-1" restricted="1">
<dc:title>My Song</dc:title>
<res protocolInfo="http-get:*:audio/mpeg:*">http://example.com/a.mp3</res>
</item>
</DIDL-Lite>"#;
        assert_eq!(extract_didl_title(didl).as_deref(), Some("My Song"));
    }

    #[test]
    fn test_extract_didl_title_missing() {
        assert_eq!(extract_didl_title("<DIDL-Lite></DIDL-Lite>"), None);
    }
}
