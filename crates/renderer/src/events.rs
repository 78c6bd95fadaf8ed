//! The renderer's supervisor-facing event bus: a typed broadcast channel any
//! future collaborator (a GUI, a notification tray) can subscribe to without
//! the core ever blocking on there being a listener.
//!
//! Grounded in the reference renderer's string-topic bus (`start`, `stop`,
//! `renderer_av_uri`, `update_ip`, `app_notify`, ...) re-expressed as an enum.

use tokio::sync::broadcast;

const CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
pub enum RendererEvent {
    Start,
    Stop,
    RendererStart,
    RendererAvStop,
    RendererAvUri(String),
    /// The source conflates `ssdp_update_ip` and `update_ip` across
    /// revisions; both collapse to this one variant.
    UpdateIp,
    AppNotify { title: String, body: String },
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<RendererEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RendererEvent> {
        self.tx.subscribe()
    }

    /// Fire-and-forget: a lagging or absent subscriber never blocks emission.
    pub fn publish(&self, event: RendererEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_without_subscriber_does_not_block() {
        let bus = EventBus::new();
        bus.publish(RendererEvent::Start);
        bus.publish(RendererEvent::Stop);
    }

    #[tokio::test]
    async fn test_subscriber_receives_published_event() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.publish(RendererEvent::RendererAvUri("http://x/a.mp4".to_owned()));
        match rx.recv().await.unwrap() {
            RendererEvent::RendererAvUri(uri) => assert_eq!(uri, "http://x/a.mp4"),
            other => panic!("unexpected event {other:?}"),
        }
    }
}
