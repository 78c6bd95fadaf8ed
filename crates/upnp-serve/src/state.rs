//! Shared application state handed to every axum handler.

use std::sync::Arc;

use axum::body::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::dispatcher::RendererCommand;
use crate::registry::{Registry, ServiceKind};
use crate::subscriptions::Subscriptions;

/// Sink the HTTP layer pushes player commands into; implemented by the
/// renderer's player driver, which owns the actual child-process IPC.
pub trait RendererCommandSink: Send + Sync {
    fn send(&self, command: RendererCommand);
}

pub struct AppStateInner {
    pub registry: Registry,
    pub subscriptions: Subscriptions,
    pub commands: Arc<dyn RendererCommandSink>,
    pub rendered_root_description: Bytes,
    pub usn: String,
    pub http_prefix: String,
    pub cancellation_token: CancellationToken,
    change_tx: mpsc::UnboundedSender<(ServiceKind, String, String)>,
}

pub type AppState = Arc<AppStateInner>;

impl AppStateInner {
    pub fn new(
        registry: Registry,
        commands: Arc<dyn RendererCommandSink>,
        rendered_root_description: Bytes,
        usn: String,
        http_prefix: String,
        cancellation_token: CancellationToken,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<(ServiceKind, String, String)>) {
        let (change_tx, change_rx) = mpsc::unbounded_channel();
        let state = Arc::new(Self {
            registry,
            subscriptions: Subscriptions::default(),
            commands,
            rendered_root_description,
            usn,
            http_prefix,
            cancellation_token,
            change_tx,
        });
        (state, change_rx)
    }

    /// Validates and commits a new value for a state variable, then queues
    /// the change for the notifier tick to pick up. Used both by the SOAP
    /// dispatcher (for actions that write state directly, e.g. SetVolume)
    /// and by the player driver (for state pushed up from playback events).
    pub fn commit_state(
        &self,
        kind: ServiceKind,
        name: &str,
        value: impl Into<String>,
    ) -> anyhow::Result<()> {
        let value = value.into();
        self.registry.service(kind).set_state(name, value.clone())?;
        let _ = self.change_tx.send((kind, name.to_owned(), value));
        Ok(())
    }
}
