//! SSDP advertisement, the UPnP device/service registry, SOAP dispatch and
//! event subscriptions for an AVTransport media renderer.
//!
//! This crate owns everything reachable over the network; the actual
//! player is driven by whoever implements [`RendererCommandSink`] and hands
//! it to [`RendererServer::new`].

pub mod constants;
pub mod dispatcher;
pub mod http_server;
pub mod notify;
pub mod registry;
pub mod services;
pub mod ssdp;
pub mod state;
pub mod subscriptions;
pub mod templates;

use std::sync::Arc;

use axum::body::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub use dispatcher::RendererCommand;
pub use registry::{Registry, ServiceKind};
pub use ssdp::{SsdpRunner, SsdpRunnerOptions};
pub use state::{AppState, AppStateInner, RendererCommandSink};

use templates::RootDescriptionInputs;

pub struct RendererServeOptions {
    pub friendly_name: String,
    pub manufacturer: String,
    pub model_name: String,
    /// Bare `uuid:...` unique device name.
    pub usn: String,
    pub http_prefix: String,
}

pub struct RendererServer {
    pub router: axum::Router,
    pub state: AppState,
    change_rx: Option<mpsc::UnboundedReceiver<(ServiceKind, String, String)>>,
}

impl RendererServer {
    pub fn new(
        opts: RendererServeOptions,
        commands: Arc<dyn RendererCommandSink>,
        cancellation_token: CancellationToken,
    ) -> anyhow::Result<Self> {
        let registry = Registry::from_scpd(
            include_str!("../resources/xml/AVTransport.xml"),
            include_str!("../resources/xml/RenderingControl.xml"),
            include_str!("../resources/xml/ConnectionManager.xml"),
        )?;

        let root_desc = templates::render_root_description_xml(&RootDescriptionInputs {
            friendly_name: &opts.friendly_name,
            manufacturer: &opts.manufacturer,
            model_name: &opts.model_name,
            unique_id: &opts.usn,
            http_prefix: &opts.http_prefix,
        });

        let (state, change_rx) = AppStateInner::new(
            registry,
            commands,
            Bytes::from(root_desc),
            opts.usn,
            opts.http_prefix,
            cancellation_token,
        );

        let router = http_server::make_router(state.clone());

        Ok(Self {
            router,
            state,
            change_rx: Some(change_rx),
        })
    }

    /// Spawns the background NOTIFY tick loop. Call once before serving.
    pub fn spawn_notifier(&mut self) {
        if let Some(change_rx) = self.change_rx.take() {
            let state = self.state.clone();
            tokio::spawn(notify::run_forever(state, change_rx));
        }
    }
}
