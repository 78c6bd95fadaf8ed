//! Per-service bespoke action handlers.
//!
//! Most actions are pure reads of registry state and need no bespoke
//! handler at all (the dispatcher's `default_outputs` echoes them); a
//! handler is only registered here for actions that must push a command
//! to the player driver or derive a value the registry can't express
//! (e.g. a DIDL-Lite title).

pub mod av_transport;
pub mod connection_manager;
pub mod rendering_control;

use std::collections::HashMap;

use crate::registry::ServiceKind;
use crate::state::AppStateInner;

pub type HandlerResult = anyhow::Result<Vec<(String, String)>>;

/// Returns `None` when no bespoke handler exists for `action`, in which
/// case the caller should fall back to [`crate::dispatcher::default_outputs`].
pub fn dispatch_bespoke(
    kind: ServiceKind,
    action: &str,
    args: &HashMap<String, String>,
    state: &AppStateInner,
) -> Option<HandlerResult> {
    match kind {
        ServiceKind::AvTransport => av_transport::handle(action, args, state),
        ServiceKind::RenderingControl => rendering_control::handle(action, args, state),
        ServiceKind::ConnectionManager => connection_manager::handle(action, args, state),
    }
}
