//! RenderingControl bespoke action handlers: volume and mute both need to
//! reach the player driver, everything else is a plain registry read.

use std::collections::HashMap;

use super::HandlerResult;
use crate::dispatcher::RendererCommand;
use crate::state::AppStateInner;

pub fn handle(action: &str, args: &HashMap<String, String>, state: &AppStateInner) -> Option<HandlerResult> {
    match action {
        "SetVolume" => Some((|| {
            let value: u16 = args
                .get("DesiredVolume")
                .and_then(|v| v.parse().ok())
                .ok_or_else(|| anyhow::anyhow!("missing or invalid DesiredVolume"))?;
            state.commands.send(RendererCommand::SetVolume { value });
            Ok(Vec::new())
        })()),
        "SetMute" => Some((|| {
            let desired = args.get("DesiredMute").map(String::as_str).unwrap_or("0");
            let value = matches!(desired, "1" | "true");
            state.commands.send(RendererCommand::SetMute { value });
            Ok(Vec::new())
        })()),
        _ => None,
    }
}
