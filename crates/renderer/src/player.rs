//! The renderer driver: supervises an external mpv-compatible player over
//! its JSON IPC socket, translating [`RendererCommand`]s into outgoing IPC
//! commands and the player's property/lifecycle events back into registry
//! state.
//!
//! Mirrors the reference renderer's player plugin: a supervisor thread keeps
//! the player process alive and a parallel IPC thread owns the socket; here
//! both are `tokio` tasks coordinated through a shared [`CancellationToken`].

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use upnp_renderer_serve::{AppState, RendererCommand, RendererCommandSink, ServiceKind};

use crate::config::RendererConfig;
use crate::events::{EventBus, RendererEvent};

const SUPERVISOR_ERROR_BUDGET: u32 = 3;
const SUPERVISOR_RETRY_DELAY: Duration = Duration::from_secs(1);
const IPC_CONNECT_RETRY_DELAY: Duration = Duration::from_millis(500);

/// A little jitter on top of the 1s retry delay so a crash loop doesn't
/// line up in lockstep with anything else polling on a round interval.
fn retry_delay_with_jitter() -> Duration {
    use rand::Rng;
    let jitter_ms = rand::rng().random_range(0..200);
    SUPERVISOR_RETRY_DELAY + Duration::from_millis(jitter_ms)
}

/// Properties observed right after IPC connect, in the order their mpv
/// `observe_property` id is assigned (ids start at 1).
const OBSERVED_PROPERTIES: &[&str] = &[
    "volume",
    "time-pos",
    "pause",
    "mute",
    "duration",
    "track-list",
    "speed",
    "sub-visibility",
];

fn property_name_for_id(id: i64) -> Option<&'static str> {
    OBSERVED_PROPERTIES.get((id - 1) as usize).copied()
}

#[cfg(unix)]
pub type IpcStream = tokio::net::UnixStream;

#[cfg(unix)]
async fn connect_ipc(path: &str) -> std::io::Result<IpcStream> {
    tokio::net::UnixStream::connect(path).await
}

#[cfg(windows)]
pub type IpcStream = tokio::net::windows::named_pipe::NamedPipeClient;

#[cfg(windows)]
async fn connect_ipc(path: &str) -> std::io::Result<IpcStream> {
    tokio::net::windows::named_pipe::ClientOptions::new().open(path)
}

/// Handle handed to [`AppStateInner`](upnp_renderer_serve::AppStateInner) as
/// its `commands` sink. Fire-and-forget: dispatch never waits on the player.
pub struct PlayerCommandSink {
    tx: mpsc::UnboundedSender<RendererCommand>,
}

impl RendererCommandSink for PlayerCommandSink {
    fn send(&self, command: RendererCommand) {
        if self.tx.send(command).is_err() {
            warn!("player command dropped: driver task is gone");
        }
    }
}

fn ipc_socket_path() -> PathBuf {
    #[cfg(unix)]
    {
        std::env::temp_dir().join(format!("upnp-renderer-{}.sock", std::process::id()))
    }
    #[cfg(windows)]
    {
        PathBuf::from(format!(r"\\.\pipe\upnp-renderer-{}", std::process::id()))
    }
}

fn build_player_argv(config: &RendererConfig, ipc_path: &std::path::Path) -> Vec<String> {
    let (x, y) = config.player_position;
    let (w, h) = config.player_size;
    vec![
        format!("--input-ipc-server={}", ipc_path.display()),
        "--idle=yes".to_owned(),
        "--force-window=yes".to_owned(),
        "--ontop".to_owned(),
        format!("--geometry={w}x{h}+{x}+{y}"),
        "--autofit-larger=100%x100%".to_owned(),
        "--hwdec=auto".to_owned(),
        "--no-border".to_owned(),
    ]
}

fn spawn_player(config: &RendererConfig, ipc_path: &std::path::Path) -> anyhow::Result<Child> {
    let argv = build_player_argv(config, ipc_path);
    Command::new(&config.player_path)
        .args(&argv)
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("error spawning player {:?}", config.player_path))
}

fn format_position(seconds: f64) -> String {
    let total = seconds.max(0.0) as u64;
    format!("{:02}:{:02}:{:02}", total / 3600, (total % 3600) / 60, total % 60)
}

struct DriverCtx {
    state: AppState,
    events: EventBus,
    last_pause: AtomicBool,
}

impl DriverCtx {
    fn commit(&self, kind: ServiceKind, name: &str, value: impl Into<String>) {
        if let Err(e) = self.state.commit_state(kind, name, value) {
            debug!(error=?e, name, "error committing player-observed state");
        }
    }

    fn handle_property_change(&self, id: i64, data: &Value) {
        let Some(name) = property_name_for_id(id) else {
            return;
        };
        match name {
            "time-pos" => {
                if let Some(secs) = data.as_f64() {
                    self.commit(ServiceKind::AvTransport, "RelativeTimePosition", format_position(secs));
                    self.commit(ServiceKind::AvTransport, "AbsoluteTimePosition", format_position(secs));
                }
            }
            "duration" => {
                if let Some(secs) = data.as_f64() {
                    let formatted = format_position(secs);
                    self.commit(ServiceKind::AvTransport, "CurrentTrackDuration", formatted.clone());
                    self.commit(ServiceKind::AvTransport, "CurrentMediaDuration", formatted);
                }
            }
            "volume" => {
                if let Some(v) = data.as_f64() {
                    self.commit(ServiceKind::RenderingControl, "Volume", (v.round() as i64).to_string());
                }
            }
            "mute" => {
                if let Some(m) = data.as_bool() {
                    self.commit(ServiceKind::RenderingControl, "Mute", if m { "1" } else { "0" });
                }
            }
            "pause" => {
                if let Some(p) = data.as_bool() {
                    self.last_pause.store(p, Ordering::Relaxed);
                }
            }
            "speed" => {
                if let Some(s) = data.as_f64() {
                    self.commit(ServiceKind::AvTransport, "TransportPlaySpeed", format!("{s}"));
                }
            }
            _ => {}
        }
    }

    fn handle_lifecycle_event(&self, event: &str, data: &Value) {
        match event {
            "start-file" => {
                self.commit(ServiceKind::AvTransport, "TransportState", "TRANSITIONING");
                let uri = self.state.registry.av_transport.get_state("CurrentTrackURI").unwrap_or_default();
                self.events.publish(RendererEvent::RendererAvUri(uri));
            }
            "end-file" => {
                let reason = data.get("reason").and_then(Value::as_str).unwrap_or("eof");
                let new_state = match reason {
                    "error" => "ERROR_OCCURRED",
                    "stop" => "STOPPED",
                    _ => "NO_MEDIA_PRESENT",
                };
                self.commit(ServiceKind::AvTransport, "TransportState", new_state);
                self.events.publish(RendererEvent::RendererAvStop);
            }
            "seek" => {
                self.commit(ServiceKind::AvTransport, "TransportState", "TRANSITIONING");
            }
            "idle" => {
                self.commit(ServiceKind::AvTransport, "TransportState", "STOPPED");
            }
            "playback-restart" => {
                let state = if self.last_pause.load(Ordering::Relaxed) {
                    "PAUSED_PLAYBACK"
                } else {
                    "PLAYING"
                };
                self.commit(ServiceKind::AvTransport, "TransportState", state);
            }
            other => debug!(event = other, "unhandled player lifecycle event"),
        }
    }

    fn handle_line(&self, line: &str) {
        let value: Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(e) => {
                debug!(error=?e, line, "malformed IPC line from player");
                return;
            }
        };
        if let Some(event) = value.get("event").and_then(Value::as_str) {
            if event == "property-change" {
                if let Some(id) = value.get("id").and_then(Value::as_i64) {
                    self.handle_property_change(id, value.get("data").unwrap_or(&Value::Null));
                }
            } else {
                self.handle_lifecycle_event(event, &value);
            }
        }
    }
}

fn command_to_json(command: &RendererCommand) -> Option<Value> {
    match command {
        RendererCommand::SetAvTransportUri { uri, .. } => Some(json!({
            "command": ["loadfile", uri, "replace", "start=0"]
        })),
        RendererCommand::SetNextAvTransportUri { .. } => None,
        RendererCommand::Play { speed } => {
            let speed: f64 = speed.parse().unwrap_or(1.0);
            Some(json!({"command": ["set_property", "speed", speed]}))
        }
        RendererCommand::Pause => Some(json!({"command": ["set_property", "pause", true]})),
        RendererCommand::Stop => Some(json!({"command": ["stop"]})),
        RendererCommand::Seek { target, .. } => Some(json!({"command": ["seek", target, "absolute"]})),
        RendererCommand::Next | RendererCommand::Previous => None,
        RendererCommand::SetVolume { value } => Some(json!({"command": ["set_property", "volume", value]})),
        RendererCommand::SetMute { value } => Some(json!({"command": ["set_property", "mute", value]})),
    }
}

/// `Play` both resumes (unpause) and applies the requested speed.
fn resolve_play_command(speed_cmd: Value) -> Vec<Value> {
    vec![json!({"command": ["set_property", "pause", false]}), speed_cmd]
}

async fn ipc_session(
    stream: IpcStream,
    ctx: Arc<DriverCtx>,
    command_rx: &mut mpsc::UnboundedReceiver<RendererCommand>,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    let (read_half, write_half) = tokio::io::split(stream);
    let write_half = Arc::new(AsyncMutex::new(write_half));

    for (idx, name) in OBSERVED_PROPERTIES.iter().enumerate() {
        let cmd = json!({"command": ["observe_property", idx + 1, name]});
        write_line(&write_half, &cmd).await?;
    }
    let initial_volume = ctx.state.registry.rendering_control.get_state("Volume").unwrap_or_else(|| "50".to_owned());
    write_line(&write_half, &json!({"command": ["set_property", "volume", initial_volume]})).await?;

    let mut lines = BufReader::new(read_half).lines();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            line = lines.next_line() => {
                match line? {
                    Some(line) => ctx.handle_line(&line),
                    None => {
                        debug!("IPC connection closed by player");
                        return Ok(());
                    }
                }
            }
            Some(command) = command_rx.recv() => {
                if let RendererCommand::Play { speed } = &command {
                    let speed_json = command_to_json(&RendererCommand::Play { speed: speed.clone() })
                        .expect("Play always maps to a command");
                    for cmd in resolve_play_command(speed_json) {
                        write_line(&write_half, &cmd).await?;
                    }
                    continue;
                }
                if let Some(json_cmd) = command_to_json(&command) {
                    write_line(&write_half, &json_cmd).await?;
                }
            }
        }
    }
}

async fn write_line(
    write_half: &Arc<AsyncMutex<tokio::io::WriteHalf<IpcStream>>>,
    value: &Value,
) -> anyhow::Result<()> {
    let mut line = serde_json::to_vec(value)?;
    line.push(b'\n');
    let mut guard = write_half.lock().await;
    guard.write_all(&line).await.context("error writing to player IPC socket")?;
    Ok(())
}

/// Runs forever (until `cancel` fires): keeps the player process alive and
/// re-establishes the IPC session after a crash or `end-file`/idle restart.
pub async fn run_supervisor(
    state: AppState,
    events: EventBus,
    config: RendererConfig,
    mut command_rx: mpsc::UnboundedReceiver<RendererCommand>,
    cancel: CancellationToken,
) {
    let ctx = Arc::new(DriverCtx {
        state,
        events: events.clone(),
        last_pause: AtomicBool::new(false),
    });
    let ipc_path = ipc_socket_path();
    let mut error_budget = SUPERVISOR_ERROR_BUDGET;

    'supervisor: loop {
        if cancel.is_cancelled() {
            return;
        }

        let mut child = match spawn_player(&config, &ipc_path) {
            Ok(child) => child,
            Err(e) => {
                warn!(error=?e, "error spawning player");
                error_budget = error_budget.saturating_sub(1);
                if error_budget == 0 {
                    events.publish(RendererEvent::AppNotify {
                        title: "Player error".to_owned(),
                        body: "MPV Can't start".to_owned(),
                    });
                    return;
                }
                tokio::time::sleep(retry_delay_with_jitter()).await;
                continue;
            }
        };
        events.publish(RendererEvent::RendererStart);

        let stream = loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = child.kill().await;
                    return;
                }
                exit = child.wait() => {
                    match exit {
                        Ok(status) => warn!(?status, "player exited before IPC connected"),
                        Err(e) => warn!(error=?e, "error waiting for player exit"),
                    }
                    error_budget = error_budget.saturating_sub(1);
                    if error_budget == 0 {
                        events.publish(RendererEvent::AppNotify {
                            title: "Player error".to_owned(),
                            body: "MPV Can't start".to_owned(),
                        });
                        return;
                    }
                    tokio::time::sleep(retry_delay_with_jitter()).await;
                    continue 'supervisor;
                }
                conn = connect_ipc(&ipc_path.to_string_lossy()) => {
                    match conn {
                        Ok(stream) => break stream,
                        Err(_) => {
                            tokio::time::sleep(IPC_CONNECT_RETRY_DELAY).await;
                            continue;
                        }
                    }
                }
            }
        };

        info!("player IPC connected");
        error_budget = SUPERVISOR_ERROR_BUDGET;

        let session = ipc_session(stream, ctx.clone(), &mut command_rx, &cancel);
        tokio::select! {
            result = session => {
                if let Err(e) = result {
                    warn!(error=?e, "player IPC session ended with error");
                }
            }
            exit = child.wait() => {
                warn!(?exit, "player process exited during session");
            }
            _ = cancel.cancelled() => {
                let _ = child.kill().await;
                return;
            }
        }

        let _ = child.kill().await;
    }
}

pub fn make_command_sink() -> (Arc<PlayerCommandSink>, mpsc::UnboundedReceiver<RendererCommand>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Arc::new(PlayerCommandSink { tx }), rx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_property_name_for_id() {
        assert_eq!(property_name_for_id(1), Some("volume"));
        assert_eq!(property_name_for_id(8), Some("sub-visibility"));
        assert_eq!(property_name_for_id(99), None);
    }

    #[test]
    fn test_format_position() {
        assert_eq!(format_position(0.0), "00:00:00");
        assert_eq!(format_position(3725.0), "01:02:05");
    }

    #[test]
    fn test_command_to_json_set_volume() {
        let cmd = RendererCommand::SetVolume { value: 42 };
        let json = command_to_json(&cmd).unwrap();
        assert_eq!(json["command"][1], "volume");
        assert_eq!(json["command"][2], 42);
    }

    #[test]
    fn test_build_player_argv_contains_ipc_server() {
        let config = RendererConfig::default();
        let argv = build_player_argv(&config, std::path::Path::new("/tmp/x.sock"));
        assert!(argv.iter().any(|a| a.starts_with("--input-ipc-server=")));
    }
}
