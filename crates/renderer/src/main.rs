use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use anyhow::Context;
use clap::{CommandFactory, Parser, ValueEnum};
use clap_complete::Shell;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use network_interface::{NetworkInterface, NetworkInterfaceConfig};
use upnp_renderer_serve::{RendererServeOptions, RendererServer, SsdpRunner, SsdpRunnerOptions};

mod config;
mod events;
mod ip_monitor;
mod player;

use config::RendererConfig;
use events::{EventBus, RendererEvent};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    fn as_str(self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

#[derive(Parser)]
struct CompletionsOpts {
    /// The shell to generate completions for
    shell: Shell,
}

#[derive(Parser)]
enum SubCommand {
    /// Shell completions. eval "$(upnp-renderer completions bash)"
    Completions(CompletionsOpts),
}

#[derive(Parser)]
#[command(version, author, about)]
struct Opts {
    /// The console loglevel. Overrides the persisted config's log_level.
    #[arg(value_enum, short = 'v', long = "log-level", env = "UPNP_RENDERER_LOG_LEVEL")]
    log_level: Option<LogLevel>,

    /// Path to the JSON config file. Defaults to the OS config directory.
    #[arg(long = "config-file", env = "UPNP_RENDERER_CONFIG_FILE")]
    config_file: Option<String>,

    /// The port to listen on for HTTP/SOAP/description requests.
    #[arg(long = "port", env = "UPNP_RENDERER_PORT")]
    port: Option<u16>,

    /// The friendly name advertised to control points.
    #[arg(long = "friendly-name", env = "UPNP_RENDERER_FRIENDLY_NAME")]
    friendly_name: Option<String>,

    /// Path or name of the mpv-compatible player binary to launch.
    #[arg(long = "player-path", env = "UPNP_RENDERER_PLAYER_PATH")]
    player_path: Option<String>,

    /// Interface names to exclude from SSDP advertisement and the IP monitor.
    #[arg(long = "blocked-interface", env = "UPNP_RENDERER_BLOCKED_INTERFACES", value_delimiter = ',')]
    blocked_interfaces: Vec<String>,

    /// Interface names to include even if otherwise filtered out.
    #[arg(long = "additional-interface", env = "UPNP_RENDERER_ADDITIONAL_INTERFACES", value_delimiter = ',')]
    additional_interfaces: Vec<String>,

    #[command(subcommand)]
    subcommand: Option<SubCommand>,
}

fn init_logging(level: &str) -> anyhow::Result<()> {
    let filter = EnvFilter::builder()
        .with_default_directive(level.parse().context("invalid log level")?)
        .from_env()
        .context("invalid RUST_LOG value")?;
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .try_init()
        .context("can't init logging")?;
    Ok(())
}

fn apply_cli_overrides(mut config: RendererConfig, opts: &Opts) -> RendererConfig {
    if let Some(port) = opts.port {
        config.application_port = port;
    }
    if let Some(name) = &opts.friendly_name {
        config.friendly_name = name.clone();
    }
    if let Some(path) = &opts.player_path {
        config.player_path = path.clone();
    }
    if let Some(level) = opts.log_level {
        config.log_level = level.as_str().to_owned();
    }
    if !opts.blocked_interfaces.is_empty() {
        config.blocked_interfaces = opts.blocked_interfaces.clone();
    }
    if !opts.additional_interfaces.is_empty() {
        config.additional_interfaces = opts.additional_interfaces.clone();
    }
    config
}

/// Binds the configured port; on conflict, rebinds to an OS-assigned
/// ephemeral port. Returns the listener and whether the port changed.
async fn bind_http(configured_port: u16) -> anyhow::Result<(TcpListener, bool)> {
    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, configured_port));
    match TcpListener::bind(addr).await {
        Ok(listener) => Ok((listener, false)),
        Err(e) => {
            warn!(port = configured_port, error=?e, "configured port unavailable, rebinding ephemeral");
            let fallback = SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0));
            let listener = TcpListener::bind(fallback)
                .await
                .context("error binding fallback ephemeral port")?;
            Ok((listener, true))
        }
    }
}

fn new_usn() -> String {
    format!("uuid:{}", uuid::Uuid::new_v4())
}

/// The address baked into the root device description's absolute
/// `SCPDURL`/`controlURL`/`eventSubURL` values. Picks the first
/// non-loopback private IPv4 address; falls back to loopback on a host
/// with no such interface (e.g. a container with only `lo`).
fn primary_local_ip() -> std::net::IpAddr {
    NetworkInterface::show()
        .ok()
        .into_iter()
        .flatten()
        .flat_map(|nic| nic.addr.into_iter())
        .map(|a| a.ip())
        .find(|ip| matches!(ip, std::net::IpAddr::V4(v4) if v4.is_private() && !v4.is_loopback()))
        .unwrap_or(std::net::IpAddr::V4(Ipv4Addr::LOCALHOST))
}

async fn async_main(opts: Opts, cancel: CancellationToken) -> anyhow::Result<()> {
    let config_path = match &opts.config_file {
        Some(p) => std::path::PathBuf::from(p),
        None => config::config_path()?,
    };
    let mut renderer_config = apply_cli_overrides(config::load_or_init(&config_path), &opts);

    init_logging(&renderer_config.log_level)?;

    let (listener, port_changed) = bind_http(renderer_config.application_port).await?;
    let bound_port = listener.local_addr()?.port();
    if port_changed {
        renderer_config.application_port = bound_port;
        renderer_config.usn = new_usn();
        config::save(&config_path, &renderer_config).context("error persisting rebound port")?;
        info!(port = bound_port, "rebound to an ephemeral port and regenerated USN");
    }

    // SSDP's LOCATION header is recomputed per-request relative to whoever
    // asked, but the absolute SCPDURL/controlURL values baked into
    // description.xml need one concrete host chosen up front.
    let local_ip = primary_local_ip();
    let http_prefix = format!("http://{local_ip}:{bound_port}");

    let events = EventBus::new();
    let (command_sink, command_rx) = player::make_command_sink();

    let server = RendererServer::new(
        RendererServeOptions {
            friendly_name: renderer_config.friendly_name.clone(),
            manufacturer: "renderer developers".to_owned(),
            model_name: env!("CARGO_PKG_VERSION").to_owned(),
            usn: renderer_config.usn.clone(),
            http_prefix,
        },
        command_sink,
        cancel.clone(),
    )
    .context("error constructing renderer HTTP/SOAP server")?;
    let mut server = server;
    server.spawn_notifier();

    let description_location = url::Url::parse(&format!("http://{local_ip}:{bound_port}/description.xml"))?;
    let ssdp_server_string = format!(
        "{}/{} UPnP/1.0 upnp-renderer/{}",
        std::env::consts::OS,
        "1.0",
        env!("CARGO_PKG_VERSION")
    );

    events.publish(RendererEvent::Start);

    let http_task = {
        let router = server.router.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let serve = axum::serve(listener, router).with_graceful_shutdown(async move {
                cancel.cancelled().await;
            });
            if let Err(e) = serve.await {
                error!(error=?e, "HTTP server error");
            }
        })
    };

    let (ip_changed_tx, ip_changed_rx) = mpsc::unbounded_channel();

    let ssdp_task = {
        let usn = renderer_config.usn.clone();
        let cancel = cancel.clone();
        let events = events.clone();
        tokio::spawn(async move {
            if let Err(e) = run_ssdp_supervisor(
                usn,
                description_location,
                ssdp_server_string,
                Duration::from_secs(3),
                ip_changed_rx,
                events,
                cancel,
            )
            .await
            {
                error!(error=?e, "SSDP task error");
            }
        })
    };

    let player_task = tokio::spawn(player::run_supervisor(
        server.state.clone(),
        events.clone(),
        renderer_config.clone(),
        command_rx,
        cancel.clone(),
    ));

    let ip_monitor_task = tokio::spawn(ip_monitor::run(
        renderer_config.blocked_interfaces.clone(),
        renderer_config.additional_interfaces.clone(),
        ip_changed_tx,
        cancel.clone(),
    ));

    events.publish(RendererEvent::RendererStart);

    cancel.cancelled().await;

    events.publish(RendererEvent::Stop);

    let _ = tokio::join!(http_task, ssdp_task, player_task, ip_monitor_task);
    Ok(())
}

/// Owns the SSDP advertisement lifecycle for as long as the process runs.
/// Each time the local interface list changes, the current [`SsdpRunner`]
/// generation is torn down (without `ssdp:byebye` — the service isn't
/// actually leaving) and a fresh one is bound, so newly-appeared interfaces
/// get joined to the multicast group and start receiving alive NOTIFYs.
/// Only the final exit, driven by `cancel`, sends `ssdp:byebye`.
async fn run_ssdp_supervisor(
    usn: String,
    description_location: url::Url,
    server_string: String,
    notify_interval: Duration,
    mut ip_changed_rx: mpsc::UnboundedReceiver<()>,
    events: EventBus,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    loop {
        if cancel.is_cancelled() {
            return Ok(());
        }

        let ssdp = SsdpRunner::new(SsdpRunnerOptions {
            usn: usn.clone(),
            description_http_location: description_location.clone(),
            server_string: server_string.clone(),
            notify_interval,
            shutdown: cancel.clone(),
        })
        .await
        .context("error binding SSDP sockets")?;

        tokio::select! {
            r = ssdp.run_forever_suppressing_byebye() => {
                ssdp.send_byebye().await;
                return r;
            }
            Some(()) = ip_changed_rx.recv() => {
                info!("local interface list changed, restarting SSDP");
                events.publish(RendererEvent::UpdateIp);
            }
        }
    }
}

fn main() -> anyhow::Result<()> {
    let opts = Opts::parse();

    if let Some(SubCommand::Completions(completions_opts)) = &opts.subcommand {
        clap_complete::generate(completions_opts.shell, &mut Opts::command(), "upnp-renderer", &mut io::stdout());
        return Ok(());
    }

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("error building tokio runtime")?;

    let token = CancellationToken::new();

    #[cfg(not(target_os = "windows"))]
    {
        let token = token.clone();
        use signal_hook::consts::{SIGINT, SIGTERM};
        use signal_hook::iterator::Signals;
        let mut signals = Signals::new([SIGINT, SIGTERM])?;
        std::thread::spawn(move || {
            let mut cancel_triggered = false;
            for sig in signals.forever() {
                if cancel_triggered {
                    warn!("received signal {:?}, forcing shutdown", sig);
                    std::process::exit(1);
                }
                warn!("received signal {:?}, shutting down gracefully", sig);
                token.cancel();
                cancel_triggered = true;
                std::thread::spawn(|| {
                    std::thread::sleep(Duration::from_secs(5));
                    warn!("graceful shutdown timed out, killing process");
                    std::process::exit(1);
                });
            }
        });
    }

    let result = rt.block_on(async_main(opts, token.clone()));
    if let Err(e) = result.as_ref() {
        error!("error running upnp-renderer: {e:?}");
    }
    rt.shutdown_timeout(Duration::from_secs(1));
    match result {
        Ok(_) => std::process::exit(0),
        Err(_) => std::process::exit(1),
    }
}
