mod activity;
mod cli;
mod config;
mod connector;
mod media;
mod negotiate;
mod playback;
mod runtime;
mod signaling;
mod supervisor;
mod timers;
mod transport;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use cli::Command;
use connector::LiveConnector;
use media::MediaConfig;
use negotiate::NegotiationClient;
use playback::{PacketCounter, PlaybackSurface};
use runtime::{Runtime, RuntimeHandle};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, error, info, warn};

/// Upper bound on the close handshake once shutdown was requested.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider (needed for wss:// to the controller)
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install rustls crypto provider"))?;

    let args = cli::parse_args()?;
    init_tracing(args.log_json);

    let mut config = config::load_config(&args.config_path)?;
    config::apply_overrides(&mut config, &args, std::env::var(config::TOKEN_ENV).ok());

    // Validate configuration semantics
    if let Err(issues) = config.validate() {
        let has_errors = issues.iter().any(|i| i.starts_with("ERROR:"));
        for issue in &issues {
            if issue.starts_with("ERROR:") {
                error!("{}", issue);
            } else {
                warn!("{}", issue);
            }
        }
        if has_errors {
            error!(
                "Configuration has {} issue(s). Fix the ERROR(s) above and restart.",
                issues.len()
            );
            std::process::exit(1);
        }
    }

    info!(
        host = %config.controller.host,
        path = %config.controller.signaling_path,
        actuators = ?config.actuators,
        "Starting driveway"
    );

    let counters: Vec<Arc<PacketCounter>> = config
        .actuators
        .iter()
        .map(|a| Arc::new(PacketCounter::new(format!("{a}-video"))))
        .collect();
    let surfaces: Vec<Arc<dyn PlaybackSurface>> = counters
        .iter()
        .map(|c| Arc::clone(c) as Arc<dyn PlaybackSurface>)
        .collect();

    let timing = &config.timing;
    let negotiation = NegotiationClient::new(&config.controller, timing.negotiation_timeout())
        .context("Failed to build HTTP client")?;
    let media = MediaConfig {
        stun_urls: config.ice.stun_urls.clone(),
        negotiation_timeout: timing.negotiation_timeout(),
        track_attach_delay: timing.track_attach_delay(),
        surfaces: Arc::new(surfaces),
    };
    let tls_cert = config
        .controller
        .tls_cert
        .clone()
        .filter(|_| config.controller.secure);
    let connector = LiveConnector::new(
        config.controller.signaling_url(),
        tls_cert,
        negotiation,
        media,
    );

    let (runtime, handle) = Runtime::new(timing, &config.actuators, Arc::new(connector));
    let mut runtime_task = tokio::spawn(runtime.run());
    tokio::spawn(print_status(handle.clone()));
    tokio::spawn(read_commands(handle.clone()));

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    tokio::select! {
        result = &mut runtime_task => {
            result.context("Runtime task failed")?;
            report_playback(&counters);
            return Ok(());
        }
        _ = tokio::signal::ctrl_c() => info!("Received SIGINT, shutting down"),
        _ = sigterm.recv() => info!("Received SIGTERM, shutting down"),
    }

    handle.shutdown();
    match tokio::time::timeout(SHUTDOWN_GRACE, &mut runtime_task).await {
        Ok(result) => result.context("Runtime task failed")?,
        Err(_) => {
            warn!("Session did not close in time, exiting anyway");
            runtime_task.abort();
        }
    }
    report_playback(&counters);
    Ok(())
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    // stdout carries status lines; logs go to stderr.
    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
}

/// Write every status snapshot to stdout as one JSON line.
async fn print_status(handle: RuntimeHandle) {
    let mut status = handle.status();
    loop {
        match serde_json::to_string(&*status.borrow_and_update()) {
            Ok(line) => println!("{line}"),
            Err(e) => warn!("Failed to serialize status: {e}"),
        }
        if status.changed().await.is_err() {
            break;
        }
    }
}

/// Turn stdin lines into runtime input until stdin closes.
async fn read_commands(handle: RuntimeHandle) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => {
                debug!("stdin closed, no more commands");
                break;
            }
            Err(e) => {
                warn!("Failed to read stdin: {e}");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        match line.parse::<Command>() {
            Ok(Command::Press(actuator)) => handle.trigger(actuator),
            Ok(Command::Blur) => handle.blur(),
            Ok(Command::Focus) => handle.focus(),
            Ok(Command::Quit) => {
                handle.shutdown();
                break;
            }
            Err(e) => warn!("{e:#}"),
        }
    }
}

fn report_playback(counters: &[Arc<PacketCounter>]) {
    for counter in counters {
        info!(
            surface = counter.name(),
            packets = counter.packets(),
            bytes = counter.bytes(),
            "Playback totals"
        );
    }
}
