mod config;

use std::path::PathBuf;
use std::time::{Duration, Instant};

use clap::Parser;
use tokio::time::MissedTickBehavior;
use tracing::{error, info};

use rtpmidi_backend::{ChannelEvent, EventSink, InstanceId};

#[derive(Parser, Debug)]
#[command(name = "rtpmidi-daemon", about = "RTP-MIDI / AppleMIDI network daemon")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, env = "RTPMIDI_CONFIG", default_value = "config/rtpmidi.toml")]
    config: PathBuf,

    /// Dispatch cycle interval in milliseconds
    #[arg(long, default_value_t = 5)]
    tick_ms: u64,
}

/// Logs every event routed to a registered channel.
struct LogSink;

impl EventSink for LogSink {
    fn deliver(&mut self, instance: InstanceId, name: &str, events: &[ChannelEvent]) {
        for event in events {
            info!(
                instance = %name,
                id = %instance,
                channel = %event.ident,
                value = event.value,
                "Event"
            );
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    // Load configuration
    let config_str = tokio::fs::read_to_string(&args.config).await.map_err(|e| {
        error!("Failed to read config file {:?}: {}", args.config, e);
        e
    })?;

    let config = config::parse(&config_str).map_err(|e| {
        error!("Failed to parse config: {}", e);
        e
    })?;

    let mut backend = config::build_backend(&config)?;

    info!(
        instances = config.instances.len(),
        tick_ms = args.tick_ms,
        "rtpmidi daemon starting"
    );

    backend.start(Instant::now())?;

    let mut tick = tokio::time::interval(Duration::from_millis(args.tick_ms.max(1)));
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    let mut sink = LogSink;
    loop {
        tokio::select! {
            _ = tick.tick() => backend.dispatch(Instant::now(), &mut sink),
            result = &mut shutdown => {
                if let Err(e) = result {
                    error!(error = %e, "Signal handler failed");
                }
                info!("Shutting down...");
                break;
            }
        }
    }

    backend.shutdown();
    Ok(())
}
