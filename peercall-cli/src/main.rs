//! Peercall CLI Application

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use peercall_core::prelude::*;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;


#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// Manager configuration file (JSON)
    #[arg(short, long, env = "PEERCALL_CONFIG", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an in-process call between two local users
    Demo {
        /// Caller identity
        #[arg(long, default_value = "alice")]
        caller: String,

        /// Callee identity
        #[arg(long, default_value = "bob")]
        callee: String,

        /// Enable video
        #[arg(long)]
        video: bool,

        /// Seconds to wait for the call to connect
        #[arg(long, default_value = "15")]
        timeout: u64,

        /// Seconds to hold the call once connected
        #[arg(long, default_value = "2")]
        hold: u64,
    },

    /// Print the call identifier two users share
    CallId {
        /// First participant
        a: String,
        /// Second participant
        b: String,
    },

    /// Print the effective manager configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("peercall=info,peercall_core=info")),
        )
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Demo {
            caller,
            callee,
            video,
            timeout,
            hold,
        } => {
            handle_demo(
                &caller,
                &callee,
                video,
                config,
                Duration::from_secs(timeout),
                Duration::from_secs(hold),
            )
            .await?;
        }
        Commands::CallId { a, b } => {
            let a: UserId = a.parse().context("invalid first participant")?;
            let b: UserId = b.parse().context("invalid second participant")?;
            println!("{}", CallId::between(&a, &b));
        }
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }

    Ok(())
}

fn load_config(path: Option<&std::path::Path>) -> Result<CallManagerConfig> {
    let config = match path {
        Some(path) => CallManagerConfig::from_json_file(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => CallManagerConfig::default(),
    };
    config.validate()?;
    Ok(config)
}

fn build_manager(
    user: UserId,
    bus: Arc<MemorySignalBus>,
    config: CallManagerConfig,
) -> Result<CallManager> {
    let deps = CallDependencies {
        bus,
        peer_factory: Arc::new(WebRtcPeerFactory::new()?),
        media: Arc::new(StaticMediaCapture::with_default_devices()),
        ice_provider: Arc::new(StaticIceServerProvider::new(
            config.fallback_ice_servers.clone(),
        )),
    };
    Ok(CallManager::new(user, deps, config)?)
}

async fn handle_demo(
    caller: &str,
    callee: &str,
    video: bool,
    config: CallManagerConfig,
    timeout: Duration,
    hold: Duration,
) -> Result<()> {
    let caller: UserId = caller.parse().context("invalid caller")?;
    let callee: UserId = callee.parse().context("invalid callee")?;
    let bus = Arc::new(MemorySignalBus::new());

    let alice = build_manager(caller.clone(), bus.clone(), config.clone())?;
    let bob = Arc::new(build_manager(callee.clone(), bus, config)?);

    alice.on_state_changed(|call_id, state| {
        println!("   [caller] {call_id}: {state}");
    });
    bob.on_state_changed(|call_id, state| {
        println!("   [callee] {call_id}: {state}");
    });
    bob.on_remote_stream(|call_id, stream| {
        tracing::info!(%call_id, tracks = stream.tracks.len(), "Remote stream attached");
    });

    // The callee accepts whatever rings
    let mut bob_events = bob.subscribe_events();
    bob.watch_incoming().await?;
    let answering = bob.clone();
    let acceptor = tokio::spawn(async move {
        loop {
            match bob_events.recv().await {
                Ok(CallEvent::IncomingCall { call_id, from }) => {
                    println!("📞 Incoming call {call_id} from {from}");
                    match answering.accept_call(from, video).await {
                        Ok((_media, handle)) => break Some(handle),
                        Err(e) => {
                            tracing::error!("Accept failed: {}", e);
                            break None;
                        }
                    }
                }
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!("Dropped {} events", n);
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break None,
            }
        }
    });

    println!("📞 {caller} calling {callee} (video: {video})");
    let (media, call) = alice.start_call(callee, video).await?;
    println!("   Local stream {} with {} tracks", media.stream_id(), media.tracks().len());

    let connected = tokio::time::timeout(timeout, call.wait_for_state(CallState::Connected)).await;
    match connected {
        Ok(Ok(())) => {
            println!("✅ Connected");
            tokio::time::sleep(hold).await;
        }
        Ok(Err(e)) => println!("❌ Call ended before connecting: {e}"),
        Err(_) => println!("⌛ Timed out waiting for connection (state: {})", call.state()),
    }

    alice.end_call(call.call_id()).await;
    acceptor.abort();
    alice.shutdown().await;
    bob.shutdown().await;
    println!("📞 Call ended");

    Ok(())
}
