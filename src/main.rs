//! peercall - peer-to-peer call signaling engine
//!
//! Places and answers 1:1 audio/video calls inside chat conversations,
//! exchanging offers, answers and ICE candidates over a pub/sub channel.

mod bus;
mod calling;
mod config;
mod console;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::task::JoinHandle;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use bus::websocket::WsBus;
use calling::demo::{self, DemoOptions};
use calling::machine::{self, CallHandle};
use calling::records::{CallLog, NullCallLog, RestCallLog};
use calling::sim::SimEngine;
use calling::tone::{AudioSink, NullSink};
use calling::CallType;
use config::Config;

#[derive(Parser)]
#[command(name = "peercall")]
#[command(about = "Peer-to-peer audio/video calls over a chat signaling channel", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a complete call between two in-process engines
    Demo {
        /// Place a video call instead of an audio call
        #[arg(long)]
        video: bool,

        /// Share the screen while the call is active
        #[arg(long)]
        screen_share: bool,
    },

    /// Join a conversation and wait for incoming calls
    Listen {
        /// Conversation ID to join
        #[arg(short, long)]
        conversation: String,

        /// Local user ID (overrides config)
        #[arg(short, long)]
        user: Option<String>,
    },

    /// Call a peer in a conversation
    Call {
        /// Conversation ID to call in
        #[arg(short, long)]
        conversation: String,

        /// User ID of the peer to call
        #[arg(short, long)]
        peer: String,

        /// Local user ID (overrides config)
        #[arg(short, long)]
        user: Option<String>,

        /// Start with the camera on
        #[arg(long)]
        video: bool,
    },

    /// Show or update the configuration
    Config {
        /// Only print the config file path
        #[arg(long)]
        show_path: bool,

        /// Set the local user ID
        #[arg(long)]
        user: Option<String>,

        /// Set the WebSocket signaling relay URL
        #[arg(long)]
        signaling_url: Option<String>,

        /// Set the call record log base URL
        #[arg(long)]
        records_url: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    match cli.command {
        Commands::Demo {
            video,
            screen_share,
        } => {
            demo::run_demo(DemoOptions {
                video,
                screen_share,
                ..Default::default()
            })
            .await?;
        }
        Commands::Listen { conversation, user } => {
            let config = Config::load()?;
            let (handle, task) = start_engine(&config, user, &conversation).await?;
            println!("Waiting for calls in {}", conversation);
            console::run(handle, task).await?;
        }
        Commands::Call {
            conversation,
            peer,
            user,
            video,
        } => {
            let config = Config::load()?;
            let (handle, task) = start_engine(&config, user, &conversation).await?;
            let call_type = if video {
                CallType::Video
            } else {
                CallType::Audio
            };
            tracing::info!("Calling {} ({})...", peer, call_type);
            handle.start(&peer, call_type)?;
            console::run(handle, task).await?;
        }
        Commands::Config {
            show_path,
            user,
            signaling_url,
            records_url,
        } => {
            if show_path {
                println!("{}", Config::config_path()?.display());
                return Ok(());
            }
            let mut config = Config::load()?;
            let changed = user.is_some() || signaling_url.is_some() || records_url.is_some();
            if let Some(user) = user {
                config.user_id = Some(user);
            }
            if let Some(url) = signaling_url {
                config.signaling_url = Some(url);
            }
            if let Some(url) = records_url {
                config.records_url = Some(url);
            }
            if changed {
                config.save()?;
                tracing::info!("Saved {}", Config::config_path()?.display());
            }
            print!(
                "{}",
                toml::to_string_pretty(&config).context("Failed to serialize config")?
            );
        }
    }

    Ok(())
}

/// Connect to the relay and spawn an engine for one conversation.
async fn start_engine(
    config: &Config,
    user: Option<String>,
    conversation: &str,
) -> Result<(CallHandle, JoinHandle<()>)> {
    let user_id = user
        .or_else(|| config.user_id.clone())
        .context("No user ID: pass --user or run `peercall config --user <id>`")?;
    let url = config.signaling_url.as_deref().context(
        "No signaling relay configured: run `peercall config --signaling-url <ws-url>`",
    )?;
    let transport = WsBus::connect(url)?;

    let log: Arc<dyn CallLog> = match &config.records_url {
        Some(base) => Arc::new(RestCallLog::new(base, config.records_api_key.clone())),
        None => {
            tracing::debug!("No records_url configured; call records are not persisted");
            Arc::new(NullCallLog)
        }
    };

    tracing::info!("Using the simulated media engine");
    machine::spawn(
        config.engine_config(&user_id, conversation),
        Arc::new(transport),
        Arc::new(SimEngine::new()),
        log,
        ring_sink(),
    )
    .await
}

#[cfg(feature = "audio")]
fn ring_sink() -> Arc<dyn AudioSink> {
    match calling::audio::CpalSink::open() {
        Some(sink) => Arc::new(sink),
        None => Arc::new(NullSink),
    }
}

#[cfg(not(feature = "audio"))]
fn ring_sink() -> Arc<dyn AudioSink> {
    Arc::new(NullSink)
}
