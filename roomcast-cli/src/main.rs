//! Roomcast CLI Application

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use roomcast_core::prelude::*;
use roomcast_core::TransportConfig;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// Log filter (e.g. "roomcast=debug")
    #[arg(long, env = "ROOMCAST_LOG", default_value = "roomcast=info")]
    log: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the relay
    Serve {
        /// Signaling listen address (overrides the config file)
        #[arg(short, long, env = "ROOMCAST_LISTEN")]
        listen: Option<SocketAddr>,

        /// JSON configuration file
        #[arg(short, long, env = "ROOMCAST_CONFIG")]
        config: Option<PathBuf>,
    },

    /// Join a room as a demo participant
    Join {
        /// Relay signaling URL
        #[arg(short, long, default_value = "ws://127.0.0.1:8080")]
        url: String,

        /// Publish an audio track
        #[arg(long)]
        audio: bool,

        /// Publish a video track
        #[arg(long)]
        video: bool,

        /// Leave after this many seconds (default: until Ctrl-C)
        #[arg(short, long)]
        duration: Option<u64>,
    },

    /// Show the router capability set for a configuration
    Status {
        /// JSON configuration file
        #[arg(short, long, env = "ROOMCAST_CONFIG")]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(&cli.log))
        .init();

    match cli.command {
        Commands::Serve { listen, config } => handle_serve(listen, config).await?,
        Commands::Join {
            url,
            audio,
            video,
            duration,
        } => handle_join(&url, audio, video, duration).await?,
        Commands::Status { config } => handle_status(config).await?,
    }

    Ok(())
}

fn load_config(path: Option<PathBuf>) -> Result<RelayConfig> {
    match path {
        Some(path) => RelayConfig::from_file(path),
        None => Ok(RelayConfig::default()),
    }
}

async fn handle_serve(listen: Option<SocketAddr>, config: Option<PathBuf>) -> Result<()> {
    let mut config = load_config(config)?;
    if let Some(addr) = listen {
        config.listen_addr = addr;
    }

    let service = RelayService::builder().with_config(config).build().await?;
    let server = Arc::new(service.bind().await?);
    println!("✅ Relay listening on ws://{}", server.local_addr()?);

    let mut events = service.subscribe_events();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(RelayEvent::PeerConnected { peer_id }) => {
                    tracing::info!(%peer_id, "peer joined");
                }
                Ok(RelayEvent::PeerDisconnected { peer_id }) => {
                    tracing::info!(%peer_id, "peer left");
                }
                Ok(RelayEvent::ProducerOpened(info)) => {
                    tracing::info!(peer_id = %info.peer_id, producer_id = %info.producer_id, kind = %info.kind, "producer opened");
                }
                Ok(RelayEvent::ProducerClosed {
                    peer_id,
                    producer_id,
                }) => {
                    tracing::info!(%peer_id, %producer_id, "producer closed");
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(missed = n, "Relay event stream lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let accept = {
        let server = server.clone();
        tokio::spawn(async move { server.run().await })
    };

    tokio::signal::ctrl_c()
        .await
        .context("waiting for Ctrl-C")?;
    println!("🛑 Shutting down");
    server.stop();
    let _ = accept.await;
    Ok(())
}

async fn handle_join(url: &str, audio: bool, video: bool, duration: Option<u64>) -> Result<()> {
    // Neither flag means both.
    let (audio, video) = if audio || video {
        (audio, video)
    } else {
        (true, true)
    };
    println!("📞 Joining {}...", url);
    println!("   Video: {} | Audio: {}", video, audio);

    let channel = Arc::new(WebSocketChannel::connect(url, TransportConfig::default()).await?);
    let controller = SessionController::new(
        channel.clone(),
        LoopbackDevice::new(),
        ClientConfig::default(),
    );
    controller.init().await?;
    println!("✅ Session ready");

    let media = LocalMedia::capture(audio, video);
    let report = controller.start_producing(&media).await?;
    for outcome in &report.outcomes {
        match &outcome.result {
            Ok(producer_id) => println!("🎥 Producing {} as {}", outcome.kind, producer_id),
            Err(e) => println!("⚠️  Could not produce {}: {}", outcome.kind, e),
        }
    }

    let mut changes = controller.aggregator().subscribe();
    let deadline = async {
        match duration {
            Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
            None => {
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    };
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = &mut deadline => break,
            change = changes.recv() => match change {
                Ok(AggregateEvent::Changed(aggregate)) => {
                    println!(
                        "👥 {}: audio={} video={}",
                        aggregate.peer_id,
                        aggregate.audio.is_some(),
                        aggregate.video.is_some()
                    );
                }
                Ok(AggregateEvent::PeerRemoved { peer_id }) => {
                    println!("👋 {} left", peer_id);
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    let stopped = controller.stop_producing().await?;
    media.stop_all();
    controller.close();
    channel.close();
    println!("📞 Left the room ({} producers closed)", stopped);
    Ok(())
}

async fn handle_status(config: Option<PathBuf>) -> Result<()> {
    let config = load_config(config)?;
    let service = RelayService::new(config).await?;

    println!("📊 Roomcast Status");
    println!("=================");
    println!("Listen address: {}", service.config().listen_addr);
    println!(
        "Handler timeout: {} ms",
        service.config().handler.engine_timeout_ms
    );
    println!("Router capabilities:");
    println!(
        "{}",
        serde_json::to_string_pretty(&service.rtp_capabilities())?
    );
    println!();
    println!("Available commands:");
    println!("  roomcast serve [--listen ADDR] [--config FILE]   - Run the relay");
    println!("  roomcast join --url URL [--audio] [--video]      - Join as a participant");
    println!("  roomcast status                                  - Show this status");

    Ok(())
}
