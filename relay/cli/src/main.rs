//! Relay Probe - Interactive client for a streaming assistant backend
//!
//! Connects to a backend over WebSocket, sends each line typed on stdin as a
//! user message and prints the assistant's streamed responses as they are
//! assembled. Useful for poking at a backend and watching the link recover
//! from restarts.
//!
//! # Usage
//!
//! ```bash
//! # Connect to the configured (or default) endpoint
//! relay-probe
//!
//! # Custom endpoint, persist finalized messages
//! relay-probe --url ws://10.0.0.5:8765/ws --store ~/relay/messages.jsonl
//!
//! # Verbose logging
//! RUST_LOG=relay_core=debug relay-probe
//! ```
//!
//! # Commands
//!
//! - `/stop <request-id>`: Ask the backend to stop a response and keep what arrived
//! - `/reconnect`: Connect again after reconnection gave up
//! - `/status`: Print the connection state
//! - `/quit`: Exit
//!
//! # Signals
//!
//! - `SIGINT` (Ctrl-C): Dispose the link and exit

mod console;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, error, info, warn};

use relay_core::{
    load_config_from_path, AssemblerError, ConfigOverrides, ConnectionManager, JsonlPersistence,
    LinkEvent, MemoryPersistence, PersistenceSink, RequestId, StreamAssembler, Topic,
    WebSocketTransport,
};

use console::ConsoleRenderSink;

/// Relay Probe - interactive client for a streaming assistant backend
#[derive(Parser, Debug)]
#[command(name = "relay-probe")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Backend WebSocket URL
    #[arg(short = 'u', long, value_name = "URL")]
    url: Option<String>,

    /// Configuration file path
    #[arg(short = 'c', long, env = "RELAY_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Append finalized messages to this JSON-lines file
    #[arg(short = 's', long, env = "RELAY_STORE", value_name = "FILE")]
    store: Option<PathBuf>,

    /// Conversation id attached to saved messages
    #[arg(long, value_name = "ID")]
    chat_id: Option<String>,

    /// Give up reconnecting after this many attempts
    #[arg(long, value_name = "N")]
    max_reconnect_attempts: Option<u32>,

    /// Heartbeat period in milliseconds
    #[arg(long, value_name = "MS")]
    ping_interval_ms: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, env = "RELAY_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

impl Args {
    fn overrides(&self) -> ConfigOverrides {
        let mut overrides = ConfigOverrides::new();
        if let Some(ref url) = self.url {
            overrides = overrides.with_url(url.clone());
        }
        if let Some(attempts) = self.max_reconnect_attempts {
            overrides = overrides.with_max_reconnect_attempts(attempts);
        }
        if let Some(ms) = self.ping_interval_ms {
            overrides = overrides.with_ping_interval_ms(ms);
        }
        overrides
    }
}

/// Initialize logging with the specified level
///
/// Logs go to stderr so they don't interleave with streamed text.
fn init_logging(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!("relay_probe={level},relay_core={level}"))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();
}

/// What to do after a line of input
enum Flow {
    Continue,
    Quit,
}

async fn handle_input(
    link: &ConnectionManager,
    assembler: &StreamAssembler,
    line: &str,
) -> Result<Flow> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(Flow::Continue);
    }

    let mut parts = line.splitn(2, char::is_whitespace);
    match (parts.next(), parts.next().map(str::trim)) {
        (Some("/quit"), _) => return Ok(Flow::Quit),
        (Some("/stop"), Some(id)) if !id.is_empty() => {
            let request_id = RequestId::new(id);
            link.stop(request_id.clone())?;
            match assembler.abort(&request_id).await {
                Ok(stream) => info!(message_id = %stream.message_id, "Stream stopped"),
                Err(AssemblerError::UnknownRequest(_)) => {
                    warn!(request_id = %request_id, "No active stream with that id");
                }
                Err(e) => error!(error = %e, "Stopping stream failed"),
            }
        }
        (Some("/stop"), _) => warn!("Usage: /stop <request-id>"),
        (Some("/reconnect"), _) => link.connect()?,
        (Some("/status"), _) => {
            let snapshot = link.snapshot();
            info!(
                phase = ?snapshot.phase,
                status = snapshot.assistant_status.description(),
                epoch = snapshot.epoch,
                attempts = snapshot.reconnect_attempts,
                queued = snapshot.queued,
                dropped = snapshot.dropped,
                current = ?assembler.current_request(),
                "Link status"
            );
        }
        _ => {
            let id = link.send_user_message(line)?;
            debug!(local_id = %id, "User message sent");
        }
    }

    Ok(Flow::Continue)
}

fn report(event: &LinkEvent) {
    match event {
        LinkEvent::Connecting { epoch, attempt } => debug!(epoch, attempt, "Connecting"),
        LinkEvent::Connected { epoch } => info!(epoch, "Connected"),
        LinkEvent::Disconnected {
            epoch,
            code,
            reason,
        } => warn!(epoch, ?code, %reason, "Disconnected"),
        LinkEvent::ReconnectScheduled { attempt, delay } => {
            info!(attempt, delay_ms = delay.as_millis() as u64, "Reconnecting soon");
        }
        LinkEvent::MaxAttemptsReached { attempts } => {
            warn!(attempts, "Gave up reconnecting; type /reconnect to try again");
        }
        LinkEvent::Status(status) => info!(status = status.description(), "Assistant status"),
        LinkEvent::Finalized(stream) => info!(
            request_id = %stream.request_id,
            message_id = %stream.message_id,
            chars = stream.content_len,
            "Response saved"
        ),
        LinkEvent::FinalizeFailed { request_id, error } => {
            error!(request_id = %request_id, %error, "Response could not be saved");
        }
        LinkEvent::Message(_) => {}
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args.log_level);

    info!("Relay probe starting");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut config =
        load_config_from_path(args.config.as_deref()).context("Failed to load configuration")?;
    args.overrides()
        .apply(&mut config)
        .context("Invalid command-line override")?;

    info!(
        source = %config.source(),
        url = %config.connection.url,
        "Configuration loaded"
    );

    let persistence: Arc<dyn PersistenceSink> = match args.store {
        Some(ref path) => Arc::new(
            JsonlPersistence::open(path)
                .await
                .with_context(|| format!("Failed to open store: {path:?}"))?,
        ),
        None => {
            info!("No --store given; finalized messages are kept in memory only");
            Arc::new(MemoryPersistence::new())
        }
    };

    let transport = WebSocketTransport::new(
        config.connection.url.clone(),
        config.connection.connect_timeout,
    );
    let link = ConnectionManager::spawn(Arc::new(transport), config.connection.clone());

    let assembler = StreamAssembler::new(
        config.assembler.clone(),
        Arc::new(ConsoleRenderSink::new()),
        persistence,
        link.bus().clone(),
    );
    assembler.set_chat_id(args.chat_id.clone());
    let consumer = assembler.attach(link.subscribe(Topic::Messages));
    let mut events = link.subscribe(Topic::All);

    link.connect()?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT, shutting down");
                break;
            }
            line = lines.next_line() => match line.context("Failed to read stdin")? {
                Some(line) => {
                    if let Flow::Quit = handle_input(&link, &assembler, &line).await? {
                        break;
                    }
                }
                None => {
                    info!("Input closed, shutting down");
                    break;
                }
            },
            event = events.recv() => match event {
                Some(event) => report(&event),
                None => break,
            },
        }
    }

    link.dispose();
    if let Err(e) = consumer.await {
        warn!(error = %e, "Chunk consumer ended abnormally");
    }

    info!("Relay probe stopped");
    Ok(())
}
