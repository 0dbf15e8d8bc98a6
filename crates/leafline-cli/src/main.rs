//! leafline - storefront real-time client
//!
//! Opens the assistant chat or a delivery-tracking stream from a terminal,
//! printing every channel event as it happens.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use leafline_link::endpoint::channel_endpoint;
use leafline_link::{
    ChannelEvent, ChannelHandle, ChannelKind, ConnectParams, LinkConfig, NetworkObserver,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// How long the channel gets to close its transport on exit.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(name = "leafline")]
#[command(about = "Leafline chat and delivery tracking client")]
#[command(version)]
struct Cli {
    /// Path to config file
    #[arg(short, long, env = "LEAFLINE_CONFIG")]
    config: Option<PathBuf>,

    /// API base address, overrides the config file
    #[arg(long, env = "LEAFLINE_BASE_URL")]
    base_url: Option<String>,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Chat with the store assistant; lines from stdin are sent as messages
    Chat {
        /// Assistant persona for new sessions
        #[arg(long)]
        persona: Option<String>,

        #[command(flatten)]
        query: QueryArgs,
    },

    /// Follow a delivery
    Track {
        /// Delivery to follow
        delivery_id: String,

        #[command(flatten)]
        query: QueryArgs,
    },

    /// Print the WebSocket endpoint a channel would connect to
    Endpoint {
        /// Delivery id; the chat endpoint is printed when omitted
        #[arg(long)]
        delivery: Option<String>,

        /// Session id to offer as the resume hint
        #[arg(long)]
        session: Option<String>,

        #[command(flatten)]
        query: QueryArgs,
    },

    /// Generate a sample config file
    InitConfig {
        /// Path to write config
        #[arg(short, long, default_value = "leafline.toml")]
        output: PathBuf,
    },
}

#[derive(Args)]
struct QueryArgs {
    /// Extra endpoint query parameter (KEY=VALUE), repeatable
    #[arg(long = "query", value_parser = parse_key_value)]
    pairs: Vec<(String, String)>,
}

impl QueryArgs {
    fn into_map(self) -> BTreeMap<String, String> {
        self.pairs.into_iter().collect()
    }
}

fn parse_key_value(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got '{raw}'")),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json)?;

    match cli.command {
        Commands::Chat { persona, query } => {
            let config = load_config(cli.config.as_deref(), cli.base_url)?;
            let mut params = ConnectParams::new();
            params.query = query.into_map();
            if let Some(persona) = persona {
                params = params.with_session_param("persona", persona);
            }
            run_channel(&config, ChannelKind::Chat, params, true).await?;
        }

        Commands::Track { delivery_id, query } => {
            let config = load_config(cli.config.as_deref(), cli.base_url)?;
            let mut params = ConnectParams::new();
            params.query = query.into_map();
            run_channel(&config, ChannelKind::tracking(delivery_id), params, false).await?;
        }

        Commands::Endpoint {
            delivery,
            session,
            query,
        } => {
            let config = load_config(cli.config.as_deref(), cli.base_url)?;
            let kind = delivery.map_or(ChannelKind::Chat, ChannelKind::tracking);
            let url = channel_endpoint(
                &config.endpoint_base()?,
                &kind,
                session.as_deref(),
                &query.into_map(),
            )?;
            println!("{url}");
        }

        Commands::InitConfig { output } => {
            let base_url = cli
                .base_url
                .unwrap_or_else(|| "https://shop.example.com".to_string());
            init_config(&output, base_url)?;
        }
    }

    Ok(())
}

fn init_tracing(json: bool) -> anyhow::Result<()> {
    let filter = EnvFilter::from_default_env()
        .add_directive("leafline_link=info".parse()?)
        .add_directive("leafline=info".parse()?);

    if json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer().with_writer(std::io::stderr))
            .with(filter)
            .init();
    }
    Ok(())
}

fn load_config(path: Option<&Path>, base_url: Option<String>) -> anyhow::Result<LinkConfig> {
    let mut config = match path {
        Some(path) => LinkConfig::from_file(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => LinkConfig::new("http://localhost:8000"),
    };
    if let Some(base_url) = base_url {
        config.base_url = base_url;
    }
    config.validate()?;
    Ok(config)
}

fn init_config(output: &Path, base_url: String) -> anyhow::Result<()> {
    if output.exists() {
        anyhow::bail!("{} already exists", output.display());
    }
    let config = LinkConfig::new(base_url);
    std::fs::write(output, config.to_toml()?)
        .with_context(|| format!("writing {}", output.display()))?;
    println!("Config written to {}", output.display());
    Ok(())
}

async fn run_channel(
    config: &LinkConfig,
    kind: ChannelKind,
    params: ConnectParams,
    interactive: bool,
) -> anyhow::Result<()> {
    let network = Arc::new(NetworkObserver::default());
    let channel = config.channel_builder(kind.clone(), network)?.spawn();
    channel.on_any(|event| println!("{}", describe(event)));

    info!(channel = %kind, base_url = %config.base_url, "connecting");
    channel.connect(params)?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line() => match line? {
                Some(line) => {
                    if !handle_line(&channel, line.trim(), interactive)? {
                        break;
                    }
                }
                // stdin closed; keep following until interrupted
                None => {
                    tokio::signal::ctrl_c().await?;
                    break;
                }
            },
        }
    }

    info!(channel = %kind, "shutting down");
    stop_channel(&channel, SHUTDOWN_GRACE).await
}

/// Stop the channel and wait for it to close its transport.
async fn stop_channel(channel: &ChannelHandle, grace: Duration) -> anyhow::Result<()> {
    channel.shutdown()?;
    if tokio::time::timeout(grace, channel.stopped()).await.is_err() {
        warn!(channel = %channel.kind(), "channel did not stop within {grace:?}");
    }
    Ok(())
}

/// Apply one input line. Returns `false` when the user asked to quit.
fn handle_line(channel: &ChannelHandle, line: &str, interactive: bool) -> anyhow::Result<bool> {
    match line {
        "" => {}
        "/quit" => return Ok(false),
        "/reconnect" => channel.reconnect()?,
        "/reset" => channel.reset_session()?,
        "/disconnect" => channel.disconnect()?,
        "/status" => {
            let status = channel.status();
            println!(
                "state={} session={} attempt={} queued={}",
                status.state(),
                status.session_id().as_deref().unwrap_or("-"),
                status.reconnect_attempt(),
                status.queued_messages()
            );
        }
        text if interactive => channel.send_message(text)?,
        other => warn!(input = %other, "tracking is read-only; try /status or /quit"),
    }
    Ok(true)
}

fn describe(event: &ChannelEvent) -> String {
    match event {
        ChannelEvent::Connected {
            session_id,
            resumed: true,
        } => format!("* resumed session {session_id}"),
        ChannelEvent::Connected { session_id, .. } => format!("* new session {session_id}"),
        ChannelEvent::Disconnected { reason } => format!("* disconnected: {reason}"),
        ChannelEvent::Reconnecting {
            attempt,
            max_attempts,
            delay,
        } => match max_attempts {
            Some(max) => format!("* reconnecting in {delay:?} (attempt {attempt}/{max})"),
            None => format!("* reconnecting in {delay:?} (attempt {attempt})"),
        },
        ChannelEvent::ConnectionFailed {
            attempts,
            last_error,
        } => format!("* gave up after {attempts} attempt(s): {last_error}; /reconnect to retry"),
        ChannelEvent::WaitingForNetwork => "* offline, waiting for network".to_string(),
        ChannelEvent::StateChanged { from, to } => format!("  [{from} -> {to}]"),
        ChannelEvent::Message(frame) => match frame.field("content").and_then(|c| c.as_str()) {
            Some(content) => format!("<{}> {content}", frame.frame_type),
            None => format!("<{}> {}", frame.frame_type, frame.body),
        },
    }
}
