use anyhow::{Context, Result};
use chatload_core::{
    ChatMessage, ChatResponse, Config, ConnectionManager, MessageType, Metrics, MetricsDetail, WsConnector,
};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "preflight")]
#[command(about = "Preflight checks for a chat load test target (handshake and echo per room)")]
struct Args {
    /// Path to configuration file
    #[arg(long, default_value = "config/example.local.toml")]
    config: PathBuf,

    /// Server base URL (overrides config)
    #[arg(long)]
    url: Option<String>,

    /// Rooms to probe; defaults to every configured room
    #[arg(long = "room")]
    rooms: Vec<u32>,
}

#[derive(Debug)]
enum Probe {
    Ok,
    Rejected(String),
    NoReply,
    Failed(String),
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let mut cfg = if args.config.exists() {
        Config::from_file(&args.config).with_context(|| format!("Failed to load config from {:?}", args.config))?
    } else {
        Config::default()
    };
    if let Some(url) = args.url {
        cfg.target.url = url;
    }

    info!("Validating target URL...");
    let base = validate_target_url(&cfg.target.url)
        .with_context(|| format!("Invalid target.url: {}", cfg.target.url))?;

    let rooms: Vec<u32> = if args.rooms.is_empty() {
        (1..=cfg.target.rooms).collect()
    } else {
        args.rooms.clone()
    };

    let connector = Arc::new(WsConnector::new(base.as_str()).context("Failed to create WebSocket connector")?);
    let metrics = Arc::new(Metrics::new(MetricsDetail::Summary));
    let connections = ConnectionManager::new(connector, metrics, cfg.target.connect_timeout());

    println!();
    println!("=== Preflight ({} rooms) ===", rooms.len());
    println!("Endpoint: {}", base.as_str().trim_end_matches('/'));

    let mut failures = 0u64;
    for room in rooms {
        let start = Instant::now();
        let probe = probe_room(&connections, room, &cfg).await;
        let latency_ms = start.elapsed().as_millis() as u64;
        match &probe {
            Probe::Ok => println!("room {:<3} -> OK ({}ms)", room, latency_ms),
            Probe::Rejected(reason) => println!("room {:<3} -> ERROR {} ({}ms)", room, reason, latency_ms),
            Probe::NoReply => println!("room {:<3} -> TIMEOUT ({}ms)", room, latency_ms),
            Probe::Failed(reason) => println!("room {:<3} -> FAILED {} ({}ms)", room, reason, latency_ms),
        }
        if !matches!(probe, Probe::Ok) {
            warn!("Probe failed for {}: {:?}", connections.connector().endpoint(room), probe);
            failures = failures.saturating_add(1);
        }
    }

    if failures > 0 {
        anyhow::bail!("Preflight failed: {failures} room probe(s) failed");
    }

    println!();
    println!("Preflight OK.");
    Ok(())
}

async fn probe_room(connections: &ConnectionManager, room: u32, cfg: &Config) -> Probe {
    let mut conn = match connections.open(room).await {
        Ok(conn) => conn,
        Err(e) => return Probe::Failed(e.to_string()),
    };

    let payload = match ChatMessage::new(1, "preflight probe", MessageType::Text, room).to_json() {
        Ok(payload) => payload,
        Err(e) => return Probe::Failed(e.to_string()),
    };

    let probe = match conn.send_and_wait(&payload, cfg.target.response_timeout()).await {
        Ok(Some(reply)) => match serde_json::from_str::<ChatResponse>(&reply) {
            Ok(response) if response.is_ok() => Probe::Ok,
            Ok(response) => Probe::Rejected(response.reason().to_string()),
            Err(_) => Probe::Rejected(format!("unparseable reply: {reply}")),
        },
        Ok(None) => Probe::NoReply,
        Err(e) => Probe::Failed(e.to_string()),
    };
    conn.close().await;
    probe
}

fn validate_target_url(raw: &str) -> Result<url::Url> {
    let url = url::Url::parse(raw).with_context(|| format!("Invalid URL: {raw}"))?;

    if url.scheme() == "wss" {
        anyhow::bail!("Target URL must be plain ws://, TLS is not supported (got {raw})");
    }
    if url.scheme() != "ws" {
        anyhow::bail!("Target URL must be ws:// (got {raw})");
    }
    if !url.username().is_empty() || url.password().is_some() {
        anyhow::bail!("Target URL must not include credentials (got {raw})");
    }
    url.host_str().context("Target URL must include a hostname")?;

    // Base URL only; the client appends `/chat/{room}`.
    if url.path() != "/" {
        anyhow::bail!("Target URL must not include a path (got path={}, url={raw})", url.path());
    }
    if url.query().is_some() || url.fragment().is_some() {
        anyhow::bail!("Target URL must not include query/fragment (got {raw})");
    }

    Ok(url)
}
