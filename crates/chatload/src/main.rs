use anyhow::{Context, Result};
use chatload_core::report::{export_latency, export_throughput, print_phase_report, print_run_summary};
use chatload_core::{Config, Connector, LoadTest, MetricsDetail, MockBehavior, MockConnector, RunError, WsConnector};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "chatload")]
#[command(about = "Two-phase WebSocket chat load test client")]
struct Args {
    /// Path to configuration file
    #[arg(long, default_value = "config/example.local.toml")]
    config: PathBuf,

    /// Connection mode: mock or ws
    #[arg(long, default_value = "ws")]
    mode: String,

    /// Server base URL (overrides config)
    #[arg(long)]
    url: Option<String>,

    /// Total messages to generate (overrides config)
    #[arg(long)]
    total_messages: Option<u64>,

    /// Main phase worker count (overrides config)
    #[arg(long)]
    main_workers: Option<usize>,

    /// Metrics detail: summary or full (overrides config)
    #[arg(long)]
    detail: Option<String>,

    /// Mock mode: fraction of requests the mock rejects
    #[arg(long, default_value = "0.0")]
    mock_failure_rate: f64,

    /// Mock mode: simulated service time per request
    #[arg(long, default_value = "1")]
    mock_latency_ms: u64,
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
    let config = load_config(&args)?;

    let connector: Arc<dyn Connector> = match args.mode.as_str() {
        "mock" => {
            let behavior = if args.mock_failure_rate > 0.0 {
                MockBehavior::FailureRate(args.mock_failure_rate)
            } else {
                MockBehavior::AlwaysOk
            };
            Arc::new(MockConnector::new(behavior).with_latency(Duration::from_millis(args.mock_latency_ms)))
        }
        "ws" => Arc::new(WsConnector::new(config.target.url.clone()).context("Failed to create WebSocket connector")?),
        _ => anyhow::bail!("Invalid mode: {}, must be 'mock' or 'ws'", args.mode),
    };

    info!("Using connector: {} ({})", connector.name(), connector.endpoint(1));
    info!(
        "Load profile: {} messages, queue {}, warmup {}x{}, main {} workers, detail {:?}",
        config.load.total_messages,
        config.load.queue_capacity,
        config.warmup.workers,
        config.warmup.messages_per_worker,
        config.main.workers,
        config.output.detail
    );

    let output_dir = PathBuf::from(&config.output.dir);
    let detail = config.output.detail;
    let test = LoadTest::new(config, connector);

    let cancel = test.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, shutting down workers...");
            cancel.cancel();
        }
    });

    let started = Instant::now();
    let summary = match test.run().await {
        Ok(summary) => summary,
        Err(e) => {
            let metrics = test.metrics();
            print_phase_report(&metrics.report("Partial", started.elapsed()));
            if matches!(e, RunError::Cancelled) {
                warn!("Run cancelled before completion");
            } else {
                error!("Run failed: {}", e);
            }
            return Err(e).context("Load test did not complete");
        }
    };

    let timestamp = chrono::Utc::now().format("%Y%m%d_%H%M%S");
    if detail == MetricsDetail::Full {
        let metrics = test.metrics();
        export_latency(&metrics.records(), &output_dir.join(format!("latency_{timestamp}.csv")))?;
        export_throughput(
            &summary.throughput_over_time,
            &output_dir.join(format!("throughput_{timestamp}.csv")),
        )?;
    }

    let output_path = output_dir.join(format!("run_{timestamp}.json"));
    write_summary(&output_path, &summary)?;
    info!("Results written to {}", output_path.display());

    print_run_summary(&summary);
    Ok(())
}

fn load_config(args: &Args) -> Result<Config> {
    let mut config = if args.config.exists() {
        Config::from_file(&args.config).with_context(|| format!("Failed to load config from {:?}", args.config))?
    } else {
        warn!("Config {:?} not found, using built-in load profile", args.config);
        Config::default()
    };

    if let Some(url) = &args.url {
        config.target.url = url.clone();
    }
    if let Some(total) = args.total_messages {
        config.load.total_messages = total;
    }
    if let Some(workers) = args.main_workers {
        config.main.workers = workers;
    }
    if let Some(detail) = &args.detail {
        config.output.detail = match detail.as_str() {
            "summary" => MetricsDetail::Summary,
            "full" => MetricsDetail::Full,
            other => anyhow::bail!("Invalid detail: {}, must be 'summary' or 'full'", other),
        };
    }

    config.validate()?;
    Ok(config)
}

fn write_summary(path: &Path, summary: &chatload_core::RunSummary) -> Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).with_context(|| format!("Failed to create {:?}", dir))?;
    }
    let json = serde_json::to_string_pretty(summary)?;
    std::fs::write(path, json).with_context(|| format!("Failed to write {:?}", path))?;
    Ok(())
}
