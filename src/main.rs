//! sigtap - Main Entry Point
//!
//! Runs the acquisition worker against the simulated engine, installs a
//! graph description and prints the replies of the given subscriptions as
//! JSON lines on stdout.

use anyhow::Context;
use clap::Parser;
use sigtap::{
    config::{default_config_path, AcqConfig},
    AcquisitionWorker, FlowGraphService, LocalBroker, SignalEntry, SimEngine, SinkRegistry,
};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Poll interval of the reply printer
const PRINT_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Parser, Debug)]
#[command(name = "sigtap", version, about = "Acquisition worker with demand-driven signal taps")]
struct Cli {
    /// Configuration file (defaults to the platform config directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Flow graph description (TOML)
    #[arg(short, long)]
    graph: PathBuf,

    /// Subscription query, e.g. "acquisitionModeFilter=continuous&channelNameFilter=A"
    #[arg(short, long = "subscribe")]
    subscriptions: Vec<String>,

    /// Stop after this many seconds (runs until stdin closes otherwise)
    #[arg(short, long)]
    duration_secs: Option<u64>,
}

fn init_logging(config: &AcqConfig) -> Option<WorkerGuard> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.filter));
    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr));

    match &config.logging.directory {
        Some(directory) => {
            let appender = tracing_appender::rolling::daily(directory, "sigtap.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(writer),
                )
                .init();
            Some(guard)
        }
        None => {
            registry.init();
            None
        }
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match cli.config.clone().or_else(default_config_path) {
        Some(path) if path.exists() => AcqConfig::load(&path)
            .with_context(|| format!("Failed to load config from {:?}", path))?,
        _ => AcqConfig::default(),
    };

    // Keep the guard alive so buffered log lines are flushed on exit
    let _log_guard = init_logging(&config);
    tracing::info!("Starting sigtap");

    let registry = SinkRegistry::new(config.taps.clone());
    let broker = LocalBroker::new(&config.broker);
    let engine = SimEngine::new(registry.clone(), config.simulation.clone())
        .with_default_sample_rate(config.taps.default_sample_rate);

    let worker = AcquisitionWorker::builder(config.worker.clone())
        .registry(Arc::new(registry))
        .engine(Arc::new(engine))
        .broker(broker.clone())
        .signal_observer(|entries: &[SignalEntry]| {
            if entries.is_empty() {
                tracing::info!("Signal list cleared");
            }
            for entry in entries {
                tracing::info!(
                    "Signal '{}' [{}] at {} Hz",
                    entry.name,
                    entry.unit,
                    entry.sample_rate
                );
            }
        })
        .spawn()
        .context("Failed to start acquisition worker")?;

    let flowgraph = FlowGraphService::new(worker);
    flowgraph
        .load_file(&cli.graph)
        .with_context(|| format!("Failed to install graph {:?}", cli.graph))?;

    let subscriptions = cli
        .subscriptions
        .iter()
        .map(|query| {
            broker
                .subscribe_query(query)
                .with_context(|| format!("Invalid subscription '{}'", query))
        })
        .collect::<anyhow::Result<Vec<_>>>()?;

    // End of input stops the service when no duration is given
    let (eof_tx, eof_rx) = crossbeam_channel::bounded::<()>(1);
    if cli.duration_secs.is_none() {
        std::thread::spawn(move || {
            let _ = std::io::stdin().read_line(&mut String::new());
            let _ = eof_tx.send(());
        });
    }

    let deadline = cli
        .duration_secs
        .map(|secs| Instant::now() + Duration::from_secs(secs));
    let stdout = std::io::stdout();
    loop {
        for subscription in &subscriptions {
            for reply in subscription.drain() {
                let line = serde_json::to_string(&reply)?;
                writeln!(stdout.lock(), "{}", line)?;
            }
        }

        if deadline.is_some_and(|d| Instant::now() >= d) || eof_rx.try_recv().is_ok() {
            break;
        }
        std::thread::sleep(PRINT_INTERVAL);
    }

    tracing::info!("Shutting down...");
    let stats = flowgraph.sink().stats();
    drop(subscriptions);
    flowgraph.sink().shutdown();
    tracing::info!(
        "Worker ran {} cycles and sent {} replies ({} dropped by the broker)",
        stats.cycles,
        stats.replies,
        broker.stats().dropped
    );
    Ok(())
}
