//! history-replay: play a recorded history file back in virtual time.
//!
//! Prints every published update as one JSON line on stdout: first the value
//! of each stream at the start time, then each later record as the playback
//! clock reaches it.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use histplay_core::config::load_dotenv;
use histplay_core::{format_virtual_time, Config, PublishedUpdate};
use histplay_playback::{
    InMemoryHistoryStore, PublishError, PublishSink, ReplayCoordinator, SimulatedPlayback,
};

// ── CLI ─────────────────────────────────────────────────────────────

/// Replay recorded tag history at an adjustable speed.
#[derive(Parser, Debug)]
#[command(name = "history-replay", version, about)]
struct Cli {
    /// JSON file holding an array of history records.
    #[arg(long)]
    records: PathBuf,

    /// Virtual start time in epoch milliseconds. Defaults to the earliest record.
    #[arg(long)]
    start: Option<i64>,

    /// Virtual milliseconds per real millisecond.
    #[arg(long, default_value_t = 1.0)]
    speed: f64,

    /// TOML config file. Without it, settings come from the environment.
    #[arg(long, env = "HISTPLAY_CONFIG")]
    config: Option<PathBuf>,

    /// Real milliseconds to play for. Defaults to the time needed to reach the last record.
    #[arg(long)]
    duration_ms: Option<u64>,
}

// ── Sink ────────────────────────────────────────────────────────────

/// Writes each update as a JSON line to stdout.
struct JsonLinesSink {
    out: std::io::Stdout,
}

impl PublishSink for JsonLinesSink {
    fn publish(&self, update: PublishedUpdate) -> Result<(), PublishError> {
        let line = serde_json::to_string(&update)?;
        let mut out = self.out.lock();
        writeln!(out, "{line}")?;
        out.flush()?;
        Ok(())
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    load_dotenv();
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => Config::from_env().context("invalid config in environment")?,
    };
    config.log_summary();

    let store = Arc::new(
        InMemoryHistoryStore::from_json_file(&cli.records)
            .with_context(|| format!("failed to load records from {}", cli.records.display()))?,
    );
    let (first, last) = store.time_range().unwrap_or((0, 0));
    let start = cli.start.unwrap_or(first);

    let playback = Arc::new(SimulatedPlayback::new(start, cli.speed));
    let sink = Arc::new(JsonLinesSink {
        out: std::io::stdout(),
    });
    let coordinator = ReplayCoordinator::attach(playback.clone(), store, sink, &config);

    info!(
        start = %format_virtual_time(start),
        end = %format_virtual_time(last),
        speed = playback.clock().speed(),
        "starting replay"
    );
    playback.seek(start);
    playback.play();

    let duration = cli.duration_ms.map(Duration::from_millis).unwrap_or_else(|| {
        let remaining = (last - start).max(0) as f64 / playback.clock().speed();
        Duration::from_millis(remaining as u64 + 500)
    });
    thread::sleep(duration);

    playback.stop();
    if let Some(metrics) = coordinator.timer_metrics() {
        info!(
            fired = metrics.tasks_fired,
            failed = metrics.callback_failures,
            behind_episodes = metrics.behind_schedule_episodes,
            max_lag_ms = metrics.max_lag_ms,
            drift_pauses = coordinator.drift_guard().pause_count(),
            "replay finished"
        );
    }
    coordinator.cancel_all_scheduled_events();
    Ok(())
}
