use anyhow::Context;
use chrono::{DateTime, Duration, Utc};
use clap::Parser;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

use floe::store::local::LocalChunkStore;
use floe::{
    cancel_pair, CycleReport, LogicalStream, StreamConfig, StreamError, StreamingSession,
    SyntheticSource,
};

#[derive(Parser, Debug)]
#[command(name = "floe", version, about = "Resumable streaming appender for instrument time series")]
struct Cli {
    /// Root directory of the chunked store.
    #[arg(long, env = "FLOE_STORE")]
    store: PathBuf,

    /// Instrument identifier (first path segment).
    #[arg(long, env = "FLOE_INSTRUMENT")]
    instrument: String,

    /// Project identifier (second path segment).
    #[arg(long, env = "FLOE_PROJECT")]
    project: String,

    /// TOML configuration file; defaults apply when omitted.
    #[arg(long, env = "FLOE_CONFIG")]
    config: Option<PathBuf>,

    /// Forward-only lower bound (RFC 3339). Never rewinds committed data.
    #[arg(long, value_parser = parse_instant)]
    since_hint: Option<DateTime<Utc>>,

    /// Upper bound (RFC 3339) for this run.
    #[arg(long, value_parser = parse_instant)]
    until_hint: Option<DateTime<Utc>>,

    /// Campaign start for the built-in synthetic source (RFC 3339).
    /// Defaults to one hour ago.
    #[arg(long, value_parser = parse_instant)]
    synthetic_start: Option<DateTime<Utc>>,

    /// Run exactly one cycle and exit.
    #[arg(long)]
    once: bool,

    /// Emit one JSON line per cycle on stdout.
    #[arg(long)]
    json: bool,
}

fn parse_instant(s: &str) -> std::result::Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| format!("invalid RFC 3339 instant: {e}"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => StreamConfig::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => StreamConfig::default(),
    };

    let stream = LogicalStream {
        instrument: cli.instrument.clone(),
        project: cli.project.clone(),
        gas_id: config.gas_id.clone(),
        gas_version: config.gas_version.clone(),
    };

    let store = LocalChunkStore::new(&cli.store);
    let start = cli
        .synthetic_start
        .unwrap_or_else(|| Utc::now() - Duration::hours(1));
    let mut source = SyntheticSource::new(stream.clone(), start);
    if let Some(until) = cli.until_hint {
        source = source.with_end(until);
    }

    let (handle, mut token) = cancel_pair();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received; finishing the in-flight commit, then exiting");
            handle.cancel();
        }
    });

    let json = cli.json;
    let mut on_cycle = move |report: &CycleReport| {
        if json {
            match serde_json::to_string(report) {
                Ok(line) => println!("{line}"),
                Err(e) => tracing::error!(error = %e, "failed to serialize cycle report"),
            }
        }
    };

    let mut session = StreamingSession::new(&store, &source, &config, &stream);

    if cli.once {
        match session
            .run_cycle(cli.since_hint, cli.until_hint, Utc::now(), &mut token)
            .await
        {
            Ok(report) => {
                on_cycle(&report);
                if report.degraded {
                    anyhow::bail!("cycle finished degraded");
                }
            }
            Err(StreamError::Cancelled) => info!("cancelled before completion"),
            Err(e) => return Err(e).context("streaming cycle failed"),
        }
        return Ok(());
    }

    match session
        .run_until_caught_up(cli.since_hint, cli.until_hint, &mut token, &mut on_cycle)
        .await
    {
        Ok(summary) => {
            if json {
                println!("{}", serde_json::to_string(&summary)?);
            }
            if summary.degraded_cycles > 0 {
                anyhow::bail!("{} degraded cycle(s)", summary.degraded_cycles);
            }
            Ok(())
        }
        Err(StreamError::Cancelled) => {
            info!("cancelled before catching up");
            Ok(())
        }
        Err(e) => Err(e).context("streaming session failed"),
    }
}
