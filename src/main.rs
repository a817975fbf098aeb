use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio::sync::mpsc;
use tracing::{info, warn};

use sayl::config::{load_config, Config};
use sayl::engine::Engine;
use sayl::report::{write_json_report, Report};

/// Declarative HTTP load generator.
#[derive(Debug, Parser)]
#[command(name = "sayl", version, about)]
struct Args {
    /// Path to the YAML scenario file.
    #[arg(short = 'f', long = "config")]
    config: Option<PathBuf>,

    /// Target URL (overrides the file).
    #[arg(long)]
    url: Option<String>,

    /// HTTP method (overrides the file).
    #[arg(long)]
    method: Option<String>,

    /// Requests per second (overrides the file).
    #[arg(long)]
    rate: Option<u32>,

    /// Test duration, e.g. 30s or 1m (overrides the file).
    #[arg(long)]
    duration: Option<String>,

    /// Number of concurrent workers (overrides the file).
    #[arg(long)]
    concurrency: Option<usize>,

    /// Comma-separated success status codes, e.g. 200,201.
    #[arg(long)]
    success: Option<String>,

    /// Skip the pre-run connectivity check.
    #[arg(long)]
    no_preflight: bool,

    /// Where to write the JSON report.
    #[arg(long, default_value = "report.json")]
    output: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sayl=info".into()),
        )
        .with_target(false)
        .init();

    let args = Args::parse();
    let cfg = build_config(&args)?;

    let engine = Engine::new();
    if !args.no_preflight {
        let target = if cfg.steps.is_empty() {
            cfg.url.clone()
        } else {
            cfg.steps[0].url.clone()
        };
        // Templated URLs cannot be probed verbatim; skip those.
        if !target.contains("{{") {
            if let Err(e) = engine.preflight(&target, Duration::from_secs(10)).await {
                warn!(error = %e, "preflight check failed, starting anyway");
            }
        }
    }

    // Live snapshots for progress logging, throttled to roughly one per
    // second.
    let (sink_tx, mut sink_rx) = mpsc::channel::<Report>(16);
    let progress = tokio::spawn(async move {
        let mut last_logged = std::time::Instant::now();
        while let Some(snapshot) = sink_rx.recv().await {
            if last_logged.elapsed() >= Duration::from_secs(1) {
                last_logged = std::time::Instant::now();
                info!(
                    requests = snapshot.total_requests,
                    rps = (snapshot.rps * 10.0).round() / 10.0,
                    p99_ms = (snapshot.p99.as_secs_f64() * 10_000.0).round() / 10.0,
                    failures = snapshot.failure_count,
                    "progress"
                );
            }
        }
    });

    let report = tokio::select! {
        report = engine.run(cfg, Some(sink_tx)) => report.context("load test failed")?,
        _ = tokio::signal::ctrl_c() => {
            warn!("interrupted");
            std::process::exit(130);
        }
    };
    let _ = progress.await;

    print!("{}", report.render_summary());
    write_json_report(&args.output, &report)
        .with_context(|| format!("failed to write {}", args.output.display()))?;
    info!(path = %args.output.display(), "report written");
    Ok(())
}

/// Merge the scenario file with command-line overrides, flag over file.
fn build_config(args: &Args) -> Result<Config> {
    let mut cfg = match &args.config {
        Some(path) => load_config(path)
            .with_context(|| format!("error loading config file {}", path.display()))?,
        None => Config::default(),
    };

    if let Some(url) = &args.url {
        cfg.url = url.clone();
    }
    if let Some(method) = &args.method {
        cfg.method = method.clone();
    }
    if let Some(rate) = args.rate {
        cfg.rate = rate;
    }
    if let Some(duration) = &args.duration {
        cfg.duration = humantime::parse_duration(duration)
            .with_context(|| format!("invalid duration flag '{duration}'"))?;
    }
    if let Some(concurrency) = args.concurrency {
        cfg.concurrency = concurrency;
    }
    if let Some(success) = &args.success {
        let codes: HashSet<u16> = success
            .split(',')
            .filter_map(|part| part.trim().parse().ok())
            .collect();
        if codes.is_empty() {
            bail!("invalid --success list '{success}'");
        }
        cfg.success_codes = codes;
    }

    cfg.validate().context("configuration error")?;
    Ok(cfg)
}
