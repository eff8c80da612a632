use anyhow::{Context, Result};
use clap::Parser;
use phasebench_core::{
    parse_codes, print_summary, server, split_list, Categorizer, Config, HttpProbeFactory,
    MetricsStore, MockProbe, PhasePlan, PhaseState, ProbeFactory, Scheduler,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "phasebench")]
#[command(about = "Loads each target in turn and serves live per-status counts")]
struct Args {
    /// Path to a TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Comma-separated target URLs, loaded one phase each in this order
    #[arg(long, env = "TARGET_URLS")]
    targets: Option<String>,

    /// Concurrent workers per phase
    #[arg(long, env = "THREADS")]
    workers: Option<u32>,

    /// Phase length in seconds
    #[arg(long, env = "DURATION")]
    duration: Option<u64>,

    /// Comma-separated status codes counted individually
    #[arg(long, env = "TRACK_CODES")]
    track_codes: Option<String>,

    /// Per-request timeout in milliseconds
    #[arg(long, env = "REQUEST_TIMEOUT_MS")]
    request_timeout_ms: Option<u64>,

    /// Give up waiting for a stopped phase after this many milliseconds
    #[arg(long, env = "DRAIN_TIMEOUT_MS")]
    drain_timeout_ms: Option<u64>,

    /// Address for the report endpoint
    #[arg(long, env = "BIND_ADDR")]
    bind: Option<String>,

    /// Request mode: http or mock
    #[arg(long, default_value = "http")]
    mode: String,

    /// Log progress every N milliseconds while phases run
    #[arg(long, default_value = "1000")]
    print_every_ms: u64,

    /// Exit after the last phase and print the final report as JSON
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = load_config(&args)?;
    config.validate().context("Invalid configuration")?;

    info!("Targets: {}", config.load.targets.join(", "));
    info!(
        "Workers: {}, phase: {}s, request timeout: {}ms",
        config.load.workers, config.load.duration_secs, config.load.request_timeout_ms
    );
    info!("Tracked codes: {:?}", config.load.track_codes);

    let probes: Arc<dyn ProbeFactory> = match args.mode.as_str() {
        "http" => Arc::new(HttpProbeFactory::new(config.load.request_timeout())),
        "mock" => Arc::new(MockProbe::new(5)), // 5ms simulated latency
        _ => anyhow::bail!("Invalid mode: {}, must be 'http' or 'mock'", args.mode),
    };

    let store = Arc::new(MetricsStore::new(Categorizer::new(
        config.load.track_codes.clone(),
    )));

    let listener = server::bind(&config.server.bind_addr).await?;
    let server_handle = tokio::spawn(server::serve(
        listener,
        Arc::clone(&store),
        shutdown_signal(),
    ));

    let progress_handle = tokio::spawn(print_progress(
        Arc::clone(&store),
        Duration::from_millis(args.print_every_ms.max(1)),
    ));

    let plan = PhasePlan::from(&config.load);
    info!("Total planned duration: {}s", plan.total_duration().as_secs());
    let outcome = Scheduler::new(Arc::clone(&store), plan, probes).run().await;
    progress_handle.abort();

    let report = store.snapshot();
    match &outcome {
        Ok(()) => print_summary(&report),
        Err(e) => error!("Run stopped early: {:#}", e),
    }

    if args.once {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return outcome;
    }

    info!("Run finished; still serving the final report until Ctrl-C");
    exit_result(outcome, server_handle.await?)
}

/// A failed run still fails the process after the endpoint shuts down cleanly.
fn exit_result(run: Result<()>, served: Result<()>) -> Result<()> {
    served?;
    run
}

fn load_config(args: &Args) -> Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("Failed to load config from {:?}", path))?,
        None => Config::default(),
    };

    if let Some(targets) = &args.targets {
        config.load.targets = split_list(targets);
    }
    if let Some(workers) = args.workers {
        config.load.workers = workers;
    }
    if let Some(duration) = args.duration {
        config.load.duration_secs = duration;
    }
    if let Some(codes) = &args.track_codes {
        config.load.track_codes = parse_codes(codes).context("Invalid TRACK_CODES")?;
    }
    if let Some(timeout) = args.request_timeout_ms {
        config.load.request_timeout_ms = timeout;
    }
    if let Some(timeout) = args.drain_timeout_ms {
        config.load.drain_timeout_ms = timeout;
    }
    if let Some(bind) = &args.bind {
        config.server.bind_addr = bind.clone();
    }

    Ok(config)
}

async fn print_progress(store: Arc<MetricsStore>, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let phase = store.phase();
        if phase == PhaseState::Done {
            return;
        }

        let report = store.snapshot();
        let Some(site) = report
            .current_site
            .as_deref()
            .and_then(|target| report.site(target))
        else {
            continue;
        };
        let elapsed_s = (report.timestamp - site.start_time).num_seconds();
        let rps = if elapsed_s > 0 {
            site.metrics.total() / elapsed_s as u64
        } else {
            0
        };
        let counts: Vec<String> = site
            .metrics
            .iter()
            .filter(|(_, count)| *count > 0)
            .map(|(label, count)| format!("{label}={count}"))
            .collect();

        info!(
            "Progress: {} requests={} rps={} [{}] total={}",
            phase,
            site.metrics.total(),
            rps,
            counts.join(" "),
            report.total_requests()
        );
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutting down");
}
