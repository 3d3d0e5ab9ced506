use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use clap::Parser;
use rand::SeedableRng;
use rand::rngs::StdRng;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crossword_loadgen::aggregator::{Aggregator, CompletionRecord, ResultsConfig};
use crossword_loadgen::client::{build_client, ClientConfig, Dispatcher};
use crossword_loadgen::config::{CliOverrides, Config, LoadSource, RandomUserMode};
use crossword_loadgen::connection_pool::PoolConfig;
use crossword_loadgen::journey::JourneyExecutor;
use crossword_loadgen::memory_guard::{self, MemoryGuardConfig};
use crossword_loadgen::metrics;
use crossword_loadgen::scheduler::{schedule_at, CompletionLatch, ReplaySource, WaveSource};
use crossword_loadgen::session::SessionStore;
use crossword_loadgen::trace::{cumulative_dispatch_offsets, parse_trace_file, peak_bucket_count, replay_pool_size};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// Command-line surface for the crossword load-generation and
/// traffic-replay engine. Every flag overrides its environment-variable
/// equivalent in `Config::load`.
#[derive(Parser, Debug)]
#[command(name = "crossword_loadgen", about = "Load generator and traffic replayer for a crossword puzzle service")]
struct Cli {
    /// Requests per second to launch in wave mode.
    #[arg(long)]
    rps: Option<usize>,

    /// Wave mode duration in seconds.
    #[arg(long)]
    duration: Option<u64>,

    /// Override the worker-pool size instead of the recommended default.
    #[arg(long)]
    parallel: Option<usize>,

    /// Fixed virtual-user identifier for every journey.
    #[arg(long)]
    uid: Option<String>,

    /// Generate a fresh random uid for every journey.
    #[arg(long)]
    random_uid: bool,

    /// Draw uids uniformly from a pre-generated pool of this size.
    #[arg(long)]
    uid_pool_size: Option<usize>,

    /// Title recorded in the results document.
    #[arg(long)]
    title: Option<String>,

    /// Path to write the results document to (stdout if omitted).
    #[arg(long)]
    output: Option<std::path::PathBuf>,

    /// Replay a recorded JSONL trace instead of generating a synthetic wave.
    #[arg(long)]
    replay: Option<std::path::PathBuf>,

    /// Replay speed factor; 2.0 replays twice as fast as recorded.
    #[arg(long)]
    speed: Option<f64>,

    /// Validate configuration and the trace file (if any), then exit.
    #[arg(long)]
    dry_run: bool,

    /// Save derived sessions to this file when the run completes.
    #[arg(long)]
    save_sessions: Option<std::path::PathBuf>,

    /// Pre-warm the session store from a previously saved file.
    #[arg(long)]
    load_sessions: Option<std::path::PathBuf>,

    /// Emit an HTML summary alongside the JSON results document.
    #[arg(long)]
    html: bool,

    /// Increase logging verbosity; repeatable.
    #[arg(short = 'v', action = clap::ArgAction::Count)]
    verbosity: u8,
}

impl From<Cli> for CliOverrides {
    fn from(cli: Cli) -> Self {
        CliOverrides {
            rps: cli.rps,
            duration: cli.duration,
            parallel: cli.parallel,
            uid: cli.uid,
            random_uid: cli.random_uid,
            uid_pool_size: cli.uid_pool_size,
            title: cli.title,
            output: cli.output,
            replay: cli.replay,
            speed: cli.speed,
            dry_run: cli.dry_run,
            save_sessions: cli.save_sessions,
            load_sessions: cli.load_sessions,
            html: cli.html,
            verbosity: cli.verbosity,
        }
    }
}

fn init_tracing(verbosity: u8) {
    let default_level = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).json().init();
}

fn now_ms() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
}

fn pick_uid(config: &Config, rng: &mut impl rand::Rng, pool: &[String]) -> String {
    match &config.random_user_mode {
        RandomUserMode::Off => config.uid.clone().unwrap_or_default(),
        RandomUserMode::PerRequest => format!("loadgen-{:016x}", rng.gen::<u64>()),
        RandomUserMode::Pool(n) => {
            let idx = rng.gen_range(0..(*n).max(1));
            pool.get(idx).cloned().unwrap_or_else(|| format!("pool-{}", idx))
        }
    }
}

fn uid_pool(config: &Config) -> Vec<String> {
    match config.random_user_mode {
        RandomUserMode::Pool(n) => (0..n).map(|i| format!("pool-{}", i)).collect(),
        _ => Vec::new(),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let cli = Cli::parse();
    init_tracing(cli.verbosity);

    let overrides: CliOverrides = cli.into();
    let config = match Config::load(&overrides) {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "configuration invalid");
            std::process::exit(2);
        }
    };

    metrics::register_metrics()?;
    memory_guard::init_percentile_tracking_flag(true);
    tokio::spawn(memory_guard::spawn_memory_guard(MemoryGuardConfig::default()));

    if let Some(port) = config.metrics_port {
        let registry = Arc::new(std::sync::Mutex::new(prometheus::default_registry().clone()));
        tokio::spawn(metrics::start_metrics_server(port, registry));
    }

    let pool_config = PoolConfig::new().with_max_idle_per_host(config.max_per_host);
    let client_config = ClientConfig {
        skip_tls_verify: config.skip_tls_verify,
        resolve_target_addr: config.resolve_target_addr.clone(),
        client_cert_path: config.client_cert_path.clone(),
        client_key_path: config.client_key_path.clone(),
        custom_headers: config.custom_headers.clone(),
        pool_config: Some(pool_config),
        request_timeout: config.request_timeout,
        max_concurrent_requests: config.max_concurrent_requests,
        max_per_host: config.max_per_host,
    };
    let build_result = build_client(&client_config)?;
    let dispatcher = Dispatcher::new(build_result.client, config.max_concurrent_requests, config.max_per_host);
    let sessions = Arc::new(SessionStore::new(dispatcher.clone(), config.target_url.clone()));

    if let Some(load_path) = &config.load_sessions {
        if sessions.load_from_file(load_path, &config.puzzle_id).await {
            info!(path = %load_path.display(), "pre-warmed sessions from cache file");
        } else {
            warn!(path = %load_path.display(), "no session cache file found, starting empty");
        }
    }

    let executor = Arc::new(JourneyExecutor::new(
        dispatcher,
        sessions.clone(),
        config.target_url.clone(),
        config.series.clone(),
        config.puzzle_id.clone(),
        config.state_len,
        config.journey_variant,
    ));

    let result = match &config.source {
        LoadSource::Wave { rps, duration_secs } => {
            run_wave(&config, executor.clone(), *rps, *duration_secs).await
        }
        LoadSource::Replay { file, speed } => {
            run_replay(&config, executor.clone(), file, *speed).await
        }
    };

    let (aggregator, total_time_ms) = match result {
        Ok(run) => run,
        Err(e) => {
            error!(error = %e, "run failed before completion");
            std::process::exit(1);
        }
    };

    if let Some(save_path) = &config.save_sessions {
        if let Err(e) = sessions.save_to_file(save_path).await {
            warn!(error = %e, path = %save_path.display(), "failed to save session cache");
        }
    }

    let (rps, duration, true_rps) = match &config.source {
        LoadSource::Wave { rps, duration_secs } => (*rps, *duration_secs, true),
        LoadSource::Replay { .. } => (0, 0, false),
    };

    let results_config = ResultsConfig {
        rps,
        duration,
        puzzle_id: config.puzzle_id.clone(),
        state_len: config.state_len,
        true_rps,
    };

    let document = aggregator.finalize(config.title.clone(), results_config, total_time_ms, now_ms());
    let json = serde_json::to_string_pretty(&document)?;

    match &config.output {
        Some(path) => std::fs::write(path, &json)?,
        None => println!("{}", json),
    }

    if config.emit_html {
        if let Some(path) = &config.output {
            let html_path = path.with_extension("html");
            std::fs::write(&html_path, render_html_summary(&document))?;
        }
    }

    let overall = crossword_loadgen::aggregator::overall_stats(&document.results);
    info!(
        success_count = overall.success_count,
        failure_count = overall.failure_count,
        success_rate_pct = overall.success_rate_pct,
        p95_latency_ms = overall.p95_latency_ms,
        "run complete"
    );

    if overall.failure_count > 0 && overall.success_count == 0 {
        std::process::exit(1);
    }

    Ok(())
}

async fn run_wave(
    config: &Config,
    executor: Arc<JourneyExecutor>,
    rps: usize,
    duration_secs: u64,
) -> Result<(Aggregator, u64), Box<dyn std::error::Error + Send + Sync>> {
    let wave = WaveSource { rps, duration_secs };
    let pool_size = config.parallel_override.unwrap_or_else(|| wave.recommended_pool_size());
    let worker_pool = Arc::new(Semaphore::new(pool_size));
    let aggregator = Arc::new(Aggregator::new());
    let total = wave.total_journeys();
    let latch = CompletionLatch::new(total);

    let uid_pool = Arc::new(uid_pool(config));
    let config = Arc::new(config.clone());

    if config.dry_run {
        info!(rps, duration_secs, pool_size, "dry run: wave configuration validated");
        return Ok((Arc::try_unwrap(aggregator).unwrap_or_else(|_| Aggregator::new()), 0));
    }

    let t0 = Instant::now();
    for w in 1..=duration_secs {
        for thread in 0..rps {
            let fire_at = wave.wave_fire_time(t0, w);
            let executor = executor.clone();
            let aggregator = aggregator.clone();
            let latch = latch.clone();
            let config = config.clone();
            let uid_pool = uid_pool.clone();

            schedule_at(fire_at, worker_pool.clone(), async move {
                let mut rng = StdRng::from_entropy();
                let uid = pick_uid(&config, &mut rng, &uid_pool);
                let launch = now_ms();
                let journey = executor.run(&uid, &mut rng).await;
                let completion = now_ms();

                aggregator.push(CompletionRecord {
                    wave: w,
                    thread,
                    launch_wall_clock_ms: launch,
                    completion_wall_clock_ms: completion,
                    journey: Some(journey),
                    crashed: false,
                    crash_error: None,
                });
                latch.count_down();
            })
            .await;
        }
    }

    let margin_secs = (duration_secs + 120).max(2 * config.request_timeout.as_secs());
    let safety_margin = tokio::time::Duration::from_secs(margin_secs);
    if !latch.await_completion(safety_margin).await {
        warn!("wave did not drain within the safety margin; results reflect partial completion");
    }

    let total_time_ms = t0.elapsed().as_millis() as u64;
    Ok((Arc::try_unwrap(aggregator).unwrap_or_else(|_| Aggregator::new()), total_time_ms))
}

async fn run_replay(
    config: &Config,
    executor: Arc<JourneyExecutor>,
    file: &std::path::Path,
    speed: f64,
) -> Result<(Aggregator, u64), Box<dyn std::error::Error + Send + Sync>> {
    let events = parse_trace_file(file)?;
    let offsets = cumulative_dispatch_offsets(&events, speed);
    let peak = peak_bucket_count(&offsets);
    let pool_size = config
        .parallel_override
        .unwrap_or_else(|| replay_pool_size(peak, 5, 500));

    info!(events = events.len(), peak_concurrency = peak, pool_size, "replay configuration resolved");

    if config.dry_run {
        return Ok((Aggregator::new(), 0));
    }

    let source = ReplaySource { offsets_ms: offsets };
    let worker_pool = Arc::new(Semaphore::new(pool_size));
    let aggregator = Arc::new(Aggregator::new());
    let latch = CompletionLatch::new(source.len());

    let uid_pool = Arc::new(uid_pool(config));
    let config = Arc::new(config.clone());
    let t0 = Instant::now();

    for (index, event) in events.into_iter().enumerate() {
        let fire_at = source.dispatch_time(t0, index);
        let executor = executor.clone();
        let aggregator = aggregator.clone();
        let latch = latch.clone();
        let config = config.clone();
        let uid_pool = uid_pool.clone();

        schedule_at(fire_at, worker_pool.clone(), async move {
            let mut rng = StdRng::from_entropy();
            let uid = event.user_id.unwrap_or_else(|| pick_uid(&config, &mut rng, &uid_pool));
            let launch = now_ms();
            let journey = executor.run(&uid, &mut rng).await;
            let completion = now_ms();

            aggregator.push(CompletionRecord {
                wave: event.index as u64,
                thread: index,
                launch_wall_clock_ms: launch,
                completion_wall_clock_ms: completion,
                journey: Some(journey),
                crashed: false,
                crash_error: None,
            });
            latch.count_down();
        })
        .await;
    }

    let margin_secs = (source.len() as u64 / 10).max(2 * config.request_timeout.as_secs());
    let safety_margin = tokio::time::Duration::from_secs(margin_secs);
    if !latch.await_completion(safety_margin).await {
        warn!("replay did not drain within the safety margin; results reflect partial completion");
    }

    let total_time_ms = t0.elapsed().as_millis() as u64;
    Ok((Arc::try_unwrap(aggregator).unwrap_or_else(|_| Aggregator::new()), total_time_ms))
}

fn render_html_summary(document: &crossword_loadgen::aggregator::ResultsDocument) -> String {
    format!(
        "<html><head><title>{title}</title></head><body><h1>{title}</h1><p>waves: {waves}, total records: {records}, total time: {total_ms}ms</p></body></html>",
        title = document.title,
        waves = document.waves.len(),
        records = document.results.len(),
        total_ms = document.total_time_ms,
    )
}
