use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing::info;

use vslam_bench::config::BenchmarkConfig;
use vslam_bench::context::BenchmarkContext;
use vslam_bench::events::{EventStream, RemoteEventBus, TcpBroker, TcpTransport};
use vslam_bench::experiment::recompute::{DEFAULT_PAGE_SIZE, confidence_curve};
use vslam_bench::experiment::{ExperimentManager, ExperimentOutcome, recompute_experiment};
use vslam_bench::frontend::DefaultProcessorFactory;
use vslam_bench::metrics::{MetricsCalculator, PrCurveCalculator, TrajectoryEvaluator};
use vslam_bench::storage::JsonStore;
use vslam_bench::tasks::{TaskStatus, WorkerPool};

#[derive(Parser)]
#[command(name = "vslam-bench")]
#[command(about = "Benchmark visual odometry feature/estimator combinations")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the experiment described by a config file.
    Run {
        /// YAML benchmark config.
        #[arg(long)]
        config: PathBuf,

        /// Store results in this directory instead of `storage.root`.
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Recompute metrics of a stored experiment from its frame results.
    Recompute {
        /// Result store directory.
        #[arg(long)]
        store: PathBuf,

        #[arg(long)]
        experiment: String,

        /// Trajectory settings for runs that have no stored metrics yet.
        #[arg(long)]
        config: Option<PathBuf>,

        #[arg(long, default_value_t = DEFAULT_PAGE_SIZE)]
        page_size: usize,
    },
    /// Run an event broker that fans events out to all connected clients.
    Broker {
        #[arg(long, default_value = "127.0.0.1:7878")]
        listen: String,
    },
    /// Print events from a broker as a server-sent-event stream.
    Watch {
        #[arg(long, default_value = "127.0.0.1:7878")]
        broker: String,

        #[arg(long, default_value_t = 15_000)]
        heartbeat_ms: u64,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config, output } => run(config, output),
        Commands::Recompute {
            store,
            experiment,
            config,
            page_size,
        } => recompute(store, &experiment, config, page_size),
        Commands::Broker { listen } => broker(&listen),
        Commands::Watch {
            broker,
            heartbeat_ms,
        } => watch(&broker, Duration::from_millis(heartbeat_ms)),
    }
}

fn run(config_path: PathBuf, output: Option<PathBuf>) -> Result<()> {
    let mut config = BenchmarkConfig::load(&config_path)?;
    if output.is_some() {
        config.storage.root = output;
    }

    let ctx = Arc::new(BenchmarkContext::from_config(config.clone())?);
    ctx.start_janitor()?;
    let factory = Arc::new(DefaultProcessorFactory::new(config.frontend.clone()));
    let manager = Arc::new(ExperimentManager::new(Arc::clone(&ctx), factory));
    let pool = WorkerPool::with_timeout(
        config.workers.threads,
        Arc::clone(ctx.registry()),
        config.workers.queue_timeout(),
    )?;

    let experiment = manager.create_experiment(config.experiment.clone());
    info!(
        experiment_id = %experiment.id,
        runs = experiment.runs.len(),
        "Submitting experiment"
    );
    let task_id = manager.submit_experiment(&pool, &experiment.id)?;

    let result = pool
        .results()
        .iter()
        .find(|r| r.task_id == task_id)
        .context("worker pool stopped before the experiment finished")?;
    pool.shutdown();
    ctx.stop_janitor();

    if result.status != TaskStatus::Completed {
        bail!(
            "experiment {} ended {}: {}",
            experiment.id,
            result.status,
            result.error.unwrap_or_default()
        );
    }
    let outcome: ExperimentOutcome = serde_json::from_value(
        result.result.context("experiment task returned no outcome")?,
    )?;

    let curves = PrCurveCalculator::default();
    for run in &outcome.runs {
        match &run.metrics {
            Some(m) => {
                let confidence = confidence_curve(
                    ctx.store().as_ref(),
                    &curves,
                    &run.run,
                    DEFAULT_PAGE_SIZE,
                )?;
                info!(
                    run = %run.run,
                    status = %run.status,
                    success_rate = m.success_rate,
                    fps = m.fps,
                    ate_rmse = m.trajectory.as_ref().map(|t| t.ate.rmse),
                    rpe_rmse = m.trajectory.as_ref().map(|t| t.rpe.rmse),
                    confidence_auc = confidence.auc,
                    confidence_threshold = confidence.optimal.threshold,
                    confidence_f1 = confidence.optimal.f1,
                    "Run summary"
                )
            }
            None => info!(
                run = %run.run,
                status = %run.status,
                error = run.error.as_deref().unwrap_or(""),
                "Run summary"
            ),
        }
    }
    println!("{}", serde_json::to_string_pretty(&outcome)?);
    Ok(())
}

fn recompute(
    store_root: PathBuf,
    experiment_id: &str,
    config_path: Option<PathBuf>,
    page_size: usize,
) -> Result<()> {
    let config = match config_path {
        Some(path) => BenchmarkConfig::load(path)?,
        None => BenchmarkConfig::default(),
    };
    if !store_root.is_dir() {
        bail!("store directory {:?} does not exist", store_root);
    }
    let store = JsonStore::open(&store_root)?;
    let calculator = MetricsCalculator::new(TrajectoryEvaluator::new(config.trajectory));
    let metrics = recompute_experiment(&store, &calculator, experiment_id, page_size)?;
    if metrics.is_empty() {
        bail!("no runs stored for experiment '{}'", experiment_id);
    }
    for m in &metrics {
        info!(
            run = %m.run,
            frames = m.total_frames,
            success_rate = m.success_rate,
            "Recomputed"
        );
    }
    Ok(())
}

fn broker(listen: &str) -> Result<()> {
    let broker = TcpBroker::bind(listen)?;
    info!(addr = %broker.local_addr(), "Event broker listening");
    let mut last_clients = usize::MAX;
    while broker.is_running() {
        let clients = broker.client_count();
        if clients != last_clients {
            info!(clients, "Broker clients changed");
            last_clients = clients;
        }
        thread::sleep(Duration::from_millis(500));
    }
    Ok(())
}

fn watch(addr: &str, heartbeat: Duration) -> Result<()> {
    let transport = TcpTransport::connect(addr)?;
    let bus = Arc::new(RemoteEventBus::new(Arc::new(transport), 1024)?);
    info!(broker = %addr, "Watching events");
    let stdout = std::io::stdout();
    for frame in EventStream::new(bus, heartbeat) {
        let mut out = stdout.lock();
        out.write_all(frame.to_sse().as_bytes())?;
        out.flush()?;
    }
    Ok(())
}
