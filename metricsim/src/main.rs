#![cfg_attr(
    not(test),
    warn(clippy::print_stdout, clippy::dbg_macro),
    deny(clippy::unwrap_used, clippy::expect_used)
)]

use std::{path::PathBuf, sync::Arc, time::Duration};

use rama::{
    error::{BoxError, ErrorContext},
    graceful::{self, ShutdownGuard},
    net::socket::Interface,
    telemetry::tracing::{self, Instrument as _},
};

use clap::{Parser, ValueEnum};

use metricsim_lib::{
    control::ControlService,
    instance::InstanceDefaults,
    metrics::{MetricsSink, SummaryConfig},
    simulation::{self, SimulationConfig, SimulationMode, SimulationState, Simulator, Tunables},
    utils,
};

pub mod server;

#[cfg(target_family = "unix")]
#[global_allocator]
static ALLOC: jemallocator::Jemalloc = jemallocator::Jemalloc;

#[cfg(target_os = "windows")]
#[global_allocator]
static ALLOC: mimalloc::MiMalloc = mimalloc::MiMalloc;


/// CLI arguments for configuring the simulation and its control surface.
#[derive(Debug, Clone, Parser)]
#[command(name = "metricsim")]
#[command(bin_name = "metricsim")]
#[command(version, about, long_about = None)]
pub struct Args {
    /// network interface to bind the control (and metrics) http server to
    #[arg(
        long,
        short = 'b',
        value_name = "INTERFACE",
        default_value = "127.0.0.1:8080"
    )]
    pub bind: Interface,

    /// time between two simulation ticks
    #[arg(long, value_name = "DURATION", value_parser = humantime::parse_duration, default_value = "1s")]
    pub interval: Duration,

    /// amount of instances registered at startup (named A, B, C, ...)
    #[arg(long, value_name = "N", default_value_t = 1)]
    pub instance_count: usize,

    /// simulated requests per second, scaled to the tick interval and split evenly over all instances
    #[arg(long, value_name = "N", default_value_t = 100)]
    pub request_rate: u32,

    /// initial global error percentage
    #[arg(long, value_name = "PCT", default_value_t = 1, allow_negative_numbers = true)]
    pub error_pct: i64,

    /// default minimum latency of new instances
    #[arg(long, value_name = "MILLIS", default_value_t = 100, allow_negative_numbers = true)]
    pub latency_min_ms: i64,

    /// default random latency range on top of the minimum
    #[arg(long, value_name = "MILLIS", default_value_t = 300, allow_negative_numbers = true)]
    pub latency_max_ms: i64,

    /// initial global latency offset
    #[arg(long, value_name = "MILLIS", default_value_t = 0, allow_negative_numbers = true)]
    pub latency_offset_ms: i64,

    /// simulate the registered instances or a single global one
    #[arg(long, value_enum, default_value_t = Mode::Instances)]
    pub mode: Mode,

    /// age after which observations no longer count towards the quantiles (0 = forever)
    #[arg(long, value_name = "DURATION", value_parser = humantime::parse_duration, default_value = "10m")]
    pub summary_max_age: Duration,

    /// amount of buckets the quantile window rotates through
    #[arg(long, value_name = "N", default_value_t = 5)]
    pub summary_age_buckets: u32,

    /// debug logging as default instead of Info; use RUST_LOG env for more options
    #[arg(long, short = 'v', default_value_t = false)]
    pub verbose: bool,

    /// enable pretty logging (format for humans)
    #[arg(long, default_value_t = false)]
    pub pretty: bool,

    /// directory to write the bound control address to (as `control.addr.txt`)
    #[arg(long, short = 'D')]
    pub data: Option<PathBuf>,

    /// write the tracing output to the provided (log) file instead of stderr
    #[arg(long, short = 'o')]
    pub output: Option<PathBuf>,

    #[arg(long, value_name = "SECONDS", default_value_t = 1.)]
    /// the graceful shutdown timeout (<= 0.0 = no timeout)
    pub graceful: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Mode {
    Instances,
    Global,
}

impl From<Mode> for SimulationMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Instances => SimulationMode::Instances,
            Mode::Global => SimulationMode::Global,
        }
    }
}

impl Args {
    pub fn simulation_config(&self) -> Result<SimulationConfig, BoxError> {
        if self.interval.is_zero() {
            return Err(BoxError::from("interval has to be greater than zero"));
        }
        if self.summary_age_buckets == 0 {
            return Err(BoxError::from("summary age buckets has to be at least 1"));
        }

        Ok(SimulationConfig {
            interval: self.interval,
            request_rate: self.request_rate,
            mode: self.mode.into(),
            defaults: InstanceDefaults {
                latency_min_ms: self.latency_min_ms,
                latency_max_ms: self.latency_max_ms,
            },
            tunables: Tunables {
                error_pct: self.error_pct,
                latency_offset_ms: self.latency_offset_ms,
            },
            instance_count: self.instance_count,
            summary: SummaryConfig {
                max_age: self.summary_max_age,
                age_buckets: self.summary_age_buckets,
            },
        })
    }
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    let args = Args::parse();

    utils::telemetry::init_tracing(Some(utils::telemetry::TelemetryConfig {
        verbose: args.verbose,
        pretty: args.pretty,
        output: args.output.as_deref(),
    }))?;

    let base_shutdown_signal = graceful::default_signal();
    if let Err(err) = run_with_args(base_shutdown_signal, args).await {
        eprintln!("🚩 exit with error: {err}");
        std::process::exit(1);
    }

    Ok(())
}

/// Runs the simulation ticker and the control server and blocks until
/// a critical error occurs or the (graceful) shutdown has been initiated.
async fn run_with_args<F>(base_shutdown_signal: F, args: Args) -> Result<(), BoxError>
where
    F: Future<Output: Send + 'static> + Send + 'static,
{
    let cfg = args.simulation_config().context("validate simulation args")?;

    if let Some(dir) = args.data.as_deref() {
        tokio::fs::create_dir_all(dir)
            .await
            .context("create data directory")
            .with_context_debug_field("path", || dir.to_owned())?;
        tracing::info!(path = ?dir, "data directory ready to be used");
    }

    let graceful_timeout = (args.graceful > 0.).then(|| Duration::from_secs_f64(args.graceful));

    let sink = Arc::new(MetricsSink::try_new(cfg.summary).context("create metrics sink")?);
    let state = SimulationState::from_config(&cfg);
    tracing::info!(
        mode = ?cfg.mode,
        request_rate = cfg.request_rate,
        requests_per_tick = cfg.requests_per_tick(),
        "simulation ready: interval of {:?}",
        cfg.interval,
    );

    let svc = ControlService::try_new(state.clone(), sink.clone())
        .context("create control service")?;

    let (error_tx, error_rx) = tokio::sync::mpsc::channel::<BoxError>(1);
    let graceful = graceful::Shutdown::new(new_shutdown_signal(error_rx, base_shutdown_signal));

    graceful.spawn_task_fn({
        let simulator = Simulator::new(state, sink, cfg.requests_per_tick());
        let interval = cfg.interval;
        move |guard| {
            simulation::run_ticker(guard, simulator, interval).instrument(tracing::debug_span!(
                "simulation lifetime",
                service.name = utils::env::project_name(),
            ))
        }
    });

    graceful.spawn_task_fn(move |guard| run_control_server(args, guard, error_tx, svc));

    let delay = match graceful_timeout {
        Some(duration) => graceful.shutdown_with_limit(duration).await?,
        None => graceful.shutdown().await,
    };

    tracing::info!("gracefully shutdown with a delay of: {delay:?}");
    Ok(())
}

async fn run_control_server(
    args: Args,
    guard: ShutdownGuard,
    error_tx: tokio::sync::mpsc::Sender<BoxError>,
    svc: ControlService,
) {
    tracing::info!("spawning control http server...");
    if let Err(err) = server::run_control_server(args, guard, svc)
        .instrument(tracing::debug_span!(
            "control server lifetime",
            server.service.name = format!("{}-control", utils::env::project_name()),
            otel.kind = "server",
            network.protocol.name = "http",
        ))
        .await
    {
        tracing::error!("control server exited with an error: {err}");
        let _ = error_tx.send(err).await;
    }
}

fn new_shutdown_signal(
    error_rx: tokio::sync::mpsc::Receiver<BoxError>,
    base_shutdown_signal: impl Future<Output: Send + 'static> + Send + 'static,
) -> impl Future + Send + 'static {
    async move {
        let mut mut_error_rx = error_rx;
        let mut signal = Box::pin(base_shutdown_signal);

        tokio::select! {
            _ = signal.as_mut() => {
                tracing::debug!("default signal triggered: init graceful shutdown");
            }
            err = mut_error_rx.recv() => {
                if let Some(err) = err {
                    tracing::error!("fatal err received: {err}; abort");
                } else {
                    tracing::info!("wait for default signal, no error was received");
                    signal.await;
                    tracing::debug!("default signal triggered: init graceful shutdown");
                }
            }
        }
    }
}
