//! solard - solar water-heating controller daemon
//!
//! Wires the sensor reader, health registry, broker connection and control
//! loop together, then runs until SIGINT or SIGTERM. SIGHUP re-reads the
//! broker credentials from the environment.

use clap::{Parser, Subcommand};
use solard::alerts::AlertPublisher;
use solard::config::{ConfigError, DaemonConfig};
use solard::control::{ControlLoop, ControlLoopAdapter, LoopTiming, ReadingLogger};
use solard::error::DaemonError;
use solard::observability::{
    init_default_logging, init_logging, metrics, parse_level, HealthServer, LogFormat,
};
use solard::sensors::{RobustSensorReader, SensorHealthMonitor, SensorSource, W1ThermSource};
use solard::transport::mqtt::{ConnectionManager, CredentialSource, MqttLink};
use std::error::Error;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Exit status for a clean shutdown
const EXIT_OK: i32 = 0;
/// Exit status for a failure after startup
const EXIT_RUNTIME: i32 = 1;
/// Exit status for invalid configuration or credentials at startup
const EXIT_CONFIG: i32 = 2;

/// Solar water-heating controller daemon
#[derive(Parser)]
#[command(name = "solard")]
#[command(about = "Resilient sensor polling and broker telemetry for a solar water heater")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "SOLARD_CONFIG")]
    config: Option<PathBuf>,

    /// Verbose logging (-v debug, -vv trace); overrides LOG_LEVEL
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the daemon
    Run,
    /// Validate configuration and credentials
    Config {
        /// Print the effective configuration
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_observability(cli.verbose);

    info!("Starting solard v{}", env!("CARGO_PKG_VERSION"));

    let config = match load_configuration(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Failed to load configuration");
            process::exit(EXIT_CONFIG);
        }
    };

    let result = match cli.command {
        Commands::Run => run_daemon(config).await,
        Commands::Config { show } => handle_config_command(&config, show),
    };

    let code = match result {
        Ok(()) => EXIT_OK,
        Err(e) => {
            let code = exit_code(e.as_ref());
            error!(error = %e, exit_code = code, "Command failed");
            code
        }
    };

    info!("Shutdown complete");
    process::exit(code);
}

fn init_observability(verbose: u8) {
    if verbose == 0 {
        init_default_logging();
        return;
    }

    let level = parse_level(if verbose == 1 { "DEBUG" } else { "TRACE" });
    let format = LogFormat::parse(&std::env::var("LOG_FORMAT").unwrap_or_else(|_| "json".into()));
    let spans = std::env::var("LOG_SPANS")
        .map(|v| v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);
    init_logging(level, format, spans);
}

fn load_configuration(explicit: Option<&std::path::Path>) -> Result<DaemonConfig, ConfigError> {
    let path = DaemonConfig::locate(explicit)?;
    info!(path = %path.display(), "Loading configuration");
    DaemonConfig::load_from_file(&path)
}

/// Startup configuration and credential errors exit with 2, everything else with 1
fn exit_code(e: &(dyn Error + 'static)) -> i32 {
    if e.downcast_ref::<ConfigError>().is_some() {
        return EXIT_CONFIG;
    }
    match e.downcast_ref::<DaemonError>() {
        Some(daemon_error) if !daemon_error.is_recoverable() => EXIT_CONFIG,
        _ => EXIT_RUNTIME,
    }
}

fn handle_config_command(config: &DaemonConfig, show: bool) -> Result<(), Box<dyn Error>> {
    if show {
        println!("{}", toml::to_string_pretty(config)?);
    }

    match config.credential_source().load() {
        Ok(credentials) => info!(
            principal = %credentials.principal(),
            broker = %credentials.broker(),
            "Credentials present"
        ),
        Err(e) => return Err(Box::new(DaemonError::from(e))),
    }

    info!(
        daemon_id = %config.daemon.id,
        channels = config.channels().len(),
        "Configuration is valid"
    );
    Ok(())
}

async fn run_daemon(config: DaemonConfig) -> Result<(), Box<dyn Error>> {
    let collector = metrics();
    collector.set_daemon_state("initializing");
    info!(daemon_id = %config.daemon.id, "Daemon starting");

    // Credentials are validated here, before any network activity
    let (manager, connection) = ConnectionManager::initialize(
        Arc::new(config.credential_source()),
        config.reconnect_config(),
        MqttLink::new(config.link_settings()),
    )?;
    let connection_task = manager.spawn();

    let monitor = SensorHealthMonitor::new(config.health_policy());
    let publisher = Arc::new(AlertPublisher::new(
        &config.daemon.id,
        config.topics(),
        Arc::new(connection.clone()),
    ));
    let reader = RobustSensorReader::new(
        monitor.clone(),
        config.retry_policy(),
        config.plausible_range(),
        publisher.clone(),
    );

    let channels = config
        .channels()
        .iter()
        .map(|channel| {
            let source: Arc<dyn SensorSource> =
                Arc::new(W1ThermSource::new(&config.sensors.w1_base, &channel.device));
            (channel.id.clone(), source)
        })
        .collect();
    let adapter = ControlLoopAdapter::new(reader, channels);

    let (stop_tx, stop_rx) = watch::channel(false);
    let control = ControlLoop::new(
        adapter,
        Box::new(ReadingLogger),
        LoopTiming {
            cycle_period: config.cycle_period(),
            summary_interval: config.summary_interval(),
        },
        stop_rx.clone(),
    )
    .with_summary_publisher(publisher);
    let control_task = tokio::spawn(control.run());

    let health_task = if config.daemon.health_port == 0 {
        info!("Diagnostics server disabled");
        None
    } else {
        let server = Arc::new(HealthServer::new(
            config.daemon.id.clone(),
            monitor.clone(),
            connection.subscribe(),
        ));
        let mut stop = stop_rx.clone();
        let addr = SocketAddr::from(([0, 0, 0, 0], config.daemon.health_port));
        let (_, serve) = server.bind(addr, async move {
            let _ = stop.wait_for(|stop| *stop).await;
        })?;
        Some(tokio::spawn(serve))
    };

    collector.set_daemon_state("running");

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sighup = signal(SignalKind::hangup())?;

    info!("Daemon running");

    loop {
        tokio::select! {
            _ = sigint.recv() => {
                info!("Received SIGINT, shutting down gracefully");
                break;
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down gracefully");
                break;
            }
            _ = sighup.recv() => {
                connection.reload_credentials();
            }
        }
    }

    collector.set_daemon_state("stopping");

    // Stop polling first so the last alerts still reach the connection queue
    stop_tx.send_replace(true);
    match join_within(control_task, "control loop").await {
        Some(cycles) => info!(cycles, "Control loop finished"),
        None => collector.set_daemon_state("error"),
    }

    connection.shutdown();
    join_within(connection_task, "connection context").await;

    if let Some(task) = health_task {
        join_within(task, "diagnostics server").await;
    }

    collector.set_daemon_state("stopped");
    Ok(())
}

/// Await a task for at most [`SHUTDOWN_TIMEOUT`], aborting it after that
async fn join_within<T>(mut task: JoinHandle<T>, name: &str) -> Option<T> {
    match tokio::time::timeout(SHUTDOWN_TIMEOUT, &mut task).await {
        Ok(Ok(value)) => Some(value),
        Ok(Err(e)) => {
            error!(task = name, error = %e, "Task ended abnormally");
            None
        }
        Err(_) => {
            warn!(task = name, "Task did not stop in time, aborting");
            task.abort();
            None
        }
    }
}
