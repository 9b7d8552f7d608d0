use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use endpoint_interchange::broker::AmqpBrokerClient;
use endpoint_interchange::executor::{DirectLauncher, LocalProvider, ProcessPoolExecutor};
use endpoint_interchange::strategy::SimpleStrategy;
use endpoint_interchange::{
    error::exit_code, EndpointConfig, EndpointLock, EndpointPaths, Interchange, InterchangeError,
    RegistrationClient, RegistrationRecord, ResultSpool,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "endpoint-interchange")]
#[command(version)]
#[command(about = "Durable message pump between a broker task queue and a local worker pool")]
struct Cli {
    /// Endpoint name, selecting `~/.endpoint_interchange/<name>` unless `--home` overrides the root.
    #[arg(long, global = true, default_value = "default")]
    name: String,

    /// Override the endpoint directory root (supports `~` expansion).
    #[arg(long, global = true)]
    home: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the interchange until terminated by SIGTERM/SIGINT.
    Start,
    /// Run the registration handshake alone and persist `endpoint.json`.
    Register,
    /// Report whether an interchange instance is currently running.
    Status,
    /// Show the whole configuration, read one key, or set one key.
    Configure {
        key: Option<String>,
        value: Option<String>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let paths = EndpointPaths::new(cli.home.as_deref(), &cli.name)
        .context("resolving endpoint directory")?;
    let _log_guard = init_logging(&paths)?;

    let outcome = match cli.command {
        Commands::Start => {
            let runtime = tokio::runtime::Runtime::new().context("building tokio runtime")?;
            runtime.block_on(start(paths))
        }
        Commands::Register => {
            let runtime = tokio::runtime::Runtime::new().context("building tokio runtime")?;
            runtime.block_on(register(paths))
        }
        Commands::Status => status(&paths),
        Commands::Configure { key, value } => configure(&paths, key, value),
    };

    if let Err(e) = outcome {
        if let Some(ie) = e.downcast_ref::<InterchangeError>() {
            tracing::error!(error = %ie, "exiting on error");
            std::process::exit(ie.exit_code());
        }
        tracing::error!(error = %e, "exiting on error");
        std::process::exit(exit_code::UNHANDLED);
    }
    Ok(())
}

/// Structured logging to both stderr and `interchange.log` in the endpoint
/// directory (A2), initialized once before any component starts.
fn init_logging(
    paths: &EndpointPaths,
) -> Result<tracing_appender::non_blocking::WorkerGuard> {
    let file_appender = tracing_appender::rolling::never(paths.root(), "interchange.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(non_blocking.and(std::io::stderr))
        .init();

    Ok(guard)
}

async fn start(paths: EndpointPaths) -> Result<()> {
    let config = EndpointConfig::load(&paths.config_file())?;
    let _lock = EndpointLock::acquire(&paths.lock_file(), &paths.pid_file())?;

    let registration = perform_registration(&paths, &config).await?;

    let mut broker_params = registration.broker.clone();
    if let Some(url) = &config.broker_url_override {
        broker_params.url = url.clone();
    }

    let prefetch = (config.max_blocks.max(1) as u16).saturating_mul(config.prefetch_multiplier.max(1));
    let broker = Arc::new(AmqpBrokerClient::new(
        broker_params,
        registration.task_queue.clone(),
        registration.result_queue.clone(),
        prefetch,
    ));

    let spool = ResultSpool::new(paths.spool_dir())?;

    let launcher = Arc::new(DirectLauncher);
    let executor = ProcessPoolExecutor::new(
        config.worker_command.clone(),
        launcher,
        config.min_blocks.max(1),
    );
    let provider = Arc::new(LocalProvider::new(executor.semaphore(), config.min_blocks.max(1)));
    let strategy = Arc::new(SimpleStrategy::new(
        config.min_blocks,
        config.max_blocks,
        config.max_idletime(),
    ));

    let interchange = Arc::new(Interchange::new(
        broker, spool, executor, provider, strategy, config,
    ));

    let cancel = CancellationToken::new();
    let shutdown_cancel = cancel.clone();
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        tracing::info!("shutdown signal received, draining");
        shutdown_cancel.cancel();
    });

    interchange.run(cancel).await;
    Ok(())
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm =
            signal(SignalKind::terminate()).expect("installing SIGTERM handler");
        tokio::select! {
            _ = sigterm.recv() => {}
            _ = tokio::signal::ctrl_c() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

/// Endpoint identity persists across restarts via `endpoint.json`; only
/// generated fresh the first time an endpoint directory is used.
fn endpoint_id(paths: &EndpointPaths) -> Uuid {
    std::fs::read_to_string(paths.registration_file())
        .ok()
        .and_then(|body| serde_json::from_str::<RegistrationRecord>(&body).ok())
        .map(|record| record.endpoint_id)
        .unwrap_or_else(Uuid::new_v4)
}

async fn perform_registration(
    paths: &EndpointPaths,
    config: &EndpointConfig,
) -> Result<RegistrationRecord, InterchangeError> {
    let id = endpoint_id(paths);
    let client = RegistrationClient::new(config.control_plane_url.clone());
    let record = client.register(id, &config.endpoint_name).await?;

    let body = serde_json::to_string_pretty(&record).map_err(|e| {
        InterchangeError::FatalConfig(format!("encoding registration record: {e}"))
    })?;
    std::fs::write(paths.registration_file(), body).map_err(|e| {
        InterchangeError::FatalConfig(format!("writing endpoint.json: {e}"))
    })?;

    Ok(record)
}

async fn register(paths: EndpointPaths) -> Result<()> {
    let config = EndpointConfig::load(&paths.config_file())?;
    let record = perform_registration(&paths, &config).await?;
    println!("{}", serde_json::to_string_pretty(&record)?);
    Ok(())
}

fn status(paths: &EndpointPaths) -> Result<()> {
    if !paths.lock_file().exists() {
        println!("not running ({})", paths.root().display());
        return Ok(());
    }
    let owner = std::fs::read_to_string(paths.pid_file())
        .ok()
        .and_then(|s| s.trim().parse::<u32>().ok());
    match owner {
        Some(pid) if EndpointLock::pid_is_alive(pid) => {
            println!("running, pid {pid}");
        }
        _ => println!("stale lock present at {}, no live owner", paths.lock_file().display()),
    }
    Ok(())
}

fn configure(paths: &EndpointPaths, key: Option<String>, value: Option<String>) -> Result<()> {
    let mut config = EndpointConfig::load(&paths.config_file())?;
    match (key, value) {
        (None, None) => println!("{}", toml::to_string_pretty(&config)?),
        (Some(k), None) => {
            let as_json = serde_json::to_value(&config)?;
            let found = as_json
                .get(&k)
                .ok_or_else(|| anyhow::anyhow!("unknown config key '{k}'"))?;
            println!("{found}");
        }
        (Some(k), Some(v)) => {
            set_config_field(&mut config, &k, &v)?;
            config.save(&paths.config_file())?;
            println!("set {k} = {v}");
        }
        (None, Some(_)) => anyhow::bail!("a value was given without a key"),
    }
    Ok(())
}

fn set_config_field(config: &mut EndpointConfig, key: &str, value: &str) -> Result<()> {
    match key {
        "min_blocks" => config.min_blocks = value.parse()?,
        "max_blocks" => config.max_blocks = value.parse()?,
        "max_idletime_secs" => config.max_idletime_secs = value.parse()?,
        "tick_interval_secs" => config.tick_interval_secs = value.parse()?,
        "prefetch_multiplier" => config.prefetch_multiplier = value.parse()?,
        "drain_deadline_secs" => config.drain_deadline_secs = value.parse()?,
        "control_plane_url" => config.control_plane_url = value.to_string(),
        "endpoint_name" => config.endpoint_name = value.to_string(),
        "broker_url_override" => config.broker_url_override = Some(value.to_string()),
        "worker_command" => {
            config.worker_command = value.split_whitespace().map(String::from).collect()
        }
        other => anyhow::bail!("unknown config key '{other}'"),
    }
    Ok(())
}
