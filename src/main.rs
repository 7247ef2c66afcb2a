#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use clap::Parser;
use proxy_engine::config::{EngineConfig, Environment, LogLevel};
use proxy_engine::error::ProxyError;
use proxy_engine::server::{cpu, Runtime};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "proxy-engine", about = "Multi-tenant L7 reverse proxy / API gateway")]
struct Cli {
    /// Path to the JSON configuration file. Without it, a default
    /// single-gateway configuration is used.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen host for the default configuration.
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Listen port for the default configuration.
    #[arg(short, long, default_value_t = 8080)]
    port: u16,

    /// Override the configured log level.
    #[arg(long)]
    log_level: Option<LogLevel>,

    /// Override the configured environment.
    #[arg(long = "env")]
    environment: Option<Environment>,

    /// Override the configured metrics port.
    #[arg(long)]
    metrics_port: Option<u16>,

    /// Reject unknown configuration fields.
    #[arg(long)]
    strict: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("proxy-engine: {}", e);
            return ExitCode::from(2);
        }
    };

    init_tracing(config.log_level);

    let worker_threads = cpu::worker_threads();
    let rt = match tokio::runtime::Builder::new_multi_thread()
        .worker_threads(worker_threads)
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("proxy-engine: cannot build runtime: {}", e);
            return ExitCode::from(1);
        }
    };

    ExitCode::from(rt.block_on(run(config)))
}

fn load_config(cli: &Cli) -> Result<EngineConfig, ProxyError> {
    let mut config = match &cli.config {
        Some(path) => EngineConfig::load(path, cli.strict)?,
        None => EngineConfig::default_single_gateway(&cli.host, cli.port),
    };
    if let Some(level) = cli.log_level {
        config.log_level = level;
    }
    if let Some(environment) = cli.environment {
        config.environment = environment;
    }
    if let Some(port) = cli.metrics_port {
        config.metrics_port = port;
    }
    Ok(config)
}

fn init_tracing(level: LogLevel) {
    let (non_blocking, guard) = tracing_appender::non_blocking::NonBlockingBuilder::default()
        .lossy(true)
        .finish(std::io::stdout());

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_str())))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(false)
                .json(),
        )
        .init();

    std::mem::forget(guard);
}

async fn run(config: EngineConfig) -> u8 {
    let runtime = match Runtime::new(config) {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::error!("startup failed: {}", e);
            return exit_code_for(&e);
        }
    };

    if let Err(e) = runtime.start().await {
        tracing::error!("startup failed: {}", e);
        return exit_code_for(&e);
    }

    let reason = runtime.wait().await;
    reason.exit_code() as u8
}

fn exit_code_for(error: &ProxyError) -> u8 {
    match error {
        ProxyError::Configuration(_) => 2,
        _ => 1,
    }
}
