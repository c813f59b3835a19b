mod config;
mod telemetry;

use clap::{Args, Parser, Subcommand};
use config::{Config, ConfigError};
use multiplexer::{Multiplexer, MultiplexerError};
use shared::admin_service::AdminService;
use shared::http::run_http_service;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use telemetry::TelemetryError;

#[derive(Parser)]
#[command(name = "gateway", about = "Routes client calls to backend worker nodes")]
struct Cli {
    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand)]
enum CliCommand {
    /// Serve workers and the admin endpoints until interrupted
    Run(ConfigArgs),
    /// Load and validate a configuration file, then exit
    CheckConfig(ConfigArgs),
}

#[derive(Args)]
struct ConfigArgs {
    /// Path to the YAML configuration file
    #[arg(long, short)]
    config: PathBuf,
}

#[derive(thiserror::Error, Debug)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Telemetry(#[from] TelemetryError),
    #[error(transparent)]
    Multiplexer(#[from] MultiplexerError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let result = match &cli.command {
        CliCommand::Run(args) => run(&args.config),
        CliCommand::CheckConfig(args) => check_config(&args.config),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("gateway: {e}");
            ExitCode::FAILURE
        }
    }
}

fn check_config(path: &Path) -> Result<(), CliError> {
    Config::from_file(path)?;
    println!("{}: ok", path.display());
    Ok(())
}

fn run(path: &Path) -> Result<(), CliError> {
    let config = Config::from_file(path)?;
    let _telemetry = telemetry::init(&config.common)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(serve(config))
}

async fn serve(config: Config) -> Result<(), CliError> {
    let mux = Multiplexer::new(config.multiplexer)?;

    let admin_service = {
        let mux = mux.clone();
        AdminService::<_, std::io::Error>::new(move || mux.is_ready())
    };
    let admin_task = run_http_service(
        &config.admin_listener.host,
        config.admin_listener.port,
        admin_service,
    );

    let result = tokio::select! {
        result = mux.serve() => result.map_err(CliError::from),
        result = admin_task => result.map_err(CliError::from),
        signal = tokio::signal::ctrl_c() => {
            tracing::info!("interrupt received");
            signal.map_err(CliError::from)
        }
    };

    if let Err(e) = &result {
        tracing::error!(error = %e, "gateway stopped");
    }
    mux.shutdown();
    result
}
