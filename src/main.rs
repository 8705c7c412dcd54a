use sockspawn::cli::CliArgs;
use sockspawn::config::Config;
use sockspawn::server::Server;
use sockspawn::signals::Signals;
use sockspawn::status::StatusLog;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let args = match CliArgs::try_parse_args_from(std::env::args_os()) {
        Ok(args) => args,
        Err(e) if !e.use_stderr() => e.exit(),
        Err(e) => {
            let _ = e.print();
            return ExitCode::FAILURE;
        }
    };

    let config = match Config::try_from(args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("sockspawn: {}", e);
            return ExitCode::FAILURE;
        }
    };

    // Initialize logging; RUST_LOG takes precedence over -q/-Q/-v
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.verbosity.filter_directive()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match serve(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            // Each message already names its cause
            error!(error = %e, "Fatal error");
            ExitCode::FAILURE
        }
    }
}

async fn serve(config: Config) -> anyhow::Result<()> {
    let config = Arc::new(config);

    let mut signals = Signals::install()?;
    let status = Arc::new(StatusLog::stdout(config.verbosity.status_enabled()));
    let server = Server::bind(Arc::clone(&config), status)?;

    info!(
        socket = %config.socket_path.display(),
        command = ?config.command,
        max_connections = config.max_connections,
        backlog = config.backlog,
        delete_on_exit = config.delete_on_exit,
        "Starting sockspawn"
    );

    server
        .run(async {
            let name = signals.shutdown().await;
            info!(signal = name, "Shutting down");
        })
        .await?;

    info!("Shutdown complete");
    Ok(())
}
