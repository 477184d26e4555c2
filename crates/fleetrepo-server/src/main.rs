use clap::Parser;
use fleetrepo_server::{AccessLog, Publisher};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "fleetrepo-server", about = "Serve a published fleetrepo tree and catalog")]
struct Cli {
    /// Port to listen on.
    #[arg(long, default_value_t = 8080)]
    port: u16,

    /// Address to bind.
    #[arg(long, default_value = "0.0.0.0")]
    bind: String,

    /// Document root: `{basedir}/public` of the repository.
    #[arg(long)]
    docroot: PathBuf,

    /// Serve the `/_catalog` routes from this shared catalog directory.
    #[arg(long)]
    catalog: Option<PathBuf>,

    /// Append access-log lines to this file instead of stdout.
    #[arg(long)]
    access_log: Option<PathBuf>,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    if !cli.docroot.is_dir() {
        error!("document root {} is not a directory", cli.docroot.display());
        return ExitCode::FAILURE;
    }
    if let Some(catalog) = &cli.catalog {
        if let Err(e) = std::fs::create_dir_all(catalog) {
            error!("cannot create catalog directory {}: {e}", catalog.display());
            return ExitCode::FAILURE;
        }
    }
    let log = match &cli.access_log {
        Some(path) => match AccessLog::file(path) {
            Ok(log) => log,
            Err(e) => {
                error!("cannot open access log {}: {e}", path.display());
                return ExitCode::FAILURE;
            }
        },
        None => AccessLog::stdout(),
    };

    let addr = format!("{}:{}", cli.bind, cli.port);
    info!("serving {} on {addr}", cli.docroot.display());
    if let Some(catalog) = &cli.catalog {
        info!("catalog directory: {}", catalog.display());
    }

    let state = Arc::new(Publisher::new(cli.docroot, cli.catalog, log));
    match fleetrepo_server::run_server(&state, &addr) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("server error: {e}");
            ExitCode::FAILURE
        }
    }
}
