mod commands;

use clap::{Parser, Subcommand};
use clap_complete::Shell;
use commands::declare::DeclareArgs;
use commands::exit_code_for;
use fleetrepo_core::install_signal_handler;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(
    name = "fleetrepo",
    version,
    about = "Signed package repository publishing and pull-based fleet configuration"
)]
struct Cli {
    /// Path to the fleetrepo config file.
    #[arg(long, default_value = "fleetrepo.toml", global = true)]
    config: PathBuf,

    /// Output results as structured JSON.
    #[arg(long, default_value_t = false, global = true)]
    json: bool,

    /// Enable verbose (debug) logging output.
    #[arg(short, long, default_value_t = false, global = true)]
    verbose: bool,

    /// Enable trace-level logging (more detailed than --verbose).
    #[arg(long, default_value_t = false, global = true)]
    trace: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Create the repository layout and intake directories.
    Init,
    /// Compile intake files into a signed, published snapshot.
    Compile {
        /// Distribution to compile (repeatable). All when omitted.
        #[arg(long = "dist")]
        dists: Vec<String>,
    },
    /// Show the live snapshot, pending and quarantined files per distribution.
    Status,
    /// Verify the published tree: signature, index and package digests.
    Verify {
        #[arg(long)]
        dist: Option<String>,
        /// Also check every pool file and snapshot record.
        #[arg(long, default_value_t = false)]
        store: bool,
    },
    /// Prune old snapshots and unreferenced pool files.
    Gc {
        /// Only report what would be removed.
        #[arg(long, default_value_t = false)]
        dry_run: bool,
    },
    /// Generate a signing key in the configured keyring.
    Keygen {
        /// Key id. Defaults to the repository key_id.
        #[arg(long)]
        key_id: Option<String>,
        /// Days until the key expires.
        #[arg(long)]
        expires_days: Option<u32>,
    },
    /// Publish the public key as {docroot}/{name}.gpg.
    ExportKey,
    /// Declare a resource into the fleet catalog.
    Declare {
        /// Resource JSON file ({"name", "tags", "payload"}). Overrides the flags.
        #[arg(long)]
        file: Option<PathBuf>,
        /// repository_source or dns_address.
        #[arg(long)]
        kind: Option<String>,
        #[arg(long)]
        name: Option<String>,
        /// Comma-separated tags. Defaults to the node's own tags.
        #[arg(long)]
        tags: Option<String>,
        /// dns_address: host name (defaults to --name).
        #[arg(long)]
        hostname: Option<String>,
        /// dns_address: IP address.
        #[arg(long)]
        ip: Option<String>,
        /// repository_source: repository base URL.
        #[arg(long)]
        url: Option<String>,
        /// repository_source: distribution name.
        #[arg(long)]
        distribution: Option<String>,
        /// repository_source: comma-separated components.
        #[arg(long)]
        components: Option<String>,
        /// repository_source: signing key id.
        #[arg(long)]
        key_id: Option<String>,
        /// repository_source: public key URL (defaults to {url}/{name}.gpg).
        #[arg(long)]
        key_url: Option<String>,
        /// repository_source: also configure deb-src.
        #[arg(long, default_value_t = false)]
        include_source: bool,
        /// Catalog directory or URL. Defaults to [node] catalog.
        #[arg(long)]
        catalog: Option<String>,
    },
    /// Retract a resource this node declared.
    Retract {
        kind: String,
        name: String,
        #[arg(long)]
        catalog: Option<String>,
    },
    /// List catalog resources matching tags.
    Pull {
        /// Comma-separated tags. Defaults to the node's own tags.
        #[arg(long)]
        tags: Option<String>,
        #[arg(long)]
        catalog: Option<String>,
    },
    /// Declare the resources from [announce].
    Announce,
    /// Announce, then converge local apt sources and hosts entries.
    Reconcile,
    /// Run the compile and reconcile scheduler until interrupted.
    Run {
        /// Run every job once and exit.
        #[arg(long, default_value_t = false)]
        once: bool,
    },
    /// Generate shell completions for bash, zsh, fish, elvish, or powershell.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
    /// Generate man pages into a directory.
    ManPages {
        /// Output directory for man pages.
        #[arg(default_value = "man")]
        dir: PathBuf,
    },
}

fn main() -> ExitCode {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let msg = info.to_string();
        if msg.contains("Broken pipe")
            || msg.contains("broken pipe")
            || msg.contains("os error 32")
            || msg.contains("failed printing to stdout")
        {
            std::process::exit(0);
        }
        default_hook(info);
    }));

    let cli = Cli::parse();

    let default_level = if cli.trace {
        "trace"
    } else if cli.verbose {
        "debug"
    } else {
        "warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("FLEETREPO_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .without_time()
        .init();

    install_signal_handler();

    let result = dispatch(cli);
    match result {
        Ok(code) => ExitCode::from(code),
        Err(msg) => {
            eprintln!("error: {msg}");
            ExitCode::from(exit_code_for(&msg))
        }
    }
}

fn dispatch(cli: Cli) -> Result<u8, String> {
    let json = cli.json;
    // These two never read the config file.
    match cli.command {
        Commands::Completions { shell } => return commands::completions::run::<Cli>(shell),
        Commands::ManPages { ref dir } => return commands::man_pages::run::<Cli>(dir),
        _ => {}
    }

    let config = commands::load_config(&cli.config)?;
    match cli.command {
        Commands::Init => commands::init::run(&config, json),
        Commands::Compile { dists } => commands::compile::run(config, &dists, json),
        Commands::Status => commands::status::run(&config, json),
        Commands::Verify { dist, store } => {
            commands::verify::run(&config, dist.as_deref(), store, json)
        }
        Commands::Gc { dry_run } => commands::gc::run(&config, dry_run, json),
        Commands::Keygen {
            key_id,
            expires_days,
        } => commands::keygen::run(&config, key_id.as_deref(), expires_days, json),
        Commands::ExportKey => commands::export_key::run(&config, json),
        Commands::Declare {
            file,
            kind,
            name,
            tags,
            hostname,
            ip,
            url,
            distribution,
            components,
            key_id,
            key_url,
            include_source,
            catalog,
        } => {
            let args = DeclareArgs {
                file,
                kind,
                name,
                tags,
                hostname,
                ip,
                url,
                distribution,
                components,
                key_id,
                key_url,
                include_source,
            };
            commands::declare::run(&config, catalog.as_deref(), &args, json)
        }
        Commands::Retract {
            kind,
            name,
            catalog,
        } => commands::retract::run(&config, catalog.as_deref(), &kind, &name, json),
        Commands::Pull { tags, catalog } => {
            commands::pull::run(&config, catalog.as_deref(), tags.as_deref(), json)
        }
        Commands::Announce => commands::announce::run(config, json),
        Commands::Reconcile => commands::reconcile::run(config, json),
        Commands::Run { once } => commands::run::run(&config, once, json),
        Commands::Completions { .. } | Commands::ManPages { .. } => Ok(commands::EXIT_SUCCESS),
    }
}
