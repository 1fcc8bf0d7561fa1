mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use delineator::config::ENV_LOG_FILE;

#[derive(Parser)]
#[command(
    name = "delineator",
    version,
    about = "Watershed delineation using MERIT-Hydro data",
    arg_required_else_help = true
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Show detailed progress
    #[arg(long, short, global = true)]
    verbose: bool,

    /// Suppress all output except errors
    #[arg(long, short, global = true)]
    quiet: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run watershed delineation for outlets defined in a config file
    Run {
        /// Path to the master configuration file (delineate.toml)
        config_file: PathBuf,
        /// Override the output directory from the config
        #[arg(long, short)]
        output: Option<PathBuf>,
        /// Stop after this many failures
        #[arg(long)]
        max_fails: Option<u32>,
        /// Fill polygon holes smaller than this many pixels
        #[arg(long)]
        fill_threshold: Option<u32>,
        /// Validate configuration and data availability without processing
        #[arg(long)]
        dry_run: bool,
        /// Resume: skip outlets already present in the output file
        #[arg(long)]
        skip_existing: bool,
        /// Overwrite existing output files
        #[arg(long, short)]
        force: bool,
        /// Skip outlets recorded in FAILED.csv by a previous run
        #[arg(long)]
        skip_failed: bool,
        /// Output file format: 'gpkg' (GeoPackage) or 'shp' (Shapefile)
        #[arg(long, default_value = "gpkg")]
        file_format: String,
        /// Include river network geometries in the output
        #[arg(long)]
        include_rivers: bool,
    },
    /// Start the delineation HTTP API
    Serve {
        /// Interface to bind
        #[arg(long, default_value = "127.0.0.1")]
        interface: String,
        /// Port to listen on
        #[arg(long, default_value_t = 8000)]
        port: u16,
    },
    /// Check MERIT data availability for a region
    CheckData {
        /// Bounding box: min_lon,min_lat,max_lon,max_lat
        #[arg(long)]
        bbox: Option<String>,
        /// Comma-separated basin codes (e.g. "18,45,61")
        #[arg(long)]
        basins: Option<String>,
        /// Data directory (defaults to DELINEATOR_DATA_DIR or ./data)
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
    /// List the Pfafstetter Level 2 basin codes
    ListBasins {
        /// Data directory (defaults to DELINEATOR_DATA_DIR or ./data)
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
}

fn init_telemetry(verbose: bool, quiet: bool) {
    let default_level = if quiet {
        "error"
    } else if verbose {
        "debug"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level));

    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false));

    // Mirror log output into DELINEATOR_LOG_FILE when configured.
    let log_file = std::env::var(ENV_LOG_FILE).ok().and_then(|path| {
        let path = PathBuf::from(path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok()?;
        }
        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .ok()
    });

    match log_file {
        Some(file) => registry
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_ansi(false)
                    .with_writer(std::sync::Arc::new(file)),
            )
            .init(),
        None => registry.init(),
    }
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    init_telemetry(cli.verbose, cli.quiet);

    let result = match cli.command {
        Commands::Run {
            config_file,
            output,
            max_fails,
            fill_threshold,
            dry_run,
            skip_existing,
            force,
            skip_failed,
            file_format,
            include_rivers,
        } => {
            commands::handle_run(commands::run::RunArgs {
                config_file,
                output,
                max_fails,
                fill_threshold,
                dry_run,
                skip_existing,
                force,
                skip_failed,
                file_format,
                include_rivers,
            })
            .await
        }
        Commands::Serve { interface, port } => {
            commands::handle_serve(interface, port).await.map(|_| 0)
        }
        Commands::CheckData { bbox, basins, data_dir } => {
            commands::handle_check_data(bbox, basins, data_dir).await
        }
        Commands::ListBasins { data_dir } => commands::handle_list_basins(data_dir).await,
    };

    match result {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("Error: {e:#}");
            std::process::exit(2);
        }
    }
}
