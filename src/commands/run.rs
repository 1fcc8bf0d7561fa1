//! The `run` subcommand: batch delineation from a master TOML config.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use tracing::{error, info, warn};

use delineator::basins::{BasinIndex, basins_shapefile_path};
use delineator::batch::{BatchDriver, ResumeMode};
use delineator::config::{load_config, load_outlets};
use delineator::country::{CountryLookup, NoCountryLookup};
use delineator::delineate::DelineateOptions;
use delineator::merit::{BasinDataCache, check_data_availability};
use delineator::output::{OutputFormat, OutputWriter};

/// Flags for a batch run, mirroring the CLI surface.
#[derive(Debug, Clone)]
pub struct RunArgs {
    pub config_file: PathBuf,
    pub output: Option<PathBuf>,
    pub max_fails: Option<u32>,
    pub fill_threshold: Option<u32>,
    pub dry_run: bool,
    pub skip_existing: bool,
    pub force: bool,
    pub skip_failed: bool,
    pub file_format: String,
    pub include_rivers: bool,
}

/// Execute a batch run; returns the process exit code.
pub async fn handle_run(args: RunArgs) -> Result<i32> {
    if args.skip_existing && args.force {
        error!("--skip-existing and --force are mutually exclusive");
        return Ok(2);
    }
    let Some(format) = OutputFormat::from_cli(&args.file_format) else {
        error!("Invalid file format '{}': must be 'gpkg' or 'shp'", args.file_format);
        return Ok(2);
    };

    let mut config = match load_config(&args.config_file) {
        Ok(config) => config,
        Err(e) => {
            error!("Configuration error: {e}");
            return Ok(2);
        }
    };
    if let Some(output) = &args.output {
        config.settings.output_dir = output.to_string_lossy().into_owned();
        info!("Output directory overridden to {}", output.display());
    }
    if let Some(max_fails) = args.max_fails {
        config.settings.max_fails = Some(max_fails);
    }
    if let Some(fill_threshold) = args.fill_threshold {
        config.settings.fill_threshold = fill_threshold;
    }

    // Validate every outlets file up front and gather the overall extent.
    let mut bounds: Option<(f64, f64, f64, f64)> = None;
    let mut total_outlets = 0usize;
    for region in &config.regions {
        let outlets = match load_outlets(Path::new(&region.outlets)) {
            Ok(outlets) => outlets,
            Err(e) => {
                error!("Region '{}': {e}", region.name);
                return Ok(2);
            }
        };
        info!("  {}: {} outlets", region.name, outlets.len());
        total_outlets += outlets.len();
        for outlet in &outlets {
            bounds = Some(match bounds {
                None => (outlet.lng, outlet.lat, outlet.lng, outlet.lat),
                Some((min_lon, min_lat, max_lon, max_lat)) => (
                    min_lon.min(outlet.lng),
                    min_lat.min(outlet.lat),
                    max_lon.max(outlet.lng),
                    max_lat.max(outlet.lat),
                ),
            });
        }
    }
    info!("Total: {total_outlets} outlets in {} region(s)", config.regions.len());
    let Some((min_lon, min_lat, max_lon, max_lat)) = bounds else {
        error!("No outlets configured");
        return Ok(2);
    };

    let data_dir = config.data_dir();
    info!("Using MERIT data directory {}", data_dir.display());

    let basin_index = match BasinIndex::load(&basins_shapefile_path(&data_dir)) {
        Ok(index) => index,
        Err(e) => {
            error!("Cannot load basin index: {e}");
            return Ok(2);
        }
    };
    let required = match basin_index.basins_for_bbox(min_lon, min_lat, max_lon, max_lat) {
        Ok(required) => required,
        Err(e) => {
            error!("Basin lookup failed: {e}");
            return Ok(2);
        }
    };
    info!(
        "Required MERIT basins: {}",
        required.iter().map(u32::to_string).collect::<Vec<_>>().join(", ")
    );

    let availability =
        check_data_availability(&required, &data_dir, config.settings.use_high_res, true);
    if !availability.all_available() {
        for file in availability.missing_files.iter().take(5) {
            warn!("Missing: {}", file.display());
        }
        if availability.missing_files.len() > 5 {
            warn!("... and {} more files", availability.missing_files.len() - 5);
        }
        if !args.dry_run {
            error!(
                "Missing MERIT data for basin(s) {:?}; place the files under {} and retry",
                availability.missing_basins,
                data_dir.display()
            );
            return Ok(2);
        }
    }

    if args.dry_run {
        info!("Dry run complete; configuration is valid");
        return Ok(0);
    }

    let output_dir = PathBuf::from(&config.settings.output_dir);
    if output_dir.exists() && !output_dir.is_dir() {
        error!("Output path exists but is not a directory: {}", output_dir.display());
        return Ok(2);
    }
    std::fs::create_dir_all(&output_dir)
        .with_context(|| format!("creating {}", output_dir.display()))?;

    let options = DelineateOptions {
        use_high_res: config.settings.use_high_res,
        high_res_area_limit_km2: config.settings.high_res_area_limit_km2,
        fill_threshold_pixels: config.settings.fill_threshold,
        include_rivers: args.include_rivers,
    };
    let resume = if args.skip_existing {
        ResumeMode::SkipExisting
    } else if args.force {
        ResumeMode::Force
    } else {
        ResumeMode::FailIfExists
    };

    let config = Arc::new(config);
    let writer = Arc::new(OutputWriter::new(output_dir, format, args.include_rivers));
    let basin_index = Arc::new(basin_index);
    let basin_cache = Arc::new(BasinDataCache::new(
        data_dir,
        BasinDataCache::DEFAULT_CAPACITY,
    ));
    let country: Arc<dyn CountryLookup> = Arc::new(NoCountryLookup);

    // The interrupt is absorbed between outlets: the driver polls this flag
    // and flushes the current region before returning.
    let cancel = Arc::new(AtomicBool::new(false));
    let signal_flag = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, finishing current outlet");
            signal_flag.store(true, Ordering::SeqCst);
        }
    });

    let skip_failed = args.skip_failed;
    let driver_writer = writer.clone();
    let summary = tokio::task::spawn_blocking(move || {
        let driver = BatchDriver::new(
            &config,
            &driver_writer,
            &basin_index,
            &basin_cache,
            country.as_ref(),
            options,
            resume,
            skip_failed,
            cancel,
        );
        driver.run()
    })
    .await
    .context("batch driver task panicked")?;

    let summary = match summary {
        Ok(summary) => summary,
        Err(e) => {
            error!("{e}");
            return Ok(2);
        }
    };

    info!(
        "Complete: {} succeeded, {} skipped, {} failed",
        summary.processed, summary.skipped, summary.failed
    );
    Ok(summary.exit_code())
}
