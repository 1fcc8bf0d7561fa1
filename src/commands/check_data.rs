//! The `check-data` subcommand: report MERIT data availability.

use std::path::PathBuf;

use anyhow::Result;
use tracing::{error, info, warn};

use delineator::basins::{BasinIndex, basins_shapefile_path, is_valid_pfafstetter};
use delineator::config::ENV_DATA_DIR;
use delineator::merit::check_data_availability;

/// Resolve the data directory: explicit flag, then environment, then ./data.
fn resolve_data_dir(data_dir: Option<PathBuf>) -> PathBuf {
    data_dir
        .or_else(|| std::env::var(ENV_DATA_DIR).ok().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("data"))
}

pub async fn handle_check_data(
    bbox: Option<String>,
    basins: Option<String>,
    data_dir: Option<PathBuf>,
) -> Result<i32> {
    if bbox.is_some() && basins.is_some() {
        error!("Cannot specify both --bbox and --basins");
        return Ok(2);
    }
    if bbox.is_none() && basins.is_none() {
        error!("Must specify either --bbox or --basins");
        return Ok(2);
    }
    let data_dir = resolve_data_dir(data_dir);

    let codes: Vec<u32> = if let Some(bbox) = bbox {
        let parts: Vec<f64> = bbox
            .split(',')
            .filter_map(|part| part.trim().parse().ok())
            .collect();
        if parts.len() != 4 {
            error!("Invalid bounding box '{bbox}': expected min_lon,min_lat,max_lon,max_lat");
            return Ok(2);
        }
        let index = match BasinIndex::load(&basins_shapefile_path(&data_dir)) {
            Ok(index) => index,
            Err(e) => {
                error!("Cannot load basin index: {e}");
                return Ok(2);
            }
        };
        match index.basins_for_bbox(parts[0], parts[1], parts[2], parts[3]) {
            Ok(codes) => codes,
            Err(e) => {
                error!("{e}");
                return Ok(2);
            }
        }
    } else {
        let mut codes = Vec::new();
        for part in basins.unwrap_or_default().split(',') {
            match part.trim().parse::<u32>() {
                Ok(code) if is_valid_pfafstetter(code) => codes.push(code),
                _ => {
                    error!(
                        "Invalid basin code '{}': codes are two digits, both 1..9",
                        part.trim()
                    );
                    return Ok(2);
                }
            }
        }
        codes
    };

    if codes.is_empty() {
        warn!("No basins matched the request");
        return Ok(0);
    }
    info!(
        "Checking basins: {}",
        codes.iter().map(u32::to_string).collect::<Vec<_>>().join(", ")
    );

    let availability = check_data_availability(&codes, &data_dir, true, true);
    for basin in &availability.available_basins {
        info!("Basin {basin}: complete");
    }
    for basin in &availability.missing_basins {
        warn!("Basin {basin}: incomplete");
    }
    for file in &availability.missing_files {
        warn!("  missing {}", file.display());
    }

    Ok(if availability.all_available() { 0 } else { 1 })
}
