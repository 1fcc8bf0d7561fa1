//! The `list-basins` subcommand: show the Pfafstetter Level-2 codes.

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::Result;
use tracing::error;

use delineator::basins::{BasinIndex, basins_shapefile_path, continent_name};
use delineator::config::ENV_DATA_DIR;

pub async fn handle_list_basins(data_dir: Option<PathBuf>) -> Result<i32> {
    let data_dir = data_dir
        .or_else(|| std::env::var(ENV_DATA_DIR).ok().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("data"));

    let index = match BasinIndex::load(&basins_shapefile_path(&data_dir)) {
        Ok(index) => index,
        Err(e) => {
            error!("Cannot load basin index: {e}");
            return Ok(2);
        }
    };

    let mut grouped: BTreeMap<&'static str, Vec<u32>> = BTreeMap::new();
    for code in index.all_codes() {
        grouped.entry(continent_name(code)).or_default().push(code);
    }

    println!("Available Pfafstetter Level 2 basin codes:\n");
    let mut total = 0;
    for (continent, codes) in &grouped {
        total += codes.len();
        let list = codes.iter().map(u32::to_string).collect::<Vec<_>>().join(", ");
        println!("  {continent:<15} {list}");
    }
    println!("\nTotal: {total} basins");
    Ok(0)
}
