//! The `serve` subcommand: run the HTTP facade.

use anyhow::Result;
use tracing::info;

use delineator::cache::WatershedCache;
use delineator::web::{AppState, start_web_server};

pub async fn handle_serve(interface: String, port: u16) -> Result<()> {
    let data_dir = AppState::data_dir_from_env();
    info!("Serving delineations from MERIT data at {}", data_dir.display());

    let cache = WatershedCache::open_default()?;
    let state = AppState::new(data_dir, cache);
    start_web_server(interface, port, state).await
}
