//! Watershed delineation on the MERIT-Hydro / MERIT-Basins dataset.
//!
//! Given an outlet coordinate, this library produces the polygon of all
//! land draining to it using a hybrid vector/raster method: unit catchments
//! from the MERIT-Basins vector layers upstream, and a pixel-scale D8
//! delineation against the MERIT-Hydro rasters inside the terminal
//! catchment only. Around that core sit a persistent result cache, a
//! partitioned batch output writer, and a small HTTP facade.

pub mod basins;
pub mod batch;
pub mod cache;
pub mod config;
pub mod country;
pub mod delineate;
pub mod errors;
pub mod export;
pub mod geometry;
pub mod gpkg;
pub mod merit;
pub mod models;
pub mod network;
pub mod output;
pub mod raster;
pub mod shp;
pub mod web;

pub use delineate::{DelineateOptions, DelineatedWatershed, Resolution, delineate_outlet};
pub use errors::{DelineationError, DelineationResult};
pub use merit::{BasinData, BasinDataCache, load_basin_data};
