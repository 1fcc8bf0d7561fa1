//! Batch configuration files.
//!
//! A master TOML file carries `[settings]` and `[[regions]]`; each region
//! points at an outlets TOML with `[[outlets]]` entries. Everything is
//! validated at load time so the driver only ever sees well-formed input.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::{debug, info};

use crate::errors::{DelineationError, DelineationResult};

pub const ENV_DATA_DIR: &str = "DELINEATOR_DATA_DIR";
pub const ENV_MERIT_DATA_DIR: &str = "MERIT_DATA_DIR";
pub const ENV_LOG_FILE: &str = "DELINEATOR_LOG_FILE";
pub const ENV_CORS_ORIGINS: &str = "DELINEATOR_CORS_ORIGINS";

pub const DEFAULT_OUTPUT_DIR: &str = "./output";
pub const DEFAULT_API_DATA_DIR: &str = "/data/merit-hydro";
pub const DEFAULT_FILL_THRESHOLD: u32 = 100;

/// A single outlet point, typically a stream gauge.
#[derive(Debug, Clone, Deserialize)]
pub struct Outlet {
    pub gauge_id: String,
    pub lat: f64,
    pub lng: f64,
    #[serde(default)]
    pub gauge_name: String,
}

impl Outlet {
    fn validate(&mut self) -> DelineationResult<()> {
        self.gauge_id = self.gauge_id.trim().to_string();
        self.gauge_name = self.gauge_name.trim().to_string();
        if self.gauge_id.is_empty() {
            return Err(DelineationError::InvalidInput("gauge_id cannot be empty".into()));
        }
        if !(-90.0..=90.0).contains(&self.lat) {
            return Err(DelineationError::InvalidInput(format!(
                "outlet '{}': lat {} is not within -90..90",
                self.gauge_id, self.lat
            )));
        }
        if !(-180.0..=180.0).contains(&self.lng) {
            return Err(DelineationError::InvalidInput(format!(
                "outlet '{}': lng {} is not within -180..180",
                self.gauge_id, self.lng
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct OutletsFile {
    outlets: Vec<Outlet>,
}

/// One region: a name used for hive partitioning and the path to its
/// outlets file.
#[derive(Debug, Clone, Deserialize)]
pub struct RegionConfig {
    pub name: String,
    pub outlets: String,
}

impl RegionConfig {
    fn validate(&mut self) -> DelineationResult<()> {
        self.name = self.name.trim().to_string();
        let valid_name = !self.name.is_empty()
            && self.name.chars().next().is_some_and(|c| c.is_ascii_alphabetic())
            && self
                .name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_');
        if !valid_name {
            return Err(DelineationError::InvalidInput(format!(
                "region name '{}' must start with a letter and contain only \
                 letters, numbers, and underscores",
                self.name
            )));
        }
        if self.outlets.trim().is_empty() {
            return Err(DelineationError::InvalidInput(format!(
                "region '{}': outlets path cannot be empty",
                self.name
            )));
        }
        Ok(())
    }
}

fn default_output_dir() -> String {
    DEFAULT_OUTPUT_DIR.to_string()
}

fn default_fill_threshold() -> u32 {
    DEFAULT_FILL_THRESHOLD
}

fn default_use_high_res() -> bool {
    true
}

fn default_high_res_area_limit() -> f64 {
    10_000.0
}

/// Global settings shared by every region in a run.
#[derive(Debug, Clone, Deserialize)]
pub struct SettingsConfig {
    #[serde(default = "default_output_dir")]
    pub output_dir: String,
    /// Overrides the DELINEATOR_DATA_DIR environment variable when set.
    #[serde(default)]
    pub data_dir: Option<String>,
    /// Stop after this many failures; absent means unlimited.
    #[serde(default)]
    pub max_fails: Option<u32>,
    #[serde(default = "default_fill_threshold")]
    pub fill_threshold: u32,
    #[serde(default = "default_use_high_res")]
    pub use_high_res: bool,
    #[serde(default = "default_high_res_area_limit")]
    pub high_res_area_limit_km2: f64,
}

impl Default for SettingsConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            data_dir: None,
            max_fails: None,
            fill_threshold: default_fill_threshold(),
            use_high_res: default_use_high_res(),
            high_res_area_limit_km2: default_high_res_area_limit(),
        }
    }
}

impl SettingsConfig {
    fn validate(&mut self) -> DelineationResult<()> {
        self.output_dir = self.output_dir.trim().to_string();
        if self.output_dir.is_empty() {
            return Err(DelineationError::InvalidInput("output_dir cannot be empty".into()));
        }
        if self.max_fails == Some(0) {
            return Err(DelineationError::InvalidInput(
                "max_fails must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// The master configuration loaded from delineate.toml.
#[derive(Debug, Clone, Deserialize)]
pub struct MasterConfig {
    #[serde(default)]
    pub settings: SettingsConfig,
    pub regions: Vec<RegionConfig>,
}

impl MasterConfig {
    fn validate(&mut self) -> DelineationResult<()> {
        self.settings.validate()?;
        if self.regions.is_empty() {
            return Err(DelineationError::InvalidInput(
                "at least one region must be configured".into(),
            ));
        }
        let mut seen = HashSet::new();
        for region in &mut self.regions {
            region.validate()?;
            if !seen.insert(region.name.clone()) {
                return Err(DelineationError::InvalidInput(format!(
                    "duplicate region name '{}'",
                    region.name
                )));
            }
        }
        Ok(())
    }

    /// Data directory resolution chain: settings, then the environment,
    /// then a `data` directory beside the output directory.
    pub fn data_dir(&self) -> PathBuf {
        if let Some(dir) = &self.data_dir_setting() {
            return PathBuf::from(dir);
        }
        if let Ok(dir) = std::env::var(ENV_DATA_DIR)
            && !dir.trim().is_empty()
        {
            return PathBuf::from(dir);
        }
        Path::new(&self.settings.output_dir)
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join("data")
    }

    fn data_dir_setting(&self) -> Option<String> {
        self.settings
            .data_dir
            .as_ref()
            .filter(|dir| !dir.trim().is_empty())
            .cloned()
    }
}

/// Load and validate a master configuration file. Relative outlet paths are
/// resolved against the configuration file's directory.
pub fn load_config(config_path: &Path) -> DelineationResult<MasterConfig> {
    if !config_path.is_file() {
        return Err(DelineationError::DataMissing(config_path.to_path_buf()));
    }
    info!("Loading configuration from {}", config_path.display());

    let contents = std::fs::read_to_string(config_path)?;
    let mut config: MasterConfig = toml::from_str(&contents).map_err(|e| {
        DelineationError::InvalidInput(format!("invalid TOML in {}: {e}", config_path.display()))
    })?;
    config.validate()?;

    let config_dir = config_path.parent().unwrap_or_else(|| Path::new("."));
    for region in &mut config.regions {
        let outlets_path = Path::new(&region.outlets);
        if outlets_path.is_relative() {
            let resolved = config_dir.join(outlets_path);
            debug!("Resolved outlets path for '{}': {}", region.name, resolved.display());
            region.outlets = resolved.to_string_lossy().into_owned();
        }
    }

    info!("Loaded configuration with {} region(s)", config.regions.len());
    Ok(config)
}

/// Load and validate an outlets file; gauge_ids must be unique per region.
pub fn load_outlets(outlets_path: &Path) -> DelineationResult<Vec<Outlet>> {
    if !outlets_path.is_file() {
        return Err(DelineationError::DataMissing(outlets_path.to_path_buf()));
    }

    let contents = std::fs::read_to_string(outlets_path)?;
    let file: OutletsFile = toml::from_str(&contents).map_err(|e| {
        DelineationError::InvalidInput(format!(
            "invalid TOML in {}: {e}",
            outlets_path.display()
        ))
    })?;

    let mut outlets = file.outlets;
    let mut seen = HashSet::new();
    for outlet in &mut outlets {
        outlet.validate()?;
        if !seen.insert(outlet.gauge_id.clone()) {
            return Err(DelineationError::InvalidInput(format!(
                "duplicate gauge_id '{}' in {}",
                outlet.gauge_id,
                outlets_path.display()
            )));
        }
    }

    info!("Loaded {} outlet(s) from {}", outlets.len(), outlets_path.display());
    Ok(outlets)
}
