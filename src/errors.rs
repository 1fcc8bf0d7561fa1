use std::path::PathBuf;

use thiserror::Error;

/// Failure taxonomy for the delineation core.
///
/// Every error a delineation can surface maps to one of these kinds; the
/// HTTP facade translates them to wire codes and the batch driver records
/// their display form in FAILED.csv.
#[derive(Debug, Error)]
pub enum DelineationError {
    /// Coordinates out of range, malformed config, or a bad format parameter.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The outlet does not fall inside any unit catchment of its basin.
    #[error("outlet point ({lat}, {lng}) does not fall within any unit catchment")]
    NoRiverFound { lat: f64, lng: f64 },

    /// A required raster or shapefile is absent.
    #[error("required data file not found: {0}")]
    DataMissing(PathBuf),

    /// A file is present but not parseable or missing required columns.
    #[error("corrupt or unreadable data: {0}")]
    DataCorrupt(String),

    /// Raster sub-delineation produced no polygon, or any unexpected
    /// internal failure.
    #[error("delineation failed: {0}")]
    Failed(String),

    /// Cache lookup by gauge_id missed (export endpoint).
    #[error("no cached watershed for gauge '{0}'")]
    WatershedNotFound(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl DelineationError {
    /// Wire-format error code for API responses.
    pub fn error_code(&self) -> &'static str {
        match self {
            DelineationError::InvalidInput(_) => "INVALID_COORDINATES",
            DelineationError::NoRiverFound { .. } => "NO_RIVER_FOUND",
            DelineationError::DataMissing(_) => "NO_DATA_AVAILABLE",
            DelineationError::WatershedNotFound(_) => "WATERSHED_NOT_FOUND",
            DelineationError::DataCorrupt(_)
            | DelineationError::Failed(_)
            | DelineationError::Io(_) => "DELINEATION_FAILED",
        }
    }

    /// HTTP status the facade answers with for this kind.
    pub fn http_status(&self) -> u16 {
        match self {
            DelineationError::InvalidInput(_) => 400,
            DelineationError::NoRiverFound { .. }
            | DelineationError::DataMissing(_)
            | DelineationError::WatershedNotFound(_) => 404,
            DelineationError::DataCorrupt(_)
            | DelineationError::Failed(_)
            | DelineationError::Io(_) => 500,
        }
    }
}

pub type DelineationResult<T> = Result<T, DelineationError>;
