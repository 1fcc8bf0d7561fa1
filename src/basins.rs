//! Pfafstetter Level-2 basin locator.
//!
//! The MERIT-Basins dataset partitions the globe into 61 continental
//! drainage basins with two-digit codes (both digits 1..9). A coarse
//! boundary layer maps coordinates to basin codes; everything downstream
//! keys its data files off those codes.

use std::path::{Path, PathBuf};

use geo::{Coord, Intersects, MultiPolygon, Rect};
use tracing::{debug, info};

use crate::errors::{DelineationError, DelineationResult};
use crate::shp;

/// Expansion applied to degenerate (point or line) query boxes, roughly
/// 111 m at the equator.
const POINT_BUFFER_DEG: f64 = 0.001;

/// Attribute column carrying the basin code in the index layer.
const BASIN_COLUMN: &str = "BASIN";

/// Relative location of the basin index layer inside a MERIT data directory.
pub fn basins_shapefile_path(data_dir: &Path) -> PathBuf {
    data_dir
        .join("shp")
        .join("basins_level2")
        .join("merit_hydro_vect_level2.shp")
}

/// Structural check on a Pfafstetter Level-2 code: two digits, neither zero.
pub fn is_valid_pfafstetter(code: u32) -> bool {
    (11..=99).contains(&code) && code % 10 != 0
}

/// Continent for a basin code, keyed off the leading digit.
pub fn continent_name(code: u32) -> &'static str {
    match code / 10 {
        1 | 2 => "Africa",
        3 | 4 => "Europe",
        5 => "Asia",
        6 => "South America",
        7 => "North America",
        8 => "Oceania",
        9 => "Antarctica",
        _ => "Unknown",
    }
}

/// Loaded basin boundary layer. Load once per process and share by
/// reference; the polygons are read-only afterwards.
pub struct BasinIndex {
    basins: Vec<(u32, MultiPolygon<f64>)>,
}

impl BasinIndex {
    /// Read the Level-2 boundary shapefile. The layer must carry a numeric
    /// `BASIN` column.
    pub fn load(path: &Path) -> DelineationResult<Self> {
        if !path.is_file() {
            return Err(DelineationError::DataMissing(path.to_path_buf()));
        }
        info!("Loading basin index from {}", path.display());

        let mut reader = shapefile::Reader::from_path(path)
            .map_err(|e| DelineationError::DataCorrupt(format!("{}: {e}", path.display())))?;

        let mut basins = Vec::new();
        for row in reader.iter_shapes_and_records() {
            let (shape, record) = row
                .map_err(|e| DelineationError::DataCorrupt(format!("{}: {e}", path.display())))?;
            let code = shp::numeric_field(&record, BASIN_COLUMN).ok_or_else(|| {
                DelineationError::DataCorrupt(format!(
                    "{}: missing '{BASIN_COLUMN}' column",
                    path.display()
                ))
            })? as u32;
            let geometry = match shape {
                shapefile::Shape::Polygon(polygon) => shp::polygon_to_multipolygon(&polygon),
                other => {
                    return Err(DelineationError::DataCorrupt(format!(
                        "{}: expected polygons, found {}",
                        path.display(),
                        other.shapetype()
                    )));
                }
            };
            basins.push((code, geometry));
        }

        debug!("Basin index holds {} basins", basins.len());
        Ok(Self { basins })
    }

    /// Build an index directly from code/geometry pairs (tests, embedding).
    pub fn from_parts(basins: Vec<(u32, MultiPolygon<f64>)>) -> Self {
        Self { basins }
    }

    /// Basin codes whose boundary intersects the bounding box, ascending.
    ///
    /// Degenerate boxes (min == max on an axis) are widened so point queries
    /// work; inputs are clamped to WGS-84 ranges; inverted bounds fail.
    pub fn basins_for_bbox(
        &self,
        mut min_lon: f64,
        mut min_lat: f64,
        mut max_lon: f64,
        mut max_lat: f64,
    ) -> DelineationResult<Vec<u32>> {
        if min_lon == max_lon {
            min_lon -= POINT_BUFFER_DEG;
            max_lon += POINT_BUFFER_DEG;
        }
        if min_lat == max_lat {
            min_lat -= POINT_BUFFER_DEG;
            max_lat += POINT_BUFFER_DEG;
        }

        min_lon = min_lon.max(-180.0);
        max_lon = max_lon.min(180.0);
        min_lat = min_lat.max(-90.0);
        max_lat = max_lat.min(90.0);

        if min_lon > max_lon {
            return Err(DelineationError::InvalidInput(format!(
                "min_lon ({min_lon}) must be <= max_lon ({max_lon})"
            )));
        }
        if min_lat > max_lat {
            return Err(DelineationError::InvalidInput(format!(
                "min_lat ({min_lat}) must be <= max_lat ({max_lat})"
            )));
        }

        let query = Rect::new(
            Coord { x: min_lon, y: min_lat },
            Coord { x: max_lon, y: max_lat },
        )
        .to_polygon();

        let mut codes: Vec<u32> = self
            .basins
            .iter()
            .filter(|(_, geometry)| geometry.intersects(&query))
            .map(|(code, _)| *code)
            .collect();
        codes.sort_unstable();
        codes.dedup();
        Ok(codes)
    }

    /// Point query: a bbox query with min == max.
    pub fn basin_for_point(&self, lat: f64, lng: f64) -> DelineationResult<Option<u32>> {
        Ok(self.basins_for_bbox(lng, lat, lng, lat)?.first().copied())
    }

    /// All basin codes in the layer, ascending.
    pub fn all_codes(&self) -> Vec<u32> {
        let mut codes: Vec<u32> = self.basins.iter().map(|(code, _)| *code).collect();
        codes.sort_unstable();
        codes.dedup();
        codes
    }

    /// Validate codes against the layer, returning them unchanged or an
    /// error listing every invalid one.
    pub fn validate_codes(&self, codes: &[u32]) -> DelineationResult<Vec<u32>> {
        let known = self.all_codes();
        let invalid: Vec<u32> = codes
            .iter()
            .copied()
            .filter(|code| !is_valid_pfafstetter(*code) || known.binary_search(code).is_err())
            .collect();
        if invalid.is_empty() {
            Ok(codes.to_vec())
        } else {
            Err(DelineationError::InvalidInput(format!(
                "invalid basin codes: {invalid:?}; valid codes are two digits in 1..9"
            )))
        }
    }
}
