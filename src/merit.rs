//! MERIT-Basins vector data store.
//!
//! Each Pfafstetter Level-2 basin ships as a unit-catchment polygon layer
//! and a river-reach layer sharing COMID identifiers. Both are loaded into
//! COMID-indexed maps, with a bounding-box index over catchments for the
//! point-in-catchment join. Loaded basins are immutable and shared behind
//! `Arc`, so workers can read them without locking.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use geo::{BoundingRect, Intersects, LineString, MultiPolygon, Point};
use lru::LruCache;
use rstar::{AABB, RTree, RTreeObject};
use tracing::{debug, info};

use crate::errors::{DelineationError, DelineationResult};
use crate::shp;

/// A river reach and its upstream topology.
///
/// The line runs upstream: its first coordinate is the downstream outflow
/// point. `up` holds the COMIDs of up to four tributaries, zero meaning
/// none. `uparea` is the cumulative upstream drainage area in km².
#[derive(Debug, Clone)]
pub struct RiverReach {
    pub comid: i64,
    pub up: [i64; 4],
    pub uparea: f64,
    pub geometry: LineString<f64>,
}

impl RiverReach {
    /// Downstream outflow point as (lng, lat).
    pub fn outflow(&self) -> Option<(f64, f64)> {
        self.geometry.0.first().map(|c| (c.x, c.y))
    }
}

#[derive(Debug)]
struct CatchmentEnvelope {
    comid: i64,
    aabb: AABB<[f64; 2]>,
}

impl RTreeObject for CatchmentEnvelope {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        self.aabb
    }
}

/// Vector data for one basin, indexed by COMID.
#[derive(Debug)]
pub struct BasinData {
    pub basin: u32,
    pub catchments: HashMap<i64, MultiPolygon<f64>>,
    pub rivers: HashMap<i64, RiverReach>,
    index: RTree<CatchmentEnvelope>,
}

impl BasinData {
    pub fn new(
        basin: u32,
        catchments: HashMap<i64, MultiPolygon<f64>>,
        rivers: HashMap<i64, RiverReach>,
    ) -> Self {
        let envelopes = catchments
            .iter()
            .filter_map(|(comid, geometry)| {
                geometry.bounding_rect().map(|rect| CatchmentEnvelope {
                    comid: *comid,
                    aabb: AABB::from_corners(
                        [rect.min().x, rect.min().y],
                        [rect.max().x, rect.max().y],
                    ),
                })
            })
            .collect();
        Self {
            basin,
            catchments,
            rivers,
            index: RTree::bulk_load(envelopes),
        }
    }

    /// COMID of the unit catchment containing the point, if any.
    ///
    /// Bounding boxes narrow the candidates, then an exact intersection test
    /// decides. Candidates are checked in COMID order so boundary points
    /// resolve deterministically.
    pub fn find_catchment(&self, lat: f64, lng: f64) -> Option<i64> {
        let point = Point::new(lng, lat);
        let mut candidates: Vec<i64> = self
            .index
            .locate_in_envelope_intersecting(&AABB::from_point([lng, lat]))
            .map(|e| e.comid)
            .collect();
        candidates.sort_unstable();
        candidates
            .into_iter()
            .find(|comid| self.catchments[comid].intersects(&point))
    }
}

pub fn catchments_path(data_dir: &Path, basin: u32) -> PathBuf {
    data_dir
        .join("shp")
        .join("merit_catchments")
        .join(format!("cat_pfaf_{basin}_MERIT_Hydro_v07_Basins_v01.shp"))
}

pub fn rivers_path(data_dir: &Path, basin: u32) -> PathBuf {
    data_dir
        .join("shp")
        .join("merit_rivers")
        .join(format!("riv_pfaf_{basin}_MERIT_Hydro_v07_Basins_v01.shp"))
}

pub fn flowdir_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("raster").join("flowdir_basins")
}

pub fn accum_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("raster").join("accum_basins")
}

pub fn flowdir_path(fdir_dir: &Path, basin: u32) -> PathBuf {
    fdir_dir.join(format!("flowdir{basin}.tif"))
}

pub fn accum_path(accum_dir: &Path, basin: u32) -> PathBuf {
    accum_dir.join(format!("accum{basin}.tif"))
}

/// Load the catchment and river layers for one basin.
///
/// Missing files surface as `DataMissing`; unreadable files or layers
/// lacking the expected columns surface as `DataCorrupt`. Geometries are
/// already EPSG:4326 in MERIT-Basins.
pub fn load_basin_data(basin: u32, data_dir: &Path) -> DelineationResult<BasinData> {
    let catchments_file = catchments_path(data_dir, basin);
    let rivers_file = rivers_path(data_dir, basin);

    if !catchments_file.is_file() {
        return Err(DelineationError::DataMissing(catchments_file));
    }
    if !rivers_file.is_file() {
        return Err(DelineationError::DataMissing(rivers_file));
    }

    info!("Loading basin {basin} data");
    debug!("  catchments: {}", catchments_file.display());
    debug!("  rivers: {}", rivers_file.display());

    let corrupt =
        |path: &Path, msg: String| DelineationError::DataCorrupt(format!("{}: {msg}", path.display()));

    let mut catchments = HashMap::new();
    let mut reader = shapefile::Reader::from_path(&catchments_file)
        .map_err(|e| corrupt(&catchments_file, e.to_string()))?;
    for row in reader.iter_shapes_and_records() {
        let (shape, record) = row.map_err(|e| corrupt(&catchments_file, e.to_string()))?;
        let comid = shp::numeric_field(&record, "COMID")
            .ok_or_else(|| corrupt(&catchments_file, "missing 'COMID' column".into()))?
            as i64;
        let geometry = match shape {
            shapefile::Shape::Polygon(polygon) => shp::polygon_to_multipolygon(&polygon),
            other => {
                return Err(corrupt(
                    &catchments_file,
                    format!("expected polygons, found {}", other.shapetype()),
                ));
            }
        };
        catchments.insert(comid, geometry);
    }

    let mut rivers = HashMap::new();
    let mut reader = shapefile::Reader::from_path(&rivers_file)
        .map_err(|e| corrupt(&rivers_file, e.to_string()))?;
    for row in reader.iter_shapes_and_records() {
        let (shape, record) = row.map_err(|e| corrupt(&rivers_file, e.to_string()))?;
        let comid = shp::numeric_field(&record, "COMID")
            .ok_or_else(|| corrupt(&rivers_file, "missing 'COMID' column".into()))?
            as i64;
        let mut up = [0i64; 4];
        for (i, column) in ["up1", "up2", "up3", "up4"].iter().enumerate() {
            up[i] = shp::numeric_field(&record, column)
                .ok_or_else(|| corrupt(&rivers_file, format!("missing '{column}' column")))?
                as i64;
        }
        let uparea = shp::numeric_field(&record, "uparea")
            .ok_or_else(|| corrupt(&rivers_file, "missing 'uparea' column".into()))?;
        let geometry = match shape {
            shapefile::Shape::Polyline(line) => shp::polyline_to_linestring(&line),
            other => {
                return Err(corrupt(
                    &rivers_file,
                    format!("expected polylines, found {}", other.shapetype()),
                ));
            }
        };
        rivers.insert(comid, RiverReach { comid, up, uparea, geometry });
    }

    info!(
        "Basin {basin}: {} catchments, {} reaches",
        catchments.len(),
        rivers.len()
    );
    Ok(BasinData::new(basin, catchments, rivers))
}

/// LRU-cached basin loader used by the HTTP facade and the batch driver.
pub struct BasinDataCache {
    data_dir: PathBuf,
    cache: Mutex<LruCache<u32, Arc<BasinData>>>,
}

impl BasinDataCache {
    pub const DEFAULT_CAPACITY: usize = 5;

    pub fn new(data_dir: PathBuf, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("capacity is at least one");
        Self {
            data_dir,
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Fetch a basin, loading and evicting LRU-style on miss.
    pub fn get_or_load(&self, basin: u32) -> DelineationResult<Arc<BasinData>> {
        let mut cache = self.cache.lock().expect("basin cache lock poisoned");
        if let Some(data) = cache.get(&basin) {
            return Ok(data.clone());
        }
        let data = Arc::new(load_basin_data(basin, &self.data_dir)?);
        cache.put(basin, data.clone());
        Ok(data)
    }

    pub fn len(&self) -> usize {
        self.cache.lock().expect("basin cache lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Outcome of a data availability check.
#[derive(Debug, Default)]
pub struct DataAvailability {
    pub available_basins: Vec<u32>,
    pub missing_basins: Vec<u32>,
    pub missing_files: Vec<PathBuf>,
}

impl DataAvailability {
    pub fn all_available(&self) -> bool {
        self.missing_basins.is_empty()
    }
}

/// Files a basin needs on disk for the requested checks.
pub fn expected_files(
    basin: u32,
    data_dir: &Path,
    check_rasters: bool,
    check_vectors: bool,
) -> Vec<PathBuf> {
    let mut files = Vec::new();
    if check_rasters {
        files.push(flowdir_path(&flowdir_dir(data_dir), basin));
        files.push(accum_path(&accum_dir(data_dir), basin));
    }
    if check_vectors {
        files.push(catchments_path(data_dir, basin));
        files.push(rivers_path(data_dir, basin));
    }
    files
}

/// Check which basins have complete file sets, without opening anything.
pub fn check_data_availability(
    basins: &[u32],
    data_dir: &Path,
    check_rasters: bool,
    check_vectors: bool,
) -> DataAvailability {
    info!("Checking data availability for {} basin(s)", basins.len());

    let mut result = DataAvailability::default();
    for &basin in basins {
        let missing: Vec<PathBuf> = expected_files(basin, data_dir, check_rasters, check_vectors)
            .into_iter()
            .filter(|file| !file.exists())
            .collect();
        if missing.is_empty() {
            result.available_basins.push(basin);
        } else {
            debug!("Basin {basin}: {} missing file(s)", missing.len());
            result.missing_basins.push(basin);
            result.missing_files.extend(missing);
        }
    }

    info!(
        "Availability: {} available, {} missing",
        result.available_basins.len(),
        result.missing_basins.len()
    );
    result
}
