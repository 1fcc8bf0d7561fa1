//! Partitioned batch output and the failure log.
//!
//! Regional results land under a hive-style layout:
//! `<out>/REGION_NAME={region}/data_type={geopackage|shapefiles}/...`, with
//! river networks as a second GeoPackage layer or a sibling shapefile.
//! Failures from every region accumulate into one FAILED.csv at the output
//! root, written atomically at finalization.
//!
//! Shapefile attribute names are capped at 10 characters, so the writer
//! carries an explicit rename table instead of trusting a library to
//! truncate: gauge_name -> gauge_nam, snap_distance_m -> snap_dist,
//! strahler_order -> strahler, shreve_order -> shreve.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result, bail};
use rusqlite::types::Value as SqlValue;
use shapefile::dbase::{self, FieldName, FieldValue, Record, TableWriterBuilder};
use tempfile::NamedTempFile;
use tracing::{info, warn};

use crate::delineate::DelineatedWatershed;
use crate::gpkg::GeoPackage;
use crate::shp;

pub const FAILED_CSV: &str = "FAILED.csv";
const WATERSHED_LAYER: &str = "watershed";
const RIVERS_LAYER: &str = "rivers";

/// Output file format for regional results.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Geopackage,
    Shapefile,
}

impl OutputFormat {
    /// Value of the `data_type=` partition directory.
    pub fn data_type(&self) -> &'static str {
        match self {
            OutputFormat::Geopackage => "geopackage",
            OutputFormat::Shapefile => "shapefiles",
        }
    }

    /// Parse the CLI spelling ("gpkg" or "shp").
    pub fn from_cli(value: &str) -> Option<Self> {
        match value {
            "gpkg" => Some(OutputFormat::Geopackage),
            "shp" => Some(OutputFormat::Shapefile),
            _ => None,
        }
    }
}

/// How to treat an existing region file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Fail when the file already exists.
    Create,
    /// Replace any existing file.
    Overwrite,
    /// Add records to an existing file; read-concat-write for shapefiles.
    Append,
}

/// Record of a failed delineation, destined for FAILED.csv.
#[derive(Debug, Clone)]
pub struct FailedOutlet {
    pub region_name: String,
    pub gauge_id: String,
    pub lat: f64,
    pub lng: f64,
    pub error: String,
}

pub struct OutputWriter {
    output_dir: PathBuf,
    format: OutputFormat,
    include_rivers: bool,
    failed: Mutex<Vec<FailedOutlet>>,
}

impl OutputWriter {
    pub fn new(output_dir: PathBuf, format: OutputFormat, include_rivers: bool) -> Self {
        Self {
            output_dir,
            format,
            include_rivers,
            failed: Mutex::new(Vec::new()),
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    fn region_dir(&self, region: &str) -> PathBuf {
        self.output_dir
            .join(format!("REGION_NAME={region}"))
            .join(format!("data_type={}", self.format.data_type()))
    }

    /// Path of the regional record file, without creating directories.
    pub fn output_path(&self, region: &str) -> PathBuf {
        match self.format {
            OutputFormat::Geopackage => self.region_dir(region).join(format!("{region}.gpkg")),
            OutputFormat::Shapefile => {
                self.region_dir(region).join(format!("{region}_shapes.shp"))
            }
        }
    }

    fn rivers_path(&self, region: &str) -> PathBuf {
        self.region_dir(region).join(format!("{region}_rivers.shp"))
    }

    pub fn check_output_exists(&self, region: &str) -> bool {
        self.output_path(region).exists()
    }

    /// Gauge ids already present in a region's output, geometry untouched.
    /// Missing or unreadable files simply yield an empty set.
    pub fn read_existing_gauge_ids(&self, region: &str) -> HashSet<String> {
        let path = self.output_path(region);
        if !path.exists() {
            return HashSet::new();
        }
        let result = match self.format {
            OutputFormat::Geopackage => GeoPackage::open(&path)
                .and_then(|gpkg| gpkg.read_strings(WATERSHED_LAYER, "gauge_id"))
                .map(|ids| ids.into_iter().collect()),
            OutputFormat::Shapefile => read_dbf_gauge_ids(&path.with_extension("dbf")),
        };
        match result {
            Ok(ids) => {
                info!("Found {} existing gauge ids in {}", ids.len(), path.display());
                ids
            }
            Err(e) => {
                warn!("Could not read existing gauge ids from {}: {e}", path.display());
                HashSet::new()
            }
        }
    }

    /// Write a region's watersheds. Returns the record file path.
    pub fn write_region_output(
        &self,
        region: &str,
        watersheds: &[DelineatedWatershed],
        mode: WriteMode,
    ) -> Result<PathBuf> {
        if watersheds.is_empty() {
            bail!("no watersheds to write for region '{region}'");
        }
        let path = self.output_path(region);
        if mode == WriteMode::Create && path.exists() {
            bail!("output already exists for region '{region}': {}", path.display());
        }
        std::fs::create_dir_all(self.region_dir(region))
            .with_context(|| format!("creating region directory for '{region}'"))?;

        info!(
            "Writing {} watershed(s) for region '{region}' ({:?})",
            watersheds.len(),
            mode
        );

        match self.format {
            OutputFormat::Geopackage => self.write_geopackage(region, watersheds, mode)?,
            OutputFormat::Shapefile => self.write_shapefiles(region, watersheds, mode)?,
        }
        Ok(path)
    }

    fn write_geopackage(
        &self,
        region: &str,
        watersheds: &[DelineatedWatershed],
        mode: WriteMode,
    ) -> Result<()> {
        let path = self.output_path(region);
        if mode == WriteMode::Overwrite && path.exists() {
            std::fs::remove_file(&path)
                .with_context(|| format!("removing {}", path.display()))?;
        }

        let gpkg = GeoPackage::open(&path)?;
        gpkg.create_feature_layer(
            WATERSHED_LAYER,
            "MULTIPOLYGON",
            &[
                ("gauge_id", "TEXT"),
                ("gauge_name", "TEXT"),
                ("gauge_lat", "REAL"),
                ("gauge_lon", "REAL"),
                ("snap_lat", "REAL"),
                ("snap_lon", "REAL"),
                ("snap_dist", "REAL"),
                ("country", "TEXT"),
                ("area", "REAL"),
            ],
        )?;

        for ws in watersheds {
            gpkg.insert_feature(
                WATERSHED_LAYER,
                &geo::Geometry::MultiPolygon(ws.geometry.clone()),
                &[
                    "gauge_id", "gauge_name", "gauge_lat", "gauge_lon", "snap_lat",
                    "snap_lon", "snap_dist", "country", "area",
                ],
                vec![
                    SqlValue::Text(ws.gauge_id.clone()),
                    SqlValue::Text(ws.gauge_name.clone()),
                    SqlValue::Real(ws.gauge_lat),
                    SqlValue::Real(ws.gauge_lng),
                    SqlValue::Real(ws.snap_lat),
                    SqlValue::Real(ws.snap_lng),
                    SqlValue::Real(ws.snap_distance_m),
                    SqlValue::Text(ws.country.clone()),
                    SqlValue::Real(ws.area_km2),
                ],
            )?;
        }

        if self.include_rivers {
            gpkg.create_feature_layer(
                RIVERS_LAYER,
                "LINESTRING",
                &[
                    ("gauge_id", "TEXT"),
                    ("comid", "INTEGER"),
                    ("uparea", "REAL"),
                    ("strahler_order", "INTEGER"),
                    ("shreve_order", "INTEGER"),
                ],
            )?;
            for ws in watersheds {
                for segment in ws.rivers.iter().flatten() {
                    gpkg.insert_feature(
                        RIVERS_LAYER,
                        &geo::Geometry::LineString(segment.geometry.clone()),
                        &["gauge_id", "comid", "uparea", "strahler_order", "shreve_order"],
                        vec![
                            SqlValue::Text(ws.gauge_id.clone()),
                            SqlValue::Integer(segment.comid),
                            SqlValue::Real(segment.uparea),
                            SqlValue::Integer(segment.strahler_order as i64),
                            SqlValue::Integer(segment.shreve_order as i64),
                        ],
                    )?;
                }
            }
        }
        Ok(())
    }

    fn write_shapefiles(
        &self,
        region: &str,
        watersheds: &[DelineatedWatershed],
        mode: WriteMode,
    ) -> Result<()> {
        let path = self.output_path(region);

        // Shapefiles have no native append; carry existing rows forward.
        let mut existing: Vec<(shapefile::Polygon, Record)> = Vec::new();
        if mode == WriteMode::Append && path.exists() {
            existing = read_polygon_rows(&path)?;
        }

        let builder = TableWriterBuilder::new()
            .add_character_field(field_name("gauge_id"), 64)
            .add_character_field(field_name("gauge_nam"), 64)
            .add_numeric_field(field_name("gauge_lat"), 18, 8)
            .add_numeric_field(field_name("gauge_lon"), 18, 8)
            .add_numeric_field(field_name("snap_lat"), 18, 8)
            .add_numeric_field(field_name("snap_lon"), 18, 8)
            .add_numeric_field(field_name("snap_dist"), 18, 3)
            .add_character_field(field_name("country"), 50)
            .add_numeric_field(field_name("area"), 18, 3);
        let mut writer = shapefile::Writer::from_path(&path, builder)
            .with_context(|| format!("opening {}", path.display()))?;

        for (shape, record) in &existing {
            writer
                .write_shape_and_record(shape, record)
                .context("rewriting existing watershed record")?;
        }
        for ws in watersheds {
            let shape = shp::multipolygon_to_shp(&ws.geometry);
            let mut record = Record::default();
            record.insert("gauge_id".into(), character(&ws.gauge_id, 64));
            record.insert("gauge_nam".into(), character(&ws.gauge_name, 64));
            record.insert("gauge_lat".into(), FieldValue::Numeric(Some(ws.gauge_lat)));
            record.insert("gauge_lon".into(), FieldValue::Numeric(Some(ws.gauge_lng)));
            record.insert("snap_lat".into(), FieldValue::Numeric(Some(ws.snap_lat)));
            record.insert("snap_lon".into(), FieldValue::Numeric(Some(ws.snap_lng)));
            record.insert("snap_dist".into(), FieldValue::Numeric(Some(ws.snap_distance_m)));
            record.insert("country".into(), character(&ws.country, 50));
            record.insert("area".into(), FieldValue::Numeric(Some(ws.area_km2)));
            writer
                .write_shape_and_record(&shape, &record)
                .context("writing watershed record")?;
        }
        drop(writer);

        if self.include_rivers {
            self.write_rivers_shapefile(region, watersheds, mode)?;
        }
        Ok(())
    }

    fn write_rivers_shapefile(
        &self,
        region: &str,
        watersheds: &[DelineatedWatershed],
        mode: WriteMode,
    ) -> Result<()> {
        let path = self.rivers_path(region);

        let mut existing: Vec<(shapefile::Polyline, Record)> = Vec::new();
        if mode == WriteMode::Append && path.exists() {
            existing = read_polyline_rows(&path)?;
        }

        let builder = TableWriterBuilder::new()
            .add_character_field(field_name("gauge_id"), 64)
            .add_numeric_field(field_name("comid"), 12, 0)
            .add_numeric_field(field_name("uparea"), 18, 3)
            .add_numeric_field(field_name("strahler"), 6, 0)
            .add_numeric_field(field_name("shreve"), 6, 0);
        let mut writer = shapefile::Writer::from_path(&path, builder)
            .with_context(|| format!("opening {}", path.display()))?;

        for (shape, record) in &existing {
            writer
                .write_shape_and_record(shape, record)
                .context("rewriting existing river record")?;
        }
        for ws in watersheds {
            for segment in ws.rivers.iter().flatten() {
                let shape = shp::linestring_to_polyline(&segment.geometry);
                let mut record = Record::default();
                record.insert("gauge_id".into(), character(&ws.gauge_id, 64));
                record.insert("comid".into(), FieldValue::Numeric(Some(segment.comid as f64)));
                record.insert("uparea".into(), FieldValue::Numeric(Some(segment.uparea)));
                record.insert(
                    "strahler".into(),
                    FieldValue::Numeric(Some(segment.strahler_order as f64)),
                );
                record.insert(
                    "shreve".into(),
                    FieldValue::Numeric(Some(segment.shreve_order as f64)),
                );
                writer
                    .write_shape_and_record(&shape, &record)
                    .context("writing river record")?;
            }
        }
        Ok(())
    }

    /// Remember a failed outlet for FAILED.csv.
    pub fn record_failure(
        &self,
        region_name: &str,
        gauge_id: &str,
        lat: f64,
        lng: f64,
        error: &str,
    ) {
        warn!("Recorded failure for {region_name}/{gauge_id}: {error}");
        self.failed.lock().expect("failure log lock poisoned").push(FailedOutlet {
            region_name: region_name.to_string(),
            gauge_id: gauge_id.to_string(),
            lat,
            lng,
            error: error.to_string(),
        });
    }

    pub fn failure_count(&self) -> usize {
        self.failed.lock().expect("failure log lock poisoned").len()
    }

    /// Write FAILED.csv (temp file + rename). Returns its path, or None
    /// when no failures were recorded.
    pub fn finalize(&self) -> Result<Option<PathBuf>> {
        let failed = self.failed.lock().expect("failure log lock poisoned").clone();
        if failed.is_empty() {
            info!("No failures to write");
            return Ok(None);
        }

        std::fs::create_dir_all(&self.output_dir)
            .with_context(|| format!("creating {}", self.output_dir.display()))?;
        let destination = self.output_dir.join(FAILED_CSV);
        info!("Writing {} failure(s) to {}", failed.len(), destination.display());

        let mut csv_writer = csv::Writer::from_writer(Vec::new());
        csv_writer
            .write_record(["region_name", "gauge_id", "lat", "lng", "error"])
            .context("writing FAILED.csv header")?;
        for failure in &failed {
            csv_writer
                .write_record([
                    failure.region_name.as_str(),
                    failure.gauge_id.as_str(),
                    &failure.lat.to_string(),
                    &failure.lng.to_string(),
                    failure.error.as_str(),
                ])
                .context("writing FAILED.csv row")?;
        }
        let bytes = csv_writer
            .into_inner()
            .context("flushing FAILED.csv buffer")?;

        let temp = NamedTempFile::new_in(&self.output_dir)
            .context("creating temporary FAILED.csv")?;
        std::fs::write(temp.path(), &bytes).context("writing temporary FAILED.csv")?;
        temp.persist(&destination)
            .map_err(|e| anyhow::anyhow!("replacing FAILED.csv: {e}"))?;
        Ok(Some(destination))
    }

    /// Gauge ids recorded in a previous run's FAILED.csv.
    pub fn load_failed_gauge_ids(&self) -> HashSet<String> {
        let path = self.output_dir.join(FAILED_CSV);
        if !path.exists() {
            return HashSet::new();
        }
        let mut ids = HashSet::new();
        let Ok(mut reader) = csv::Reader::from_path(&path) else {
            warn!("Could not read {}", path.display());
            return ids;
        };
        let gauge_column = reader
            .headers()
            .ok()
            .and_then(|headers| headers.iter().position(|h| h == "gauge_id"));
        let Some(column) = gauge_column else { return ids };
        for record in reader.records().flatten() {
            if let Some(id) = record.get(column) {
                ids.insert(id.to_string());
            }
        }
        info!("Loaded {} failed gauge ids from {}", ids.len(), path.display());
        ids
    }
}

fn field_name(name: &str) -> FieldName {
    FieldName::try_from(name).expect("dbase field names are under 10 characters")
}

fn character(value: &str, limit: usize) -> FieldValue {
    FieldValue::Character(Some(value.chars().take(limit).collect()))
}

fn read_dbf_gauge_ids(dbf_path: &Path) -> Result<HashSet<String>> {
    let mut reader = dbase::Reader::from_path(dbf_path)
        .with_context(|| format!("opening {}", dbf_path.display()))?;
    let mut ids = HashSet::new();
    for record in reader.iter_records() {
        let record = record.context("reading dbf record")?;
        if let Some(id) = shp::character_field(&record, "gauge_id") {
            ids.insert(id);
        }
    }
    Ok(ids)
}

fn read_polygon_rows(path: &Path) -> Result<Vec<(shapefile::Polygon, Record)>> {
    let mut reader = shapefile::Reader::from_path(path)
        .with_context(|| format!("opening {}", path.display()))?;
    let mut rows = Vec::new();
    for row in reader.iter_shapes_and_records() {
        let (shape, record) = row.context("reading existing record")?;
        match shape {
            shapefile::Shape::Polygon(polygon) => rows.push((polygon, record)),
            other => bail!("unexpected shape {} in {}", other.shapetype(), path.display()),
        }
    }
    Ok(rows)
}

fn read_polyline_rows(path: &Path) -> Result<Vec<(shapefile::Polyline, Record)>> {
    let mut reader = shapefile::Reader::from_path(path)
        .with_context(|| format!("opening {}", path.display()))?;
    let mut rows = Vec::new();
    for row in reader.iter_shapes_and_records() {
        let (shape, record) = row.context("reading existing record")?;
        match shape {
            shapefile::Shape::Polyline(line) => rows.push((line, record)),
            other => bail!("unexpected shape {} in {}", other.shapetype(), path.display()),
        }
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delineate::{Resolution, RiverSegment};
    use geo::{Coord, LineString, MultiPolygon, polygon};

    fn watershed(gauge_id: &str) -> DelineatedWatershed {
        DelineatedWatershed {
            gauge_id: gauge_id.into(),
            gauge_name: format!("Gauge {gauge_id}"),
            gauge_lat: 40.0,
            gauge_lng: -105.0,
            snap_lat: 39.975,
            snap_lng: -105.0,
            snap_distance_m: 2780.0,
            country: "Unknown".into(),
            area_km2: 100.0,
            geometry: MultiPolygon::new(vec![polygon![
                (x: -105.05, y: 39.95),
                (x: -104.95, y: 39.95),
                (x: -104.95, y: 40.05),
                (x: -105.05, y: 40.05),
                (x: -105.05, y: 39.95),
            ]]),
            resolution: Resolution::LowRes,
            rivers: Some(vec![RiverSegment {
                comid: 41000001,
                uparea: 25.0,
                strahler_order: 1,
                shreve_order: 1,
                geometry: LineString::new(vec![
                    Coord { x: -105.0, y: 39.975 },
                    Coord { x: -105.0, y: 40.0 },
                ]),
            }]),
        }
    }

    #[test]
    fn test_partition_layout() {
        let writer = OutputWriter::new(PathBuf::from("/out"), OutputFormat::Geopackage, false);
        assert_eq!(
            writer.output_path("iceland"),
            PathBuf::from("/out/REGION_NAME=iceland/data_type=geopackage/iceland.gpkg")
        );
        let writer = OutputWriter::new(PathBuf::from("/out"), OutputFormat::Shapefile, false);
        assert_eq!(
            writer.output_path("iceland"),
            PathBuf::from("/out/REGION_NAME=iceland/data_type=shapefiles/iceland_shapes.shp")
        );
    }

    #[test]
    fn test_shapefile_write_and_resume_scan() {
        let dir = tempfile::tempdir().unwrap();
        let writer =
            OutputWriter::new(dir.path().to_path_buf(), OutputFormat::Shapefile, false);

        writer
            .write_region_output("test_region", &[watershed("g1"), watershed("g2")], WriteMode::Create)
            .unwrap();
        assert!(writer.check_output_exists("test_region"));

        let ids = writer.read_existing_gauge_ids("test_region");
        assert_eq!(ids.len(), 2);
        assert!(ids.contains("g1") && ids.contains("g2"));

        // Create mode refuses to clobber.
        assert!(writer
            .write_region_output("test_region", &[watershed("g3")], WriteMode::Create)
            .is_err());

        // Append keeps the original rows.
        writer
            .write_region_output("test_region", &[watershed("g3")], WriteMode::Append)
            .unwrap();
        let ids = writer.read_existing_gauge_ids("test_region");
        assert_eq!(ids.len(), 3);
        assert!(ids.contains("g3"));

        // Overwrite replaces them.
        writer
            .write_region_output("test_region", &[watershed("g9")], WriteMode::Overwrite)
            .unwrap();
        let ids = writer.read_existing_gauge_ids("test_region");
        assert_eq!(ids, HashSet::from(["g9".to_string()]));
    }

    #[test]
    fn test_geopackage_write_and_rivers_layer() {
        let dir = tempfile::tempdir().unwrap();
        let writer =
            OutputWriter::new(dir.path().to_path_buf(), OutputFormat::Geopackage, true);
        writer
            .write_region_output("basin_a", &[watershed("g1")], WriteMode::Create)
            .unwrap();
        writer
            .write_region_output("basin_a", &[watershed("g2")], WriteMode::Append)
            .unwrap();

        let gpkg = GeoPackage::open(&writer.output_path("basin_a")).unwrap();
        assert_eq!(gpkg.feature_count("watershed").unwrap(), 2);
        assert_eq!(gpkg.feature_count("rivers").unwrap(), 2);
        let ids = writer.read_existing_gauge_ids("basin_a");
        assert_eq!(ids.len(), 2);
    }

    #[test]
    fn test_rivers_sidecar_shapefile() {
        let dir = tempfile::tempdir().unwrap();
        let writer = OutputWriter::new(dir.path().to_path_buf(), OutputFormat::Shapefile, true);
        writer
            .write_region_output("r", &[watershed("g1")], WriteMode::Create)
            .unwrap();
        assert!(writer.rivers_path("r").exists());
    }

    #[test]
    fn test_failed_csv_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let writer =
            OutputWriter::new(dir.path().to_path_buf(), OutputFormat::Geopackage, false);

        assert!(writer.finalize().unwrap().is_none());

        writer.record_failure("region_a", "g1", 40.0, -105.0, "no river found");
        writer.record_failure("region_b", "g2", 41.0, -106.0, "data, with comma");
        assert_eq!(writer.failure_count(), 2);

        let path = writer.finalize().unwrap().unwrap();
        assert_eq!(path.file_name().unwrap(), FAILED_CSV);

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.starts_with("region_name,gauge_id,lat,lng,error"));

        let failed = writer.load_failed_gauge_ids();
        assert_eq!(failed, HashSet::from(["g1".to_string(), "g2".to_string()]));
    }

    #[test]
    fn test_empty_region_write_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let writer =
            OutputWriter::new(dir.path().to_path_buf(), OutputFormat::Geopackage, false);
        assert!(writer.write_region_output("r", &[], WriteMode::Create).is_err());
    }
}
