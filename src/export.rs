//! Conversion of cached delineation responses into downloadable files.

use std::io::Write;

use anyhow::{Context, Result, anyhow};
use geojson::{Feature, FeatureCollection};
use geo::{LineString, MultiPolygon};
use rusqlite::types::Value as SqlValue;
use shapefile::dbase::{FieldName, FieldValue, Record, TableWriterBuilder};

use crate::gpkg::GeoPackage;
use crate::models::{
    DelineateResponse, ExportFormat, feature_f64, feature_geometry, feature_str,
};
use crate::shp;

/// A rendered export: raw bytes plus the HTTP metadata to serve them.
pub struct ExportPayload {
    pub bytes: Vec<u8>,
    pub content_type: &'static str,
    pub filename: String,
}

/// Render a response in the requested format.
pub fn export_watershed(
    response: &DelineateResponse,
    gauge_id: &str,
    format: ExportFormat,
) -> Result<ExportPayload> {
    match format {
        ExportFormat::Geojson => Ok(ExportPayload {
            bytes: export_geojson(response)?,
            content_type: "application/geo+json",
            filename: format!("{gauge_id}.geojson"),
        }),
        ExportFormat::Shapefile => Ok(ExportPayload {
            bytes: export_shapefile_zip(response, gauge_id)?,
            content_type: "application/zip",
            filename: format!("{gauge_id}.shp.zip"),
        }),
        ExportFormat::Geopackage => Ok(ExportPayload {
            bytes: export_geopackage(response)?,
            content_type: "application/geopackage+sqlite3",
            filename: format!("{gauge_id}.gpkg"),
        }),
    }
}

/// Watershed (and rivers, when present) as one GeoJSON FeatureCollection.
fn export_geojson(response: &DelineateResponse) -> Result<Vec<u8>> {
    let mut features = vec![response.watershed.clone()];
    if let Some(rivers) = &response.rivers {
        features.extend(rivers.features.iter().cloned());
    }
    let collection = FeatureCollection {
        bbox: None,
        features,
        foreign_members: None,
    };
    Ok(serde_json::to_vec(&collection).context("serializing GeoJSON export")?)
}

fn watershed_polygon(feature: &Feature) -> Result<MultiPolygon<f64>> {
    match feature_geometry(feature) {
        Some(geo::Geometry::MultiPolygon(mp)) => Ok(mp),
        Some(geo::Geometry::Polygon(p)) => Ok(MultiPolygon::new(vec![p])),
        _ => Err(anyhow!("cached watershed has no polygon geometry")),
    }
}

fn river_line(feature: &Feature) -> Option<LineString<f64>> {
    match feature_geometry(feature) {
        Some(geo::Geometry::LineString(line)) => Some(line),
        _ => None,
    }
}

fn field_name(name: &str) -> FieldName {
    FieldName::try_from(name).expect("dbase field names are under 10 characters")
}

/// Zipped shapefile bundle. Attribute names follow the writer's rename
/// table for the 10-character dbf limit.
fn export_shapefile_zip(response: &DelineateResponse, gauge_id: &str) -> Result<Vec<u8>> {
    let staging = tempfile::tempdir().context("creating export staging directory")?;
    let shp_path = staging.path().join(format!("{gauge_id}.shp"));

    let geometry = watershed_polygon(&response.watershed)?;
    let builder = TableWriterBuilder::new()
        .add_character_field(field_name("gauge_id"), 64)
        .add_numeric_field(field_name("area_km2"), 18, 3)
        .add_numeric_field(field_name("snap_lat"), 18, 8)
        .add_numeric_field(field_name("snap_lng"), 18, 8)
        .add_numeric_field(field_name("snap_dist"), 18, 3)
        .add_character_field(field_name("resolution"), 10);
    let mut writer = shapefile::Writer::from_path(&shp_path, builder)
        .context("creating export shapefile")?;

    let mut record = Record::default();
    record.insert("gauge_id".into(), FieldValue::Character(Some(gauge_id.to_string())));
    record.insert(
        "area_km2".into(),
        FieldValue::Numeric(feature_f64(&response.watershed, "area_km2")),
    );
    record.insert(
        "snap_lat".into(),
        FieldValue::Numeric(feature_f64(&response.watershed, "snap_lat")),
    );
    record.insert(
        "snap_lng".into(),
        FieldValue::Numeric(feature_f64(&response.watershed, "snap_lng")),
    );
    record.insert(
        "snap_dist".into(),
        FieldValue::Numeric(feature_f64(&response.watershed, "snap_distance_m")),
    );
    record.insert(
        "resolution".into(),
        FieldValue::Character(feature_str(&response.watershed, "resolution")),
    );
    writer
        .write_shape_and_record(&shp::multipolygon_to_shp(&geometry), &record)
        .context("writing export shapefile record")?;
    drop(writer);

    if let Some(rivers) = &response.rivers
        && !rivers.features.is_empty()
    {
        let rivers_path = staging.path().join(format!("{gauge_id}_rivers.shp"));
        let builder = TableWriterBuilder::new()
            .add_numeric_field(field_name("comid"), 12, 0)
            .add_numeric_field(field_name("uparea"), 18, 3)
            .add_numeric_field(field_name("strahler"), 6, 0)
            .add_numeric_field(field_name("shreve"), 6, 0);
        let mut writer = shapefile::Writer::from_path(&rivers_path, builder)
            .context("creating rivers export shapefile")?;
        for feature in &rivers.features {
            let Some(line) = river_line(feature) else { continue };
            let mut record = Record::default();
            record.insert("comid".into(), FieldValue::Numeric(feature_f64(feature, "comid")));
            record.insert("uparea".into(), FieldValue::Numeric(feature_f64(feature, "uparea")));
            record.insert(
                "strahler".into(),
                FieldValue::Numeric(feature_f64(feature, "strahler_order")),
            );
            record.insert(
                "shreve".into(),
                FieldValue::Numeric(feature_f64(feature, "shreve_order")),
            );
            writer
                .write_shape_and_record(&shp::linestring_to_polyline(&line), &record)
                .context("writing rivers export record")?;
        }
    }

    // Bundle every sidecar the writers produced.
    let mut cursor = std::io::Cursor::new(Vec::new());
    let mut zip = zip::ZipWriter::new(&mut cursor);
    let options = zip::write::SimpleFileOptions::default();
    let mut entries: Vec<_> = std::fs::read_dir(staging.path())
        .context("listing export staging directory")?
        .collect::<std::io::Result<Vec<_>>>()
        .context("listing export staging directory")?;
    entries.sort_by_key(|entry| entry.file_name());
    for entry in entries {
        let name = entry.file_name().to_string_lossy().into_owned();
        let bytes = std::fs::read(entry.path())
            .with_context(|| format!("reading staged file {name}"))?;
        zip.start_file(name, options).context("starting zip entry")?;
        zip.write_all(&bytes).context("writing zip entry")?;
    }
    zip.finish().context("finishing zip archive")?;
    Ok(cursor.into_inner())
}

/// Single-watershed GeoPackage: layer `watershed`, optional layer `rivers`.
fn export_geopackage(response: &DelineateResponse) -> Result<Vec<u8>> {
    let staging = tempfile::tempdir().context("creating export staging directory")?;
    let path = staging.path().join("export.gpkg");

    let gpkg = GeoPackage::open(&path)?;
    gpkg.create_feature_layer(
        "watershed",
        "MULTIPOLYGON",
        &[
            ("gauge_id", "TEXT"),
            ("area_km2", "REAL"),
            ("snap_lat", "REAL"),
            ("snap_lng", "REAL"),
            ("snap_distance_m", "REAL"),
            ("resolution", "TEXT"),
        ],
    )?;
    let geometry = watershed_polygon(&response.watershed)?;
    gpkg.insert_feature(
        "watershed",
        &geo::Geometry::MultiPolygon(geometry),
        &["gauge_id", "area_km2", "snap_lat", "snap_lng", "snap_distance_m", "resolution"],
        vec![
            SqlValue::Text(response.gauge_id.clone()),
            SqlValue::Real(feature_f64(&response.watershed, "area_km2").unwrap_or(0.0)),
            SqlValue::Real(feature_f64(&response.watershed, "snap_lat").unwrap_or(0.0)),
            SqlValue::Real(feature_f64(&response.watershed, "snap_lng").unwrap_or(0.0)),
            SqlValue::Real(feature_f64(&response.watershed, "snap_distance_m").unwrap_or(0.0)),
            SqlValue::Text(
                feature_str(&response.watershed, "resolution").unwrap_or_default(),
            ),
        ],
    )?;

    if let Some(rivers) = &response.rivers
        && !rivers.features.is_empty()
    {
        gpkg.create_feature_layer(
            "rivers",
            "LINESTRING",
            &[
                ("comid", "INTEGER"),
                ("uparea", "REAL"),
                ("strahler_order", "INTEGER"),
                ("shreve_order", "INTEGER"),
            ],
        )?;
        for feature in &rivers.features {
            let Some(line) = river_line(feature) else { continue };
            gpkg.insert_feature(
                "rivers",
                &geo::Geometry::LineString(line),
                &["comid", "uparea", "strahler_order", "shreve_order"],
                vec![
                    SqlValue::Integer(feature_f64(feature, "comid").unwrap_or(0.0) as i64),
                    SqlValue::Real(feature_f64(feature, "uparea").unwrap_or(0.0)),
                    SqlValue::Integer(
                        feature_f64(feature, "strahler_order").unwrap_or(1.0) as i64,
                    ),
                    SqlValue::Integer(feature_f64(feature, "shreve_order").unwrap_or(1.0) as i64),
                ],
            )?;
        }
    }
    drop(gpkg);

    Ok(std::fs::read(&path).context("reading rendered geopackage")?)
}
