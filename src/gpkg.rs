//! Minimal GeoPackage writing and scanning.
//!
//! A GeoPackage is a SQLite file with a small registry (gpkg_contents,
//! gpkg_geometry_columns, gpkg_spatial_ref_sys) and one table per feature
//! layer whose geometry column holds GP-header WKB blobs. Only the pieces
//! the output writer and export service need are implemented: create,
//! append, and attribute scans. Everything stays in EPSG:4326.

use std::path::Path;

use anyhow::{Context, Result, bail};
use geozero::{CoordDimensions, ToWkb};
use rusqlite::{Connection, params, params_from_iter};
use rusqlite::types::Value as SqlValue;

const WGS84_WKT: &str = "GEOGCS[\"WGS 84\",DATUM[\"WGS_1984\",\
SPHEROID[\"WGS 84\",6378137,298.257223563,AUTHORITY[\"EPSG\",\"7030\"]],\
AUTHORITY[\"EPSG\",\"6326\"]],PRIMEM[\"Greenwich\",0,\
AUTHORITY[\"EPSG\",\"8901\"]],UNIT[\"degree\",0.0174532925199433,\
AUTHORITY[\"EPSG\",\"9122\"]],AUTHORITY[\"EPSG\",\"4326\"]]";

pub struct GeoPackage {
    conn: Connection,
}

impl GeoPackage {
    /// Open a GeoPackage, creating the file and registry tables if needed.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("opening geopackage {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA application_id = 1196444487;
             PRAGMA user_version = 10300;
             CREATE TABLE IF NOT EXISTS gpkg_spatial_ref_sys (
                 srs_name TEXT NOT NULL,
                 srs_id INTEGER PRIMARY KEY,
                 organization TEXT NOT NULL,
                 organization_coordsys_id INTEGER NOT NULL,
                 definition TEXT NOT NULL,
                 description TEXT
             );
             CREATE TABLE IF NOT EXISTS gpkg_contents (
                 table_name TEXT PRIMARY KEY,
                 data_type TEXT NOT NULL,
                 identifier TEXT UNIQUE,
                 description TEXT DEFAULT '',
                 last_change DATETIME NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now')),
                 min_x DOUBLE,
                 min_y DOUBLE,
                 max_x DOUBLE,
                 max_y DOUBLE,
                 srs_id INTEGER
             );
             CREATE TABLE IF NOT EXISTS gpkg_geometry_columns (
                 table_name TEXT NOT NULL,
                 column_name TEXT NOT NULL,
                 geometry_type_name TEXT NOT NULL,
                 srs_id INTEGER NOT NULL,
                 z TINYINT NOT NULL,
                 m TINYINT NOT NULL,
                 PRIMARY KEY (table_name, column_name)
             );",
        )
        .context("initializing geopackage registry")?;

        conn.execute(
            "INSERT OR IGNORE INTO gpkg_spatial_ref_sys
             (srs_name, srs_id, organization, organization_coordsys_id, definition)
             VALUES
             ('WGS 84', 4326, 'EPSG', 4326, ?1),
             ('Undefined cartesian SRS', -1, 'NONE', -1, 'undefined'),
             ('Undefined geographic SRS', 0, 'NONE', 0, 'undefined')",
            params![WGS84_WKT],
        )
        .context("registering spatial reference systems")?;

        Ok(Self { conn })
    }

    pub fn has_layer(&self, layer: &str) -> Result<bool> {
        let count: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM gpkg_contents WHERE table_name = ?1",
                params![layer],
                |row| row.get(0),
            )
            .context("checking layer registry")?;
        Ok(count > 0)
    }

    /// Create and register a feature layer. `columns` are (name, SQL type)
    /// pairs for the attribute columns; the id and geometry columns are
    /// implicit.
    pub fn create_feature_layer(
        &self,
        layer: &str,
        geometry_type: &str,
        columns: &[(&str, &str)],
    ) -> Result<()> {
        validate_identifier(layer)?;
        let attribute_sql: String = columns
            .iter()
            .map(|(name, ty)| format!(", \"{name}\" {ty}"))
            .collect();
        self.conn
            .execute(
                &format!(
                    "CREATE TABLE IF NOT EXISTS \"{layer}\" (
                         fid INTEGER PRIMARY KEY AUTOINCREMENT,
                         geom BLOB{attribute_sql}
                     )"
                ),
                [],
            )
            .with_context(|| format!("creating layer table '{layer}'"))?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO gpkg_contents (table_name, data_type, identifier, srs_id)
                 VALUES (?1, 'features', ?1, 4326)",
                params![layer],
            )
            .context("registering layer contents")?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO gpkg_geometry_columns
                 (table_name, column_name, geometry_type_name, srs_id, z, m)
                 VALUES (?1, 'geom', ?2, 4326, 0, 0)",
                params![layer, geometry_type],
            )
            .context("registering geometry column")?;
        Ok(())
    }

    /// Append one feature. `values` must match the columns the layer was
    /// created with, in order.
    pub fn insert_feature(
        &self,
        layer: &str,
        geometry: &geo::Geometry<f64>,
        columns: &[&str],
        values: Vec<SqlValue>,
    ) -> Result<()> {
        validate_identifier(layer)?;
        let blob = geometry
            .to_gpkg_wkb(CoordDimensions::xy(), Some(4326), Vec::new())
            .map_err(|e| anyhow::anyhow!("encoding geopackage geometry: {e}"))?;

        let names: String = columns
            .iter()
            .map(|name| format!(", \"{name}\""))
            .collect();
        let placeholders: String = (0..columns.len())
            .map(|i| format!(", ?{}", i + 2))
            .collect();
        let sql =
            format!("INSERT INTO \"{layer}\" (geom{names}) VALUES (?1{placeholders})");

        let mut params: Vec<SqlValue> = Vec::with_capacity(values.len() + 1);
        params.push(SqlValue::Blob(blob));
        params.extend(values);
        self.conn
            .execute(&sql, params_from_iter(params))
            .with_context(|| format!("inserting feature into '{layer}'"))?;
        self.conn
            .execute(
                "UPDATE gpkg_contents
                 SET last_change = strftime('%Y-%m-%dT%H:%M:%fZ','now')
                 WHERE table_name = ?1",
                params![layer],
            )
            .context("touching layer contents")?;
        Ok(())
    }

    /// All values of a text column in a layer; used for resume scans.
    pub fn read_strings(&self, layer: &str, column: &str) -> Result<Vec<String>> {
        validate_identifier(layer)?;
        validate_identifier(column)?;
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT \"{column}\" FROM \"{layer}\""))
            .with_context(|| format!("scanning '{layer}'"))?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .context("reading rows")?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.context("reading row")?);
        }
        Ok(out)
    }

    pub fn feature_count(&self, layer: &str) -> Result<u64> {
        validate_identifier(layer)?;
        let count: i64 = self
            .conn
            .query_row(&format!("SELECT COUNT(*) FROM \"{layer}\""), [], |row| row.get(0))
            .context("counting features")?;
        Ok(count as u64)
    }
}

/// Layer and column names come from validated config, but a stray quote in
/// dynamic SQL would still be unrecoverable; reject anything non-trivial.
fn validate_identifier(name: &str) -> Result<()> {
    let ok = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        && name.chars().next().is_some_and(|c| c.is_ascii_alphabetic());
    if !ok {
        bail!("invalid identifier '{name}'");
    }
    Ok(())
}
