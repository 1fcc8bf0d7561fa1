//! Synthetic basin fixtures for integration tests.
//!
//! Builds small basins both in memory (for the orchestrator) and as real
//! shapefiles on disk (for the loaders and the batch driver), without any
//! real MERIT-Hydro data.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::Path;

use geo::{Coord, LineString, MultiPolygon, polygon};
use shapefile::dbase::{FieldName, FieldValue, Record, TableWriterBuilder};

use delineator::merit::{BasinData, RiverReach};
use delineator::shp;

/// Square unit catchment centred at (lng, lat).
pub fn square_catchment(center: (f64, f64), size: f64) -> MultiPolygon<f64> {
    let (cx, cy) = center;
    let half = size / 2.0;
    MultiPolygon::new(vec![polygon![
        (x: cx - half, y: cy - half),
        (x: cx + half, y: cy - half),
        (x: cx + half, y: cy + half),
        (x: cx - half, y: cy + half),
        (x: cx - half, y: cy - half),
    ]])
}

/// River reach flowing north from its downstream point.
pub fn reach(comid: i64, downstream: (f64, f64), up: [i64; 4], uparea: f64) -> RiverReach {
    let (lng, lat) = downstream;
    RiverReach {
        comid,
        up,
        uparea,
        geometry: LineString::new(vec![
            Coord { x: lng, y: lat },
            Coord { x: lng, y: lat + 0.04 },
        ]),
    }
}

pub struct FixtureBasin {
    pub basin: u32,
    pub catchments: Vec<(i64, MultiPolygon<f64>)>,
    pub rivers: Vec<RiverReach>,
}

impl FixtureBasin {
    pub fn into_basin_data(self) -> BasinData {
        let catchments: HashMap<i64, MultiPolygon<f64>> =
            self.catchments.into_iter().collect();
        let rivers: HashMap<i64, RiverReach> = self
            .rivers
            .into_iter()
            .map(|reach| (reach.comid, reach))
            .collect();
        BasinData::new(self.basin, catchments, rivers)
    }
}

/// One unit catchment, no upstream tributaries: a 0.1 degree square at
/// (-105.0, 40.0) with its outflow at (-105.0, 39.975).
pub fn single_catchment_basin() -> FixtureBasin {
    FixtureBasin {
        basin: 41,
        catchments: vec![(41000001, square_catchment((-105.0, 40.0), 0.1))],
        rivers: vec![reach(41000001, (-105.0, 39.975), [0, 0, 0, 0], 25.0)],
    }
}

/// Linear chain 41000003 -> 41000002 -> 41000001 stacked northward.
pub fn chain_basin() -> FixtureBasin {
    FixtureBasin {
        basin: 41,
        catchments: vec![
            (41000001, square_catchment((-105.0, 40.0), 0.1)),
            (41000002, square_catchment((-105.0, 40.1), 0.1)),
            (41000003, square_catchment((-105.0, 40.2), 0.1)),
        ],
        rivers: vec![
            reach(41000001, (-105.0, 39.975), [41000002, 0, 0, 0], 300.0),
            reach(41000002, (-105.0, 40.075), [41000003, 0, 0, 0], 200.0),
            reach(41000003, (-105.0, 40.175), [0, 0, 0, 0], 100.0),
        ],
    }
}

/// Y-branching: two headwaters joining at the terminal.
pub fn branched_basin() -> FixtureBasin {
    FixtureBasin {
        basin: 41,
        catchments: vec![
            (41000001, square_catchment((-105.0, 40.0), 0.1)),
            (41000002, square_catchment((-105.05, 40.1), 0.1)),
            (41000003, square_catchment((-104.95, 40.1), 0.1)),
        ],
        rivers: vec![
            reach(41000001, (-105.0, 39.975), [41000002, 41000003, 0, 0], 300.0),
            reach(41000002, (-105.05, 40.075), [0, 0, 0, 0], 100.0),
            reach(41000003, (-104.95, 40.075), [0, 0, 0, 0], 100.0),
        ],
    }
}

/// Seven reaches with two levels of confluence under one terminal.
pub fn seven_node_basin() -> FixtureBasin {
    FixtureBasin {
        basin: 41,
        catchments: vec![
            (41000001, square_catchment((-105.0, 40.0), 0.1)),
            (41000002, square_catchment((-105.1, 40.1), 0.1)),
            (41000003, square_catchment((-104.9, 40.1), 0.1)),
            (41000004, square_catchment((-105.15, 40.2), 0.1)),
            (41000005, square_catchment((-105.05, 40.2), 0.1)),
            (41000006, square_catchment((-104.95, 40.2), 0.1)),
            (41000007, square_catchment((-104.85, 40.2), 0.1)),
        ],
        rivers: vec![
            reach(41000001, (-105.0, 39.975), [41000002, 41000003, 0, 0], 700.0),
            reach(41000002, (-105.1, 40.075), [41000004, 41000005, 0, 0], 300.0),
            reach(41000003, (-104.9, 40.075), [41000006, 41000007, 0, 0], 300.0),
            reach(41000004, (-105.15, 40.175), [0, 0, 0, 0], 100.0),
            reach(41000005, (-105.05, 40.175), [0, 0, 0, 0], 100.0),
            reach(41000006, (-104.95, 40.175), [0, 0, 0, 0], 100.0),
            reach(41000007, (-104.85, 40.175), [0, 0, 0, 0], 100.0),
        ],
    }
}

/// Three disjoint single-catchment watersheds in one basin; used by the
/// batch driver tests where each outlet is independent.
pub fn three_outlet_basin() -> FixtureBasin {
    FixtureBasin {
        basin: 41,
        catchments: vec![
            (41000001, square_catchment((-105.0, 40.0), 0.1)),
            (41000002, square_catchment((-105.2, 40.0), 0.1)),
            (41000003, square_catchment((-104.8, 40.0), 0.1)),
        ],
        rivers: vec![
            reach(41000001, (-105.0, 39.975), [0, 0, 0, 0], 25.0),
            reach(41000002, (-105.2, 39.975), [0, 0, 0, 0], 25.0),
            reach(41000003, (-104.8, 39.975), [0, 0, 0, 0], 25.0),
        ],
    }
}

fn field_name(name: &str) -> FieldName {
    FieldName::try_from(name).unwrap()
}

/// Write a fixture basin as real MERIT-layout shapefiles under `data_dir`.
pub fn write_basin_fixture(data_dir: &Path, fixture: &FixtureBasin) {
    let basin = fixture.basin;

    let catchments_path = data_dir
        .join("shp")
        .join("merit_catchments")
        .join(format!("cat_pfaf_{basin}_MERIT_Hydro_v07_Basins_v01.shp"));
    std::fs::create_dir_all(catchments_path.parent().unwrap()).unwrap();
    let builder = TableWriterBuilder::new().add_numeric_field(field_name("COMID"), 12, 0);
    let mut writer = shapefile::Writer::from_path(&catchments_path, builder).unwrap();
    for (comid, geometry) in &fixture.catchments {
        let mut record = Record::default();
        record.insert("COMID".into(), FieldValue::Numeric(Some(*comid as f64)));
        writer
            .write_shape_and_record(&shp::multipolygon_to_shp(geometry), &record)
            .unwrap();
    }
    drop(writer);

    let rivers_path = data_dir
        .join("shp")
        .join("merit_rivers")
        .join(format!("riv_pfaf_{basin}_MERIT_Hydro_v07_Basins_v01.shp"));
    std::fs::create_dir_all(rivers_path.parent().unwrap()).unwrap();
    let builder = TableWriterBuilder::new()
        .add_numeric_field(field_name("COMID"), 12, 0)
        .add_numeric_field(field_name("up1"), 12, 0)
        .add_numeric_field(field_name("up2"), 12, 0)
        .add_numeric_field(field_name("up3"), 12, 0)
        .add_numeric_field(field_name("up4"), 12, 0)
        .add_numeric_field(field_name("uparea"), 18, 3);
    let mut writer = shapefile::Writer::from_path(&rivers_path, builder).unwrap();
    for river in &fixture.rivers {
        let mut record = Record::default();
        record.insert("COMID".into(), FieldValue::Numeric(Some(river.comid as f64)));
        for (i, column) in ["up1", "up2", "up3", "up4"].iter().enumerate() {
            record.insert(
                (*column).into(),
                FieldValue::Numeric(Some(river.up[i] as f64)),
            );
        }
        record.insert("uparea".into(), FieldValue::Numeric(Some(river.uparea)));
        writer
            .write_shape_and_record(&shp::linestring_to_polyline(&river.geometry), &record)
            .unwrap();
    }
}

/// Write a one-basin Level-2 index layer covering the given extent.
pub fn write_basin_index_fixture(data_dir: &Path, basin: u32, extent: [f64; 4]) {
    let path = data_dir
        .join("shp")
        .join("basins_level2")
        .join("merit_hydro_vect_level2.shp");
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    let builder = TableWriterBuilder::new().add_numeric_field(field_name("BASIN"), 4, 0);
    let mut writer = shapefile::Writer::from_path(&path, builder).unwrap();

    let [min_lon, min_lat, max_lon, max_lat] = extent;
    let boundary = MultiPolygon::new(vec![polygon![
        (x: min_lon, y: min_lat),
        (x: max_lon, y: min_lat),
        (x: max_lon, y: max_lat),
        (x: min_lon, y: max_lat),
        (x: min_lon, y: min_lat),
    ]]);
    let mut record = Record::default();
    record.insert("BASIN".into(), FieldValue::Numeric(Some(basin as f64)));
    writer
        .write_shape_and_record(&shp::multipolygon_to_shp(&boundary), &record)
        .unwrap();
}
