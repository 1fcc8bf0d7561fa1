//! End-to-end delineation scenarios over synthetic basins.
//!
//! These run the full orchestrator in vector-only mode, so no raster files
//! are required; the raster path is covered by unit tests on its pieces.

mod common;

use std::path::Path;

use geo::{Contains, Point};

use delineator::country::FixedCountryLookup;
use delineator::delineate::{DelineateOptions, Resolution, delineate_outlet};
use delineator::errors::DelineationError;
use delineator::geometry;

fn low_res_options() -> DelineateOptions {
    DelineateOptions {
        use_high_res: false,
        ..DelineateOptions::default()
    }
}

fn no_country() -> delineator::country::NoCountryLookup {
    delineator::country::NoCountryLookup
}

#[test]
fn test_single_catchment_low_res() {
    let basin = common::single_catchment_basin().into_basin_data();
    let options = DelineateOptions { include_rivers: true, ..low_res_options() };

    let watershed = delineate_outlet(
        "gauge_1",
        40.0,
        -105.0,
        "Boulder Creek",
        &basin,
        Path::new("/nonexistent/fdir"),
        Path::new("/nonexistent/accum"),
        &options,
        &no_country(),
    )
    .unwrap();

    assert_eq!(watershed.gauge_id, "gauge_1");
    assert_eq!(watershed.gauge_name, "Boulder Creek");
    assert_eq!(watershed.resolution, Resolution::LowRes);
    assert!(!watershed.geometry.0.is_empty());

    // A 0.1 degree square at 40N is close to 95 km².
    assert!(
        watershed.area_km2 > 80.0 && watershed.area_km2 < 110.0,
        "area was {}",
        watershed.area_km2
    );

    // Snap point is the downstream end of the terminal reach.
    assert_eq!(watershed.snap_lat, 39.975);
    assert_eq!(watershed.snap_lng, -105.0);

    // Snap distance matches the geodesic between original and snapped.
    let expected = geometry::geodesic_distance_m(40.0, -105.0, 39.975, -105.0);
    assert!((watershed.snap_distance_m - expected).abs() < 1.0);
    assert!(watershed.snap_distance_m > 2000.0 && watershed.snap_distance_m < 3500.0);

    // The watershed contains its own snapped outlet.
    assert!(watershed
        .geometry
        .contains(&Point::new(watershed.snap_lng, watershed.snap_lat)));

    // Exactly one contributing reach.
    let rivers = watershed.rivers.unwrap();
    assert_eq!(rivers.len(), 1);
    assert_eq!(rivers[0].comid, 41000001);
    assert_eq!(rivers[0].uparea, 25.0);
}

#[test]
fn test_chain_low_res() {
    let basin = common::chain_basin().into_basin_data();
    let options = DelineateOptions { include_rivers: true, ..low_res_options() };

    let watershed = delineate_outlet(
        "chain",
        40.0,
        -105.0,
        "",
        &basin,
        Path::new("/nonexistent/fdir"),
        Path::new("/nonexistent/accum"),
        &options,
        &no_country(),
    )
    .unwrap();

    // All three catchments dissolve into one boundary three squares tall.
    let rivers = watershed.rivers.as_ref().unwrap();
    assert_eq!(rivers.len(), 3);
    assert_eq!(watershed.geometry.0.len(), 1);
    assert!(
        watershed.area_km2 > 250.0 && watershed.area_km2 < 320.0,
        "area was {}",
        watershed.area_km2
    );
    assert_eq!((watershed.snap_lng, watershed.snap_lat), (-105.0, 39.975));

    // No confluences anywhere in a chain.
    for river in rivers {
        assert_eq!(river.strahler_order, 1);
        assert_eq!(river.shreve_order, 1);
    }
}

#[test]
fn test_branched_orders() {
    let basin = common::branched_basin().into_basin_data();
    let options = DelineateOptions { include_rivers: true, ..low_res_options() };

    let watershed = delineate_outlet(
        "branched",
        40.0,
        -105.0,
        "",
        &basin,
        Path::new("/nonexistent/fdir"),
        Path::new("/nonexistent/accum"),
        &options,
        &no_country(),
    )
    .unwrap();

    let rivers = watershed.rivers.unwrap();
    assert_eq!(rivers.len(), 3);
    let terminal = rivers.iter().find(|r| r.comid == 41000001).unwrap();
    assert_eq!(terminal.strahler_order, 2);
    assert_eq!(terminal.shreve_order, 2);
}

#[test]
fn test_seven_node_orders() {
    let basin = common::seven_node_basin().into_basin_data();
    let options = DelineateOptions { include_rivers: true, ..low_res_options() };

    let watershed = delineate_outlet(
        "seven",
        40.0,
        -105.0,
        "",
        &basin,
        Path::new("/nonexistent/fdir"),
        Path::new("/nonexistent/accum"),
        &options,
        &no_country(),
    )
    .unwrap();

    let rivers = watershed.rivers.unwrap();
    assert_eq!(rivers.len(), 7);
    let terminal = rivers.iter().find(|r| r.comid == 41000001).unwrap();
    assert_eq!(terminal.strahler_order, 3);
    assert_eq!(terminal.shreve_order, 4);
}

#[test]
fn test_outlet_outside_basin_is_no_river_found() {
    let basin = common::single_catchment_basin().into_basin_data();

    let err = delineate_outlet(
        "nowhere",
        0.0,
        0.0,
        "",
        &basin,
        Path::new("/nonexistent/fdir"),
        Path::new("/nonexistent/accum"),
        &low_res_options(),
        &no_country(),
    )
    .unwrap_err();

    assert!(matches!(err, DelineationError::NoRiverFound { .. }));
    assert_eq!(err.error_code(), "NO_RIVER_FOUND");
}

#[test]
fn test_country_lookup_and_fallback() {
    let basin = common::single_catchment_basin().into_basin_data();
    let lookup = FixedCountryLookup::default().with_answer(40.0, -105.0, "United States");

    let watershed = delineate_outlet(
        "g",
        40.0,
        -105.0,
        "",
        &basin,
        Path::new("/nonexistent/fdir"),
        Path::new("/nonexistent/accum"),
        &low_res_options(),
        &lookup,
    )
    .unwrap();
    assert_eq!(watershed.country, "United States");

    let basin = common::single_catchment_basin().into_basin_data();
    let watershed = delineate_outlet(
        "g",
        40.0,
        -105.0,
        "",
        &basin,
        Path::new("/nonexistent/fdir"),
        Path::new("/nonexistent/accum"),
        &low_res_options(),
        &no_country(),
    )
    .unwrap();
    assert_eq!(watershed.country, "Unknown");
}

#[test]
fn test_high_res_without_rasters_is_data_missing() {
    // With high-res requested and a small upstream area, the orchestrator
    // must reach for the flow-direction raster and fail cleanly without it.
    let basin = common::single_catchment_basin().into_basin_data();

    let err = delineate_outlet(
        "g",
        40.0,
        -105.0,
        "",
        &basin,
        Path::new("/nonexistent/fdir"),
        Path::new("/nonexistent/accum"),
        &DelineateOptions::default(),
        &no_country(),
    )
    .unwrap_err();

    assert!(matches!(err, DelineationError::DataMissing(_)));
    assert_eq!(err.error_code(), "NO_DATA_AVAILABLE");
}

#[test]
fn test_area_limit_demotes_to_low_res() {
    // Terminal uparea of 300 km² with a 200 km² limit forces low-res even
    // though high-res was requested, so no rasters are touched.
    let basin = common::chain_basin().into_basin_data();
    let options = DelineateOptions {
        use_high_res: true,
        high_res_area_limit_km2: 200.0,
        ..DelineateOptions::default()
    };

    let watershed = delineate_outlet(
        "g",
        40.0,
        -105.0,
        "",
        &basin,
        Path::new("/nonexistent/fdir"),
        Path::new("/nonexistent/accum"),
        &options,
        &no_country(),
    )
    .unwrap();
    assert_eq!(watershed.resolution, Resolution::LowRes);
}
