//! Request/response types for the delineation API.
//!
//! Coordinate range enforcement lives in the request deserialiser, so a
//! request that parses is already valid; the facade maps parse failures to
//! the INVALID_COORDINATES wire code.

use std::str::FromStr;

use geojson::{Feature, FeatureCollection, Geometry, JsonObject, Value};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::delineate::DelineatedWatershed;
use crate::errors::DelineationError;
use crate::geometry;

/// Supported export file formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    Geojson,
    Shapefile,
    Geopackage,
}

impl FromStr for ExportFormat {
    type Err = DelineationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "geojson" => Ok(ExportFormat::Geojson),
            "shapefile" => Ok(ExportFormat::Shapefile),
            "geopackage" => Ok(ExportFormat::Geopackage),
            other => Err(DelineationError::InvalidInput(format!(
                "unsupported export format '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct RawDelineateRequest {
    gauge_id: String,
    lat: f64,
    lng: f64,
    #[serde(default)]
    force_low_res: bool,
    #[serde(default)]
    include_rivers: bool,
}

/// A validated delineation request. Range checks live in the conversion
/// from the raw form, so deserialization is the validation boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "RawDelineateRequest")]
pub struct DelineateRequest {
    pub gauge_id: String,
    pub lat: f64,
    pub lng: f64,
    pub force_low_res: bool,
    pub include_rivers: bool,
}

impl TryFrom<RawDelineateRequest> for DelineateRequest {
    type Error = String;

    fn try_from(raw: RawDelineateRequest) -> Result<Self, Self::Error> {
        if raw.gauge_id.trim().is_empty() {
            return Err("gauge_id cannot be empty".into());
        }
        if !raw.lat.is_finite() || !(-90.0..=90.0).contains(&raw.lat) {
            return Err(format!("lat: {} is not within -90..90", raw.lat));
        }
        if !raw.lng.is_finite() || !(-180.0..=180.0).contains(&raw.lng) {
            return Err(format!("lng: {} is not within -180..180", raw.lng));
        }
        Ok(Self {
            gauge_id: raw.gauge_id.trim().to_string(),
            lat: raw.lat,
            lng: raw.lng,
            force_low_res: raw.force_low_res,
            include_rivers: raw.include_rivers,
        })
    }
}

/// Success response: the watershed as a GeoJSON feature, plus the upstream
/// river network when requested.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DelineateResponse {
    pub gauge_id: String,
    pub status: String,
    pub cached: bool,
    pub watershed: Feature,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rivers: Option<FeatureCollection>,
}

/// Error response envelope shared by every endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub gauge_id: String,
    pub status: String,
    pub error_code: String,
    pub error_message: String,
}

impl ErrorResponse {
    pub fn new(gauge_id: &str, error_code: &str, error_message: String) -> Self {
        Self {
            gauge_id: gauge_id.to_string(),
            status: "error".to_string(),
            error_code: error_code.to_string(),
            error_message,
        }
    }
}

/// Convert a delineated watershed into the wire response.
///
/// The polygon is simplified topology-preserving before serialisation; the
/// simplified geometry is what the cache stores.
pub fn watershed_to_response(
    watershed: &DelineatedWatershed,
    gauge_id: &str,
    cached: bool,
) -> DelineateResponse {
    let simplified = geometry::simplify_for_output(&watershed.geometry);

    let mut properties = JsonObject::new();
    properties.insert("gauge_id".into(), json!(gauge_id));
    properties.insert("area_km2".into(), json!(watershed.area_km2));
    properties.insert("snap_lat".into(), json!(watershed.snap_lat));
    properties.insert("snap_lng".into(), json!(watershed.snap_lng));
    properties.insert("snap_distance_m".into(), json!(watershed.snap_distance_m));
    properties.insert("resolution".into(), json!(watershed.resolution.as_str()));
    properties.insert("country".into(), json!(watershed.country));

    let feature = Feature {
        bbox: None,
        geometry: Some(Geometry::new(Value::from(&simplified))),
        id: None,
        properties: Some(properties),
        foreign_members: None,
    };

    let rivers = watershed.rivers.as_ref().map(|segments| FeatureCollection {
        bbox: None,
        features: segments
            .iter()
            .map(|segment| {
                let mut properties = JsonObject::new();
                properties.insert("comid".into(), json!(segment.comid));
                properties.insert("uparea".into(), json!(segment.uparea));
                properties.insert("strahler_order".into(), json!(segment.strahler_order));
                properties.insert("shreve_order".into(), json!(segment.shreve_order));
                Feature {
                    bbox: None,
                    geometry: Some(Geometry::new(Value::from(&segment.geometry))),
                    id: None,
                    properties: Some(properties),
                    foreign_members: None,
                }
            })
            .collect(),
        foreign_members: None,
    });

    DelineateResponse {
        gauge_id: gauge_id.to_string(),
        status: "success".to_string(),
        cached,
        watershed: feature,
        rivers,
    }
}

/// Geometry of a feature as a geo type, if present and convertible.
pub fn feature_geometry(feature: &Feature) -> Option<geo::Geometry<f64>> {
    feature
        .geometry
        .as_ref()
        .and_then(|geometry| geo::Geometry::<f64>::try_from(geometry.value.clone()).ok())
}

/// Numeric property accessor for features.
pub fn feature_f64(feature: &Feature, name: &str) -> Option<f64> {
    feature
        .properties
        .as_ref()
        .and_then(|props| props.get(name))
        .and_then(|value| value.as_f64())
}

/// String property accessor for features.
pub fn feature_str(feature: &Feature, name: &str) -> Option<String> {
    feature
        .properties
        .as_ref()
        .and_then(|props| props.get(name))
        .and_then(|value| value.as_str())
        .map(|s| s.to_string())
}
