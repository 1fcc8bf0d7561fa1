//! Country attribution for delineated watersheds.
//!
//! Reverse geocoding is an external concern; the core only needs a name for
//! the outlet's country and treats every failure as "Unknown".

use std::collections::HashMap;

/// Reverse geocoder seam. Implementations may call out to an offline
/// dataset or a remote service; returning `None` is always acceptable.
pub trait CountryLookup: Send + Sync {
    fn country(&self, lat: f64, lng: f64) -> Option<String>;
}

/// Fallback name used whenever lookup fails or no provider is configured.
pub const UNKNOWN_COUNTRY: &str = "Unknown";

/// Resolve a country name, collapsing lookup failure to the fallback.
pub fn resolve_country(lookup: &dyn CountryLookup, lat: f64, lng: f64) -> String {
    lookup
        .country(lat, lng)
        .filter(|name| !name.trim().is_empty())
        .unwrap_or_else(|| UNKNOWN_COUNTRY.to_string())
}

/// Provider that never resolves; used when no geocoder is wired in.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCountryLookup;

impl CountryLookup for NoCountryLookup {
    fn country(&self, _lat: f64, _lng: f64) -> Option<String> {
        None
    }
}

/// Table-backed provider resolving by rectangular extents. Suitable for
/// tests and for small curated deployments; first matching extent wins.
#[derive(Debug, Default)]
pub struct StaticCountryLookup {
    extents: Vec<(String, [f64; 4])>,
}

impl StaticCountryLookup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a country with its (min_lon, min_lat, max_lon, max_lat)
    /// extent.
    pub fn with_extent(mut self, name: &str, extent: [f64; 4]) -> Self {
        self.extents.push((name.to_string(), extent));
        self
    }
}

impl CountryLookup for StaticCountryLookup {
    fn country(&self, lat: f64, lng: f64) -> Option<String> {
        self.extents
            .iter()
            .find(|(_, [min_lon, min_lat, max_lon, max_lat])| {
                lng >= *min_lon && lng <= *max_lon && lat >= *min_lat && lat <= *max_lat
            })
            .map(|(name, _)| name.clone())
    }
}

/// Fixed answers keyed by rounded coordinates; test helper.
#[derive(Debug, Default)]
pub struct FixedCountryLookup {
    answers: HashMap<(i64, i64), String>,
}

impl FixedCountryLookup {
    pub fn with_answer(mut self, lat: f64, lng: f64, name: &str) -> Self {
        self.answers
            .insert(((lat * 1e4) as i64, (lng * 1e4) as i64), name.to_string());
        self
    }
}

impl CountryLookup for FixedCountryLookup {
    fn country(&self, lat: f64, lng: f64) -> Option<String> {
        self.answers
            .get(&((lat * 1e4) as i64, (lng * 1e4) as i64))
            .cloned()
    }
}
