//! Conversions between shapefile shapes/records and geo types.

use geo::{Coord, LineString, MultiPolygon, Polygon};
use shapefile::dbase::{FieldValue, Record};
use shapefile::{Point, PolygonRing, Polyline};

/// Convert a shapefile polygon into a geo MultiPolygon.
///
/// Shapefiles store rings as a flat list where each outer ring is followed
/// by its holes; ring roles are explicit in the shapefile crate.
pub fn polygon_to_multipolygon(shape: &shapefile::Polygon) -> MultiPolygon<f64> {
    fn ring_to_linestring(points: &[Point]) -> LineString<f64> {
        let mut coords: Vec<Coord<f64>> =
            points.iter().map(|p| Coord { x: p.x, y: p.y }).collect();
        if let (Some(first), Some(last)) = (coords.first().copied(), coords.last().copied())
            && first != last
        {
            coords.push(first);
        }
        LineString::new(coords)
    }

    let mut polys: Vec<Polygon<f64>> = Vec::new();
    let mut exterior: Option<LineString<f64>> = None;
    let mut holes: Vec<LineString<f64>> = Vec::new();

    for ring in shape.rings() {
        match ring {
            PolygonRing::Outer(points) => {
                if let Some(ext) = exterior.take() {
                    polys.push(Polygon::new(ext, std::mem::take(&mut holes)));
                }
                exterior = Some(ring_to_linestring(points));
            }
            PolygonRing::Inner(points) => holes.push(ring_to_linestring(points)),
        }
    }
    if let Some(ext) = exterior {
        polys.push(Polygon::new(ext, holes));
    }

    MultiPolygon::new(polys)
}

/// Convert a geo MultiPolygon into a shapefile polygon.
///
/// Shapefile convention is clockwise outer rings and counter-clockwise
/// holes; orientation is corrected here rather than trusted from the input.
pub fn multipolygon_to_shp(mp: &MultiPolygon<f64>) -> shapefile::Polygon {
    fn signed_area(points: &[Point]) -> f64 {
        let mut doubled = 0.0;
        for pair in points.windows(2) {
            doubled += pair[0].x * pair[1].y - pair[1].x * pair[0].y;
        }
        doubled / 2.0
    }

    fn ring_points(ring: &LineString<f64>) -> Vec<Point> {
        let mut points: Vec<Point> =
            ring.0.iter().map(|c| Point { x: c.x, y: c.y }).collect();
        if let (Some(&first), Some(&last)) = (points.first(), points.last())
            && (first.x != last.x || first.y != last.y)
        {
            points.push(first);
        }
        points
    }

    let mut rings: Vec<PolygonRing<Point>> = Vec::new();
    for poly in &mp.0 {
        let mut outer = ring_points(poly.exterior());
        if signed_area(&outer) > 0.0 {
            outer.reverse();
        }
        rings.push(PolygonRing::Outer(outer));

        for hole in poly.interiors() {
            let mut inner = ring_points(hole);
            if signed_area(&inner) < 0.0 {
                inner.reverse();
            }
            rings.push(PolygonRing::Inner(inner));
        }
    }

    shapefile::Polygon::with_rings(rings)
}

/// First part of a polyline as a geo LineString. MERIT river reaches are
/// single-part; extra parts are ignored.
pub fn polyline_to_linestring(shape: &Polyline) -> LineString<f64> {
    let coords = shape
        .parts()
        .first()
        .map(|part| {
            part.iter()
                .map(|p| Coord { x: p.x, y: p.y })
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();
    LineString::new(coords)
}

pub fn linestring_to_polyline(line: &LineString<f64>) -> Polyline {
    let points: Vec<Point> = line.0.iter().map(|c| Point { x: c.x, y: c.y }).collect();
    Polyline::new(points)
}

/// Numeric attribute, accepting any of the dbase numeric encodings.
pub fn numeric_field(record: &Record, name: &str) -> Option<f64> {
    match record.get(name) {
        Some(FieldValue::Numeric(Some(n))) => Some(*n),
        Some(FieldValue::Float(Some(f))) => Some(*f as f64),
        Some(FieldValue::Integer(i)) => Some(*i as f64),
        Some(FieldValue::Double(d)) => Some(*d),
        Some(FieldValue::Character(Some(s))) => s.trim().parse().ok(),
        _ => None,
    }
}

pub fn character_field(record: &Record, name: &str) -> Option<String> {
    match record.get(name) {
        Some(FieldValue::Character(Some(s))) => Some(s.trim().to_string()),
        Some(FieldValue::Numeric(Some(n))) => Some(n.to_string()),
        _ => None,
    }
}
