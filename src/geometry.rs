//! Polygon primitives for watershed boundary processing.
//!
//! MERIT-Basins unit catchments ship with many small topology defects, and a
//! watershed can contain thousands of them. The dissolve here therefore uses
//! a clip formulation (box around everything, clipped to the merged layer)
//! rather than a pairwise cascade over raw inputs, and every result goes
//! through a mitre-buffer repair round trip before use.

use anyhow::{Context, Result, anyhow};
use geo::{
    Area, BooleanOps, BoundingRect, Coord, Distance, Geodesic, LineString, MultiPolygon, Point,
    Polygon, Rect, SimplifyVwPreserve,
};
use proj4rs::Proj;
use proj4rs::transform::transform;

/// Merge many overlapping or touching polygons into a single boundary.
///
/// Builds a rectangle one degree larger than the total bounds of the inputs
/// and clips it against their union. The clip keeps the operation linear in
/// vertex count and tolerant of sliver defects in the source layer.
pub fn dissolve(parts: &[MultiPolygon<f64>]) -> MultiPolygon<f64> {
    let Some(bounds) = total_bounds(parts) else {
        return MultiPolygon::new(vec![]);
    };

    let rect = Rect::new(
        Coord { x: bounds.min().x - 1.0, y: bounds.min().y - 1.0 },
        Coord { x: bounds.max().x + 1.0, y: bounds.max().y + 1.0 },
    );
    let rect_mp = MultiPolygon::new(vec![rect.to_polygon()]);

    let merged = union_all(parts);
    repair(&rect_mp.intersection(&merged))
}

/// Union a set of polygons with balanced pairwise merges.
///
/// A left fold degrades to quadratic work as the accumulator grows; merging
/// halves keeps each overlay between operands of similar size.
pub fn union_all(parts: &[MultiPolygon<f64>]) -> MultiPolygon<f64> {
    match parts.len() {
        0 => MultiPolygon::new(vec![]),
        1 => parts[0].clone(),
        n => {
            let (left, right) = parts.split_at(n / 2);
            union_all(left).union(&union_all(right))
        }
    }
}

/// Offset distance of the repair round trip, in degrees.
pub const REPAIR_BUFFER_DEG: f64 = 1e-5;

/// Remove slivers, dangles, and hairline gaps from a multipolygon.
///
/// A buffer out followed by a buffer in by 1e-5 degrees, both with mitre
/// joins: gaps and holes narrower than twice the offset close during the
/// dilation and stay closed, and the erosion restores the remaining
/// boundary. Guarantees validity of the output of `dissolve`.
pub fn repair(mp: &MultiPolygon<f64>) -> MultiPolygon<f64> {
    let grown = buffer(mp, REPAIR_BUFFER_DEG);
    buffer(&grown, -REPAIR_BUFFER_DEG)
}

/// Signed polygon offset with mitre joins.
///
/// Positive distances dilate, negative distances erode; holes move opposite
/// to their shell. Rings that invert or collapse under the offset are
/// dropped, and mitre artifacts (spikes at sharp corners, crossings where a
/// neck pinches shut) are resolved through the boolean overlay, so the
/// result is always valid.
pub fn buffer(mp: &MultiPolygon<f64>, distance: f64) -> MultiPolygon<f64> {
    let mut parts: Vec<Polygon<f64>> = Vec::with_capacity(mp.0.len());
    for poly in &mp.0 {
        let Some(exterior) = offset_ring(poly.exterior(), distance) else {
            continue;
        };
        let holes: Vec<LineString<f64>> = poly
            .interiors()
            .iter()
            .filter_map(|ring| offset_ring(ring, -distance))
            .collect();
        parts.push(Polygon::new(exterior, holes));
    }
    let offset = MultiPolygon::new(parts);
    offset.union(&offset)
}

/// Offset the region enclosed by a ring by a signed distance, mitre joins.
/// Returns None when the ring degenerates or inverts under the offset.
fn offset_ring(ring: &LineString<f64>, distance: f64) -> Option<LineString<f64>> {
    // Strip the closing duplicate and zero-length edges.
    let mut points: Vec<Coord<f64>> = Vec::with_capacity(ring.0.len());
    for &coord in &ring.0 {
        if points.last() != Some(&coord) {
            points.push(coord);
        }
    }
    if points.len() > 1 && points[0] == points[points.len() - 1] {
        points.pop();
    }
    if points.len() < 3 {
        return None;
    }

    let area = signed_area(&points);
    if area.abs() < f64::EPSILON {
        return None;
    }
    // Outward normal of edge (a, b): (dy, -dx) for counter-clockwise rings,
    // negated for clockwise ones.
    let orientation = area.signum();
    let normal = |a: Coord<f64>, b: Coord<f64>| -> Coord<f64> {
        let (dx, dy) = (b.x - a.x, b.y - a.y);
        let length = (dx * dx + dy * dy).sqrt();
        Coord {
            x: orientation * dy / length,
            y: -orientation * dx / length,
        }
    };

    let n = points.len();
    let mut offset_points: Vec<Coord<f64>> = Vec::with_capacity(n + 1);
    for i in 0..n {
        let prev = points[(i + n - 1) % n];
        let curr = points[i];
        let next = points[(i + 1) % n];
        let n_prev = normal(prev, curr);
        let n_next = normal(curr, next);

        // Mitre join: the offset vertex is the intersection of the two
        // offset edges, p + d (n1 + n2) / (1 + n1·n2).
        let dot = n_prev.x * n_next.x + n_prev.y * n_next.y;
        let scale = 1.0 + dot;
        let direction = if scale.abs() < 1e-12 {
            // The boundary doubles back on itself here.
            n_prev
        } else {
            Coord {
                x: (n_prev.x + n_next.x) / scale,
                y: (n_prev.y + n_next.y) / scale,
            }
        };
        offset_points.push(Coord {
            x: curr.x + distance * direction.x,
            y: curr.y + distance * direction.y,
        });
    }

    // A ring narrower than the erosion distance crosses over itself and
    // flips orientation; drop it.
    let offset_area = signed_area(&offset_points);
    if offset_area.abs() < f64::EPSILON || offset_area.signum() != orientation {
        return None;
    }

    let first = offset_points[0];
    offset_points.push(first);
    Some(LineString::new(offset_points))
}

/// Shoelace area of a vertex list, implicitly closed.
fn signed_area(points: &[Coord<f64>]) -> f64 {
    let mut doubled = 0.0;
    for i in 0..points.len() {
        let a = points[i];
        let b = points[(i + 1) % points.len()];
        doubled += a.x * b.y - b.x * a.y;
    }
    doubled / 2.0
}

/// Remove interior rings with area at or below `area_max` square degrees.
///
/// `area_max = 0` removes every interior ring. Applied per part for
/// multipolygons.
pub fn close_holes(mp: &MultiPolygon<f64>, area_max: f64) -> MultiPolygon<f64> {
    let parts = mp
        .0
        .iter()
        .map(|poly| {
            if area_max == 0.0 {
                return Polygon::new(poly.exterior().clone(), vec![]);
            }
            let kept: Vec<LineString<f64>> = poly
                .interiors()
                .iter()
                .filter(|ring| ring_area(ring) > area_max)
                .cloned()
                .collect();
            Polygon::new(poly.exterior().clone(), kept)
        })
        .collect();
    MultiPolygon::new(parts)
}

/// Planar (unprojected) area of a single ring in square degrees.
pub fn ring_area(ring: &LineString<f64>) -> f64 {
    Polygon::new(ring.clone(), vec![]).unsigned_area()
}

/// The polygon with maximum planar area. Ties break on iteration order.
pub fn largest_part(mp: &MultiPolygon<f64>) -> Option<Polygon<f64>> {
    let mut best: Option<(f64, &Polygon<f64>)> = None;
    for poly in &mp.0 {
        let area = poly.unsigned_area();
        match best {
            Some((max, _)) if area <= max => {}
            _ => best = Some((area, poly)),
        }
    }
    best.map(|(_, poly)| poly.clone())
}

/// Bounding rectangle covering every part of every input.
pub fn total_bounds(parts: &[MultiPolygon<f64>]) -> Option<Rect<f64>> {
    parts
        .iter()
        .filter_map(|mp| mp.bounding_rect())
        .reduce(|a, b| {
            Rect::new(
                Coord { x: a.min().x.min(b.min().x), y: a.min().y.min(b.min().y) },
                Coord { x: a.max().x.max(b.max().x), y: a.max().y.max(b.max().y) },
            )
        })
}

/// Area of a polygon in km², measured in an Albers equal-area projection
/// whose standard parallels are the polygon's latitude extent.
pub fn area_km2(mp: &MultiPolygon<f64>) -> Result<f64> {
    let bounds = mp
        .bounding_rect()
        .ok_or_else(|| anyhow!("cannot measure an empty geometry"))?;

    let wgs84 = Proj::from_proj_string("+proj=longlat +ellps=WGS84 +no_defs")
        .context("building WGS84 definition")?;
    let aea = Proj::from_proj_string(&format!(
        "+proj=aea +lat_1={} +lat_2={} +lon_0=0 +x_0=0 +y_0=0 +ellps=WGS84 +units=m +no_defs",
        bounds.min().y,
        bounds.max().y
    ))
    .context("building equal-area projection")?;

    let mut total_m2 = 0.0;
    for poly in &mp.0 {
        total_m2 += projected_ring_area(poly.exterior(), &wgs84, &aea)?;
        for ring in poly.interiors() {
            total_m2 -= projected_ring_area(ring, &wgs84, &aea)?;
        }
    }
    Ok(total_m2 / 1e6)
}

fn projected_ring_area(ring: &LineString<f64>, from: &Proj, to: &Proj) -> Result<f64> {
    let mut projected: Vec<(f64, f64)> = Vec::with_capacity(ring.0.len());
    for coord in &ring.0 {
        let mut point = (coord.x.to_radians(), coord.y.to_radians(), 0.0);
        transform(from, to, &mut point).context("equal-area projection refused coordinate")?;
        projected.push((point.0, point.1));
    }
    // Shoelace; input rings are closed (first == last).
    let mut doubled = 0.0;
    for pair in projected.windows(2) {
        doubled += pair[0].0 * pair[1].1 - pair[1].0 * pair[0].1;
    }
    Ok((doubled / 2.0).abs())
}

/// WGS-84 inverse geodesic distance in meters.
pub fn geodesic_distance_m(lat1: f64, lng1: f64, lat2: f64, lng2: f64) -> f64 {
    Geodesic.distance(Point::new(lng1, lat1), Point::new(lng2, lat2))
}

/// Topology-preserving simplification used before serialization.
/// 0.001 degrees is roughly 100 m at the equator.
pub const SIMPLIFY_TOLERANCE_DEG: f64 = 0.001;

pub fn simplify_for_output(mp: &MultiPolygon<f64>) -> MultiPolygon<f64> {
    mp.simplify_vw_preserve(&SIMPLIFY_TOLERANCE_DEG)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn square(minx: f64, miny: f64, size: f64) -> Polygon<f64> {
        Rect::new(
            Coord { x: minx, y: miny },
            Coord { x: minx + size, y: miny + size },
        )
        .to_polygon()
    }

    fn donut() -> Polygon<f64> {
        let outer = square(0.0, 0.0, 10.0);
        Polygon::new(
            outer.exterior().clone(),
            vec![square(4.0, 4.0, 2.0).exterior().clone()],
        )
    }

    #[test]
    fn test_dissolve_touching_squares() {
        let parts = vec![
            MultiPolygon::new(vec![square(0.0, 0.0, 1.0)]),
            MultiPolygon::new(vec![square(1.0, 0.0, 1.0)]),
        ];
        let merged = dissolve(&parts);
        assert_eq!(merged.0.len(), 1);
        assert_relative_eq!(merged.unsigned_area(), 2.0, max_relative = 1e-9);
    }

    #[test]
    fn test_dissolve_overlapping_squares() {
        let parts = vec![
            MultiPolygon::new(vec![square(0.0, 0.0, 2.0)]),
            MultiPolygon::new(vec![square(1.0, 0.0, 2.0)]),
        ];
        let merged = dissolve(&parts);
        assert_eq!(merged.0.len(), 1);
        assert_relative_eq!(merged.unsigned_area(), 6.0, max_relative = 1e-9);
    }

    #[test]
    fn test_dissolve_empty_input() {
        assert!(dissolve(&[]).0.is_empty());
    }

    #[test]
    fn test_buffer_dilates_with_mitre_corners() {
        let mp = MultiPolygon::new(vec![square(0.0, 0.0, 10.0)]);
        // Mitre joins keep square corners sharp: 10 + 2 on each axis.
        let grown = buffer(&mp, 1.0);
        assert_eq!(grown.0.len(), 1);
        assert_relative_eq!(grown.unsigned_area(), 144.0, max_relative = 1e-9);

        let shrunk = buffer(&mp, -1.0);
        assert_relative_eq!(shrunk.unsigned_area(), 64.0, max_relative = 1e-9);
    }

    #[test]
    fn test_buffer_erosion_drops_collapsed_rings() {
        let mp = MultiPolygon::new(vec![square(0.0, 0.0, 1.0)]);
        assert!(buffer(&mp, -0.6).0.is_empty());
    }

    #[test]
    fn test_repair_round_trip_preserves_shape() {
        let mp = MultiPolygon::new(vec![square(0.0, 0.0, 10.0)]);
        let repaired = repair(&mp);
        assert_eq!(repaired.0.len(), 1);
        assert!(repaired.0[0].interiors().is_empty());
        assert_relative_eq!(repaired.unsigned_area(), 100.0, max_relative = 1e-6);
    }

    #[test]
    fn test_repair_bridges_hairline_gap() {
        // Two squares separated by less than twice the buffer distance
        // fuse during the dilation and stay fused.
        let gap = REPAIR_BUFFER_DEG / 2.0;
        let mp = MultiPolygon::new(vec![
            square(0.0, 0.0, 1.0),
            square(1.0 + gap, 0.0, 1.0),
        ]);
        let repaired = repair(&mp);
        assert_eq!(repaired.0.len(), 1);
        assert_relative_eq!(repaired.unsigned_area(), 2.0, max_relative = 1e-3);
    }

    #[test]
    fn test_repair_fills_hairline_hole() {
        let outer = square(0.0, 0.0, 1.0);
        let hole = LineString::new(vec![
            Coord { x: 0.5, y: 0.2 },
            Coord { x: 0.500001, y: 0.2 },
            Coord { x: 0.500001, y: 0.8 },
            Coord { x: 0.5, y: 0.8 },
            Coord { x: 0.5, y: 0.2 },
        ]);
        let mp =
            MultiPolygon::new(vec![Polygon::new(outer.exterior().clone(), vec![hole])]);
        let repaired = repair(&mp);
        assert_eq!(repaired.0.len(), 1);
        assert!(repaired.0[0].interiors().is_empty());
        assert_relative_eq!(repaired.unsigned_area(), 1.0, max_relative = 1e-3);
    }

    #[test]
    fn test_close_holes_removes_all_at_zero() {
        let mp = MultiPolygon::new(vec![donut()]);
        let filled = close_holes(&mp, 0.0);
        assert_eq!(filled.0.len(), 1);
        assert!(filled.0[0].interiors().is_empty());
        assert_relative_eq!(filled.unsigned_area(), 100.0, max_relative = 1e-9);
    }

    #[test]
    fn test_close_holes_respects_threshold() {
        let mp = MultiPolygon::new(vec![donut()]);
        // Hole area is 4 square degrees; a threshold below that keeps it.
        let kept = close_holes(&mp, 1.0);
        assert_eq!(kept.0[0].interiors().len(), 1);
        // A threshold at or above the hole area closes it.
        let closed = close_holes(&mp, 4.0);
        assert!(closed.0[0].interiors().is_empty());
    }

    #[test]
    fn test_largest_part() {
        let mp = MultiPolygon::new(vec![square(0.0, 0.0, 1.0), square(5.0, 5.0, 3.0)]);
        let largest = largest_part(&mp).unwrap();
        assert_relative_eq!(largest.unsigned_area(), 9.0, max_relative = 1e-9);
        assert!(largest_part(&MultiPolygon::new(vec![])).is_none());
    }

    #[test]
    fn test_area_km2_equator_degree_square() {
        // One square degree at the equator is close to 12,300 km².
        let mp = MultiPolygon::new(vec![square(0.0, 0.0, 1.0)]);
        let area = area_km2(&mp).unwrap();
        assert_relative_eq!(area, 12308.0, max_relative = 0.01);
    }

    #[test]
    fn test_area_km2_subtracts_holes() {
        let solid = area_km2(&MultiPolygon::new(vec![square(0.0, 0.0, 10.0)])).unwrap();
        let holed = area_km2(&MultiPolygon::new(vec![donut()])).unwrap();
        assert!(holed < solid);
        assert_relative_eq!(holed / solid, 0.96, max_relative = 0.01);
    }

    #[test]
    fn test_geodesic_distance_equator_degree() {
        // One degree of longitude on the WGS-84 equator.
        let d = geodesic_distance_m(0.0, 0.0, 0.0, 1.0);
        assert_relative_eq!(d, 111_319.49, max_relative = 1e-4);
        assert_eq!(geodesic_distance_m(40.0, -105.0, 40.0, -105.0), 0.0);
    }

    #[test]
    fn test_simplify_reduces_vertices() {
        // A dense circle-ish ring simplifies without collapsing.
        let pts: Vec<Coord<f64>> = (0..=360)
            .map(|deg| {
                let rad = (deg as f64).to_radians();
                Coord { x: 0.05 * rad.cos(), y: 0.05 * rad.sin() }
            })
            .collect();
        let mp = MultiPolygon::new(vec![Polygon::new(LineString::new(pts), vec![])]);
        let simplified = simplify_for_output(&mp);
        assert_eq!(simplified.0.len(), 1);
        assert!(simplified.0[0].exterior().0.len() < mp.0[0].exterior().0.len());
        assert!(simplified.unsigned_area() > 0.0);
    }
}
