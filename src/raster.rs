//! Raster sub-delineation inside the terminal unit catchment.
//!
//! MERIT-Hydro rasters are 3-arc-second grids (1/1200 degree per pixel).
//! Only a window covering the terminal catchment is ever read; the catchment
//! polygon is rasterised into a mask and both rasters are zeroed outside it,
//! which keeps the snap step from jumping into a neighbouring watershed near
//! a confluence. From the snapped stream pixel, a reverse walk over the D8
//! flow-direction grid yields the upstream pixel set, which is traced back
//! into a polygon.

use std::collections::VecDeque;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use geo::{BoundingRect, Contains, Coord, LineString, MultiPolygon, Point, Polygon};
use georaster::geotiff::{GeoTiffReader, RasterValue};
use tracing::{debug, info, warn};

use crate::errors::{DelineationError, DelineationResult};
use crate::geometry;
use crate::merit;

/// One MERIT pixel, 3 arc-seconds.
pub const PIXEL_DEG: f64 = 1.0 / 1200.0;
/// Half a pixel; window bounds and the snap nudge are expressed with it.
pub const HALF_PIXEL_DEG: f64 = PIXEL_DEG / 2.0;

/// ESRI D8 codes, as (row offset, col offset, code) with rows growing
/// southward: {1=E, 2=SE, 4=S, 8=SW, 16=W, 32=NW, 64=N, 128=NE}.
const D8: [(i64, i64, u32); 8] = [
    (0, 1, 1),
    (1, 1, 2),
    (1, 0, 4),
    (1, -1, 8),
    (0, -1, 16),
    (-1, -1, 32),
    (-1, 0, 64),
    (-1, 1, 128),
];

fn d8_code(dr: i64, dc: i64) -> u32 {
    D8.iter()
        .find(|(r, c, _)| *r == dr && *c == dc)
        .map(|(_, _, code)| *code)
        .unwrap_or(0)
}

/// A rectangular raster subview aligned to the MERIT pixel lattice.
///
/// `west`/`north` are the outer edges of the window; cell (r, c) has its
/// centre at (west + (c + 0.5)p, north - (r + 0.5)p). Nodata is stored as 0.
#[derive(Debug, Clone)]
pub struct GridWindow {
    pub west: f64,
    pub north: f64,
    pub rows: usize,
    pub cols: usize,
    pub pixel: f64,
    pub data: Vec<f64>,
}

impl GridWindow {
    pub fn zeroed(west: f64, north: f64, rows: usize, cols: usize, pixel: f64) -> Self {
        Self {
            west,
            north,
            rows,
            cols,
            pixel,
            data: vec![0.0; rows * cols],
        }
    }

    #[inline]
    pub fn get(&self, r: usize, c: usize) -> f64 {
        self.data[r * self.cols + c]
    }

    #[inline]
    pub fn set(&mut self, r: usize, c: usize, value: f64) {
        self.data[r * self.cols + c] = value;
    }

    /// Centre coordinate of a cell as (lng, lat).
    pub fn cell_center(&self, r: usize, c: usize) -> (f64, f64) {
        (
            self.west + (c as f64 + 0.5) * self.pixel,
            self.north - (r as f64 + 0.5) * self.pixel,
        )
    }

    /// Northwest corner of a cell as (lng, lat).
    pub fn cell_corner(&self, r: usize, c: usize) -> (f64, f64) {
        (
            self.west + c as f64 * self.pixel,
            self.north - r as f64 * self.pixel,
        )
    }

    /// Zero every cell not selected by the mask.
    pub fn apply_mask(&mut self, mask: &[bool]) {
        for (value, keep) in self.data.iter_mut().zip(mask.iter()) {
            if !keep {
                *value = 0.0;
            }
        }
    }
}

/// Snap a polygon bounding box outward onto the pixel-centre lattice.
///
/// Left and bottom round down, right and top round up, each adjusted by a
/// half pixel so the raster read receives centre-of-pixel bounds rather than
/// the raw polygon bounds.
pub fn snap_window_bounds(minx: f64, miny: f64, maxx: f64, maxy: f64) -> (f64, f64, f64, f64) {
    (
        (minx * 1200.0).floor() / 1200.0 - HALF_PIXEL_DEG,
        (miny * 1200.0).floor() / 1200.0 - HALF_PIXEL_DEG,
        (maxx * 1200.0).ceil() / 1200.0 + HALF_PIXEL_DEG,
        (maxy * 1200.0).ceil() / 1200.0 + HALF_PIXEL_DEG,
    )
}

fn raster_value_to_f64(value: RasterValue) -> f64 {
    match value {
        RasterValue::U8(v) => v as f64,
        RasterValue::U16(v) => v as f64,
        RasterValue::U32(v) => v as f64,
        RasterValue::U64(v) => v as f64,
        RasterValue::I8(v) => v as f64,
        RasterValue::I16(v) => v as f64,
        RasterValue::I32(v) => v as f64,
        RasterValue::I64(v) => v as f64,
        RasterValue::F32(v) => v as f64,
        RasterValue::F64(v) => v,
        _ => 0.0,
    }
}

/// Windowed reader over one MERIT GeoTIFF.
pub struct MeritRaster {
    reader: GeoTiffReader<BufReader<File>>,
    origin: [f64; 2],
    pixel: [f64; 2],
    dimensions: (u32, u32),
}

impl std::fmt::Debug for MeritRaster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeritRaster")
            .field("origin", &self.origin)
            .field("pixel", &self.pixel)
            .field("dimensions", &self.dimensions)
            .finish()
    }
}

impl MeritRaster {
    pub fn open(path: &Path) -> DelineationResult<Self> {
        if !path.is_file() {
            return Err(DelineationError::DataMissing(path.to_path_buf()));
        }
        let file = BufReader::new(File::open(path)?);
        let reader = GeoTiffReader::open(file).map_err(|e| {
            DelineationError::DataCorrupt(format!("{}: {e}", path.display()))
        })?;
        let origin = reader.origin().ok_or_else(|| {
            DelineationError::DataCorrupt(format!("{}: no georeference origin", path.display()))
        })?;
        let pixel = reader.pixel_size().ok_or_else(|| {
            DelineationError::DataCorrupt(format!("{}: no pixel size", path.display()))
        })?;
        let dimensions = reader.image_info().dimensions.ok_or_else(|| {
            DelineationError::DataCorrupt(format!("{}: no image dimensions", path.display()))
        })?;
        if dimensions.0 == 0 || dimensions.1 == 0 {
            return Err(DelineationError::DataCorrupt(format!(
                "{}: empty raster",
                path.display()
            )));
        }
        Ok(Self { reader, origin, pixel, dimensions })
    }

    /// Read the window described by centre-lattice bounds
    /// (left, bottom, right, top), clamped to the raster extent.
    pub fn read_window(
        &mut self,
        bounds: (f64, f64, f64, f64),
    ) -> DelineationResult<GridWindow> {
        let (left, bottom, right, top) = bounds;
        let px = self.pixel[0].abs();
        let py = self.pixel[1].abs();
        let (width, height) = self.dimensions;

        // The bounds refer to centres of the edge pixels.
        let c0 = (((left - self.origin[0]) / px) - 0.5).round().max(0.0) as u32;
        let r0 = (((self.origin[1] - top) / py) - 0.5).round().max(0.0) as u32;
        let c1 = ((((right - self.origin[0]) / px) - 0.5).round().max(0.0) as u32).min(width - 1);
        let r1 = ((((self.origin[1] - bottom) / py) - 0.5).round().max(0.0) as u32)
            .min(height - 1);

        if c0 > c1 || r0 > r1 {
            return Err(DelineationError::Failed(
                "raster window does not overlap the raster extent".into(),
            ));
        }

        let cols = (c1 - c0 + 1) as usize;
        let rows = (r1 - r0 + 1) as usize;
        let mut window = GridWindow::zeroed(
            self.origin[0] + c0 as f64 * px,
            self.origin[1] - r0 as f64 * py,
            rows,
            cols,
            px,
        );

        for (x, y, value) in self.reader.pixels(c0, r0, cols as u32, rows as u32) {
            if x < c0 || y < r0 {
                continue;
            }
            let (r, c) = ((y - r0) as usize, (x - c0) as usize);
            if r < rows && c < cols {
                window.set(r, c, raster_value_to_f64(value));
            }
        }

        Ok(window)
    }
}

/// Rasterise a polygon into a byte mask over the window's cell centres.
///
/// Even-odd scanline fill; the polygon here is the terminal catchment
/// reduced to its largest part with holes closed, so only the exterior ring
/// participates.
pub fn rasterize_mask(window: &GridWindow, polygon: &Polygon<f64>) -> Vec<bool> {
    let mut mask = vec![false; window.rows * window.cols];
    let ring = polygon.exterior();
    if ring.0.len() < 4 {
        return mask;
    }

    let mut crossings: Vec<f64> = Vec::new();
    for r in 0..window.rows {
        let y = window.north - (r as f64 + 0.5) * window.pixel;
        crossings.clear();
        for edge in ring.0.windows(2) {
            let (a, b) = (edge[0], edge[1]);
            if (a.y > y) != (b.y > y) {
                crossings.push(a.x + (y - a.y) * (b.x - a.x) / (b.y - a.y));
            }
        }
        if crossings.is_empty() {
            continue;
        }
        crossings.sort_by(|a, b| a.partial_cmp(b).expect("finite crossing"));

        for c in 0..window.cols {
            let x = window.west + (c as f64 + 0.5) * window.pixel;
            let below = crossings.partition_point(|&cx| cx < x);
            if below % 2 == 1 {
                mask[r * window.cols + c] = true;
            }
        }
    }
    mask
}

/// Pixel threshold for stream snapping, from the known upstream area when
/// available, else from whether the watershed is a single unit catchment.
/// The table is a calibrated heuristic; change it and small watersheds stop
/// finding their stream.
pub fn compute_snap_threshold(upstream_area: Option<f64>, is_single_catchment: bool) -> u32 {
    match upstream_area {
        Some(area) if area < 50.0 => 300,
        Some(area) if area < 200.0 => 500,
        Some(area) if area < 1000.0 => 1000,
        Some(area) if area < 5000.0 => 2000,
        Some(_) => 5000,
        None if is_single_catchment => 500,
        None => 5000,
    }
}

/// Snap the outlet to the nearest cell whose accumulation exceeds the
/// threshold. Returns the (row, col) of the stream cell, or None when no
/// stream pixel survives the mask.
pub fn snap_to_stream(
    accum: &GridWindow,
    threshold: u32,
    lng: f64,
    lat: f64,
) -> Option<(usize, usize)> {
    let mut best: Option<(f64, (usize, usize))> = None;
    for r in 0..accum.rows {
        for c in 0..accum.cols {
            if accum.get(r, c) <= threshold as f64 {
                continue;
            }
            let (cx, cy) = accum.cell_center(r, c);
            let d2 = (cx - lng).powi(2) + (cy - lat).powi(2);
            if best.is_none_or(|(min, _)| d2 < min) {
                best = Some((d2, (r, c)));
            }
        }
    }
    best.map(|(_, cell)| cell)
}

/// All cells draining to the snap cell, the snap cell included.
///
/// Reverse D8 walk with an explicit queue: a neighbour joins when its flow
/// direction code points at a cell already in the set. The queue replaces
/// the recursion the operation is traditionally written with, so continental
/// windows cannot exhaust the stack; capacity is reserved up front.
pub fn upstream_of(fdir: &GridWindow, snap: (usize, usize)) -> Vec<bool> {
    let mut included = vec![false; fdir.rows * fdir.cols];
    let mut queue = VecDeque::with_capacity(16_384);

    included[snap.0 * fdir.cols + snap.1] = true;
    queue.push_back(snap);

    while let Some((r, c)) = queue.pop_front() {
        for (dr, dc, _) in D8 {
            let (nr, nc) = (r as i64 + dr, c as i64 + dc);
            if nr < 0 || nc < 0 || nr >= fdir.rows as i64 || nc >= fdir.cols as i64 {
                continue;
            }
            let (nr, nc) = (nr as usize, nc as usize);
            if included[nr * fdir.cols + nc] {
                continue;
            }
            // The code the neighbour must carry to flow into (r, c).
            let required = d8_code(-dr, -dc);
            if fdir.get(nr, nc) as u32 == required {
                included[nr * fdir.cols + nc] = true;
                queue.push_back((nr, nc));
            }
        }
    }

    included
}

/// Trace the boundary of a binary cell mask into polygons.
///
/// Every edge between an included cell and an excluded (or out-of-window)
/// cell becomes a directed segment with the included side on its left;
/// chained segments close into rings. Counter-clockwise rings are shells,
/// clockwise rings are holes assigned to the smallest containing shell.
pub fn polygonize(window: &GridWindow, mask: &[bool]) -> MultiPolygon<f64> {
    let cols = window.cols;
    let rows = window.rows;
    let vcols = cols + 1;
    let inside = |r: i64, c: i64| -> bool {
        r >= 0 && c >= 0 && (r as usize) < rows && (c as usize) < cols
            && mask[r as usize * cols + c as usize]
    };

    // Directed edges between vertex-grid nodes, indexed by start vertex.
    let vertex = |vr: usize, vc: usize| vr * vcols + vc;
    let mut edges: Vec<(usize, usize)> = Vec::new();
    for r in 0..rows {
        for c in 0..cols {
            if !mask[r * cols + c] {
                continue;
            }
            let (ri, ci) = (r as i64, c as i64);
            let nw = vertex(r, c);
            let ne = vertex(r, c + 1);
            let sw = vertex(r + 1, c);
            let se = vertex(r + 1, c + 1);
            if !inside(ri - 1, ci) {
                edges.push((ne, nw));
            }
            if !inside(ri + 1, ci) {
                edges.push((sw, se));
            }
            if !inside(ri, ci - 1) {
                edges.push((nw, sw));
            }
            if !inside(ri, ci + 1) {
                edges.push((se, ne));
            }
        }
    }

    let mut outgoing: std::collections::HashMap<usize, Vec<usize>> = std::collections::HashMap::new();
    for (i, (from, _)) in edges.iter().enumerate() {
        outgoing.entry(*from).or_default().push(i);
    }

    // In the vertex grid, direction from a to b: 0=E, 1=N, 2=W, 3=S.
    let direction = |from: usize, to: usize| -> usize {
        let (fr, fc) = (from / vcols, from % vcols);
        let (tr, tc) = (to / vcols, to % vcols);
        if tc > fc {
            0
        } else if tr < fr {
            1
        } else if tc < fc {
            2
        } else {
            3
        }
    };

    let mut used = vec![false; edges.len()];
    let mut rings: Vec<Vec<usize>> = Vec::new();

    for start in 0..edges.len() {
        if used[start] {
            continue;
        }
        let mut ring = vec![edges[start].0];
        let mut current = start;
        used[start] = true;

        loop {
            let (_, end) = edges[current];
            ring.push(end);
            if end == edges[start].0 {
                break;
            }
            let incoming = direction(edges[current].0, end);
            let candidates = outgoing.get(&end).map(Vec::as_slice).unwrap_or(&[]);
            // Prefer the leftmost turn so rings at pinch vertices stay simple.
            let mut next = None;
            for turn in [1usize, 0, 3, 2] {
                let want = (incoming + turn) % 4;
                if let Some(&edge) = candidates
                    .iter()
                    .find(|&&e| !used[e] && direction(edges[e].0, edges[e].1) == want)
                {
                    next = Some(edge);
                    break;
                }
            }
            let Some(next) = next else { break };
            used[next] = true;
            current = next;
        }

        if ring.len() >= 4 && ring.first() == ring.last() {
            rings.push(ring);
        }
    }

    // Vertex indices to geographic rings.
    let to_linestring = |ring: &[usize]| -> LineString<f64> {
        LineString::new(
            ring.iter()
                .map(|&v| {
                    let (vr, vc) = (v / vcols, v % vcols);
                    Coord {
                        x: window.west + vc as f64 * window.pixel,
                        y: window.north - vr as f64 * window.pixel,
                    }
                })
                .collect(),
        )
    };

    let mut shells: Vec<(Polygon<f64>, f64)> = Vec::new();
    let mut holes: Vec<LineString<f64>> = Vec::new();
    for ring in &rings {
        let line = to_linestring(ring);
        let signed = signed_ring_area(&line);
        if signed > 0.0 {
            let area = signed;
            shells.push((Polygon::new(line, vec![]), area));
        } else {
            holes.push(line);
        }
    }

    for hole in holes {
        let Some(probe) = hole.0.first().map(|c| Point::new(c.x, c.y)) else {
            continue;
        };
        // Smallest shell whose ring surrounds the hole.
        let owner = shells
            .iter_mut()
            .filter(|(shell, _)| shell.contains(&probe) || shell.exterior().contains(&probe))
            .min_by(|a, b| a.1.partial_cmp(&b.1).expect("finite area"));
        if let Some((shell, _)) = owner {
            shell.interiors_push(hole);
        }
    }

    MultiPolygon::new(shells.into_iter().map(|(shell, _)| shell).collect())
}

fn signed_ring_area(ring: &LineString<f64>) -> f64 {
    let mut doubled = 0.0;
    for pair in ring.0.windows(2) {
        doubled += pair[0].x * pair[1].y - pair[1].x * pair[0].y;
    }
    doubled / 2.0
}

/// Result of the raster sub-delineation.
///
/// Snap coordinates may be present without a polygon: snapping can succeed
/// while the fill or trace fails, and the caller still wants to report where
/// the outlet moved.
#[derive(Debug)]
pub struct SplitResult {
    pub polygon: Option<Polygon<f64>>,
    pub snap_lat: Option<f64>,
    pub snap_lng: Option<f64>,
}

impl SplitResult {
    fn empty() -> Self {
        Self { polygon: None, snap_lat: None, snap_lng: None }
    }
}

/// Pixel-scale delineation of the part of the terminal unit catchment that
/// drains to the outlet.
///
/// The windowing, masking, snapping and fill steps follow the hybrid method
/// of Djokic & Ye (1999): rasters only inside one unit catchment, vectors
/// everywhere upstream.
#[allow(clippy::too_many_arguments)]
pub fn split_catchment(
    basin: u32,
    lat: f64,
    lng: f64,
    catchment: &MultiPolygon<f64>,
    is_single_catchment: bool,
    upstream_area: Option<f64>,
    fdir_dir: &Path,
    accum_dir: &Path,
) -> DelineationResult<SplitResult> {
    // Largest part, holes closed: the mask wants one exterior ring.
    let Some(largest) = geometry::largest_part(catchment) else {
        return Ok(SplitResult::empty());
    };
    let filled = Polygon::new(largest.exterior().clone(), vec![]);
    let Some(rect) = filled.bounding_rect() else {
        return Ok(SplitResult::empty());
    };
    let window_bounds =
        snap_window_bounds(rect.min().x, rect.min().y, rect.max().x, rect.max().y);

    let fdir_file = merit::flowdir_path(fdir_dir, basin);
    info!("Loading flow direction raster from {}", fdir_file.display());
    debug!("Window bounds {window_bounds:?}");
    let mut fdir = MeritRaster::open(&fdir_file)?.read_window(window_bounds)?;

    let accum_file = merit::accum_path(accum_dir, basin);
    let mut accum = MeritRaster::open(&accum_file)?.read_window(window_bounds)?;

    // Mask both rasters to the catchment so the snap cannot escape it.
    let mask = rasterize_mask(&fdir, &filled);
    fdir.apply_mask(&mask);
    accum.apply_mask(&mask);

    let threshold = compute_snap_threshold(upstream_area, is_single_catchment);
    info!("Snapping pour point with threshold of {threshold} upstream pixels");

    let Some(snap_cell) = snap_to_stream(&accum, threshold, lng, lat) else {
        warn!("Could not snap the pour point to a stream cell");
        return Ok(SplitResult::empty());
    };

    // Corner coordinate plus the half-pixel nudge puts the reported pour
    // point on the centre of the stream pixel.
    let (corner_lng, corner_lat) = fdir.cell_corner(snap_cell.0, snap_cell.1);
    let snap_lng = corner_lng + HALF_PIXEL_DEG;
    let snap_lat = corner_lat - HALF_PIXEL_DEG;

    let upstream = upstream_of(&fdir, snap_cell);
    let shapes = polygonize(&fdir, &upstream);
    if shapes.0.is_empty() {
        warn!("Raster catchment produced no polygon");
        return Ok(SplitResult {
            polygon: None,
            snap_lat: Some(snap_lat),
            snap_lng: Some(snap_lng),
        });
    }

    // The trace can emit several disjoint shapes; keep the largest.
    let polygon = geometry::largest_part(&shapes);
    Ok(SplitResult {
        polygon,
        snap_lat: Some(snap_lat),
        snap_lng: Some(snap_lng),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use geo::{Area, polygon};

    fn window(rows: usize, cols: usize, values: &[u32]) -> GridWindow {
        let mut w = GridWindow::zeroed(-105.05, 40.05, rows, cols, PIXEL_DEG);
        for (i, v) in values.iter().enumerate() {
            w.data[i] = *v as f64;
        }
        w
    }

    #[test]
    fn test_snap_window_bounds() {
        let (left, bottom, right, top) = snap_window_bounds(-105.0504, 39.9496, -104.9496, 40.0504);
        assert!(left <= -105.0504 && left >= -105.0504 - PIXEL_DEG);
        assert!(bottom <= 39.9496);
        assert!(right >= -104.9496);
        assert!(top >= 40.0504);
        // Bounds land on the centre lattice: value * 1200 + 0.5 is integral.
        assert_relative_eq!(
            (left * 1200.0 + 0.5).round(),
            left * 1200.0 + 0.5,
            epsilon = 1e-6
        );
    }

    #[test]
    fn test_snap_threshold_table() {
        assert_eq!(compute_snap_threshold(Some(10.0), false), 300);
        assert_eq!(compute_snap_threshold(Some(50.0), false), 500);
        assert_eq!(compute_snap_threshold(Some(199.0), false), 500);
        assert_eq!(compute_snap_threshold(Some(200.0), false), 1000);
        assert_eq!(compute_snap_threshold(Some(999.9), false), 1000);
        assert_eq!(compute_snap_threshold(Some(1000.0), false), 2000);
        assert_eq!(compute_snap_threshold(Some(5000.0), false), 5000);
        assert_eq!(compute_snap_threshold(None, true), 500);
        assert_eq!(compute_snap_threshold(None, false), 5000);
    }

    #[test]
    fn test_upstream_all_flow_to_center() {
        // Every border cell points at the centre of a 3x3 grid.
        let fdir = window(
            3,
            3,
            &[
                2, 4, 8, //
                1, 0, 16, //
                128, 64, 32,
            ],
        );
        let included = upstream_of(&fdir, (1, 1));
        assert_eq!(included.iter().filter(|&&b| b).count(), 9);
    }

    #[test]
    fn test_upstream_chain() {
        // A single west-to-east chain draining to the last cell.
        let fdir = window(1, 4, &[1, 1, 1, 0]);
        let included = upstream_of(&fdir, (0, 3));
        assert_eq!(included, vec![true, true, true, true]);
    }

    #[test]
    fn test_upstream_excludes_divergent_cell() {
        // Third cell flows east away from the snap at index 1.
        let fdir = window(1, 4, &[1, 0, 1, 16]);
        let included = upstream_of(&fdir, (0, 1));
        assert_eq!(included, vec![true, true, false, false]);
    }

    #[test]
    fn test_polygonize_single_cell() {
        let w = GridWindow::zeroed(-105.0, 40.0, 1, 1, PIXEL_DEG);
        let mask = vec![true];
        let mp = polygonize(&w, &mask);
        assert_eq!(mp.0.len(), 1);
        assert_relative_eq!(
            mp.unsigned_area(),
            PIXEL_DEG * PIXEL_DEG,
            max_relative = 1e-5
        );
    }

    #[test]
    fn test_polygonize_block_with_hole() {
        // 3x3 ring of cells around an excluded centre.
        let w = GridWindow::zeroed(-105.0, 40.0, 3, 3, PIXEL_DEG);
        let mut mask = vec![true; 9];
        mask[4] = false;
        let mp = polygonize(&w, &mask);
        assert_eq!(mp.0.len(), 1);
        assert_eq!(mp.0[0].interiors().len(), 1);
        assert_relative_eq!(
            mp.unsigned_area(),
            8.0 * PIXEL_DEG * PIXEL_DEG,
            max_relative = 1e-5
        );
    }

    #[test]
    fn test_polygonize_disjoint_shapes() {
        let w = GridWindow::zeroed(-105.0, 40.0, 1, 3, PIXEL_DEG);
        let mask = vec![true, false, true];
        let mp = polygonize(&w, &mask);
        assert_eq!(mp.0.len(), 2);
    }

    #[test]
    fn test_rasterize_mask_square() {
        // A polygon covering the western two columns of a 2x4 window.
        let w = GridWindow::zeroed(0.0, 4.0 * PIXEL_DEG, 2, 4, PIXEL_DEG);
        let poly = polygon![
            (x: 0.0, y: 0.0),
            (x: 2.0 * PIXEL_DEG, y: 0.0),
            (x: 2.0 * PIXEL_DEG, y: 4.0 * PIXEL_DEG),
            (x: 0.0, y: 4.0 * PIXEL_DEG),
            (x: 0.0, y: 0.0),
        ];
        let mask = rasterize_mask(&w, &poly);
        assert_eq!(
            mask,
            vec![true, true, false, false, true, true, false, false]
        );
    }

    #[test]
    fn test_snap_to_stream_prefers_nearest() {
        // Stream column at c=2 with high accumulation.
        let mut accum = GridWindow::zeroed(0.0, 3.0 * PIXEL_DEG, 3, 3, PIXEL_DEG);
        for r in 0..3 {
            accum.set(r, 2, 1000.0);
        }
        let (lng, lat) = accum.cell_center(1, 0);
        let snapped = snap_to_stream(&accum, 500, lng, lat).unwrap();
        assert_eq!(snapped, (1, 2));
    }

    #[test]
    fn test_snap_to_stream_respects_mask() {
        let mut accum = GridWindow::zeroed(0.0, 2.0 * PIXEL_DEG, 2, 2, PIXEL_DEG);
        accum.set(0, 0, 1000.0);
        accum.set(1, 1, 1000.0);
        // Mask removes the nearer cell.
        accum.apply_mask(&[false, true, true, true]);
        let (lng, lat) = accum.cell_center(0, 0);
        let snapped = snap_to_stream(&accum, 500, lng, lat).unwrap();
        assert_eq!(snapped, (1, 1));
    }

    #[test]
    fn test_snap_to_stream_none_without_stream() {
        let accum = GridWindow::zeroed(0.0, PIXEL_DEG, 1, 1, PIXEL_DEG);
        assert!(snap_to_stream(&accum, 500, 0.0, 0.0).is_none());
    }

    #[test]
    fn test_missing_raster_is_data_missing() {
        let dir = tempfile::tempdir().unwrap();
        let err = MeritRaster::open(&dir.path().join("flowdir41.tif")).unwrap_err();
        assert!(matches!(err, DelineationError::DataMissing(_)));
    }
}
