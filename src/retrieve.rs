// retrieve.rs — Winner-take-all depth extraction from the final cost volume.
//
// For each output cell the extractor scans the cost column of the matching
// volume cell, keeps the lowest-cost hypothesis (lowest index on ties) and
// reports (depth, similarity):
//
//   similarity = cost / 127.5 - 1      ∈ [-1, 1], -1 best, 1.0 invalid (cost 255)
//
// With `DepthInterpolation::Parabolic`, an interior minimum with positive
// curvature is refined: the parabola through (c[d-1], c[d], c[d+1]) has its
// vertex at offset = 0.5·(c[d-1] - c[d+1]) / (c[d-1] - 2c[d] + c[d+1]),
// |offset| ≤ 0.5, and the depth is interpolated that fraction of the way
// toward the neighbor on the vertex side. Reported depths therefore never
// leave [min, max] of the hypotheses.
//
// GRID MAPPING
// ────────────
// The output map and the volume may live on different grids. An output cell
// (i, j) maps to the full-resolution pixel
//
//   full = (map_roi_ds.begin + i) · map_downscale
//
// and from there to the volume cell `full / vol_downscale - vol_roi_ds.begin`,
// clamped to the active volume extent.

use bytemuck::{Pod, Zeroable};

use crate::config::DepthInterpolation;
use crate::tile::Roi;
use crate::volume::{SimilarityVolume, VolumeDims, SIM_WORST};

/// One output cell: depth and similarity score.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct DepthSim {
    pub depth: f32,
    pub sim: f32,
}

/// Similarity score of a quantized cost.
#[inline]
pub fn cost_to_sim(cost: u32) -> f32 {
    cost.min(SIM_WORST) as f32 / 127.5 - 1.0
}

/// Dense per-tile depth/similarity map on a downscaled grid.
#[derive(Debug, Clone)]
pub struct DepthSimMap {
    roi: Roi,
    downscale: u32,
    width: usize,
    height: usize,
    data: Vec<DepthSim>,
}

impl DepthSimMap {
    /// Empty map with room for `capacity` cells, so reshaping for tiles up
    /// to that size never reallocates.
    pub fn with_capacity(capacity: usize) -> Self {
        DepthSimMap {
            roi: Roi::new(0, 0, 0, 0),
            downscale: 1,
            width: 0,
            height: 0,
            data: Vec::with_capacity(capacity),
        }
    }

    /// Map covering full-resolution `roi` at `downscale`.
    pub fn new(roi: Roi, downscale: u32) -> Self {
        let mut map = DepthSimMap::with_capacity(0);
        map.reshape(roi, downscale);
        map
    }

    /// Re-target the map to another region / grid; contents are reset.
    pub fn reshape(&mut self, roi: Roi, downscale: u32) {
        let ds = roi.downscaled(downscale.max(1));
        self.roi = roi;
        self.downscale = downscale.max(1);
        self.width = ds.width();
        self.height = ds.height();
        self.data.clear();
        self.data.resize(self.width * self.height, DepthSim::default());
    }

    pub fn roi(&self) -> &Roi {
        &self.roi
    }

    pub fn downscale(&self) -> u32 {
        self.downscale
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    #[inline]
    pub fn get(&self, x: usize, y: usize) -> DepthSim {
        self.data[y * self.width + x]
    }

    #[inline]
    pub fn set(&mut self, x: usize, y: usize, v: DepthSim) {
        self.data[y * self.width + x] = v;
    }

    pub fn as_slice(&self) -> &[DepthSim] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [DepthSim] {
        &mut self.data
    }

    /// Full-resolution pixel of cell (x, y).
    pub fn full_res_pixel(&self, x: usize, y: usize) -> (usize, usize) {
        let ds = self.roi.downscaled(self.downscale);
        let d = self.downscale as usize;
        ((ds.x.begin + x) * d, (ds.y.begin + y) * d)
    }

    /// Cells in row-major order with their full-resolution pixel.
    pub fn iter(&self) -> impl Iterator<Item = ((usize, usize), DepthSim)> + '_ {
        (0..self.height)
            .flat_map(move |y| (0..self.width).map(move |x| (x, y)))
            .map(move |(x, y)| (self.full_res_pixel(x, y), self.get(x, y)))
    }
}

/// Winner-take-all extractor.
#[derive(Debug, Clone, Copy, Default)]
pub struct DepthExtractor {
    pub interpolation: DepthInterpolation,
}

impl DepthExtractor {
    pub fn new(interpolation: DepthInterpolation) -> Self {
        DepthExtractor { interpolation }
    }

    /// Depth and similarity for one cost column.
    pub fn select(&self, costs: impl Fn(usize) -> u32, depths: &[f32]) -> DepthSim {
        let n = depths.len();
        let mut best_z = 0;
        let mut best = u32::MAX;
        for z in 0..n {
            let c = costs(z);
            if c < best {
                best = c;
                best_z = z;
            }
        }
        if n == 0 {
            return DepthSim { depth: 0.0, sim: 1.0 };
        }

        let mut depth = depths[best_z];
        if self.interpolation == DepthInterpolation::Parabolic && best_z > 0 && best_z + 1 < n && best < SIM_WORST {
            let c0 = costs(best_z - 1) as f32;
            let c1 = best as f32;
            let c2 = costs(best_z + 1) as f32;
            let denom = c0 - 2.0 * c1 + c2;
            if denom > 0.0 {
                let offset = (0.5 * (c0 - c2) / denom).clamp(-0.5, 0.5);
                let neighbor = if offset >= 0.0 { depths[best_z + 1] } else { depths[best_z - 1] };
                depth += offset.abs() * (neighbor - depth);
            }
        }
        DepthSim { depth, sim: cost_to_sim(best) }
    }

    /// Fill `map` from `volume`.
    ///
    /// `vol_roi` / `vol_downscale` describe the grid the volume was built
    /// on; `map` must already be shaped for its own grid.
    pub fn extract(
        &self,
        volume: &SimilarityVolume,
        dims: VolumeDims,
        vol_roi: &Roi,
        vol_downscale: u32,
        depths: &[f32],
        map: &mut DepthSimMap,
    ) {
        let n = depths.len().min(dims.depths);
        let depths = &depths[..n];
        let vol_ds = vol_roi.downscaled(vol_downscale.max(1));
        let vd = vol_downscale.max(1) as usize;
        let to_volume = |full: usize, begin: usize, extent: usize| -> usize {
            (full / vd).saturating_sub(begin).min(extent.saturating_sub(1))
        };

        for y in 0..map.height() {
            for x in 0..map.width() {
                let (fx, fy) = map.full_res_pixel(x, y);
                let vx = to_volume(fx, vol_ds.x.begin, dims.width);
                let vy = to_volume(fy, vol_ds.y.begin, dims.height);
                let v = self.select(|z| volume.get(vx, vy, z), depths);
                map.set(x, y, v);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::BufferLayout;

    #[test]
    fn test_nearest_picks_lowest_index_on_tie() {
        let costs = [50u32, 10, 30, 10];
        let depths = [1.0, 2.0, 3.0, 4.0];
        let e = DepthExtractor::new(DepthInterpolation::Nearest);
        let r = e.select(|z| costs[z], &depths);
        assert_eq!(r.depth, 2.0);
        assert!((r.sim - (10.0 / 127.5 - 1.0)).abs() < 1e-6);
    }

    #[test]
    fn test_parabolic_moves_toward_cheaper_neighbor() {
        let depths = [1.0, 2.0, 3.0];
        let e = DepthExtractor::new(DepthInterpolation::Parabolic);
        let r = e.select(|z| [60u32, 20, 40][z], &depths);
        assert!(r.depth > 2.0 && r.depth < 3.0, "{}", r.depth);
        let r = e.select(|z| [40u32, 20, 60][z], &depths);
        assert!(r.depth > 1.0 && r.depth < 2.0, "{}", r.depth);
        let r = e.select(|z| [40u32, 20, 40][z], &depths);
        assert_eq!(r.depth, 2.0);
    }

    #[test]
    fn test_parabolic_boundary_minimum_is_not_refined() {
        let depths = [1.0, 2.0, 3.0];
        let e = DepthExtractor::new(DepthInterpolation::Parabolic);
        assert_eq!(e.select(|z| [5u32, 20, 40][z], &depths).depth, 1.0);
        assert_eq!(e.select(|z| [50u32, 20, 4][z], &depths).depth, 3.0);
    }

    #[test]
    fn test_worst_cost_is_invalid() {
        let depths = [1.0, 2.0];
        let r = DepthExtractor::default().select(|_| SIM_WORST, &depths);
        assert_eq!(r.sim, 1.0);
        assert_eq!(r.depth, 1.0);
    }

    #[test]
    fn test_extract_maps_grids() {
        // Volume on a downscale-2 grid, map on downscale 4.
        let roi = Roi::new(8, 24, 4, 12);
        let vroi = roi.downscaled(2);
        let dims = VolumeDims { width: vroi.width(), height: vroi.height(), depths: 3 };
        let mut vol = SimilarityVolume::new(BufferLayout::new(dims.width, dims.height, 3, 4));
        for y in 0..dims.height {
            for x in 0..dims.width {
                // Winner index depends on x so the mapping is observable.
                for z in 0..3 {
                    vol.set(x, y, z, if z == x % 3 { 0 } else { 100 });
                }
            }
        }
        let depths = [10.0, 20.0, 30.0];
        let mut map = DepthSimMap::new(roi, 4);
        assert_eq!((map.width(), map.height()), (4, 2));
        DepthExtractor::default().extract(&vol, dims, &roi, 2, &depths, &mut map);
        for x in 0..map.width() {
            let (fx, _) = map.full_res_pixel(x, 0);
            let vx = fx / 2 - vroi.x.begin;
            assert_eq!(map.get(x, 0).depth, depths[vx % 3]);
            assert_eq!(map.get(x, 0).sim, -1.0);
        }
    }

    #[test]
    fn test_reshape_keeps_capacity() {
        let mut map = DepthSimMap::with_capacity(64);
        let cap = map.as_slice().len();
        assert_eq!(cap, 0);
        map.reshape(Roi::new(0, 16, 0, 16), 2);
        assert_eq!(map.as_slice().len(), 64);
        map.reshape(Roi::new(0, 4, 0, 4), 2);
        assert_eq!(map.as_slice().len(), 4);
        assert_eq!(map.full_res_pixel(1, 1), (2, 2));
    }
}
