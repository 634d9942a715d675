// similarity.rs — Cost volume construction: fuse target cameras into
// best / second-best similarity volumes (CPU reference).
//
// For every volume cell (x, y, z) of the tile:
//
//   best[x,y,z]   = lowest cost among target cameras whose depth range covers z
//   second[x,y,z] = second lowest; equal to best when one camera covers z
//
// Cells no camera covers keep the initialization value 255 in both volumes.
//
// Processing order mirrors the GPU pipeline: fill both volumes with 255, then
// one pass per target camera applying
//
//   c < best            → second = best, best = c
//   best <= c < second  → second = c
//
// and finally copy best into second for every depth slice covered by
// exactly one camera. A tie (c == best) lands in `second`, so ties never
// open a gap between the two volumes.

use log::debug;

use crate::cost::{CameraPair, MatchingCost};
use crate::depth_list::{DepthHypothesisSet, DepthRange};
use crate::tile::Roi;
use crate::volume::{SimilarityVolume, VolumeDims, SIM_WORST};

/// Fuses per-target matching costs into a best / second-best volume pair.
pub struct CostVolumeBuilder<'a> {
    cost: &'a dyn MatchingCost,
    step_xy: u32,
}

impl<'a> CostVolumeBuilder<'a> {
    pub fn new(cost: &'a dyn MatchingCost, step_xy: u32) -> Self {
        CostVolumeBuilder { cost, step_xy: step_xy.max(1) }
    }

    /// Reset both volumes to the worst score over the active region.
    pub fn reset(best: &mut SimilarityVolume, second: &mut SimilarityVolume, dims: VolumeDims) {
        best.fill(dims, SIM_WORST);
        second.fill(dims, SIM_WORST);
    }

    /// Matching-scale reference pixel of volume cell (x, y).
    #[inline]
    pub fn rc_pixel(&self, roi_ds: &Roi, x: usize, y: usize) -> (usize, usize) {
        let step = self.step_xy as usize;
        ((roi_ds.x.begin + x) * step, (roi_ds.y.begin + y) * step)
    }

    /// Raw cost of one target camera over its depth range, cell by cell.
    pub fn for_each_cost(
        &self,
        pair: &CameraPair<'_>,
        depths: &[f32],
        range: DepthRange,
        roi_ds: &Roi,
        dims: VolumeDims,
        mut f: impl FnMut(usize, usize, usize, u32),
    ) {
        for z in range.first..range.end().min(dims.depths) {
            let depth = depths[z];
            for y in 0..dims.height {
                for x in 0..dims.width {
                    let (px, py) = self.rc_pixel(roi_ds, x, y);
                    f(x, y, z, self.cost.cost(pair, px, py, depth));
                }
            }
        }
    }

    /// Fold one target camera into the volume pair.
    pub fn accumulate(
        &self,
        best: &mut SimilarityVolume,
        second: &mut SimilarityVolume,
        pair: &CameraPair<'_>,
        depths: &[f32],
        range: DepthRange,
        roi_ds: &Roi,
        dims: VolumeDims,
    ) {
        self.for_each_cost(pair, depths, range, roi_ds, dims, |x, y, z, c| {
            let b = best.get_mut(x, y, z);
            if c < *b {
                let prev = *b;
                *b = c;
                second.set(x, y, z, prev);
            } else {
                let s = second.get_mut(x, y, z);
                if c < *s {
                    *s = c;
                }
            }
        });
    }

    /// Establish `second == best` on depth slices with a single contributor.
    pub fn finish_single_coverage(
        best: &SimilarityVolume,
        second: &mut SimilarityVolume,
        coverage: &[u32],
        dims: VolumeDims,
    ) {
        for (z, _) in coverage.iter().enumerate().take(dims.depths).filter(|(_, &c)| c == 1) {
            second.copy_slice_from(best, z, dims);
        }
    }

    /// Full fusion for one tile: reset, fold every pair in order, fix up
    /// single-coverage slices. `pairs[i]` scores with `hyps.tc_ranges()[i]`.
    pub fn build(
        &self,
        best: &mut SimilarityVolume,
        second: &mut SimilarityVolume,
        pairs: &[CameraPair<'_>],
        hyps: &DepthHypothesisSet,
        roi_ds: &Roi,
        dims: VolumeDims,
    ) {
        Self::reset(best, second, dims);
        for (i, (pair, range)) in pairs.iter().zip(hyps.tc_ranges()).enumerate() {
            debug!(
                "similarity volume: tc {} ({} / {}), depths [{}, {})",
                pair.tc.key.camera,
                i + 1,
                pairs.len(),
                range.first,
                range.end()
            );
            self.accumulate(best, second, pair, hyps.depths(), *range, roi_ds, dims);
        }
        Self::finish_single_coverage(best, second, &hyps.coverage(), dims);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CameraKey, HostCamera};
    use crate::camera::{CameraIntrinsics, CameraPose, PinholeCamera};
    use crate::image::Image;
    use crate::memory::BufferLayout;

    /// Cost that ignores geometry and returns a value derived from the
    /// target camera id and the cell, so fusion can be checked exactly.
    struct TableCost;

    impl MatchingCost for TableCost {
        fn name(&self) -> &'static str {
            "table"
        }

        fn cost(&self, pair: &CameraPair<'_>, x: usize, y: usize, depth: f32) -> u32 {
            ((pair.tc.key.camera * 37 + x * 11 + y * 5 + depth as usize * 3) % 200) as u32
        }
    }

    fn host(camera: usize) -> HostCamera {
        HostCamera {
            key: CameraKey::new(camera, 1),
            view_id: camera,
            camera: PinholeCamera::new(
                CameraIntrinsics::new(10.0, 10.0, 2.0, 2.0, 4, 4),
                CameraPose::identity(),
            ),
            image: Image::new(4, 4),
        }
    }

    #[test]
    fn test_fusion_tracks_two_lowest() {
        let dims = VolumeDims { width: 4, height: 3, depths: 5 };
        let layout = BufferLayout::new(4, 3, 5, 4);
        let mut best = SimilarityVolume::new(layout);
        let mut second = SimilarityVolume::new(layout);
        let rc = host(0);
        let tcs: Vec<HostCamera> = (1..=3).map(host).collect();
        let pairs: Vec<CameraPair> = tcs.iter().map(|tc| CameraPair::new(&rc, tc)).collect();
        let depths: Vec<f32> = (0..5).map(|z| z as f32).collect();
        let hyps = DepthHypothesisSet::new(
            depths,
            vec![DepthRange::new(0, 5), DepthRange::new(0, 3), DepthRange::new(4, 1)],
        );
        let roi = Roi::new(0, 4, 0, 3);

        let builder = CostVolumeBuilder::new(&TableCost, 1);
        builder.build(&mut best, &mut second, &pairs, &hyps, &roi, dims);

        for z in 0..5 {
            for y in 0..3 {
                for x in 0..4 {
                    let mut c: Vec<u32> = pairs
                        .iter()
                        .zip(hyps.tc_ranges())
                        .filter(|(_, r)| r.contains(z))
                        .map(|(p, _)| TableCost.cost(p, x, y, z as f32))
                        .collect();
                    c.sort_unstable();
                    let expect_second = if c.len() == 1 { c[0] } else { c[1] };
                    assert_eq!(best.get(x, y, z), c[0], "best at ({x},{y},{z})");
                    assert_eq!(second.get(x, y, z), expect_second, "second at ({x},{y},{z})");
                }
            }
        }
    }

    #[test]
    fn test_uncovered_slices_stay_worst() {
        let dims = VolumeDims { width: 2, height: 2, depths: 4 };
        let layout = BufferLayout::new(2, 2, 4, 4);
        let mut best = SimilarityVolume::new(layout);
        let mut second = SimilarityVolume::new(layout);
        best.fill(dims, 3); // stale content from a previous tile
        let rc = host(0);
        let tc = host(1);
        let pairs = [CameraPair::new(&rc, &tc)];
        let hyps = DepthHypothesisSet::new(vec![1.0, 2.0, 3.0, 4.0], vec![DepthRange::new(1, 2)]);

        CostVolumeBuilder::new(&TableCost, 1).build(
            &mut best,
            &mut second,
            &pairs,
            &hyps,
            &Roi::new(0, 2, 0, 2),
            dims,
        );
        for z in [0, 3] {
            for y in 0..2 {
                for x in 0..2 {
                    assert_eq!(best.get(x, y, z), SIM_WORST);
                    assert_eq!(second.get(x, y, z), SIM_WORST);
                }
            }
        }
        assert_eq!(best.get(1, 1, 1), second.get(1, 1, 1));
    }

    #[test]
    fn test_rc_pixel_uses_roi_and_step() {
        let builder = CostVolumeBuilder::new(&TableCost, 2);
        let roi = Roi::new(3, 10, 5, 9);
        assert_eq!(builder.rc_pixel(&roi, 0, 0), (6, 10));
        assert_eq!(builder.rc_pixel(&roi, 2, 1), (10, 12));
    }
}
