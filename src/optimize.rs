// optimize.rs — Semi-global aggregation of the fused cost volume (CPU reference).
//
// For every directed sweep r, each line of the volume perpendicular to r is
// walked from its start endpoint. At path step i the cost of cell p is
//
//   L(p, d) = C(p, d)                                         i == 0
//   L(p, d) = C(p, d) + min( L'(d),
//                            L'(d-1) + P1,  L'(d+1) + P1,
//                            min_k L'(k) + P2 ) - min_k L'(k)  i > 0
//
// where L' is the previous cell on the same line. Neighbors outside
// [0, depths) drop out of the min. Subtracting min_k L' keeps L bounded by
// C + P2. Penalties are capped at MAX_PENALTY, so the u32 sum over the four
// sweeps cannot overflow.
//
// BUFFERS
// ───────
//   slice_a, slice_b   max_side × max_depths   previous / current L per line
//   axis               max_side × 1            min_k L' per line
//
// Even steps write slice_a and read slice_b, odd steps the reverse. The
// output volume is cleared to 0, accumulates Σ_r L_r, and is finally
// normalized to min(255, round(Σ / n_sweeps)) so extraction sees the same
// range it would without aggregation.
//
// The GPU kernel `aggregate_path` runs one workgroup per line with one
// invocation per depth and must stay in lockstep with this file.

use log::debug;

use crate::config::{SgmPenalties, SweepDirection};
use crate::memory::{HostBuffer, SgmBufferPlan};
use crate::volume::{SimilarityVolume, VolumeDims, SIM_WORST};

/// Scratch buffers of the aggregator, allocated once per engine.
#[derive(Debug, Clone)]
pub struct AggregationBuffers {
    pub slice_a: HostBuffer<u32>,
    pub slice_b: HostBuffer<u32>,
    pub axis: HostBuffer<u32>,
}

impl AggregationBuffers {
    /// Allocate the plan's slice and axis buffers; `None` when the plan has
    /// aggregation disabled.
    pub fn from_plan(plan: &SgmBufferPlan) -> Option<Self> {
        let slice = plan.slice?;
        let axis = plan.axis?;
        Some(AggregationBuffers {
            slice_a: HostBuffer::new(slice, 0),
            slice_b: HostBuffer::new(slice, 0),
            axis: HostBuffer::new(axis, 0),
        })
    }

    /// Longest path these buffers can hold.
    pub fn max_side(&self) -> usize {
        self.axis.layout().width
    }

    pub fn max_depths(&self) -> usize {
        self.slice_a.layout().height
    }
}

/// Geometry of one directed sweep over a volume.
#[derive(Debug, Clone, Copy)]
pub struct SweepGeometry {
    pub direction: SweepDirection,
    /// Number of independent paths.
    pub lines: usize,
    /// Cells per path.
    pub length: usize,
}

impl SweepGeometry {
    pub fn new(direction: SweepDirection, dims: VolumeDims) -> Self {
        let (lines, length) = if direction.is_horizontal() {
            (dims.height, dims.width)
        } else {
            (dims.width, dims.height)
        };
        SweepGeometry { direction, lines, length }
    }

    /// Volume (x, y) of step `i` on path `line`.
    #[inline]
    pub fn cell(&self, line: usize, i: usize) -> (usize, usize) {
        let along = if self.direction.is_forward() { i } else { self.length - 1 - i };
        if self.direction.is_horizontal() {
            (along, line)
        } else {
            (line, along)
        }
    }
}

/// SGM volume aggregator over a fixed set of directed sweeps.
#[derive(Debug, Clone)]
pub struct VolumeAggregator {
    penalties: SgmPenalties,
    sweeps: Vec<SweepDirection>,
}

impl VolumeAggregator {
    /// Penalties above `MAX_PENALTY` are capped.
    pub fn new(penalties: SgmPenalties, sweeps: &[SweepDirection]) -> Self {
        VolumeAggregator { penalties: penalties.clamped(), sweeps: sweeps.to_vec() }
    }

    pub fn sweeps(&self) -> &[SweepDirection] {
        &self.sweeps
    }

    /// Aggregate `input` into `output` over the active region `dims`.
    pub fn aggregate(
        &self,
        input: &SimilarityVolume,
        output: &mut SimilarityVolume,
        bufs: &mut AggregationBuffers,
        dims: VolumeDims,
    ) {
        output.fill(dims, 0);
        if self.sweeps.is_empty() {
            output.copy_from(input, dims);
            return;
        }
        for &dir in &self.sweeps {
            debug!("aggregate sweep {dir}: {}x{}x{}", dims.width, dims.height, dims.depths);
            self.sweep(SweepGeometry::new(dir, dims), input, output, bufs, dims.depths);
        }
        Self::normalize(output, dims, self.sweeps.len() as u32);
    }

    fn sweep(
        &self,
        geom: SweepGeometry,
        input: &SimilarityVolume,
        output: &mut SimilarityVolume,
        bufs: &mut AggregationBuffers,
        depths: usize,
    ) {
        let SgmPenalties { p1, p2 } = self.penalties;
        let AggregationBuffers { slice_a, slice_b, axis } = bufs;

        for i in 0..geom.length {
            let (cur, prev) = if i % 2 == 0 {
                (&mut *slice_a, &*slice_b)
            } else {
                (&mut *slice_b, &*slice_a)
            };
            for line in 0..geom.lines {
                let (x, y) = geom.cell(line, i);
                let mut line_min = u32::MAX;
                for z in 0..depths {
                    let c = input.get(x, y, z);
                    let l = if i == 0 {
                        c
                    } else {
                        let bp = axis.get(line, 0, 0);
                        let mut m = prev.get(line, z, 0).min(bp + p2);
                        if z > 0 {
                            m = m.min(prev.get(line, z - 1, 0) + p1);
                        }
                        if z + 1 < depths {
                            m = m.min(prev.get(line, z + 1, 0) + p1);
                        }
                        c + m - bp
                    };
                    cur.set(line, z, 0, l);
                    *output.get_mut(x, y, z) += l;
                    line_min = line_min.min(l);
                }
                axis.set(line, 0, 0, line_min);
            }
        }
    }

    fn normalize(output: &mut SimilarityVolume, dims: VolumeDims, n: u32) {
        for z in 0..dims.depths {
            for y in 0..dims.height {
                for x in 0..dims.width {
                    let v = output.get_mut(x, y, z);
                    *v = ((*v + n / 2) / n).min(SIM_WORST);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MatchingConfig;
    use crate::memory::BufferLayout;
    use crate::tile::TileParams;

    fn setup(w: usize, h: usize, d: usize) -> (SimilarityVolume, SimilarityVolume, AggregationBuffers, VolumeDims) {
        let cfg = MatchingConfig { scale: 1, step_xy: 1, max_depths: d, ..MatchingConfig::default() };
        let plan = SgmBufferPlan::new(TileParams { width: w, height: h }, &cfg);
        let bufs = AggregationBuffers::from_plan(&plan).unwrap();
        let layout = BufferLayout::new(w, h, d, 4);
        let mut input = SimilarityVolume::new(layout);
        // Deterministic pseudo-random costs.
        let mut s = 12345u32;
        for z in 0..d {
            for y in 0..h {
                for x in 0..w {
                    s = s.wrapping_mul(1_103_515_245).wrapping_add(12345);
                    input.set(x, y, z, (s >> 16) % 256);
                }
            }
        }
        (input, SimilarityVolume::new(layout), bufs, VolumeDims { width: w, height: h, depths: d })
    }

    fn penalties() -> SgmPenalties {
        SgmPenalties { p1: 10, p2: 100 }
    }

    #[test]
    fn test_sweep_geometry() {
        let dims = VolumeDims { width: 5, height: 3, depths: 1 };
        let g = SweepGeometry::new(SweepDirection::NegX, dims);
        assert_eq!((g.lines, g.length), (3, 5));
        assert_eq!(g.cell(2, 0), (4, 2));
        let g = SweepGeometry::new(SweepDirection::PosY, dims);
        assert_eq!((g.lines, g.length), (5, 3));
        assert_eq!(g.cell(1, 2), (1, 2));
    }

    #[test]
    fn test_start_endpoint_equals_raw_cost() {
        let (input, mut output, mut bufs, dims) = setup(7, 5, 6);
        for (dir, x0) in [(SweepDirection::PosX, 0), (SweepDirection::NegX, 6)] {
            VolumeAggregator::new(penalties(), &[dir]).aggregate(&input, &mut output, &mut bufs, dims);
            for y in 0..5 {
                for z in 0..6 {
                    assert_eq!(output.get(x0, y, z), input.get(x0, y, z), "{dir} at y={y} z={z}");
                }
            }
        }
        for (dir, y0) in [(SweepDirection::PosY, 0), (SweepDirection::NegY, 4)] {
            VolumeAggregator::new(penalties(), &[dir]).aggregate(&input, &mut output, &mut bufs, dims);
            for x in 0..7 {
                for z in 0..6 {
                    assert_eq!(output.get(x, y0, z), input.get(x, y0, z), "{dir} at x={x} z={z}");
                }
            }
        }
    }

    #[test]
    fn test_second_step_matches_recurrence() {
        let (input, mut output, mut bufs, dims) = setup(2, 1, 4);
        VolumeAggregator::new(penalties(), &[SweepDirection::PosX])
            .aggregate(&input, &mut output, &mut bufs, dims);
        let prev: Vec<u32> = input.column(0, 0, 4);
        let bp = *prev.iter().min().unwrap();
        for z in 0..4 {
            let mut m = prev[z].min(bp + 100);
            if z > 0 {
                m = m.min(prev[z - 1] + 10);
            }
            if z < 3 {
                m = m.min(prev[z + 1] + 10);
            }
            let l = input.get(1, 0, z) + m - bp;
            assert_eq!(output.get(1, 0, z), l.min(SIM_WORST));
        }
    }

    #[test]
    fn test_output_bounded_below_by_raw_cost() {
        let (input, mut output, mut bufs, dims) = setup(12, 9, 8);
        let axes = [SweepDirection::PosX, SweepDirection::NegX, SweepDirection::PosY, SweepDirection::NegY];
        VolumeAggregator::new(penalties(), &axes).aggregate(&input, &mut output, &mut bufs, dims);
        // Every path cost is C plus a non-negative transition term.
        for (o, c) in output.to_packed(dims).iter().zip(input.to_packed(dims)) {
            assert!(*o <= SIM_WORST);
            assert!(*o >= c, "aggregated {o} below raw {c}");
        }
    }

    #[test]
    fn test_constant_volume_is_fixed_point() {
        let (_, mut output, mut bufs, dims) = setup(6, 6, 5);
        let mut input = SimilarityVolume::new(*output.layout());
        input.fill(dims, 42);
        VolumeAggregator::new(penalties(), &[SweepDirection::PosX, SweepDirection::PosY])
            .aggregate(&input, &mut output, &mut bufs, dims);
        assert!(output.to_packed(dims).iter().all(|&c| c == 42));
    }
}
