// tests/test_optimize.rs — SGM aggregation of a fused cost volume.

use mvsgm::config::{SgmPenalties, MAX_PENALTY};
use mvsgm::memory::BufferLayout;
use mvsgm::optimize::{AggregationBuffers, SweepGeometry, VolumeAggregator};
use mvsgm::retrieve::DepthExtractor;
use mvsgm::volume::{SimilarityVolume, VolumeDims, SIM_WORST};
use mvsgm::{FilteringAxes, MatchingConfig, SgmBufferPlan, SweepDirection, TileParams};

const PENALTIES: SgmPenalties = SgmPenalties { p1: 10, p2: 100 };

fn buffers(w: usize, h: usize, d: usize) -> AggregationBuffers {
    let cfg = MatchingConfig { scale: 1, step_xy: 1, max_depths: d, ..MatchingConfig::default() };
    let plan = SgmBufferPlan::new(TileParams { width: w, height: h }, &cfg);
    AggregationBuffers::from_plan(&plan).unwrap()
}

fn volume(dims: VolumeDims, f: impl Fn(usize, usize, usize) -> u32) -> SimilarityVolume {
    let mut v = SimilarityVolume::new(BufferLayout::new(dims.width, dims.height, dims.depths, 4));
    for z in 0..dims.depths {
        for y in 0..dims.height {
            for x in 0..dims.width {
                v.set(x, y, z, f(x, y, z));
            }
        }
    }
    v
}

fn noise(x: usize, y: usize, z: usize) -> u32 {
    let mut h = (x as u32).wrapping_mul(73_856_093) ^ (y as u32).wrapping_mul(19_349_663) ^ (z as u32).wrapping_mul(83_492_791);
    h ^= h >> 13;
    h = h.wrapping_mul(0x5bd1_e995);
    h ^= h >> 15;
    h % 256
}

// ===== Path geometry =====

#[test]
fn sweep_geometry_covers_every_cell_once() {
    let dims = VolumeDims { width: 5, height: 3, depths: 1 };
    for dir in [SweepDirection::PosX, SweepDirection::NegX, SweepDirection::PosY, SweepDirection::NegY] {
        let g = SweepGeometry::new(dir, dims);
        let mut seen = vec![0; 15];
        for line in 0..g.lines {
            for i in 0..g.length {
                let (x, y) = g.cell(line, i);
                seen[y * 5 + x] += 1;
            }
        }
        assert!(seen.iter().all(|&n| n == 1), "{dir}: {seen:?}");
    }
}

// ===== Aggregation =====

#[test]
fn single_sweep_path_start_is_raw_cost() {
    // "+X" alone: the first column of every row is the raw cost.
    let dims = VolumeDims { width: 12, height: 7, depths: 9 };
    let input = volume(dims, noise);
    let mut out = SimilarityVolume::new(*input.layout());
    let mut bufs = buffers(12, 7, 9);
    let axes: FilteringAxes = "+X".parse().unwrap();
    VolumeAggregator::new(PENALTIES, axes.sweeps()).aggregate(&input, &mut out, &mut bufs, dims);

    for y in 0..dims.height {
        for z in 0..dims.depths {
            assert_eq!(out.get(0, y, z), input.get(0, y, z), "(0,{y},{z})");
        }
    }
}

#[test]
fn constant_volume_is_fixed_point() {
    let dims = VolumeDims { width: 10, height: 6, depths: 5 };
    let input = volume(dims, |_, _, _| 42);
    let mut out = SimilarityVolume::new(*input.layout());
    let mut bufs = buffers(10, 6, 5);
    VolumeAggregator::new(PENALTIES, FilteringAxes::default().sweeps()).aggregate(&input, &mut out, &mut bufs, dims);
    assert!(out.to_packed(dims).iter().all(|&c| c == 42));
}

#[test]
fn output_bounded() {
    let dims = VolumeDims { width: 16, height: 16, depths: 24 };
    let input = volume(dims, noise);
    let mut out = SimilarityVolume::new(*input.layout());
    let mut bufs = buffers(16, 16, 24);
    VolumeAggregator::new(PENALTIES, FilteringAxes::default().sweeps()).aggregate(&input, &mut out, &mut bufs, dims);
    assert!(out.to_packed(dims).iter().all(|&c| c <= SIM_WORST));
}

#[test]
fn largest_penalties_stay_in_range() {
    // Path costs reach 255 + P2 on every sweep; the four-sweep sum must not wrap.
    let dims = VolumeDims { width: 16, height: 16, depths: 24 };
    let input = volume(dims, noise);
    let mut bufs = buffers(16, 16, 24);
    let sweeps = FilteringAxes::default();

    let mut at_max = SimilarityVolume::new(*input.layout());
    let max = SgmPenalties { p1: MAX_PENALTY, p2: MAX_PENALTY };
    VolumeAggregator::new(max, sweeps.sweeps()).aggregate(&input, &mut at_max, &mut bufs, dims);
    assert!(at_max.to_packed(dims).iter().all(|&c| c <= SIM_WORST));

    // Anything larger is capped to the same result.
    let mut huge = SimilarityVolume::new(*input.layout());
    let beyond = SgmPenalties { p1: 10, p2: u32::MAX - 100 };
    VolumeAggregator::new(beyond, sweeps.sweeps()).aggregate(&input, &mut huge, &mut bufs, dims);
    let mut capped = SimilarityVolume::new(*input.layout());
    let cap = SgmPenalties { p1: 10, p2: MAX_PENALTY };
    VolumeAggregator::new(cap, sweeps.sweeps()).aggregate(&input, &mut capped, &mut bufs, dims);
    assert_eq!(huge.to_packed(dims), capped.to_packed(dims));
}

#[test]
fn aggregation_removes_isolated_outlier() {
    // Every cell prefers depth 3, except the center whose raw costs favor
    // depth 5. Its neighbors pull it back to 3 once aggregated.
    let dims = VolumeDims { width: 9, height: 9, depths: 8 };
    let input = volume(dims, |x, y, z| match (x == 4 && y == 4, z) {
        (true, 3) => 60,
        (true, 5) => 0,
        (false, 3) => 0,
        _ => 100,
    });
    let depths: Vec<f32> = (0..8).map(|z| 1.0 + z as f32).collect();
    let extractor = DepthExtractor::default();
    assert_eq!(extractor.select(|z| input.get(4, 4, z), &depths).depth, 6.0);

    let mut out = SimilarityVolume::new(*input.layout());
    let mut bufs = buffers(9, 9, 8);
    VolumeAggregator::new(PENALTIES, FilteringAxes::default().sweeps()).aggregate(&input, &mut out, &mut bufs, dims);

    assert_eq!(extractor.select(|z| out.get(4, 4, z), &depths).depth, 4.0);
    for y in 0..dims.height {
        for x in 0..dims.width {
            assert_eq!(extractor.select(|z| out.get(x, y, z), &depths).depth, 4.0, "({x},{y})");
        }
    }
}

#[test]
fn reused_buffers_give_same_result() {
    // One buffer set shared across tiles of different shapes.
    let mut bufs = buffers(16, 16, 12);
    let agg = VolumeAggregator::new(PENALTIES, FilteringAxes::default().sweeps());

    let big = VolumeDims { width: 16, height: 16, depths: 12 };
    let small = VolumeDims { width: 7, height: 11, depths: 5 };
    let input_small = volume(small, noise);
    let input_big = volume(big, |x, y, z| noise(y, x, z));

    let mut first = SimilarityVolume::new(*input_small.layout());
    agg.aggregate(&input_small, &mut first, &mut bufs, small);
    let mut scratch = SimilarityVolume::new(*input_big.layout());
    agg.aggregate(&input_big, &mut scratch, &mut bufs, big);
    let mut again = SimilarityVolume::new(*input_small.layout());
    agg.aggregate(&input_small, &mut again, &mut bufs, small);

    assert_eq!(first.to_packed(small), again.to_packed(small));
}
