// tests/test_retrieve.rs — Winner-take-all depth extraction.

use mvsgm::memory::BufferLayout;
use mvsgm::retrieve::{cost_to_sim, DepthExtractor};
use mvsgm::volume::{SimilarityVolume, VolumeDims, SIM_WORST};
use mvsgm::{DepthInterpolation, DepthSimMap, Roi};

fn ramp_volume(dims: VolumeDims, best_z: impl Fn(usize, usize) -> usize) -> SimilarityVolume {
    let mut v = SimilarityVolume::new(BufferLayout::new(dims.width, dims.height, dims.depths, 4));
    for z in 0..dims.depths {
        for y in 0..dims.height {
            for x in 0..dims.width {
                let d = (z as i64 - best_z(x, y) as i64).unsigned_abs() as u32;
                v.set(x, y, z, 20 + 15 * d);
            }
        }
    }
    v
}

// ===== Similarity mapping =====

#[test]
fn cost_to_sim_endpoints() {
    assert_eq!(cost_to_sim(0), -1.0);
    assert_eq!(cost_to_sim(SIM_WORST), 1.0);
    assert!(cost_to_sim(127) < 0.0 && cost_to_sim(128) > 0.0);
    // Above-range costs clamp to the worst score.
    assert_eq!(cost_to_sim(1000), 1.0);
}

// ===== Full extraction =====

#[test]
fn extract_same_grid() {
    let roi = Roi::new(0, 10, 0, 6);
    let dims = VolumeDims { width: 10, height: 6, depths: 7 };
    let vol = ramp_volume(dims, |x, y| (x + y) % 7);
    let depths: Vec<f32> = (0..7).map(|z| 2.0 + 0.5 * z as f32).collect();

    let mut map = DepthSimMap::new(roi, 1);
    DepthExtractor::new(DepthInterpolation::Nearest).extract(&vol, dims, &roi, 1, &depths, &mut map);

    assert_eq!((map.width(), map.height()), (10, 6));
    for y in 0..6 {
        for x in 0..10 {
            let cell = map.get(x, y);
            assert_eq!(cell.depth, depths[(x + y) % 7]);
            assert_eq!(cell.sim, cost_to_sim(20));
        }
    }
}

#[test]
fn extract_coarser_map() {
    // Volume on a downscale-1 grid, map on downscale 2: every map cell
    // reads the volume cell under its top-left full-resolution pixel.
    let roi = Roi::new(4, 20, 2, 10);
    let dims = VolumeDims { width: 16, height: 8, depths: 5 };
    let vol = ramp_volume(dims, |x, _| x % 5);
    let depths = [1.0, 2.0, 3.0, 4.0, 5.0];

    let mut map = DepthSimMap::new(roi, 2);
    DepthExtractor::default().extract(&vol, dims, &roi, 1, &depths, &mut map);

    assert_eq!((map.width(), map.height()), (8, 4));
    for ((fx, _), cell) in map.iter() {
        let vx = fx - roi.x.begin;
        assert_eq!(cell.depth, depths[vx % 5], "full-res x {fx}");
    }
}

#[test]
fn parabolic_stays_between_neighbors() {
    let roi = Roi::new(0, 4, 0, 1);
    let dims = VolumeDims { width: 4, height: 1, depths: 5 };
    let mut vol = SimilarityVolume::new(BufferLayout::new(4, 1, 5, 4));
    // Column x: minimum at z = 2 with asymmetric neighbors.
    let columns = [[90, 50, 10, 30, 80], [90, 30, 10, 50, 80], [90, 30, 10, 30, 80], [5, 30, 60, 90, 120]];
    for (x, col) in columns.iter().enumerate() {
        for (z, &c) in col.iter().enumerate() {
            vol.set(x, 0, z, c);
        }
    }
    let depths = [1.0, 2.0, 3.0, 4.0, 5.0];
    let mut map = DepthSimMap::new(roi, 1);
    DepthExtractor::new(DepthInterpolation::Parabolic).extract(&vol, dims, &roi, 1, &depths, &mut map);

    let d: Vec<f32> = (0..4).map(|x| map.get(x, 0).depth).collect();
    assert!(d[0] > 3.0 && d[0] < 3.5, "{}", d[0]);
    assert!(d[1] > 2.5 && d[1] < 3.0, "{}", d[1]);
    assert_eq!(d[2], 3.0);
    assert_eq!(d[3], 1.0);
    // Similarity is always that of the winning cost.
    assert_eq!(map.get(0, 0).sim, cost_to_sim(10));
}

#[test]
fn empty_volume_cells_report_invalid() {
    let roi = Roi::new(0, 3, 0, 3);
    let dims = VolumeDims { width: 3, height: 3, depths: 4 };
    let vol = SimilarityVolume::new(BufferLayout::new(3, 3, 4, 4));
    let mut map = DepthSimMap::new(roi, 1);
    DepthExtractor::default().extract(&vol, dims, &roi, 1, &[1.0, 2.0, 3.0, 4.0], &mut map);
    for (_, cell) in map.iter() {
        assert_eq!(cell.sim, 1.0);
        assert_eq!(cell.depth, 1.0);
    }
}
