// benches/gpu_benchmarks.rs — GPU engine benchmarks.
//
// Mirrors sgm_benchmarks.rs: every GPU case sits in the same group as its
// CPU counterpart for direct comparison.
//
//   cargo bench --bench gpu_benchmarks
//
// CRITERION + GPU CAVEATS
// ────────────────────────
// `process` only records and submits; the map download is what waits for
// the queue. Each iteration therefore runs process + download, which is
// the latency a caller consuming the map actually sees.
//
// The first iterations pay pipeline compilation on some drivers, so the
// warmup time is set explicitly.

use criterion::{criterion_group, criterion_main, Criterion};
use std::sync::Arc;
use std::time::Duration;

use mvsgm::gpu::{DeviceCameraCache, GpuDevice, GpuSgm};
use mvsgm::synthetic::{SceneBuilder, SyntheticScene};
use mvsgm::{HostCameraCache, MatchingConfig, Roi, Sgm, Tile, TileParams};

// ============================================================
// Shared helpers
// ============================================================

fn scene(targets: usize) -> SyntheticScene {
    let baselines = (0..targets)
        .map(|i| {
            let a = i as f64 * std::f64::consts::TAU / targets as f64;
            (0.4 * a.cos(), 0.4 * a.sin())
        })
        .collect();
    SceneBuilder::new(256, 192).baselines(baselines).build().unwrap()
}

fn config(optimize: bool) -> MatchingConfig {
    MatchingConfig { scale: 1, step_xy: 2, max_depths: 64, do_optimize_volume: optimize, ..MatchingConfig::default() }
}

// ============================================================
// Full tile: CPU vs GPU
// ============================================================

fn bench_full_tile(c: &mut Criterion) {
    let gpu = Arc::new(GpuDevice::new().expect("no Vulkan GPU"));
    let scene = scene(4);
    let views = Arc::new(scene.views.clone());
    let hyps = scene.hypotheses(4.0, 20.0, 64);
    let params = TileParams { width: 256, height: 192 };
    let tile = Tile::whole(scene.rc, scene.tcs.clone(), Roi::new(0, 256, 0, 192));

    let mut group = c.benchmark_group("full_tile");
    group.warm_up_time(Duration::from_secs(2));
    group.sample_size(10);

    for optimize in [false, true] {
        let suffix = if optimize { "sgm" } else { "wta" };

        let mut cpu = Sgm::new(Arc::clone(&views), Arc::new(HostCameraCache::new()), params, config(optimize)).unwrap();
        group.bench_function(format!("cpu_256x192x64_4tc_{suffix}"), |b| {
            b.iter(|| cpu.process(&tile, &hyps).unwrap())
        });

        let mut engine = GpuSgm::new(
            Arc::clone(&gpu),
            Arc::clone(&views),
            Arc::new(DeviceCameraCache::new()),
            params,
            config(optimize),
        )
        .unwrap();
        group.bench_function(format!("gpu_256x192x64_4tc_{suffix}"), |b| {
            b.iter(|| {
                engine.process(&tile, &hyps).unwrap();
                engine.download_depth_sim_map().unwrap().width()
            })
        });
    }
    group.finish();
}

// ============================================================
// GPU: scaling with target count
// ============================================================

fn bench_targets(c: &mut Criterion) {
    let gpu = Arc::new(GpuDevice::new().expect("no Vulkan GPU"));

    let mut group = c.benchmark_group("gpu_targets");
    group.warm_up_time(Duration::from_secs(2));
    group.sample_size(10);

    for targets in [1usize, 4, 10] {
        let scene = scene(targets);
        let views = Arc::new(scene.views.clone());
        let hyps = scene.hypotheses(4.0, 20.0, 64);
        let tile = Tile::whole(scene.rc, scene.tcs.clone(), Roi::new(0, 256, 0, 192));
        let mut engine = GpuSgm::new(
            Arc::clone(&gpu),
            views,
            Arc::new(DeviceCameraCache::new()),
            TileParams { width: 256, height: 192 },
            config(true),
        )
        .unwrap();
        group.bench_function(format!("{targets}tc"), |b| {
            b.iter(|| {
                engine.process(&tile, &hyps).unwrap();
                engine.download_depth_sim_map().unwrap().width()
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_full_tile, bench_targets);
criterion_main!(benches);
