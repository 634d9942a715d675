// demos/synthetic_sweep.rs
//
// Render a synthetic multi-view scene, sweep it tile by tile and report
// depth accuracy against the known ground truth.
//
// Usage:
//   cargo run --example synthetic_sweep --release -- --targets 4 --depths 48
//   cargo run --example synthetic_sweep --release -- --gpu --tile 128
//   cargo run --example synthetic_sweep --release -- --config matching.toml --export out/
//
// Output:
//   stdout            per-tile timings and a final accuracy summary
//   <export>/*.csv    volume / map snapshots when --export is given

use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use clap::Parser;
use log::info;

use mvsgm::gpu::{DeviceCameraCache, GpuDevice, GpuSgm};
use mvsgm::synthetic::{SceneBuilder, SyntheticScene};
use mvsgm::tile::tile_roi_grid;
use mvsgm::{
    CsvDiagnostics, DepthSimMap, HostCameraCache, MatchingConfig, Roi, Sgm, Tile, TileParams, TileStats,
};

#[derive(Parser, Debug)]
#[command(about = "Tiled plane-sweep SGM over a synthetic scene")]
struct Args {
    /// Image width in pixels.
    #[arg(long, default_value_t = 320)]
    width: usize,
    /// Image height in pixels.
    #[arg(long, default_value_t = 240)]
    height: usize,
    /// Square tile side in full-resolution pixels.
    #[arg(long, default_value_t = 160)]
    tile: usize,
    /// Number of target cameras, on a circle around the reference.
    #[arg(long, default_value_t = 4)]
    targets: usize,
    /// Number of depth hypotheses.
    #[arg(long, default_value_t = 32)]
    depths: usize,
    /// Matching configuration (TOML); defaults are tuned for the scene.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Run the wgpu engine instead of the CPU one.
    #[arg(long)]
    gpu: bool,
    /// Write CSV diagnostics into this directory.
    #[arg(long)]
    export: Option<PathBuf>,
}

enum Engine {
    Cpu(Sgm),
    Gpu(GpuSgm),
}

impl Engine {
    fn process(&mut self, tile: &Tile, scene: &SyntheticScene, depths: usize) -> mvsgm::Result<(TileStats, DepthSimMap)> {
        let hyps = scene.hypotheses(2.0, 24.0, depths);
        match self {
            Engine::Cpu(sgm) => {
                let stats = sgm.process(tile, &hyps)?;
                Ok((stats, sgm.depth_sim_map().clone()))
            }
            Engine::Gpu(sgm) => {
                let stats = sgm.process(tile, &hyps)?;
                Ok((stats, sgm.download_depth_sim_map()?.clone()))
            }
        }
    }
}

fn scene(args: &Args) -> mvsgm::Result<SyntheticScene> {
    let baselines = (0..args.targets.max(1))
        .map(|i| {
            let a = i as f64 * std::f64::consts::TAU / args.targets.max(1) as f64;
            (0.4 * a.cos(), 0.4 * a.sin())
        })
        .collect();
    let fg = Roi::new(args.width / 3, args.width * 2 / 3, args.height / 3, args.height * 2 / 3);
    SceneBuilder::new(args.width, args.height).baselines(baselines).foreground(fg, 3.0).build()
}

fn run(args: Args) -> mvsgm::Result<()> {
    let config = match &args.config {
        Some(path) => MatchingConfig::load(path)?,
        None => MatchingConfig { scale: 1, step_xy: 2, max_depths: args.depths, ..MatchingConfig::default() },
    };
    let scene = scene(&args)?;
    let views = Arc::new(scene.views.clone());
    let params = TileParams { width: args.tile, height: args.tile };

    println!("Scene: {}x{}, {} targets, {} depths", args.width, args.height, scene.tcs.len(), args.depths);
    println!(
        "Config: scale={} step={} aggregation={} cost={:?}",
        config.scale,
        config.step_xy,
        if config.do_optimize_volume { config.filtering_axes.to_string() } else { "off".into() },
        config.cost_function
    );

    let export = args.export.as_ref().map(CsvDiagnostics::new).transpose()?;
    let mut engine = if args.gpu {
        let gpu = Arc::new(GpuDevice::new()?);
        let mut sgm = GpuSgm::new(gpu, Arc::clone(&views), Arc::new(DeviceCameraCache::new()), params, config)?;
        if let Some(sink) = export {
            sgm = sgm.with_diagnostics(Box::new(sink));
        }
        println!("Engine: GPU, {:.2} MB", sgm.memory_usage().padded_mb());
        Engine::Gpu(sgm)
    } else {
        let mut sgm = Sgm::new(Arc::clone(&views), Arc::new(HostCameraCache::new()), params, config)?;
        if let Some(sink) = export {
            sgm = sgm.with_diagnostics(Box::new(sink));
        }
        println!("Engine: CPU, {:.2} MB", sgm.memory_usage().padded_mb());
        Engine::Cpu(sgm)
    };

    let rois = tile_roi_grid(args.width, args.height, params);
    println!("\n{:>5}  {:>17}  {:>9}  {:>9}  {:>9}  {:>9}", "tile", "roi", "fusion", "aggr", "extract", "total");
    println!("{}", "-".repeat(66));

    let mut abs_err = Vec::new();
    for (i, roi) in rois.iter().enumerate() {
        let tile = Tile::new(scene.rc, scene.tcs.clone(), *roi, i, rois.len());
        let (stats, map) = engine.process(&tile, &scene, args.depths)?;
        println!(
            "{:5}  {:>17}  {:>9.2?}  {:>9.2?}  {:>9.2?}  {:>9.2?}",
            i,
            format!("{}..{}x{}..{}", roi.x.begin, roi.x.end, roi.y.begin, roi.y.end),
            stats.fusion,
            stats.aggregation,
            stats.extraction,
            stats.total
        );
        for ((fx, fy), cell) in map.iter() {
            if fx < args.width && fy < args.height && cell.sim < 1.0 {
                abs_err.push((cell.depth - scene.ground_truth.get(fx, fy)).abs());
            }
        }
    }

    if abs_err.is_empty() {
        println!("\nNo valid cells.");
        return Ok(());
    }
    abs_err.sort_by(f32::total_cmp);
    let n = abs_err.len();
    let within = |tol: f32| abs_err.iter().filter(|&&e| e <= tol).count() as f64 * 100.0 / n as f64;
    println!("\nValid cells: {n}");
    println!("Median |depth error|: {:.4}", abs_err[n / 2]);
    println!("90th percentile:      {:.4}", abs_err[n * 9 / 10]);
    println!("Within 0.05: {:.1}%   within 0.25: {:.1}%", within(0.05), within(0.25));
    info!("sweep done: {} tiles", rois.len());
    Ok(())
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    if let Err(e) = run(Args::parse()) {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}
