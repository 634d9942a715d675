// sgm.rs — CPU engine: per-tile depth/sim map computation.
//
// One `Sgm` instance owns every buffer it needs, sized once at construction
// for the largest tile the (TileParams, MatchingConfig) pair allows, and
// reuses them for every tile. Cameras come from a shared `HostCameraCache`
// owned by whoever composes engines.
//
// `process(tile, hypotheses)` runs, strictly in order:
//
//   1. validate the tile against the caller contract and the allocation
//   2. stage the depth hypotheses
//   3. fuse target costs into (best, second best)
//   4. single target: copy best into second best over the whole volume
//   5. [export "beforeFiltering" snapshot of the fused volume]
//   6. aggregate second best into the final-cost buffer, or copy it there
//   7. [export "afterFiltering" snapshot of the final volume]
//   8. winner-take-all extraction into the depth/sim map
//   9. [export the map]
//
// This is the reference the GPU engine (`gpu::sgm::GpuSgm`) is checked
// against; both share `TileGeometry::resolve` so they accept and reject
// exactly the same tiles.

use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::cache::{request_host_camera, CameraHandle, HostCamera, HostCameraCache};
use crate::camera::ViewSet;
use crate::config::MatchingConfig;
use crate::cost::{matching_cost_from_config, CameraPair, MatchingCost};
use crate::depth_list::DepthHypothesisSet;
use crate::error::{Result, SgmError};
use crate::export::{DiagnosticSink, ExportKey, ExportStage, VolumeSnapshot};
use crate::memory::{HostBuffer, MemoryUsage, SgmBufferPlan};
use crate::optimize::{AggregationBuffers, VolumeAggregator};
use crate::retrieve::{DepthExtractor, DepthSimMap};
use crate::similarity::CostVolumeBuilder;
use crate::tile::{Roi, Tile, TileParams};
use crate::volume::{CostVolumes, SimilarityVolume, VolumeDims};

/// Validated geometry of one tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileGeometry {
    pub view_id: usize,
    /// Region of volume cells (full-resolution ROI downscaled).
    pub roi_ds: Roi,
    pub dims: VolumeDims,
}

impl TileGeometry {
    /// Check `tile` and `hyps` against the caller contract and against the
    /// buffers allocated for `plan`. Nothing is mutated on failure.
    pub fn resolve(
        views: &ViewSet,
        plan: &SgmBufferPlan,
        config: &MatchingConfig,
        tile: &Tile,
        hyps: &DepthHypothesisSet,
    ) -> Result<Self> {
        let view_id = views.get(tile.rc)?.view_id;
        if tile.tcams.is_empty() {
            return Err(SgmError::NoTargetCameras { view_id, tile: tile.prefix() });
        }
        if hyps.is_empty() {
            return Err(SgmError::EmptyDepthList { view_id, tile: tile.prefix() });
        }
        hyps.validate(tile.tcams.len(), plan.max_depths)?;

        let roi_ds = tile.roi.downscaled(config.downscale());
        if roi_ds.width() > plan.max_tile_width || roi_ds.height() > plan.max_tile_height {
            return Err(SgmError::TileTooLarge {
                width: roi_ds.width(),
                height: roi_ds.height(),
                max_width: plan.max_tile_width,
                max_height: plan.max_tile_height,
            });
        }
        if roi_ds.is_empty() {
            warn!("{tile}empty region for view id {view_id}");
        }
        Ok(TileGeometry {
            view_id,
            roi_ds,
            dims: VolumeDims { width: roi_ds.width(), height: roi_ds.height(), depths: hyps.len() },
        })
    }
}

/// Per-tile timings and sizes.
#[derive(Debug, Clone, Copy, Default)]
pub struct TileStats {
    pub view_id: usize,
    pub target_count: usize,
    pub depth_count: usize,
    pub width: usize,
    pub height: usize,
    pub fusion: Duration,
    pub aggregation: Duration,
    pub extraction: Duration,
    pub total: Duration,
}

/// Export one volume snapshot through `sink`.
pub(crate) fn export_volume(
    sink: &mut dyn DiagnosticSink,
    key: ExportKey,
    packed: &[u32],
    geom: &TileGeometry,
    depths: &[f32],
    tile: &Tile,
    downscale: u32,
) -> Result<()> {
    debug!("{tile}export {} volume of view id {}", key.stage, key.view_id);
    sink.export_volume(
        key,
        &VolumeSnapshot { costs: packed, dims: geom.dims, depths, roi: tile.roi, downscale },
    )
}

/// CPU depth/sim map engine.
pub struct Sgm {
    views: Arc<ViewSet>,
    cache: Arc<HostCameraCache>,
    config: MatchingConfig,
    plan: SgmBufferPlan,
    cost: Box<dyn MatchingCost>,
    aggregator: VolumeAggregator,
    extractor: DepthExtractor,
    depths: HostBuffer<f32>,
    volumes: CostVolumes<SimilarityVolume>,
    aggregation: Option<AggregationBuffers>,
    map: DepthSimMap,
    diagnostics: Option<Box<dyn DiagnosticSink>>,
}

impl Sgm {
    /// Validate `config` and allocate every buffer for the largest tile
    /// `tile_params` allows.
    pub fn new(
        views: Arc<ViewSet>,
        cache: Arc<HostCameraCache>,
        tile_params: TileParams,
        config: MatchingConfig,
    ) -> Result<Self> {
        config.validate()?;
        let plan = SgmBufferPlan::new(tile_params, &config);
        let usage = plan.memory_usage();
        info!(
            "SGM engine: max tile {}x{} cells, {} depths, aggregation {}, {:.2} MB ({:.2} MB unpadded)",
            plan.max_tile_width,
            plan.max_tile_height,
            plan.max_depths,
            if plan.aggregation_enabled() { config.filtering_axes.to_string() } else { "off".to_string() },
            usage.padded_mb(),
            usage.unpadded_mb(),
        );

        Ok(Sgm {
            cost: matching_cost_from_config(&config),
            aggregator: VolumeAggregator::new(config.penalties(), config.filtering_axes.sweeps()),
            extractor: DepthExtractor::new(config.depth_interpolation),
            depths: HostBuffer::new(plan.depths, 0.0),
            volumes: CostVolumes::new(SimilarityVolume::new(plan.volume), SimilarityVolume::new(plan.volume)),
            aggregation: AggregationBuffers::from_plan(&plan),
            map: DepthSimMap::with_capacity(plan.max_tile_width * plan.max_tile_height),
            diagnostics: None,
            views,
            cache,
            config,
            plan,
        })
    }

    /// Replace the matching cost policy.
    pub fn with_matching_cost(mut self, cost: Box<dyn MatchingCost>) -> Self {
        self.cost = cost;
        self
    }

    /// Receive diagnostic snapshots when `export_intermediate_results` is set.
    pub fn with_diagnostics(mut self, sink: Box<dyn DiagnosticSink>) -> Self {
        self.diagnostics = Some(sink);
        self
    }

    pub fn config(&self) -> &MatchingConfig {
        &self.config
    }

    pub fn buffer_plan(&self) -> &SgmBufferPlan {
        &self.plan
    }

    /// Padded / unpadded totals of every owned buffer.
    pub fn memory_usage(&self) -> MemoryUsage {
        self.plan.memory_usage()
    }

    /// Output of the last processed tile.
    pub fn depth_sim_map(&self) -> &DepthSimMap {
        &self.map
    }

    pub fn cost_volumes(&self) -> &CostVolumes<SimilarityVolume> {
        &self.volumes
    }

    /// Compute the depth/sim map of `tile`.
    pub fn process(&mut self, tile: &Tile, hyps: &DepthHypothesisSet) -> Result<TileStats> {
        let start = Instant::now();
        let geom = TileGeometry::resolve(&self.views, &self.plan, &self.config, tile, hyps)?;
        let dims = geom.dims;
        let downscale = self.config.downscale();
        info!(
            "{tile}SGM depth/sim map of view id: {}, rc: {} ({} tc, {} depths, {}x{}).",
            geom.view_id,
            tile.rc,
            tile.tcams.len(),
            dims.depths,
            dims.width,
            dims.height
        );
        let exporting = self.config.export_intermediate_results && self.diagnostics.is_some();
        let scale = self.config.scale;
        let export_key =
            |stage| ExportKey { view_id: geom.view_id, scale, tile_origin: tile.origin(), stage };

        self.depths.row_mut(0, 0, dims.depths).copy_from_slice(hyps.depths());

        let rc = request_host_camera(&self.cache, &self.views, tile.rc, self.config.scale)?;
        let tcs = tile
            .tcams
            .iter()
            .map(|&tc| request_host_camera(&self.cache, &self.views, tc, self.config.scale))
            .collect::<Result<Vec<CameraHandle<HostCamera>>>>()?;
        let pairs: Vec<CameraPair> = tcs.iter().map(|tc| CameraPair::new(&rc, tc)).collect();

        // Fusion
        let t = Instant::now();
        {
            let (best, second) = self.volumes.fusion_targets();
            CostVolumeBuilder::new(self.cost.as_ref(), self.config.step_xy)
                .build(best, second, &pairs, hyps, &geom.roi_ds, dims);
            if tile.tcams.len() == 1 {
                second.copy_from(best, dims);
            }
        }
        let fusion = t.elapsed();
        debug!("{tile}fusion done in {fusion:?}");

        let depths = self.depths.row(0, 0, dims.depths);
        if exporting {
            let key = export_key(ExportStage::BeforeFiltering);
            let packed = self.volumes.second_best().to_packed(dims);
            if let Some(sink) = self.diagnostics.as_deref_mut() {
                export_volume(sink, key, &packed, &geom, depths, tile, downscale)?;
            }
        }

        // Final cost: aggregated or passthrough. The primary buffer stays
        // borrowed as the final-cost volume until the tile is done.
        let t = Instant::now();
        let (out, input) = self.volumes.begin_final_stage();
        match self.aggregation.as_mut() {
            Some(bufs) => self.aggregator.aggregate(input, out, bufs, dims),
            None => out.copy_from(input, dims),
        }
        let final_cost: &SimilarityVolume = out;
        let aggregation = t.elapsed();
        debug!("{tile}final cost volume done in {aggregation:?}");

        if exporting {
            let key = export_key(ExportStage::AfterFiltering);
            let packed = final_cost.to_packed(dims);
            if let Some(sink) = self.diagnostics.as_deref_mut() {
                export_volume(sink, key, &packed, &geom, depths, tile, downscale)?;
            }
        }

        // Extraction
        let t = Instant::now();
        self.map.reshape(tile.roi, downscale);
        self.extractor.extract(final_cost, dims, &tile.roi, downscale, depths, &mut self.map);
        let extraction = t.elapsed();

        if exporting {
            let key = export_key(ExportStage::Sgm);
            if let Some(sink) = self.diagnostics.as_deref_mut() {
                sink.export_depth_sim_map(key, &self.map)?;
            }
        }

        let stats = TileStats {
            view_id: geom.view_id,
            target_count: tile.tcams.len(),
            depth_count: dims.depths,
            width: dims.width,
            height: dims.height,
            fusion,
            aggregation,
            extraction,
            total: start.elapsed(),
        };
        info!("{tile}SGM depth/sim map of view id: {} done in {:?}.", geom.view_id, stats.total);
        Ok(stats)
    }
}
