// gpu/sgm.rs — GPU engine: per-tile depth/sim map computation on wgpu.
//
// Same contract as the CPU `Sgm`, same buffer plan, same tile validation
// (`TileGeometry::resolve`). The difference is timing:
//
//   process(tile, hyps)        validates, records every stage into one
//                              command encoder and submits. Returns as soon
//                              as the work is queued.
//   download_depth_sim_map()   blocks until the queue has drained and
//                              copies the map to the host.
//
// Engines sharing a `GpuDevice` share its queue, so their tiles execute in
// submission order; engines on distinct devices overlap.
//
// With diagnostics enabled the engine reads volumes back between stages,
// which serializes the tile.
//
// STAGES ON THE DEVICE
// ────────────────────
//   fill best, second := 255
//   per target camera:   compute_similarity over its depth range
//   single coverage:     copy best → second (whole volume for one target,
//                        otherwise each depth slice covered once)
//   final stage:         fill out := 0, aggregate_path per sweep, normalize
//                        or copy second → out
//   retrieve_best_depth  into the depth/sim map buffer

use std::ops::Range;
use std::sync::Arc;
use std::time::Instant;

use log::{debug, info};

use crate::cache::CameraHandle;
use crate::camera::ViewSet;
use crate::config::{CostFunction, DepthInterpolation, MatchingConfig};
use crate::cost::CameraPair;
use crate::depth_list::{DepthHypothesisSet, DepthRange};
use crate::error::Result;
use crate::export::{DiagnosticSink, ExportKey, ExportStage};
use crate::gpu::buffer::DeviceBuffer;
use crate::gpu::camera::{request_device_camera, DeviceCamera, DeviceCameraCache};
use crate::gpu::device::{GpuDevice, GpuError};
use crate::gpu::kernels::{OptimizeParams, RetrieveParams, SgmKernels, SimilarityParams};
use crate::memory::{MemoryUsage, SgmBufferPlan};
use crate::optimize::SweepGeometry;
use crate::retrieve::{DepthSim, DepthSimMap};
use crate::sgm::{export_volume, TileGeometry, TileStats};
use crate::tile::{Roi, Tile, TileParams};
use crate::volume::{CostVolumes, VolumeDims, SIM_WORST};

/// Device scratch buffers of the aggregator.
struct DeviceAggregation {
    slice_a: DeviceBuffer,
    slice_b: DeviceBuffer,
    axis: DeviceBuffer,
}

/// Shape of the map the last `process` call produced.
#[derive(Debug, Clone, Copy)]
struct MapShape {
    roi: Roi,
    downscale: u32,
}

/// Contiguous runs of depth indices covered by exactly one target camera.
pub fn single_coverage_runs(coverage: &[u32]) -> Vec<Range<usize>> {
    let mut runs = Vec::new();
    let mut start = None;
    for (z, &c) in coverage.iter().enumerate() {
        match (c == 1, start) {
            (true, None) => start = Some(z),
            (false, Some(s)) => {
                runs.push(s..z);
                start = None;
            }
            _ => {}
        }
    }
    if let Some(s) = start {
        runs.push(s..coverage.len());
    }
    runs
}

/// GPU depth/sim map engine.
pub struct GpuSgm {
    gpu: Arc<GpuDevice>,
    views: Arc<ViewSet>,
    cache: Arc<DeviceCameraCache>,
    config: MatchingConfig,
    plan: SgmBufferPlan,
    kernels: SgmKernels,
    depths: DeviceBuffer,
    volumes: CostVolumes<DeviceBuffer>,
    aggregation: Option<DeviceAggregation>,
    map: DeviceBuffer,
    host_map: DepthSimMap,
    last: Option<MapShape>,
    pending: bool,
    diagnostics: Option<Box<dyn DiagnosticSink>>,
}

impl GpuSgm {
    /// Validate `config`, compile the kernels and allocate every device
    /// buffer for the largest tile `tile_params` allows.
    ///
    /// Allocation runs inside an out-of-memory scope: a plan that does not
    /// fit the device fails here with `GpuError::OutOfMemory` or
    /// `GpuError::BufferTooLarge`, never later while processing.
    pub fn new(
        gpu: Arc<GpuDevice>,
        views: Arc<ViewSet>,
        cache: Arc<DeviceCameraCache>,
        tile_params: TileParams,
        config: MatchingConfig,
    ) -> Result<Self> {
        config.validate()?;
        let plan = SgmBufferPlan::new(tile_params, &config);
        let usage = plan.memory_usage();
        info!(
            "GPU SGM engine on {}: max tile {}x{} cells, {} depths, aggregation {}, {:.2} MB ({:.2} MB unpadded)",
            gpu.adapter_info,
            plan.max_tile_width,
            plan.max_tile_height,
            plan.max_depths,
            if plan.aggregation_enabled() { config.filtering_axes.to_string() } else { "off".to_string() },
            usage.padded_mb(),
            usage.unpadded_mb(),
        );

        let (kernels, depths, best, second, aggregation, map) =
            gpu.scoped("allocating SGM device buffers", || -> std::result::Result<_, GpuError> {
                let kernels = SgmKernels::new(&gpu);
                let depths = DeviceBuffer::new(&gpu, "depths", plan.depths)?;
                let best = DeviceBuffer::new(&gpu, "volume best / final", plan.volume)?;
                let second = DeviceBuffer::new(&gpu, "volume second best", plan.volume)?;
                let aggregation = match (plan.slice, plan.axis) {
                    (Some(slice), Some(axis)) => Some(DeviceAggregation {
                        slice_a: DeviceBuffer::new(&gpu, "slice a", slice)?,
                        slice_b: DeviceBuffer::new(&gpu, "slice b", slice)?,
                        axis: DeviceBuffer::new(&gpu, "axis", axis)?,
                    }),
                    _ => None,
                };
                let map = DeviceBuffer::new(&gpu, "depth/sim map", plan.depth_sim_map)?;
                Ok((kernels, depths, best, second, aggregation, map))
            })??;

        Ok(GpuSgm {
            host_map: DepthSimMap::with_capacity(plan.max_tile_width * plan.max_tile_height),
            volumes: CostVolumes::new(best, second),
            last: None,
            pending: false,
            diagnostics: None,
            gpu,
            views,
            cache,
            config,
            plan,
            kernels,
            depths,
            aggregation,
            map,
        })
    }

    /// Receive diagnostic snapshots when `export_intermediate_results` is set.
    pub fn with_diagnostics(mut self, sink: Box<dyn DiagnosticSink>) -> Self {
        self.diagnostics = Some(sink);
        self
    }

    pub fn device(&self) -> &Arc<GpuDevice> {
        &self.gpu
    }

    pub fn config(&self) -> &MatchingConfig {
        &self.config
    }

    pub fn buffer_plan(&self) -> &SgmBufferPlan {
        &self.plan
    }

    pub fn memory_usage(&self) -> MemoryUsage {
        self.plan.memory_usage()
    }

    fn similarity_params(
        &self,
        geom: &TileGeometry,
        range: DepthRange,
        rc: &DeviceCamera,
        tc: &DeviceCamera,
    ) -> SimilarityParams {
        let rows = *CameraPair::new(&rc.host, &tc.host).projection_rows();
        let layout = self.plan.volume;
        let z_end = range.end().min(geom.dims.depths);
        SimilarityParams {
            m0: rows[0],
            m1: rows[1],
            m2: rows[2],
            width: geom.dims.width as u32,
            height: geom.dims.height as u32,
            pitch: layout.pitch() as u32,
            layer_height: layout.height as u32,
            roi_x: geom.roi_ds.x.begin as u32,
            roi_y: geom.roi_ds.y.begin as u32,
            step_xy: self.config.step_xy.max(1),
            z_first: range.first as u32,
            z_count: z_end.saturating_sub(range.first) as u32,
            half_window: self.config.half_window as i32,
            cost_function: match self.config.cost_function {
                CostFunction::Zncc => 0,
                CostFunction::Sad => 1,
            },
            rc_width: rc.host.image.width() as u32,
            rc_height: rc.host.image.height() as u32,
            tc_width: tc.host.image.width() as u32,
            tc_height: tc.host.image.height() as u32,
            _pad0: 0,
            gamma_c: self.config.gamma_c,
            gamma_p: self.config.gamma_p,
            _pad1: 0.0,
            _pad2: 0.0,
        }
    }

    /// Record the fusion stage.
    fn encode_fusion(
        &mut self,
        encoder: &mut wgpu::CommandEncoder,
        geom: &TileGeometry,
        hyps: &DepthHypothesisSet,
        rc: &DeviceCamera,
        tcs: &[CameraHandle<DeviceCamera>],
    ) {
        let dims = geom.dims;
        let params: Vec<SimilarityParams> = tcs
            .iter()
            .zip(hyps.tc_ranges())
            .map(|(tc, range)| self.similarity_params(geom, *range, rc, tc))
            .collect();

        let gpu = Arc::clone(&self.gpu);
        let (best, second) = self.volumes.fusion_targets();
        self.kernels.encode_fill(&gpu, encoder, best, dims, SIM_WORST);
        self.kernels.encode_fill(&gpu, encoder, second, dims, SIM_WORST);
        for (i, (p, tc)) in params.iter().zip(tcs).enumerate() {
            debug!("similarity volume: tc {} ({} / {}), {} depths", tc.host.key.camera, i + 1, tcs.len(), p.z_count);
            self.kernels.encode_similarity(&gpu, encoder, p, rc, tc, &self.depths, best, second);
        }

        let slice_bytes = (best.layout.index(0, 0, 1) * 4) as u64;
        let runs = if tcs.len() == 1 { vec![0..dims.depths] } else { single_coverage_runs(&hyps.coverage()) };
        for run in runs {
            let run = run.start..run.end.min(dims.depths);
            if run.is_empty() {
                continue;
            }
            let offset = run.start as u64 * slice_bytes;
            let bytes = run.len() as u64 * slice_bytes;
            encoder.copy_buffer_to_buffer(&best.buffer, offset, &second.buffer, offset, bytes);
        }
    }

    /// Record the final-cost stage: aggregation or passthrough.
    fn encode_final_stage(&mut self, encoder: &mut wgpu::CommandEncoder, dims: VolumeDims) {
        let gpu = Arc::clone(&self.gpu);
        let sweeps = self.config.filtering_axes.sweeps().to_vec();
        let penalties = self.config.penalties();
        let (out, input) = self.volumes.begin_final_stage();

        match self.aggregation.as_ref() {
            Some(bufs) if !sweeps.is_empty() => {
                self.kernels.encode_fill(&gpu, encoder, out, dims, 0);
                let mut params = OptimizeParams {
                    width: dims.width as u32,
                    height: dims.height as u32,
                    depths: dims.depths as u32,
                    pitch: out.pitch(),
                    layer_height: out.layout.height as u32,
                    slice_pitch: bufs.slice_a.pitch(),
                    lines: 0,
                    length: 0,
                    horizontal: 0,
                    forward: 0,
                    p1: penalties.p1,
                    p2: penalties.p2,
                    sweeps: sweeps.len() as u32,
                    _pad0: 0,
                    _pad1: 0,
                    _pad2: 0,
                };
                for dir in sweeps {
                    let sweep = SweepGeometry::new(dir, dims);
                    debug!("aggregate sweep {dir}: {} lines of {}", sweep.lines, sweep.length);
                    params.lines = sweep.lines as u32;
                    params.length = sweep.length as u32;
                    params.horizontal = dir.is_horizontal() as u32;
                    params.forward = dir.is_forward() as u32;
                    self.kernels.encode_aggregate(
                        &gpu,
                        encoder,
                        &params,
                        input,
                        out,
                        &bufs.slice_a,
                        &bufs.slice_b,
                        &bufs.axis,
                    );
                }
                self.kernels.encode_normalize(&gpu, encoder, &params, out);
            }
            _ => {
                let bytes = (out.layout.index(0, 0, dims.depths) * 4) as u64;
                if bytes > 0 {
                    encoder.copy_buffer_to_buffer(&input.buffer, 0, &out.buffer, 0, bytes);
                }
            }
        }
    }

    /// Record winner-take-all extraction into the map buffer.
    fn encode_extraction(&self, encoder: &mut wgpu::CommandEncoder, geom: &TileGeometry, shape: &MapShape) {
        let Some(volume) = self.volumes.final_cost() else {
            return;
        };
        let map_roi = shape.roi.downscaled(shape.downscale);
        let params = RetrieveParams {
            map_width: map_roi.width() as u32,
            map_height: map_roi.height() as u32,
            map_pitch: self.map.pitch(),
            depths: geom.dims.depths as u32,
            vol_width: geom.dims.width as u32,
            vol_height: geom.dims.height as u32,
            vol_pitch: volume.pitch(),
            layer_height: volume.layout.height as u32,
            map_roi_x: map_roi.x.begin as u32,
            map_roi_y: map_roi.y.begin as u32,
            map_ds: shape.downscale,
            vol_ds: self.config.downscale(),
            vol_roi_x: geom.roi_ds.x.begin as u32,
            vol_roi_y: geom.roi_ds.y.begin as u32,
            interpolation: match self.config.depth_interpolation {
                DepthInterpolation::Nearest => 0,
                DepthInterpolation::Parabolic => 1,
            },
            _pad0: 0,
        };
        self.kernels.encode_retrieve(&self.gpu, encoder, &params, volume, &self.depths, &self.map);
    }

    fn submit(&self, encoder: wgpu::CommandEncoder) {
        self.gpu.queue.submit(std::iter::once(encoder.finish()));
    }

    fn encoder(&self, label: &'static str) -> wgpu::CommandEncoder {
        self.gpu.device.create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some(label) })
    }

    /// Queue the depth/sim map computation of `tile`.
    ///
    /// Returns once the work is submitted; call `download_depth_sim_map`
    /// for the result. Timings in the returned stats cover validation and
    /// command recording, not device execution.
    pub fn process(&mut self, tile: &Tile, hyps: &DepthHypothesisSet) -> Result<TileStats> {
        let start = Instant::now();
        let geom = TileGeometry::resolve(&self.views, &self.plan, &self.config, tile, hyps)?;
        let dims = geom.dims;
        let downscale = self.config.downscale();
        let scale = self.config.scale;
        info!(
            "{tile}GPU SGM depth/sim map of view id: {}, rc: {} ({} tc, {} depths, {}x{}).",
            geom.view_id,
            tile.rc,
            tile.tcams.len(),
            dims.depths,
            dims.width,
            dims.height
        );
        let exporting = self.config.export_intermediate_results && self.diagnostics.is_some();
        let export_key = |stage| ExportKey { view_id: geom.view_id, scale, tile_origin: tile.origin(), stage };

        let rc = request_device_camera(&self.gpu, &self.cache, &self.views, tile.rc, scale)?;
        let tcs = tile
            .tcams
            .iter()
            .map(|&tc| request_device_camera(&self.gpu, &self.cache, &self.views, tc, scale))
            .collect::<Result<Vec<_>>>()?;

        let gpu = Arc::clone(&self.gpu);
        self.depths.write(&gpu, hyps.depths());
        let shape = MapShape { roi: tile.roi, downscale };

        // Fusion
        let t = Instant::now();
        gpu.scoped("computing similarity volumes", || {
            let mut encoder = self.encoder("sgm fusion");
            self.encode_fusion(&mut encoder, &geom, hyps, &rc, &tcs);
            self.submit(encoder);
        })?;
        let fusion = t.elapsed();

        if exporting {
            let packed = self.volumes.second_best().read_volume(&gpu, dims)?;
            if let Some(sink) = self.diagnostics.as_deref_mut() {
                export_volume(sink, export_key(ExportStage::BeforeFiltering), &packed, &geom, hyps.depths(), tile, downscale)?;
            }
        }

        // Final cost
        let t = Instant::now();
        gpu.scoped("optimizing the similarity volume", || {
            let mut encoder = self.encoder("sgm final cost");
            self.encode_final_stage(&mut encoder, dims);
            self.submit(encoder);
        })?;
        let aggregation = t.elapsed();

        if exporting {
            if let Some(volume) = self.volumes.final_cost() {
                let packed = volume.read_volume(&gpu, dims)?;
                if let Some(sink) = self.diagnostics.as_deref_mut() {
                    export_volume(sink, export_key(ExportStage::AfterFiltering), &packed, &geom, hyps.depths(), tile, downscale)?;
                }
            }
        }

        // Extraction
        let t = Instant::now();
        gpu.scoped("retrieving the best depth", || {
            let mut encoder = self.encoder("sgm retrieve");
            self.encode_extraction(&mut encoder, &geom, &shape);
            self.submit(encoder);
        })?;
        let extraction = t.elapsed();
        self.last = Some(shape);
        self.pending = true;

        if exporting {
            let key = export_key(ExportStage::Sgm);
            self.download_depth_sim_map()?;
            if let Some(sink) = self.diagnostics.as_deref_mut() {
                sink.export_depth_sim_map(key, &self.host_map)?;
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
        debug!("{tile}GPU SGM depth/sim map of view id: {} queued in {:?}.", geom.view_id, stats.total);
        Ok(stats)
    }

    /// Wait for the last tile and copy its depth/sim map to the host.
    pub fn download_depth_sim_map(&mut self) -> Result<&DepthSimMap> {
        if self.pending {
            if let Some(shape) = self.last {
                let (w, h) = {
                    let ds = shape.roi.downscaled(shape.downscale);
                    (ds.width(), ds.height())
                };
                let cells: Vec<DepthSim> = self.map.read_2d(&self.gpu, w, h)?;
                self.host_map.reshape(shape.roi, shape.downscale);
                self.host_map.as_mut_slice().copy_from_slice(&cells);
            }
            self.pending = false;
        }
        Ok(&self.host_map)
    }
}
