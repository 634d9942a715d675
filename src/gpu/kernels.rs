// gpu/kernels.rs — Compute pipelines of the GPU SGM engine.
//
// Five kernels, each with an explicit bind group layout:
//
//   kernel               shader              dispatch
//   ───────────────────  ──────────────────  ───────────────────────────────
//   fill_volume          sgm_fill.wgsl       (w, h, depths) / (WG_X, WG_Y, 1)
//   compute_similarity   sgm_volume.wgsl     (w, h, z_count) per target camera
//   aggregate_path       sgm_optimize.wgsl   lines × 1 × 1, WG_SIZE over depth
//   normalize_sum        sgm_optimize.wgsl   (w, h, depths)
//   retrieve_best_depth  sgm_retrieve.wgsl   (map w, map h)
//
// Every `encode_*` method records into a caller-owned encoder and returns
// immediately; nothing here waits on the device. Uniform structs must
// match their WGSL counterparts byte for byte.

use bytemuck::{Pod, Zeroable};
use wgpu::util::DeviceExt;

use crate::gpu::buffer::DeviceBuffer;
use crate::gpu::camera::DeviceCamera;
use crate::gpu::device::GpuDevice;
use crate::volume::VolumeDims;

// ---------------------------------------------------------------------------
// Uniform params (must match the WGSL structs exactly)
// ---------------------------------------------------------------------------

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct FillParams {
    pub width: u32,
    pub height: u32,
    pub depths: u32,
    pub pitch: u32,
    pub layer_height: u32,
    pub value: u32,
    pub _pad0: u32,
    pub _pad1: u32,
}

impl FillParams {
    pub fn new(target: &DeviceBuffer, dims: VolumeDims, value: u32) -> Self {
        FillParams {
            width: dims.width as u32,
            height: dims.height as u32,
            depths: dims.depths as u32,
            pitch: target.pitch(),
            layer_height: target.layout.height as u32,
            value,
            _pad0: 0,
            _pad1: 0,
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct SimilarityParams {
    pub m0: [f32; 4],
    pub m1: [f32; 4],
    pub m2: [f32; 4],
    pub width: u32,
    pub height: u32,
    pub pitch: u32,
    pub layer_height: u32,
    pub roi_x: u32,
    pub roi_y: u32,
    pub step_xy: u32,
    pub z_first: u32,
    pub z_count: u32,
    pub half_window: i32,
    /// 0 = weighted ZNCC, 1 = weighted SAD
    pub cost_function: u32,
    pub rc_width: u32,
    pub rc_height: u32,
    pub tc_width: u32,
    pub tc_height: u32,
    pub _pad0: u32,
    pub gamma_c: f32,
    pub gamma_p: f32,
    pub _pad1: f32,
    pub _pad2: f32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct OptimizeParams {
    pub width: u32,
    pub height: u32,
    pub depths: u32,
    pub pitch: u32,
    pub layer_height: u32,
    pub slice_pitch: u32,
    pub lines: u32,
    pub length: u32,
    pub horizontal: u32,
    pub forward: u32,
    pub p1: u32,
    pub p2: u32,
    pub sweeps: u32,
    pub _pad0: u32,
    pub _pad1: u32,
    pub _pad2: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct RetrieveParams {
    pub map_width: u32,
    pub map_height: u32,
    pub map_pitch: u32,
    pub depths: u32,
    pub vol_width: u32,
    pub vol_height: u32,
    pub vol_pitch: u32,
    pub layer_height: u32,
    pub map_roi_x: u32,
    pub map_roi_y: u32,
    pub map_ds: u32,
    pub vol_ds: u32,
    pub vol_roi_x: u32,
    pub vol_roi_y: u32,
    /// 0 = nearest, 1 = parabolic
    pub interpolation: u32,
    pub _pad0: u32,
}

// ---------------------------------------------------------------------------
// Bind group layout entries
// ---------------------------------------------------------------------------

fn uniform_entry(binding: u32) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Uniform,
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

fn storage_entry(binding: u32, read_only: bool) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage { read_only },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

fn texture_entry(binding: u32) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Texture {
            multisampled: false,
            view_dimension: wgpu::TextureViewDimension::D2,
            sample_type: wgpu::TextureSampleType::Float { filterable: false },
        },
        count: None,
    }
}

// ---------------------------------------------------------------------------
// Kernel
// ---------------------------------------------------------------------------

struct Kernel {
    name: &'static str,
    pipeline: wgpu::ComputePipeline,
    bgl: wgpu::BindGroupLayout,
}

impl Kernel {
    fn new(
        gpu: &GpuDevice,
        module: &wgpu::ShaderModule,
        entry_point: &'static str,
        entries: &[wgpu::BindGroupLayoutEntry],
    ) -> Self {
        let bgl = gpu.device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some(entry_point),
            entries,
        });
        let pipeline_layout = gpu.device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some(entry_point),
            bind_group_layouts: &[&bgl],
            push_constant_ranges: &[],
        });
        let pipeline = gpu.device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some(entry_point),
            layout: Some(&pipeline_layout),
            module,
            entry_point,
            compilation_options: wgpu::PipelineCompilationOptions::default(),
            cache: None,
        });
        Kernel { name: entry_point, pipeline, bgl }
    }

    /// Upload `params`, bind `resources` after it (binding 0 is always the
    /// uniform) and record one dispatch.
    fn encode<P: Pod>(
        &self,
        gpu: &GpuDevice,
        encoder: &mut wgpu::CommandEncoder,
        params: &P,
        resources: &[(u32, wgpu::BindingResource<'_>)],
        workgroups: (u32, u32, u32),
    ) {
        if workgroups.0 == 0 || workgroups.1 == 0 || workgroups.2 == 0 {
            return;
        }
        let params_buf = gpu.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some(self.name),
            contents: bytemuck::bytes_of(params),
            usage: wgpu::BufferUsages::UNIFORM,
        });
        let mut entries = Vec::with_capacity(resources.len() + 1);
        entries.push(wgpu::BindGroupEntry { binding: 0, resource: params_buf.as_entire_binding() });
        entries.extend(
            resources.iter().map(|(binding, resource)| wgpu::BindGroupEntry { binding: *binding, resource: resource.clone() }),
        );
        let bind_group = gpu.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(self.name),
            layout: &self.bgl,
            entries: &entries,
        });

        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some(self.name),
            timestamp_writes: None,
        });
        pass.set_pipeline(&self.pipeline);
        pass.set_bind_group(0, &bind_group, &[]);
        pass.dispatch_workgroups(workgroups.0, workgroups.1, workgroups.2);
    }
}

fn shader(gpu: &GpuDevice, label: &'static str, template: &str) -> wgpu::ShaderModule {
    gpu.device.create_shader_module(wgpu::ShaderModuleDescriptor {
        label: Some(label),
        source: wgpu::ShaderSource::Wgsl(gpu.workgroup_size.apply(template).into()),
    })
}

// ---------------------------------------------------------------------------
// SgmKernels
// ---------------------------------------------------------------------------

/// All pipelines of one GPU engine, compiled for the device's workgroup size.
pub struct SgmKernels {
    fill: Kernel,
    similarity: Kernel,
    aggregate: Kernel,
    normalize: Kernel,
    retrieve: Kernel,
}

impl SgmKernels {
    pub fn new(gpu: &GpuDevice) -> Self {
        let fill_module = shader(gpu, "sgm_fill.wgsl", include_str!("../shaders/sgm_fill.wgsl"));
        let volume_module = shader(gpu, "sgm_volume.wgsl", include_str!("../shaders/sgm_volume.wgsl"));
        let optimize_module = shader(gpu, "sgm_optimize.wgsl", include_str!("../shaders/sgm_optimize.wgsl"));
        let retrieve_module = shader(gpu, "sgm_retrieve.wgsl", include_str!("../shaders/sgm_retrieve.wgsl"));

        let fill = Kernel::new(
            gpu,
            &fill_module,
            "fill_volume",
            &[
                // 0 — params
                uniform_entry(0),
                // 1 — target volume
                storage_entry(1, false),
            ],
        );
        let similarity = Kernel::new(
            gpu,
            &volume_module,
            "compute_similarity",
            &[
                // 0 — params
                uniform_entry(0),
                // 1 — reference image
                texture_entry(1),
                // 2 — target image
                texture_entry(2),
                // 3 — depth hypotheses
                storage_entry(3, true),
                // 4 — best volume
                storage_entry(4, false),
                // 5 — second-best volume
                storage_entry(5, false),
            ],
        );
        let aggregate = Kernel::new(
            gpu,
            &optimize_module,
            "aggregate_path",
            &[
                // 0 — params
                uniform_entry(0),
                // 1 — input cost volume
                storage_entry(1, true),
                // 2 — output sum volume
                storage_entry(2, false),
                // 3, 4 — ping-pong slices
                storage_entry(3, false),
                storage_entry(4, false),
                // 5 — per-line minimum
                storage_entry(5, false),
            ],
        );
        let normalize = Kernel::new(
            gpu,
            &optimize_module,
            "normalize_sum",
            &[
                // 0 — params
                uniform_entry(0),
                // 2 — output sum volume
                storage_entry(2, false),
            ],
        );
        let retrieve = Kernel::new(
            gpu,
            &retrieve_module,
            "retrieve_best_depth",
            &[
                // 0 — params
                uniform_entry(0),
                // 1 — final cost volume
                storage_entry(1, true),
                // 2 — depth hypotheses
                storage_entry(2, true),
                // 3 — depth/sim map
                storage_entry(3, false),
            ],
        );

        SgmKernels { fill, similarity, aggregate, normalize, retrieve }
    }

    pub fn encode_fill(
        &self,
        gpu: &GpuDevice,
        encoder: &mut wgpu::CommandEncoder,
        target: &DeviceBuffer,
        dims: VolumeDims,
        value: u32,
    ) {
        let params = FillParams::new(target, dims, value);
        let (wx, wy) = gpu.dispatch_size(params.width, params.height);
        self.fill.encode(gpu, encoder, &params, &[(1, target.binding())], (wx, wy, params.depths));
    }

    #[allow(clippy::too_many_arguments)]
    pub fn encode_similarity(
        &self,
        gpu: &GpuDevice,
        encoder: &mut wgpu::CommandEncoder,
        params: &SimilarityParams,
        rc: &DeviceCamera,
        tc: &DeviceCamera,
        depths: &DeviceBuffer,
        best: &DeviceBuffer,
        second: &DeviceBuffer,
    ) {
        let (wx, wy) = gpu.dispatch_size(params.width, params.height);
        self.similarity.encode(
            gpu,
            encoder,
            params,
            &[
                (1, wgpu::BindingResource::TextureView(&rc.view)),
                (2, wgpu::BindingResource::TextureView(&tc.view)),
                (3, depths.binding()),
                (4, best.binding()),
                (5, second.binding()),
            ],
            (wx, wy, params.z_count),
        );
    }

    #[allow(clippy::too_many_arguments)]
    pub fn encode_aggregate(
        &self,
        gpu: &GpuDevice,
        encoder: &mut wgpu::CommandEncoder,
        params: &OptimizeParams,
        input: &DeviceBuffer,
        output: &DeviceBuffer,
        slice_a: &DeviceBuffer,
        slice_b: &DeviceBuffer,
        axis: &DeviceBuffer,
    ) {
        self.aggregate.encode(
            gpu,
            encoder,
            params,
            &[
                (1, input.binding()),
                (2, output.binding()),
                (3, slice_a.binding()),
                (4, slice_b.binding()),
                (5, axis.binding()),
            ],
            (params.lines, 1, 1),
        );
    }

    pub fn encode_normalize(
        &self,
        gpu: &GpuDevice,
        encoder: &mut wgpu::CommandEncoder,
        params: &OptimizeParams,
        output: &DeviceBuffer,
    ) {
        let (wx, wy) = gpu.dispatch_size(params.width, params.height);
        self.normalize.encode(gpu, encoder, params, &[(2, output.binding())], (wx, wy, params.depths));
    }

    pub fn encode_retrieve(
        &self,
        gpu: &GpuDevice,
        encoder: &mut wgpu::CommandEncoder,
        params: &RetrieveParams,
        volume: &DeviceBuffer,
        depths: &DeviceBuffer,
        map: &DeviceBuffer,
    ) {
        let (wx, wy) = gpu.dispatch_size(params.map_width, params.map_height);
        self.retrieve.encode(
            gpu,
            encoder,
            params,
            &[(1, volume.binding()), (2, depths.binding()), (3, map.binding())],
            (wx, wy, 1),
        );
    }
}
