// gpu/camera.rs — Device-resident cameras for the GPU engine.
//
// A `DeviceCamera` is a `HostCamera` (scaled intrinsics + box-downscaled f32
// image) plus that image uploaded as an `R32Float` texture. Kernels read it
// with `textureLoad` and interpolate by hand, because 32-bit float textures
// are not filterable without an optional feature, and manual interpolation
// keeps the GPU sample bit-compatible with `Image::sample_bilinear`.
//
// Device cameras live in a `CameraCache<DeviceCamera>` shared by every GPU
// engine on the same device: one upload per (camera, scale).

use log::debug;
use wgpu::util::DeviceExt;

use crate::cache::{CameraCache, CameraHandle, CameraKey, HostCamera};
use crate::camera::ViewSet;
use crate::error::SgmError;
use crate::gpu::device::GpuDevice;
use crate::memory::align_to;

/// A camera at matching scale with its image on the device.
pub struct DeviceCamera {
    pub host: HostCamera,
    pub texture: wgpu::Texture,
    pub view: wgpu::TextureView,
    pub width: u32,
    pub height: u32,
}

impl DeviceCamera {
    /// Build the host camera for `key` and upload its image.
    pub fn build(gpu: &GpuDevice, views: &ViewSet, key: CameraKey) -> Result<Self, SgmError> {
        let host = HostCamera::build(views, key)?;
        let (texture, view, width, height) = gpu.scoped("uploading a camera image", || {
            let width = host.image.width().max(1) as u32;
            let height = host.image.height().max(1) as u32;

            let texture = gpu.device.create_texture(&wgpu::TextureDescriptor {
                label: Some("DeviceCamera"),
                size: wgpu::Extent3d { width, height, depth_or_array_layers: 1 },
                mip_level_count: 1,
                sample_count: 1,
                dimension: wgpu::TextureDimension::D2,
                format: wgpu::TextureFormat::R32Float,
                usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
                view_formats: &[],
            });
            let view = texture.create_view(&wgpu::TextureViewDescriptor::default());

            // Rows padded to 256 bytes for the buffer → texture copy.
            let bytes_per_row = align_to(width as usize * 4, wgpu::COPY_BYTES_PER_ROW_ALIGNMENT as usize);
            let row_floats = bytes_per_row / 4;
            let mut staging = vec![0.0f32; row_floats * height as usize];
            for y in 0..host.image.height() {
                let row = host.image.row(y);
                staging[y * row_floats..y * row_floats + row.len()].copy_from_slice(row);
            }
            let staging_buf = gpu.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("DeviceCamera::staging"),
                contents: bytemuck::cast_slice(&staging),
                usage: wgpu::BufferUsages::COPY_SRC,
            });

            let mut encoder = gpu
                .device
                .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("DeviceCamera::upload") });
            encoder.copy_buffer_to_texture(
                wgpu::ImageCopyBuffer {
                    buffer: &staging_buf,
                    layout: wgpu::ImageDataLayout {
                        offset: 0,
                        bytes_per_row: Some(bytes_per_row as u32),
                        rows_per_image: Some(height),
                    },
                },
                wgpu::ImageCopyTexture {
                    texture: &texture,
                    mip_level: 0,
                    origin: wgpu::Origin3d::ZERO,
                    aspect: wgpu::TextureAspect::All,
                },
                wgpu::Extent3d { width, height, depth_or_array_layers: 1 },
            );
            gpu.queue.submit(std::iter::once(encoder.finish()));
            (texture, view, width, height)
        })?;
        debug!("uploaded {key}: {width}x{height} R32Float");
        Ok(DeviceCamera { host, texture, view, width, height })
    }
}

/// Cache of device cameras used by the GPU engine.
pub type DeviceCameraCache = CameraCache<DeviceCamera>;

/// Request a device camera, uploading it on first access.
pub fn request_device_camera(
    gpu: &GpuDevice,
    cache: &DeviceCameraCache,
    views: &ViewSet,
    camera: usize,
    scale: u32,
) -> Result<CameraHandle<DeviceCamera>, SgmError> {
    let key = CameraKey::new(camera, scale);
    cache.request(key, || DeviceCamera::build(gpu, views, key))
}
