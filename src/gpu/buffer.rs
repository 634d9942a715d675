// gpu/buffer.rs — Pitched device buffers and blocking readback.
//
// A `DeviceBuffer` is one storage allocation shaped by a `BufferLayout`,
// i.e. the exact same pitched addressing the host buffers use:
//
//   index(x, y, z) = (z · height + y) · pitch + x       (elements)
//
// Kernels receive `pitch` and `height` in their uniforms and compute the
// same index, so a region read back from the device can be unpacked with
// the host layout without any repacking on the GPU.
//
// READBACK
// ────────
// wgpu buffers cannot be mapped while the GPU may still write them. A
// readback copies the wanted byte range into a MAP_READ staging buffer,
// submits, maps it asynchronously and blocks in `device.poll(Wait)` until
// the callback has fired. Readbacks are therefore the synchronization
// points of the GPU engine: everything submitted earlier on the queue has
// finished once one returns.

use bytemuck::Pod;

use crate::gpu::device::{GpuDevice, GpuError};
use crate::memory::BufferLayout;
use crate::volume::VolumeDims;

/// One storage buffer with a pitched layout.
pub struct DeviceBuffer {
    pub buffer: wgpu::Buffer,
    pub layout: BufferLayout,
    label: &'static str,
}

impl DeviceBuffer {
    /// Allocate `layout` as a storage buffer. Rejects layouts larger than
    /// the device allows to bind before asking the driver.
    pub fn new(gpu: &GpuDevice, label: &'static str, layout: BufferLayout) -> Result<Self, GpuError> {
        let bytes = (layout.padded_bytes() as u64).max(wgpu::COPY_BUFFER_ALIGNMENT);
        let max = gpu.max_storage_bytes();
        if bytes > max {
            return Err(GpuError::BufferTooLarge { label: label.to_string(), bytes, max });
        }
        let buffer = gpu.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(label),
            size: bytes,
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        Ok(DeviceBuffer { buffer, layout, label })
    }

    pub fn label(&self) -> &'static str {
        self.label
    }

    pub fn size(&self) -> u64 {
        self.buffer.size()
    }

    /// Layout pitch in elements, as the kernels expect it.
    pub fn pitch(&self) -> u32 {
        self.layout.pitch() as u32
    }

    pub fn binding(&self) -> wgpu::BindingResource<'_> {
        self.buffer.as_entire_binding()
    }

    /// Queue a write of `data` at element offset 0.
    pub fn write<T: Pod>(&self, gpu: &GpuDevice, data: &[T]) {
        gpu.queue.write_buffer(&self.buffer, 0, bytemuck::cast_slice(data));
    }

    /// Blocking read of the first `count` elements.
    pub fn read<T: Pod>(&self, gpu: &GpuDevice, count: usize) -> Result<Vec<T>, GpuError> {
        read_buffer(gpu, &self.buffer, (count * std::mem::size_of::<T>()) as u64)
    }

    /// Blocking read of the active region of a volume, packed x-fastest,
    /// then y, then z.
    pub fn read_volume(&self, gpu: &GpuDevice, dims: VolumeDims) -> Result<Vec<u32>, GpuError> {
        if dims.cells() == 0 {
            return Ok(Vec::new());
        }
        let raw: Vec<u32> = self.read(gpu, self.layout.index(0, 0, dims.depths))?;
        let mut out = Vec::with_capacity(dims.cells());
        for z in 0..dims.depths {
            for y in 0..dims.height {
                let start = self.layout.index(0, y, z);
                out.extend_from_slice(&raw[start..start + dims.width]);
            }
        }
        Ok(out)
    }

    /// Blocking read of a `width × height` 2-D region of `T` cells.
    pub fn read_2d<T: Pod>(&self, gpu: &GpuDevice, width: usize, height: usize) -> Result<Vec<T>, GpuError> {
        if width == 0 || height == 0 {
            return Ok(Vec::new());
        }
        let raw: Vec<T> = self.read(gpu, self.layout.index(0, height, 0))?;
        let mut out = Vec::with_capacity(width * height);
        for y in 0..height {
            let start = self.layout.index(0, y, 0);
            out.extend_from_slice(&raw[start..start + width]);
        }
        Ok(out)
    }
}

/// Copy the first `bytes` of `src` to the host and wait for the result.
pub fn read_buffer<T: Pod>(gpu: &GpuDevice, src: &wgpu::Buffer, bytes: u64) -> Result<Vec<T>, GpuError> {
    let size = bytes.next_multiple_of(wgpu::COPY_BUFFER_ALIGNMENT).min(src.size());
    if size == 0 {
        return Ok(Vec::new());
    }
    let rb = gpu.device.create_buffer(&wgpu::BufferDescriptor {
        label: Some("readback"),
        size,
        usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
        mapped_at_creation: false,
    });
    let mut encoder = gpu.device.create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("readback") });
    encoder.copy_buffer_to_buffer(src, 0, &rb, 0, size);
    gpu.queue.submit(std::iter::once(encoder.finish()));

    let slice = rb.slice(..);
    let (tx, rx) = std::sync::mpsc::channel();
    slice.map_async(wgpu::MapMode::Read, move |r| {
        // The receiver only disappears if this function already returned.
        let _ = tx.send(r);
    });
    gpu.device.poll(wgpu::Maintain::Wait);
    rx.recv().map_err(|_| GpuError::MapCallbackLost)??;

    let mapped = slice.get_mapped_range();
    let elem = std::mem::size_of::<T>();
    let n = (bytes as usize / elem).min(mapped.len() / elem);
    let out: Vec<T> = bytemuck::cast_slice(&mapped[..n * elem]).to_vec();
    drop(mapped);
    rb.unmap();
    Ok(out)
}
