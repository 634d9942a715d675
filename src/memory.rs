// memory.rs — Pitched buffer layouts and memory accounting.
//
// Every 2-D/3-D buffer the engines own is laid out the way a pitched device
// allocator lays it out: each row starts on a 256-byte boundary. This is the
// same alignment wgpu requires for buffer<->texture copies
// (`wgpu::COPY_BYTES_PER_ROW_ALIGNMENT`), so a volume row can be copied
// straight out of a storage buffer without repacking.
//
// The padded/unpadded distinction is what `memory_usage()` reports:
//
//   unpadded = width × elem × height × depth      (payload)
//   padded   = pitch × height × depth             (what is actually reserved)
//
// `SgmBufferPlan` is the single place where buffer shapes are derived from
// (TileParams, MatchingConfig). Both engines allocate exactly this plan.

use std::iter::Sum;
use std::ops::{Add, AddAssign};

use crate::config::MatchingConfig;
use crate::tile::TileParams;

/// Row pitch alignment, in bytes.
pub const ROW_PITCH_ALIGNMENT: usize = 256;

/// Round `value` up to the next multiple of `alignment`.
#[inline]
pub fn align_to(value: usize, alignment: usize) -> usize {
    value.div_ceil(alignment) * alignment
}

// ---------------------------------------------------------------------------
// BufferLayout
// ---------------------------------------------------------------------------

/// Shape of a pitched `width × height × depth` buffer of `elem_size`-byte cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferLayout {
    pub width: usize,
    pub height: usize,
    pub depth: usize,
    pub elem_size: usize,
    /// Bytes between the starts of two consecutive rows.
    pub pitch_bytes: usize,
}

impl BufferLayout {
    pub fn new(width: usize, height: usize, depth: usize, elem_size: usize) -> Self {
        BufferLayout {
            width,
            height,
            depth,
            elem_size,
            pitch_bytes: align_to((width * elem_size).max(1), ROW_PITCH_ALIGNMENT),
        }
    }

    pub fn new_2d(width: usize, height: usize, elem_size: usize) -> Self {
        Self::new(width, height, 1, elem_size)
    }

    /// Row pitch in elements.
    pub fn pitch(&self) -> usize {
        self.pitch_bytes / self.elem_size
    }

    /// Linear element index of (x, y, z).
    #[inline]
    pub fn index(&self, x: usize, y: usize, z: usize) -> usize {
        (z * self.height + y) * self.pitch() + x
    }

    /// Element count including padding.
    pub fn len(&self) -> usize {
        self.pitch() * self.height * self.depth
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn padded_bytes(&self) -> usize {
        self.pitch_bytes * self.height * self.depth
    }

    pub fn unpadded_bytes(&self) -> usize {
        self.width * self.elem_size * self.height * self.depth
    }

    pub fn usage(&self) -> MemoryUsage {
        MemoryUsage { padded_bytes: self.padded_bytes(), unpadded_bytes: self.unpadded_bytes() }
    }
}

// ---------------------------------------------------------------------------
// HostBuffer
// ---------------------------------------------------------------------------

/// A pitched host-side buffer: the CPU counterpart of one device allocation.
#[derive(Debug, Clone)]
pub struct HostBuffer<T: Copy + Default> {
    layout: BufferLayout,
    data: Vec<T>,
}

impl<T: Copy + Default> HostBuffer<T> {
    /// Allocate `layout` and fill it with `fill`.
    pub fn new(layout: BufferLayout, fill: T) -> Self {
        debug_assert_eq!(layout.elem_size, std::mem::size_of::<T>());
        HostBuffer { layout, data: vec![fill; layout.len()] }
    }

    pub fn layout(&self) -> &BufferLayout {
        &self.layout
    }

    #[inline]
    pub fn get(&self, x: usize, y: usize, z: usize) -> T {
        self.data[self.layout.index(x, y, z)]
    }

    #[inline]
    pub fn set(&mut self, x: usize, y: usize, z: usize, v: T) {
        let i = self.layout.index(x, y, z);
        self.data[i] = v;
    }

    #[inline]
    pub fn get_mut(&mut self, x: usize, y: usize, z: usize) -> &mut T {
        let i = self.layout.index(x, y, z);
        &mut self.data[i]
    }

    pub fn as_slice(&self) -> &[T] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [T] {
        &mut self.data
    }

    /// Slice of `len` cells of row (y, z), starting at x = 0.
    #[inline]
    pub fn row(&self, y: usize, z: usize, len: usize) -> &[T] {
        let start = self.layout.index(0, y, z);
        &self.data[start..start + len]
    }

    #[inline]
    pub fn row_mut(&mut self, y: usize, z: usize, len: usize) -> &mut [T] {
        let start = self.layout.index(0, y, z);
        &mut self.data[start..start + len]
    }
}

// ---------------------------------------------------------------------------
// MemoryUsage
// ---------------------------------------------------------------------------

/// Byte totals across a set of owned buffers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryUsage {
    pub padded_bytes: usize,
    pub unpadded_bytes: usize,
}

impl MemoryUsage {
    pub fn padded_mb(&self) -> f64 {
        self.padded_bytes as f64 / (1024.0 * 1024.0)
    }

    pub fn unpadded_mb(&self) -> f64 {
        self.unpadded_bytes as f64 / (1024.0 * 1024.0)
    }
}

impl Add for MemoryUsage {
    type Output = MemoryUsage;

    fn add(self, rhs: MemoryUsage) -> MemoryUsage {
        MemoryUsage {
            padded_bytes: self.padded_bytes + rhs.padded_bytes,
            unpadded_bytes: self.unpadded_bytes + rhs.unpadded_bytes,
        }
    }
}

impl AddAssign for MemoryUsage {
    fn add_assign(&mut self, rhs: MemoryUsage) {
        *self = *self + rhs;
    }
}

impl Sum for MemoryUsage {
    fn sum<I: Iterator<Item = MemoryUsage>>(iter: I) -> MemoryUsage {
        iter.fold(MemoryUsage::default(), Add::add)
    }
}

// ---------------------------------------------------------------------------
// SgmBufferPlan
// ---------------------------------------------------------------------------

/// Size in bytes of one volume / slice / axis cell (u32 accumulators).
pub const VOLUME_CELL_BYTES: usize = 4;
/// Size in bytes of one depth/sim map cell (depth f32 + sim f32).
pub const DEPTH_SIM_CELL_BYTES: usize = 8;

/// Worst-case buffer shapes for one engine instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SgmBufferPlan {
    pub max_tile_width: usize,
    pub max_tile_height: usize,
    pub max_depths: usize,
    /// max(max_tile_width, max_tile_height): longest aggregation path.
    pub max_side: usize,
    /// Depth hypotheses; uploads are staged by the queue.
    pub depths: BufferLayout,
    pub depth_sim_map: BufferLayout,
    /// Layout shared by both similarity volumes.
    pub volume: BufferLayout,
    /// Ping-pong slice layout (`max_side × max_depths`), present with aggregation.
    pub slice: Option<BufferLayout>,
    /// Axis accumulator (`max_side × 1`), present with aggregation.
    pub axis: Option<BufferLayout>,
}

impl SgmBufferPlan {
    pub fn new(tile_params: TileParams, config: &MatchingConfig) -> Self {
        let (max_tile_width, max_tile_height) = tile_params.max_cells(config.downscale());
        let max_depths = config.max_depths;
        let max_side = max_tile_width.max(max_tile_height);

        let (slice, axis) = if config.do_optimize_volume {
            (
                Some(BufferLayout::new_2d(max_side, max_depths, VOLUME_CELL_BYTES)),
                Some(BufferLayout::new_2d(max_side, 1, VOLUME_CELL_BYTES)),
            )
        } else {
            (None, None)
        };

        SgmBufferPlan {
            max_tile_width,
            max_tile_height,
            max_depths,
            max_side,
            depths: BufferLayout::new_2d(max_depths, 1, 4),
            depth_sim_map: BufferLayout::new_2d(max_tile_width, max_tile_height, DEPTH_SIM_CELL_BYTES),
            volume: BufferLayout::new(max_tile_width, max_tile_height, max_depths, VOLUME_CELL_BYTES),
            slice,
            axis,
        }
    }

    pub fn aggregation_enabled(&self) -> bool {
        self.slice.is_some()
    }

    /// Totals across every buffer the plan allocates.
    pub fn memory_usage(&self) -> MemoryUsage {
        let mut total = self.depths.usage() + self.depth_sim_map.usage();
        total += self.volume.usage() + self.volume.usage(); // best + second best
        if let Some(slice) = self.slice {
            total += slice.usage() + slice.usage(); // ping-pong pair
        }
        if let Some(axis) = self.axis {
            total += axis.usage();
        }
        total
    }
}
