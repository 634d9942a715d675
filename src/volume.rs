// volume.rs — Similarity volumes and the role tracking of the volume pair.
//
// A similarity volume holds one quantized cost per (x, y, depth index).
// 255 is the worst cost and the initialization value; lower is better.
// Cells are u32 so the aggregator can accumulate per-sweep sums in place
// before normalizing back to [0, 255].
//
// BUFFER ROLES
// ────────────
// An engine owns exactly two volumes. During a tile they change meaning:
//
//   stage            primary buffer        secondary buffer
//   ───────────────  ────────────────────  ────────────────
//   fusion           raw best cost         second-best cost
//   final            final (aggregated     second-best cost
//                    or passthrough) cost  (aggregation input)
//
// `CostVolumes` makes the switch explicit: fusion writes through
// `fusion_targets()`, aggregation/passthrough through `begin_final_stage()`,
// and each accessor only answers for the role the buffer currently holds.
// It is generic over the storage so the GPU engine tracks its device
// buffers the same way.

use crate::memory::{BufferLayout, HostBuffer};

/// Worst (and initial) similarity cost.
pub const SIM_WORST: u32 = 255;

/// Active extent of a volume for one tile: cells actually computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VolumeDims {
    pub width: usize,
    pub height: usize,
    pub depths: usize,
}

impl VolumeDims {
    pub fn cells(&self) -> usize {
        self.width * self.height * self.depths
    }
}

/// Host-resident similarity volume, pitched like its device counterpart.
#[derive(Debug, Clone)]
pub struct SimilarityVolume {
    buf: HostBuffer<u32>,
}

impl SimilarityVolume {
    /// Allocate a volume for `layout`, filled with `SIM_WORST`.
    pub fn new(layout: BufferLayout) -> Self {
        SimilarityVolume { buf: HostBuffer::new(layout, SIM_WORST) }
    }

    pub fn layout(&self) -> &BufferLayout {
        self.buf.layout()
    }

    #[inline]
    pub fn get(&self, x: usize, y: usize, z: usize) -> u32 {
        self.buf.get(x, y, z)
    }

    #[inline]
    pub fn set(&mut self, x: usize, y: usize, z: usize, v: u32) {
        self.buf.set(x, y, z, v)
    }

    #[inline]
    pub fn get_mut(&mut self, x: usize, y: usize, z: usize) -> &mut u32 {
        self.buf.get_mut(x, y, z)
    }

    /// Fill the active region with `value`.
    pub fn fill(&mut self, dims: VolumeDims, value: u32) {
        for z in 0..dims.depths {
            for y in 0..dims.height {
                self.buf.row_mut(y, z, dims.width).fill(value);
            }
        }
    }

    /// Copy the active region of `src` into `self`.
    pub fn copy_from(&mut self, src: &SimilarityVolume, dims: VolumeDims) {
        for z in 0..dims.depths {
            self.copy_slice_from(src, z, dims);
        }
    }

    /// Copy depth slice `z` of `src` into `self`.
    pub fn copy_slice_from(&mut self, src: &SimilarityVolume, z: usize, dims: VolumeDims) {
        for y in 0..dims.height {
            self.buf.row_mut(y, z, dims.width).copy_from_slice(src.buf.row(y, z, dims.width));
        }
    }

    /// Costs of pixel (x, y) over depth indices [0, depths).
    pub fn column(&self, x: usize, y: usize, depths: usize) -> Vec<u32> {
        (0..depths).map(|z| self.get(x, y, z)).collect()
    }

    /// Active region packed as x-fastest, then y, then z (no padding).
    pub fn to_packed(&self, dims: VolumeDims) -> Vec<u32> {
        let mut out = Vec::with_capacity(dims.cells());
        for z in 0..dims.depths {
            for y in 0..dims.height {
                out.extend_from_slice(self.buf.row(y, z, dims.width));
            }
        }
        out
    }
}

// ---------------------------------------------------------------------------
// Role tracking
// ---------------------------------------------------------------------------

/// What the primary buffer of a `CostVolumes` pair currently holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrimaryRole {
    /// Lowest fused cost per cell.
    RawBest,
    /// Cost volume the extractor reads (aggregated or passthrough).
    FinalCost,
}

/// The two owned volumes of an engine, with their current roles.
#[derive(Debug)]
pub struct CostVolumes<V> {
    primary: V,
    second_best: V,
    role: PrimaryRole,
}

impl<V> CostVolumes<V> {
    pub fn new(primary: V, second_best: V) -> Self {
        CostVolumes { primary, second_best, role: PrimaryRole::RawBest }
    }

    pub fn role(&self) -> PrimaryRole {
        self.role
    }

    /// Start a tile: returns (best, second best) for fusion.
    pub fn fusion_targets(&mut self) -> (&mut V, &mut V) {
        self.role = PrimaryRole::RawBest;
        (&mut self.primary, &mut self.second_best)
    }

    /// Switch the primary buffer to the final-cost role.
    /// Returns (final cost output, second best input).
    pub fn begin_final_stage(&mut self) -> (&mut V, &V) {
        self.role = PrimaryRole::FinalCost;
        (&mut self.primary, &self.second_best)
    }

    /// Fused best cost, while the primary buffer still holds it.
    pub fn raw_best(&self) -> Option<&V> {
        (self.role == PrimaryRole::RawBest).then_some(&self.primary)
    }

    /// Final cost volume, once the final stage has run.
    pub fn final_cost(&self) -> Option<&V> {
        (self.role == PrimaryRole::FinalCost).then_some(&self.primary)
    }

    pub fn second_best(&self) -> &V {
        &self.second_best
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dims() -> VolumeDims {
        VolumeDims { width: 3, height: 2, depths: 4 }
    }

    #[test]
    fn test_new_is_worst() {
        let v = SimilarityVolume::new(BufferLayout::new(3, 2, 4, 4));
        assert!(v.to_packed(dims()).iter().all(|&c| c == SIM_WORST));
    }

    #[test]
    fn test_fill_only_active_region() {
        let layout = BufferLayout::new(5, 5, 5, 4);
        let mut v = SimilarityVolume::new(layout);
        v.fill(dims(), 7);
        assert_eq!(v.get(2, 1, 3), 7);
        assert_eq!(v.get(3, 1, 3), SIM_WORST);
        assert_eq!(v.get(0, 2, 0), SIM_WORST);
        assert_eq!(v.get(0, 0, 4), SIM_WORST);
    }

    #[test]
    fn test_copy_slice() {
        let layout = BufferLayout::new(3, 2, 4, 4);
        let mut a = SimilarityVolume::new(layout);
        let mut b = SimilarityVolume::new(layout);
        a.fill(dims(), 3);
        b.copy_slice_from(&a, 2, dims());
        assert_eq!(b.get(1, 1, 2), 3);
        assert_eq!(b.get(1, 1, 1), SIM_WORST);
        b.copy_from(&a, dims());
        assert_eq!(b.to_packed(dims()), a.to_packed(dims()));
    }

    #[test]
    fn test_roles() {
        let mut pair = CostVolumes::new(1u8, 2u8);
        {
            let (best, second) = pair.fusion_targets();
            *best = 10;
            *second = 20;
        }
        assert_eq!(pair.raw_best(), Some(&10));
        assert_eq!(pair.final_cost(), None);

        {
            let (out, input) = pair.begin_final_stage();
            *out = *input + 1;
        }
        assert_eq!(pair.role(), PrimaryRole::FinalCost);
        assert_eq!(pair.raw_best(), None);
        assert_eq!(pair.final_cost(), Some(&21));
        assert_eq!(*pair.second_best(), 20);

        pair.fusion_targets();
        assert_eq!(pair.role(), PrimaryRole::RawBest);
    }
}
