// depth_list.rs — Depth hypotheses of one tile and their per-target coverage.
//
// The depth-range derivation stage (outside this crate) decides which
// planes to test for a reference view and, for every target camera, which
// contiguous slice of them that camera can reliably score. This module only
// holds and validates that result.

use crate::error::SgmError;

/// Contiguous index range [first, first + count) into the depth list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DepthRange {
    pub first: usize,
    pub count: usize,
}

impl DepthRange {
    pub fn new(first: usize, count: usize) -> Self {
        DepthRange { first, count }
    }

    pub fn end(&self) -> usize {
        self.first + self.count
    }

    pub fn contains(&self, z: usize) -> bool {
        z >= self.first && z < self.end()
    }
}

/// Ordered depth values plus one `DepthRange` per target camera, in the
/// same order as `Tile::tcams`.
#[derive(Debug, Clone, PartialEq)]
pub struct DepthHypothesisSet {
    depths: Vec<f32>,
    tc_ranges: Vec<DepthRange>,
}

impl DepthHypothesisSet {
    pub fn new(depths: Vec<f32>, tc_ranges: Vec<DepthRange>) -> Self {
        DepthHypothesisSet { depths, tc_ranges }
    }

    /// Every target camera scores every depth.
    pub fn full_coverage(depths: Vec<f32>, tc_count: usize) -> Self {
        let n = depths.len();
        DepthHypothesisSet { depths, tc_ranges: vec![DepthRange::new(0, n); tc_count] }
    }

    pub fn depths(&self) -> &[f32] {
        &self.depths
    }

    pub fn len(&self) -> usize {
        self.depths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.depths.is_empty()
    }

    pub fn tc_ranges(&self) -> &[DepthRange] {
        &self.tc_ranges
    }

    /// (min, max) depth value. `None` when empty.
    pub fn bounds(&self) -> Option<(f32, f32)> {
        let mut it = self.depths.iter().copied();
        let first = it.next()?;
        Some(it.fold((first, first), |(lo, hi), d| (lo.min(d), hi.max(d))))
    }

    /// Number of target cameras scoring each depth index.
    pub fn coverage(&self) -> Vec<u32> {
        let mut cov = vec![0u32; self.depths.len()];
        for r in &self.tc_ranges {
            for c in cov.iter_mut().skip(r.first).take(r.count) {
                *c += 1;
            }
        }
        cov
    }

    /// Check the set against a tile with `tc_count` target cameras and an
    /// engine sized for `max_depths`. Emptiness is reported by the engine
    /// itself, with the view id.
    pub fn validate(&self, tc_count: usize, max_depths: usize) -> Result<(), SgmError> {
        if self.depths.len() > max_depths {
            return Err(SgmError::TooManyDepths { count: self.depths.len(), max: max_depths });
        }
        if self.tc_ranges.len() != tc_count {
            return Err(SgmError::DepthRangeCount { ranges: self.tc_ranges.len(), tcams: tc_count });
        }
        for (tc, r) in self.tc_ranges.iter().enumerate() {
            if r.end() > self.depths.len() {
                return Err(SgmError::DepthRangeOutOfBounds {
                    tc,
                    first: r.first,
                    count: r.count,
                    depths: self.depths.len(),
                });
            }
        }
        Ok(())
    }
}
