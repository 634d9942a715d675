// tile.rs — Tiles: bounded regions of a reference view processed as one unit.
//
// A `Tile` is produced by the caller's tiling stage and handed to an engine
// unchanged. Its ROI is in full-resolution reference pixels; the engines
// work on `roi.downscaled(scale * step_xy)`, the region of volume cells.

use std::fmt;

/// Half-open integer range [begin, end).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Range {
    pub begin: usize,
    pub end: usize,
}

impl Range {
    pub fn new(begin: usize, end: usize) -> Self {
        Range { begin, end: end.max(begin) }
    }

    pub fn size(&self) -> usize {
        self.end - self.begin
    }

    pub fn contains(&self, v: usize) -> bool {
        v >= self.begin && v < self.end
    }
}

/// Rectangular region of interest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Roi {
    pub x: Range,
    pub y: Range,
}

impl Roi {
    pub fn new(x_begin: usize, x_end: usize, y_begin: usize, y_end: usize) -> Self {
        Roi { x: Range::new(x_begin, x_end), y: Range::new(y_begin, y_end) }
    }

    pub fn width(&self) -> usize {
        self.x.size()
    }

    pub fn height(&self) -> usize {
        self.y.size()
    }

    pub fn is_empty(&self) -> bool {
        self.width() == 0 || self.height() == 0
    }

    /// Region covered in a grid `factor` times coarser: begin rounds down,
    /// end rounds up, so every full-resolution pixel keeps a cell.
    pub fn downscaled(&self, factor: u32) -> Roi {
        let f = factor.max(1) as usize;
        Roi {
            x: Range::new(self.x.begin / f, self.x.end.div_ceil(f)),
            y: Range::new(self.y.begin / f, self.y.end.div_ceil(f)),
        }
    }
}

/// Tile geometry fixed for a whole run, in full-resolution pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileParams {
    pub width: usize,
    pub height: usize,
}

impl TileParams {
    /// Largest volume extent (cells) a tile may have at `downscale`:
    /// `ceil(width / downscale) × ceil(height / downscale)`.
    ///
    /// Tiles whose origin is a multiple of the downscale always fit. An
    /// unaligned origin can straddle one more cell and is rejected by the
    /// engines when it does.
    pub fn max_cells(&self, downscale: u32) -> (usize, usize) {
        let d = downscale.max(1) as usize;
        (self.width.div_ceil(d), self.height.div_ceil(d))
    }
}

/// One unit of work for an engine. Immutable once dispatched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tile {
    /// Reference camera id.
    pub rc: usize,
    /// Ordered target camera ids.
    pub tcams: Vec<usize>,
    /// Region in full-resolution reference pixels.
    pub roi: Roi,
    pub index: usize,
    pub count: usize,
}

impl Tile {
    pub fn new(rc: usize, tcams: Vec<usize>, roi: Roi, index: usize, count: usize) -> Self {
        Tile { rc, tcams, roi, index, count }
    }

    /// Single-tile convenience constructor.
    pub fn whole(rc: usize, tcams: Vec<usize>, roi: Roi) -> Self {
        Tile::new(rc, tcams, roi, 0, 1)
    }

    /// Log / error-message prefix, e.g. "[tile 2/9] ". Empty for single-tile views.
    pub fn prefix(&self) -> String {
        if self.count > 1 {
            format!("[tile {}/{}] ", self.index + 1, self.count)
        } else {
            String::new()
        }
    }

    /// Origin used to key diagnostics; only meaningful with several tiles.
    pub fn origin(&self) -> Option<(usize, usize)> {
        (self.count > 1).then_some((self.roi.x.begin, self.roi.y.begin))
    }
}

impl fmt::Display for Tile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.prefix())
    }
}

/// Split a `width × height` reference image into tiles of `params` size,
/// row-major. Helper for callers and demos; the engines never tile.
pub fn tile_roi_grid(width: usize, height: usize, params: TileParams) -> Vec<Roi> {
    let mut rois = Vec::new();
    if params.width == 0 || params.height == 0 {
        return rois;
    }
    let mut y = 0;
    while y < height {
        let mut x = 0;
        while x < width {
            rois.push(Roi::new(x, (x + params.width).min(width), y, (y + params.height).min(height)));
            x += params.width;
        }
        y += params.height;
    }
    rois
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_downscaled_rounds_outward() {
        let roi = Roi::new(5, 13, 0, 8);
        let ds = roi.downscaled(4);
        assert_eq!(ds.x, Range::new(1, 4));
        assert_eq!(ds.y, Range::new(0, 2));
        assert_eq!(roi.downscaled(1), roi);
    }

    #[test]
    fn test_max_cells() {
        let params = TileParams { width: 18, height: 8 };
        assert_eq!(params.max_cells(4), (5, 2));
        assert_eq!(params.max_cells(1), (18, 8));

        // Aligned origins fit, an unaligned one straddles an extra cell.
        let (mw, _) = TileParams { width: 16, height: 8 }.max_cells(4);
        for x0 in [0, 4, 16, 20] {
            assert!(Roi::new(x0, x0 + 16, 0, 8).downscaled(4).width() <= mw);
        }
        assert_eq!(Roi::new(2, 18, 0, 8).downscaled(4).width(), mw + 1);
    }

    #[test]
    fn test_prefix() {
        let t = Tile::new(0, vec![1], Roi::new(0, 4, 0, 4), 1, 3);
        assert_eq!(t.to_string(), "[tile 2/3] ");
        assert_eq!(t.origin(), Some((0, 0)));
        let single = Tile::whole(0, vec![1], Roi::new(0, 4, 0, 4));
        assert_eq!(single.to_string(), "");
        assert_eq!(single.origin(), None);
    }

    #[test]
    fn test_tile_grid() {
        let rois = tile_roi_grid(100, 50, TileParams { width: 64, height: 32 });
        assert_eq!(rois.len(), 4);
        assert_eq!(rois[1], Roi::new(64, 100, 0, 32));
        assert_eq!(rois[3], Roi::new(64, 100, 32, 50));
    }
}
