// image.rs — Grayscale images for matching.
//
// A view arrives as `Image<u8>`. The camera cache turns it into an
// `Image<f32>` at matching scale (box-filtered), and every cost evaluation
// samples that f32 image bilinearly. Storage is packed row-major, so a row
// is a contiguous slice and can be copied straight into a staging buffer.
//
// Sampling convention: pixel (x, y) sits at integer coordinates. A sample
// is valid on [0, w-1] × [0, h-1]; anything outside yields `None` instead
// of a clamped border value, which the costs count as a missing sample.

use std::fmt;

/// Pixel types an `Image` can hold.
pub trait Pixel: Copy + Default + Send + Sync + PartialOrd + 'static {
    /// Raw intensity as f32 (no normalization).
    fn to_f32(self) -> f32;
}

impl Pixel for u8 {
    #[inline]
    fn to_f32(self) -> f32 {
        self as f32
    }
}

impl Pixel for f32 {
    #[inline]
    fn to_f32(self) -> f32 {
        self
    }
}

/// Packed row-major image with runtime dimensions.
#[derive(Clone, PartialEq)]
pub struct Image<T: Pixel> {
    data: Vec<T>,
    width: usize,
    height: usize,
}

impl<T: Pixel> Image<T> {
    /// Image filled with `T::default()`.
    pub fn new(width: usize, height: usize) -> Self {
        Image { data: vec![T::default(); width * height], width, height }
    }

    /// Wrap decoded pixels. `None` if `data` is not exactly `width × height`.
    pub fn from_vec(width: usize, height: usize, data: Vec<T>) -> Option<Self> {
        (data.len() == width * height).then_some(Image { data, width, height })
    }

    /// Evaluate `f(x, y)` for every pixel, row by row.
    pub fn from_fn(width: usize, height: usize, mut f: impl FnMut(usize, usize) -> T) -> Self {
        let mut data = Vec::with_capacity(width * height);
        for y in 0..height {
            data.extend((0..width).map(|x| f(x, y)));
        }
        Image { data, width, height }
    }

    #[inline]
    pub fn width(&self) -> usize {
        self.width
    }

    #[inline]
    pub fn height(&self) -> usize {
        self.height
    }

    /// # Panics
    /// If (x, y) lies outside the image.
    #[inline]
    pub fn get(&self, x: usize, y: usize) -> T {
        assert!(x < self.width && y < self.height, "({x},{y}) outside {}x{} image", self.width, self.height);
        self.data[y * self.width + x]
    }

    #[inline]
    pub fn set(&mut self, x: usize, y: usize, value: T) {
        assert!(x < self.width && y < self.height, "({x},{y}) outside {}x{} image", self.width, self.height);
        self.data[y * self.width + x] = value;
    }

    #[inline]
    pub fn row(&self, y: usize) -> &[T] {
        &self.data[y * self.width..(y + 1) * self.width]
    }

    pub fn as_slice(&self) -> &[T] {
        &self.data
    }

    /// Mean of each `factor × factor` block, as f32.
    ///
    /// Output (x, y) averages the block starting at (x·factor, y·factor);
    /// columns and rows that do not fill a whole block are dropped.
    /// A factor of 0 is treated as 1.
    pub fn downscale_box(&self, factor: usize) -> Image<f32> {
        let factor = factor.max(1);
        let norm = 1.0 / (factor * factor) as f32;
        Image::from_fn(self.width / factor, self.height / factor, |x, y| {
            let mut sum = 0.0f32;
            for by in y * factor..(y + 1) * factor {
                sum += self.row(by)[x * factor..(x + 1) * factor].iter().map(|p| p.to_f32()).sum::<f32>();
            }
            sum * norm
        })
    }
}

impl Image<f32> {
    /// Bilinear interpolation at (x, y); `None` outside [0, w-1] × [0, h-1]
    /// (NaN coordinates included).
    ///
    /// The expression order is shared with the similarity kernel.
    #[inline]
    pub fn sample_bilinear(&self, x: f32, y: f32) -> Option<f32> {
        if self.width == 0 || self.height == 0 {
            return None;
        }
        let inside = x >= 0.0 && y >= 0.0 && x <= (self.width - 1) as f32 && y <= (self.height - 1) as f32;
        if !inside {
            return None;
        }
        let (x0, y0) = (x.floor() as usize, y.floor() as usize);
        let (fx, fy) = (x - x0 as f32, y - y0 as f32);
        let x1 = (x0 + 1).min(self.width - 1);
        let y1 = (y0 + 1).min(self.height - 1);

        let at = |xx: usize, yy: usize| self.data[yy * self.width + xx];
        Some(
            (1.0 - fx) * (1.0 - fy) * at(x0, y0)
                + fx * (1.0 - fy) * at(x1, y0)
                + (1.0 - fx) * fy * at(x0, y1)
                + fx * fy * at(x1, y1),
        )
    }
}

impl<T: Pixel + fmt::Debug> fmt::Debug for Image<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Image({}x{})", self.width, self.height)?;
        if self.width * self.height <= 64 {
            for y in 0..self.height {
                write!(f, "\n  {:?}", self.row(y))?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_vec_checks_length() {
        assert!(Image::from_vec(3, 2, vec![0u8; 6]).is_some());
        assert!(Image::from_vec(3, 2, vec![0u8; 5]).is_none());
    }

    #[test]
    fn test_rows_are_packed() {
        let img = Image::from_fn(4, 3, |x, y| (x + 10 * y) as u8);
        assert_eq!(img.row(2), &[20, 21, 22, 23]);
        assert_eq!(img.as_slice().len(), 12);
        assert_eq!(img.get(3, 1), 13);
    }

    #[test]
    fn test_downscale_box() {
        // Values x + 4y; 2×2 block means.
        let img = Image::from_fn(4, 4, |x, y| (x + 4 * y) as u8);
        let half = img.downscale_box(2);
        assert_eq!((half.width(), half.height()), (2, 2));
        assert!((half.get(0, 0) - 2.5).abs() < 1e-6);
        assert!((half.get(1, 1) - 12.5).abs() < 1e-6);
        assert_eq!(img.downscale_box(1).get(3, 3), 15.0);
    }

    #[test]
    fn test_downscale_drops_partial_blocks() {
        let img: Image<u8> = Image::new(7, 5);
        let third = img.downscale_box(3);
        assert_eq!((third.width(), third.height()), (2, 1));
    }

    #[test]
    fn test_bilinear_inside() {
        let img = Image::from_fn(3, 3, |x, y| (x * 10 + y) as f32);
        assert_eq!(img.sample_bilinear(1.0, 2.0), Some(12.0));
        assert!((img.sample_bilinear(0.5, 0.5).unwrap() - 5.5).abs() < 1e-5);
        // Far edge is inside.
        assert_eq!(img.sample_bilinear(2.0, 2.0), Some(22.0));
    }

    #[test]
    fn test_bilinear_outside_is_none() {
        let img: Image<f32> = Image::new(4, 4);
        assert_eq!(img.sample_bilinear(-0.01, 1.0), None);
        assert_eq!(img.sample_bilinear(1.0, 3.01), None);
        assert_eq!(img.sample_bilinear(f32::NAN, 1.0), None);
    }

    #[test]
    #[should_panic(expected = "outside")]
    fn test_get_outside_panics() {
        let img: Image<u8> = Image::new(4, 4);
        img.get(4, 0);
    }
}
