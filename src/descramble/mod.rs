//! Descrambling engines for the two families of pixel-permutation schemes.
//!
//! Submodules:
//! - `cipher`     — stream cipher protecting the Type-1/Type-2 key tables
//! - `binb`       — Type-1/Type-2 rectangle permutations ("book in browser")
//! - `bookwalker` — the 4-pattern 64x64-tile permutation
//!
//! Both engines reduce a page to a [`RectangleCollection`] and reconstruct the
//! destination raster with the same clipped, row-wise blit.

pub mod binb;
pub mod bookwalker;
pub mod cipher;

use image::RgbaImage;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DescrambleError {
    #[error("key tables need to be of the same size ({ctbl} vs {ptbl})")]
    MismatchedTables { ctbl: usize, ptbl: usize },
    #[error("key tables cannot be empty")]
    EmptyTables,
    #[error("mixed key types in one table")]
    MixedKeyTypes,
    #[error("unknown key type: {0}")]
    UnknownKeyType(String),
    #[error("invalid type 1 scramble key: {0}")]
    InvalidType1Key(String),
    #[error("invalid type 2 scramble key: {0}")]
    InvalidType2Key(String),
    #[error("key index {index} out of range for a table of {len} rows")]
    KeyIndexOutOfRange { index: usize, len: usize },
    #[error("invalid input image dimensions: {width}x{height}")]
    InvalidDimensions { width: u32, height: u32 },
    #[error("image decode failed: {0}")]
    ImageDecode(#[from] image::ImageError),
}

/// One copy instruction. `src_*` always indexes the scrambled input raster,
/// `dst_*` the reconstructed output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rectangle {
    pub src_x: i32,
    pub src_y: i32,
    pub dst_x: i32,
    pub dst_y: i32,
    pub width: i32,
    pub height: i32,
}

/// The full set of rectangles reconstructing one destination image, together
/// with the source dimensions they were derived for.
#[derive(Debug)]
pub struct RectangleCollection {
    rectangles: Vec<Rectangle>,
    src_width: u32,
    src_height: u32,
    dst_width: u32,
    dst_height: u32,
}

impl RectangleCollection {
    pub fn new(
        rectangles: Vec<Rectangle>,
        src_width: u32,
        src_height: u32,
        dst_width: u32,
        dst_height: u32,
    ) -> Self {
        Self {
            rectangles,
            src_width,
            src_height,
            dst_width,
            dst_height,
        }
    }

    pub fn rectangles(&self) -> &[Rectangle] {
        &self.rectangles
    }

    pub fn matches_source(&self, width: u32, height: u32) -> bool {
        self.src_width == width && self.src_height == height
    }

    pub fn dst_dimensions(&self) -> (u32, u32) {
        (self.dst_width, self.dst_height)
    }

    /// Reconstruct the destination image. Rectangles are applied in order;
    /// where they overlap, the last write wins.
    pub fn reassemble(&self, src: &RgbaImage) -> RgbaImage {
        let mut dst = RgbaImage::new(self.dst_width, self.dst_height);
        for rect in &self.rectangles {
            blit(&mut dst, src, rect);
        }
        dst
    }
}

/// Row-wise copy of one rectangle, clipped against both rasters. Strip
/// rectangles can reach past the cropped destination; out-of-bounds rows and
/// columns are dropped rather than wrapped.
fn blit(dst: &mut RgbaImage, src: &RgbaImage, rect: &Rectangle) {
    let mut w = rect.width;
    let mut h = rect.height;
    let (mut sx, mut sy) = (rect.src_x, rect.src_y);
    let (mut dx, mut dy) = (rect.dst_x, rect.dst_y);

    let left = (-sx).max(-dx).max(0);
    sx += left;
    dx += left;
    w -= left;
    let top = (-sy).max(-dy).max(0);
    sy += top;
    dy += top;
    h -= top;

    w = w.min(src.width() as i32 - sx).min(dst.width() as i32 - dx);
    h = h.min(src.height() as i32 - sy).min(dst.height() as i32 - dy);
    if w <= 0 || h <= 0 {
        return;
    }

    let src_stride = src.width() as usize * 4;
    let dst_stride = dst.width() as usize * 4;
    let src_raw = src.as_raw();
    let dst_flat = dst.as_flat_samples_mut();
    let dst_raw: &mut [u8] = dst_flat.samples;

    let row_len = w as usize * 4;
    for row in 0..h as usize {
        let s_off = (sy as usize + row) * src_stride + sx as usize * 4;
        let d_off = (dy as usize + row) * dst_stride + dx as usize * 4;
        dst_raw[d_off..d_off + row_len].copy_from_slice(&src_raw[s_off..s_off + row_len]);
    }
}
