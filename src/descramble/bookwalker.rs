//! Descrambler for the BookWalker browser viewer.
//!
//! The viewer shuffles 64x64 tiles with one of four patterns picked from the
//! page filename. Images whose dimensions are not tile multiples carry a
//! partial row/column that is relocated first; the viewer may also pad the
//! page with dummy pixels that are cropped off the reconstruction.

use std::sync::{Arc, Mutex};

use image::RgbaImage;

use super::{DescrambleError, Rectangle, RectangleCollection};

const TILE_WIDTH: i32 = 64;
const TILE_HEIGHT: i32 = 64;
const PATTERN_COUNT: usize = 4;

// Multipliers lifted from the viewer's shuffle routine. They carry no meaning
// beyond reproducing its permutation, so they keep positional names.
const M_A: i32 = 61;
const M_B: i32 = 73;
const M_C: i32 = 4;
const M_D: i32 = 43;
const M_E: i32 = 47;
const M_F: i32 = 53;
const M_G: i32 = 59;
const M_H: i32 = 67;
const M_I: i32 = 71;
const M_J: i32 = 29;
const M_K: i32 = 37;
const M_L: i32 = 31;
const M_M: i32 = 41;

/// Which of the four patterns a page uses: the byte sum of its path, mod 4,
/// one-based.
pub fn pattern_for(file_path: &str) -> i32 {
    let sum: u32 = file_path.chars().map(|c| c as u32).sum();
    (sum % PATTERN_COUNT as u32) as i32 + 1
}

/// One cached collection per pattern; workers share a title's instance.
#[derive(Default)]
pub struct BookwalkerDescrambler {
    collections: Mutex<[Option<Arc<RectangleCollection>>; PATTERN_COUNT]>,
}

impl BookwalkerDescrambler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode a scrambled page, derive its pattern and reconstruct the
    /// original raster with the dummy padding cropped off.
    pub fn descramble(
        &self,
        filename: &str,
        data: &[u8],
        dummy_width: u32,
        dummy_height: u32,
    ) -> Result<RgbaImage, DescrambleError> {
        let img = image::load_from_memory(data)?.to_rgba8();
        let (src_w, src_h) = img.dimensions();
        let pattern = pattern_for(filename);
        let collection = self.collection_for(pattern, src_w, src_h, dummy_width, dummy_height)?;
        Ok(collection.reassemble(&img))
    }

    pub(crate) fn collection_for(
        &self,
        pattern: i32,
        src_w: u32,
        src_h: u32,
        dummy_width: u32,
        dummy_height: u32,
    ) -> Result<Arc<RectangleCollection>, DescrambleError> {
        if src_w < TILE_WIDTH as u32
            || src_h < TILE_HEIGHT as u32
            || dummy_width >= src_w
            || dummy_height >= src_h
        {
            return Err(DescrambleError::InvalidDimensions {
                width: src_w,
                height: src_h,
            });
        }

        let slot = (pattern - 1) as usize;
        let mut cache = self.collections.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(col) = &cache[slot] {
            if col.matches_source(src_w, src_h) {
                return Ok(Arc::clone(col));
            }
        }

        let col = Arc::new(RectangleCollection::new(
            generate_rectangles(src_w as i32, src_h as i32, pattern),
            src_w,
            src_h,
            src_w - dummy_width,
            src_h - dummy_height,
        ));
        cache[slot] = Some(Arc::clone(&col));
        Ok(col)
    }
}

/// Derive the rectangles for one pattern and image size: the remainder corner
/// first, then the partial row and column, then the full-tile bulk. Emission
/// order matters — the bulk overwrites strip pixels it lands on.
fn generate_rectangles(src_w: i32, src_h: i32, pattern: i32) -> Vec<Rectangle> {
    let tiles_x = src_w / TILE_WIDTH;
    let tiles_y = src_h / TILE_HEIGHT;
    let rem_x = src_w % TILE_WIDTH;
    let rem_y = src_h % TILE_HEIGHT;
    let mut res = Vec::with_capacity((tiles_x * tiles_y) as usize + tiles_x as usize + tiles_y as usize + 1);

    // Anchor tile indices; the partial row/column is folded in around them.
    let mut anchor_x = tiles_x - M_D * pattern % tiles_x;
    if anchor_x % tiles_x == 0 {
        anchor_x = (tiles_x - M_C) % tiles_x;
    }
    if anchor_x == 0 {
        anchor_x = tiles_x - 1;
    }

    let mut anchor_y = tiles_y - M_E * pattern % tiles_y;
    if anchor_y % tiles_y == 0 {
        anchor_y = (tiles_y - M_C) % tiles_y;
    }
    if anchor_y == 0 {
        anchor_y = tiles_y - 1;
    }

    if rem_x > 0 && rem_y > 0 {
        let x = anchor_x * TILE_WIDTH;
        let y = anchor_y * TILE_HEIGHT;
        res.push(Rectangle {
            src_x: x,
            src_y: y,
            dst_x: x,
            dst_y: y,
            width: rem_x,
            height: rem_y,
        });
    }

    if rem_y > 0 {
        for s in 0..tiles_x {
            let u = top_strip_column(s, tiles_x, pattern);
            let v = top_strip_row(u, anchor_x, anchor_y, tiles_y, pattern);
            res.push(Rectangle {
                src_x: offset_past_anchor(u, anchor_x, rem_x, TILE_WIDTH),
                src_y: v * TILE_HEIGHT,
                dst_x: offset_past_anchor(s, anchor_x, rem_x, TILE_WIDTH),
                dst_y: anchor_y * TILE_HEIGHT,
                width: TILE_WIDTH,
                height: rem_y,
            });
        }
    }

    if rem_x > 0 {
        for t in 0..tiles_y {
            let v = side_strip_row(t, tiles_y, pattern);
            let u = side_strip_column(v, anchor_x, anchor_y, tiles_x, pattern);
            res.push(Rectangle {
                src_x: u * TILE_WIDTH,
                src_y: offset_past_anchor(v, anchor_y, rem_y, TILE_HEIGHT),
                dst_x: anchor_x * TILE_WIDTH,
                dst_y: offset_past_anchor(t, anchor_y, rem_y, TILE_HEIGHT),
                width: rem_x,
                height: TILE_HEIGHT,
            });
        }
    }

    for s in 0..tiles_x {
        for t in 0..tiles_y {
            let u = (s + pattern * M_J + M_L * t) % tiles_x;
            let v = (t + pattern * M_K + M_M * u) % tiles_y;
            let w = if u >= side_strip_column(v, anchor_x, anchor_y, tiles_x, pattern) {
                rem_x
            } else {
                0
            };
            let x = if v >= top_strip_row(u, anchor_x, anchor_y, tiles_y, pattern) {
                rem_y
            } else {
                0
            };
            let mut dst_x = s * TILE_WIDTH;
            if s >= anchor_x {
                dst_x += rem_x;
            }
            let mut dst_y = t * TILE_HEIGHT;
            if t >= anchor_y {
                dst_y += rem_y;
            }
            res.push(Rectangle {
                src_x: u * TILE_WIDTH + w,
                src_y: v * TILE_HEIGHT + x,
                dst_x,
                dst_y,
                width: TILE_WIDTH,
                height: TILE_HEIGHT,
            });
        }
    }

    res
}

fn offset_past_anchor(coord: i32, anchor: i32, remainder: i32, tile_size: i32) -> i32 {
    let res = coord * tile_size;
    if res >= anchor { res + remainder } else { res }
}

fn top_strip_column(index: i32, tiles_x: i32, pattern: i32) -> i32 {
    (index + M_A * pattern) % tiles_x
}

fn top_strip_row(column: i32, anchor_x: i32, anchor_y: i32, tiles_y: i32, pattern: i32) -> i32 {
    let odd = pattern % 2 == 1;
    let below = if column < anchor_x { odd } else { !odd };
    let (modulo, extra) = if below {
        (anchor_y, 0)
    } else {
        (tiles_y - anchor_y, anchor_y)
    };
    (column + pattern * M_F + anchor_y * M_G) % modulo + extra
}

fn side_strip_column(row: i32, anchor_x: i32, anchor_y: i32, tiles_x: i32, pattern: i32) -> i32 {
    let odd = pattern % 2 == 1;
    let below = if row < anchor_y { odd } else { !odd };
    let (modulo, extra) = if below {
        (tiles_x - anchor_x, anchor_x)
    } else {
        (anchor_x, 0)
    };
    (row + pattern * M_H + anchor_x + M_I) % modulo + extra
}

fn side_strip_row(index: i32, tiles_y: i32, pattern: i32) -> i32 {
    (index + M_B * pattern) % tiles_y
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pattern_from_filename_sum() {
        // "item/xhtml/p-003.xhtml/0" sums to 0 mod 4
        assert_eq!(pattern_for("item/xhtml/p-003.xhtml/0"), 1);
        assert_eq!(pattern_for(""), 1);
        assert_eq!(pattern_for("\u{3}"), 4);
    }

    #[test]
    fn bulk_only_collection_is_a_tile_bijection() {
        // 640x896 divides evenly: 10x14 tiles, no strips, no corner
        for pattern in 1..=4 {
            let rects = generate_rectangles(640, 896, pattern);
            assert_eq!(rects.len(), 140);

            let mut src_cov = vec![0u8; 640 * 896];
            let mut dst_cov = vec![0u8; 640 * 896];
            for r in &rects {
                assert_eq!((r.width, r.height), (64, 64));
                for y in 0..r.height {
                    for x in 0..r.width {
                        src_cov[((r.src_y + y) * 640 + r.src_x + x) as usize] += 1;
                        dst_cov[((r.dst_y + y) * 640 + r.dst_x + x) as usize] += 1;
                    }
                }
            }
            assert!(src_cov.iter().all(|&c| c == 1));
            assert!(dst_cov.iter().all(|&c| c == 1));
        }
    }

    #[test]
    fn known_tile_mapping_for_pattern_four() {
        // anchors for 10x14 tiles at pattern 4 are (8, 8); the first bulk
        // tile lands at source tile (6, 2)
        let rects = generate_rectangles(640, 896, 4);
        let first_bulk = rects[0];
        assert_eq!(
            first_bulk,
            Rectangle {
                src_x: 384,
                src_y: 128,
                dst_x: 0,
                dst_y: 0,
                width: 64,
                height: 64,
            }
        );
    }

    #[test]
    fn dummy_padding_is_cropped() {
        let ds = BookwalkerDescrambler::new();
        let img = RgbaImage::from_fn(704, 960, |x, y| {
            image::Rgba([(x % 251) as u8, (y % 251) as u8, 7, 255])
        });
        let mut png = Vec::new();
        img.write_to(&mut std::io::Cursor::new(&mut png), image::ImageFormat::Png)
            .unwrap();
        let out = ds.descramble("file/3", &png, 64, 64).unwrap();
        assert_eq!(out.dimensions(), (640, 896));
    }

    #[test]
    fn dummy_larger_than_image_is_rejected() {
        let ds = BookwalkerDescrambler::new();
        assert!(matches!(
            ds.collection_for(1, 128, 128, 128, 0),
            Err(DescrambleError::InvalidDimensions { .. })
        ));
    }

    #[test]
    fn pattern_cache_is_reused() {
        let ds = BookwalkerDescrambler::new();
        let a = ds.collection_for(2, 640, 896, 0, 0).unwrap();
        let b = ds.collection_for(2, 640, 896, 0, 0).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        let c = ds.collection_for(3, 640, 896, 0, 0).unwrap();
        assert!(!Arc::ptr_eq(&a, &c));
    }
}
