//! Descrambler for the "book in browser" reader.
//!
//! A title ships two equal-length key tables, `Ctbl` and `Ptbl`. Every pair
//! encodes either a Type-1 key (`=h-v±p-<payload>`, slice grid with optional
//! padding strips) or a Type-2 key (`ndx-ndy-<payload>`, half-cell pieces on
//! an 8-aligned grid); a title never mixes the two. The page filename selects
//! which pair applies, and the pair plus the observed image dimensions derive
//! the rectangle permutation that reconstructs the original page.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

use image::RgbaImage;
use regex::Regex;
use tracing::debug;

use super::{DescrambleError, Rectangle, RectangleCollection};

fn re_type1_key() -> &'static Regex {
    static R: OnceLock<Regex> = OnceLock::new();
    R.get_or_init(|| {
        Regex::new(r"^=([0-9]+)-([0-9]+)([-+])([0-9]+)-([-_0-9A-Za-z]+)$").unwrap()
    })
}

fn re_type2_key() -> &'static Regex {
    static R: OnceLock<Regex> = OnceLock::new();
    R.get_or_init(|| Regex::new(r"^([0-9]+?)-([0-9]+?)-([A-Za-z]+)$").unwrap())
}

/// Base64-style lookup used by Type-1 payloads. Unrecognised characters map
/// to -1, which the coordinate shifts treat as "always below".
const TNP_TABLE: [i32; 128] = [
    -1, -1, -1, -1, -1, -1, -1, -1, -1, -1, -1, -1, -1, -1, -1, -1, -1, -1, -1,
    -1, -1, -1, -1, -1, -1, -1, -1, -1, -1, -1, -1, -1, -1, -1, -1, -1, -1, -1,
    -1, -1, -1, -1, -1, -1, -1, 62, -1, -1, 52, 53, 54, 55, 56, 57, 58, 59, 60,
    61, -1, -1, -1, -1, -1, -1, -1, 0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12,
    13, 14, 15, 16, 17, 18, 19, 20, 21, 22, 23, 24, 25, -1, -1, -1, -1, 63, -1,
    26, 27, 28, 29, 30, 31, 32, 33, 34, 35, 36, 37, 38, 39, 40, 41, 42, 43, 44,
    45, 46, 47, 48, 49, 50, 51, -1, -1, -1, -1, -1,
];

/// Case-aware alphabet for Type-2 half-cell coordinates: uppercase decodes to
/// odd values, lowercase to even.
const HALF_CELL_ALPHABET: &str = "ABCDEFGHIJKLMNOPQRSTUVWXYZ";

const KEY_TABLE_ROWS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeyType {
    Type1,
    Type2,
}

#[derive(Debug, Clone)]
struct Type1Key {
    h: i32,
    v: i32,
    padding: i32,
    src_payload: String,
    dst_payload: String,
}

#[derive(Debug, Clone, Copy)]
struct Type2Piece {
    x: i32,
    y: i32,
    width: i32,
    height: i32,
}

#[derive(Debug, Clone)]
struct Type2Key {
    ndx: i32,
    ndy: i32,
    pieces: Vec<Type2Piece>,
}

#[derive(Debug, Clone)]
enum KeyPair {
    Type1(Type1Key),
    Type2 { c: Type2Key, p: Type2Key },
}

/// Parsed key tables plus the memoised rectangle collections. One instance
/// serves a whole title; `descramble` is safe to call from parallel workers.
pub struct BinbDescrambler {
    pairs: Vec<KeyPair>,
    key_type: KeyType,
    collections: Mutex<HashMap<(usize, usize), Arc<RectangleCollection>>>,
}

impl BinbDescrambler {
    pub fn new(ctbl: &[String], ptbl: &[String]) -> Result<Self, DescrambleError> {
        if ctbl.len() != ptbl.len() {
            debug!(ctbl = ctbl.len(), ptbl = ptbl.len(), "key table sizes don't match");
            return Err(DescrambleError::MismatchedTables {
                ctbl: ctbl.len(),
                ptbl: ptbl.len(),
            });
        }
        if ctbl.is_empty() {
            return Err(DescrambleError::EmptyTables);
        }

        let mut key_type = None;
        let mut pairs = Vec::with_capacity(ctbl.len());
        for (c, p) in ctbl.iter().zip(ptbl) {
            let (new_type, pair) = parse_pair(c, p)?;
            match key_type {
                None => key_type = Some(new_type),
                Some(t) if t != new_type => {
                    debug!(ctbl = %c, ptbl = %p, "mixed key types in one table");
                    return Err(DescrambleError::MixedKeyTypes);
                }
                Some(_) => {}
            }
            pairs.push(pair);
        }

        Ok(Self {
            pairs,
            // unwrap is unreachable: the table is non-empty, so the loop ran
            key_type: key_type.ok_or(DescrambleError::EmptyTables)?,
            collections: Mutex::new(HashMap::new()),
        })
    }

    /// Decode a scrambled page and reconstruct the original raster.
    pub fn descramble(&self, filename: &str, data: &[u8]) -> Result<RgbaImage, DescrambleError> {
        let img = image::load_from_memory(data)?.to_rgba8();
        let (src_w, src_h) = img.dimensions();
        let (c_idx, p_idx) = key_indices(filename);
        let collection = self.collection_for(c_idx, p_idx, src_w, src_h)?;
        Ok(collection.reassemble(&img))
    }

    /// Look up the cached collection for a cell, recomputing when the source
    /// dimensions changed. Titles usually descramble hundreds of pages of one
    /// resolution across at most 8x8 cells, so the cache pays for itself.
    pub(crate) fn collection_for(
        &self,
        c_idx: usize,
        p_idx: usize,
        src_w: u32,
        src_h: u32,
    ) -> Result<Arc<RectangleCollection>, DescrambleError> {
        let mut cache = self.collections.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(col) = cache.get(&(c_idx, p_idx)) {
            if col.matches_source(src_w, src_h) {
                return Ok(Arc::clone(col));
            }
        }

        let col = Arc::new(match self.key_type {
            KeyType::Type1 => self.rectangles_type1(c_idx, p_idx, src_w, src_h)?,
            KeyType::Type2 => self.rectangles_type2(c_idx, p_idx, src_w, src_h)?,
        });
        cache.insert((c_idx, p_idx), Arc::clone(&col));
        Ok(col)
    }

    fn pair(&self, index: usize) -> Result<&KeyPair, DescrambleError> {
        self.pairs
            .get(index)
            .ok_or(DescrambleError::KeyIndexOutOfRange {
                index,
                len: self.pairs.len(),
            })
    }

    fn rectangles_type1(
        &self,
        c_idx: usize,
        p_idx: usize,
        src_w: u32,
        src_h: u32,
    ) -> Result<RectangleCollection, DescrambleError> {
        let c_key = match self.pair(c_idx)? {
            KeyPair::Type1(k) => k,
            KeyPair::Type2 { .. } => return Err(DescrambleError::MixedKeyTypes),
        };
        let p_key = match self.pair(p_idx)? {
            KeyPair::Type1(k) => k,
            KeyPair::Type2 { .. } => return Err(DescrambleError::MixedKeyTypes),
        };
        let h = c_key.h;
        let v = p_key.v;
        let padding = c_key.padding;
        let (sw, sh) = (src_w as i32, src_h as i32);

        // Padding strips only exist when the image is large enough to carry
        // them; small images are treated as unpadded.
        let pad_x = h * 2 * padding;
        let pad_y = v * 2 * padding;
        let (width, height) =
            if sw >= 64 + pad_x && sh >= 64 + pad_y && sw * sh >= (320 + pad_x) * (320 + pad_y) {
                (sw - pad_x, sh - pad_y)
            } else {
                (sw, sh)
            };

        let (src_t, src_n, src_p) = decode_tnp(&c_key.src_payload, h, v);
        let (dst_t, dst_n, dst_p) = decode_tnp(&p_key.dst_payload, h, v);
        let composite: Vec<i32> = (0..(h * v) as usize)
            .map(|i| {
                let d = dst_p[i];
                if d < 0 || d as usize >= src_p.len() {
                    return Err(DescrambleError::InvalidType1Key(format!(
                        "{}/{}",
                        c_key.src_payload, p_key.dst_payload
                    )));
                }
                let s = src_p[d as usize];
                if s < 0 || s >= h * v {
                    return Err(DescrambleError::InvalidType1Key(format!(
                        "{}/{}",
                        c_key.src_payload, p_key.dst_payload
                    )));
                }
                Ok(s)
            })
            .collect::<Result<_, _>>()?;

        let slice_w = (width + h - 1) / h;
        let slice_h = (height + v - 1) / v;
        let last_slice_w = width - (h - 1) * slice_w;
        let last_slice_h = height - (v - 1) * slice_h;

        let mut rects = Vec::with_capacity((h * v) as usize);
        for i in 0..h * v {
            // The payload roles flip here: coordinates derived from the
            // destination payload point into the scrambled raster, those from
            // the source payload into the output. Mirrors the reader.
            let out_col = i % h;
            let out_row = i / h;
            let mut scr_x = padding + out_col * (slice_w + 2 * padding);
            if dst_n[out_row as usize] < out_col {
                scr_x += last_slice_w - slice_w;
            }
            let mut scr_y = padding + out_row * (slice_h + 2 * padding);
            if dst_t[out_col as usize] < out_row {
                scr_y += last_slice_h - slice_h;
            }

            let p = composite[i as usize];
            let in_col = p % h;
            let in_row = p / h;
            let mut out_x = in_col * slice_w;
            if src_n[in_row as usize] < in_col {
                out_x += last_slice_w - slice_w;
            }
            let mut out_y = in_row * slice_h;
            if src_t[in_col as usize] < in_row {
                out_y += last_slice_h - slice_h;
            }

            let piece_w = if dst_n[out_row as usize] == out_col {
                last_slice_w
            } else {
                slice_w
            };
            let piece_h = if dst_t[out_col as usize] == out_row {
                last_slice_h
            } else {
                slice_h
            };

            rects.push(Rectangle {
                src_x: scr_x,
                src_y: scr_y,
                dst_x: out_x,
                dst_y: out_y,
                width: piece_w,
                height: piece_h,
            });
        }

        Ok(RectangleCollection::new(
            rects,
            src_w,
            src_h,
            width as u32,
            height as u32,
        ))
    }

    fn rectangles_type2(
        &self,
        c_idx: usize,
        p_idx: usize,
        src_w: u32,
        src_h: u32,
    ) -> Result<RectangleCollection, DescrambleError> {
        let (sw, sh) = (src_w as i32, src_h as i32);
        if !(sw >= 64 && sh >= 64 && sw * sh >= 320 * 320) {
            debug!(src_w, src_h, "invalid input image dimensions");
            return Err(DescrambleError::InvalidDimensions {
                width: src_w,
                height: src_h,
            });
        }

        // Cell grid: full cells are 8-aligned, the last column/row takes the
        // remainder.
        let e = sw - sw % 8;
        let f = ((e - 1) / 7) - ((e - 1) / 7) % 8;
        let g = e - f * 7;
        let h = sh - sh % 8;
        let j = ((h - 1) / 7) - ((h - 1) / 7) % 8;
        let k = h - j * 7;

        let c_key = match self.pair(c_idx)? {
            KeyPair::Type2 { c, .. } => c,
            KeyPair::Type1(_) => return Err(DescrambleError::MixedKeyTypes),
        };
        let p_key = match self.pair(p_idx)? {
            KeyPair::Type2 { p, .. } => p,
            KeyPair::Type1(_) => return Err(DescrambleError::MixedKeyTypes),
        };

        let mut rects = Vec::with_capacity(c_key.pieces.len() + 2);
        for (c_piece, p_piece) in c_key.pieces.iter().zip(&p_key.pieces) {
            rects.push(Rectangle {
                src_x: (c_piece.x / 2) * f + (c_piece.x % 2) * g,
                src_y: (c_piece.y / 2) * j + (c_piece.y % 2) * k,
                dst_x: (p_piece.x / 2) * f + (p_piece.x % 2) * g,
                dst_y: (p_piece.y / 2) * j + (p_piece.y % 2) * k,
                width: (c_piece.width / 2) * f + (c_piece.width % 2) * g,
                height: (c_piece.height / 2) * j + (c_piece.height % 2) * k,
            });
        }

        // Pixels right of and below the gridded region are not scrambled.
        let gridded_w = f * (c_key.ndx - 1) + g;
        let gridded_h = j * (c_key.ndy - 1) + k;
        if gridded_w < sw {
            rects.push(Rectangle {
                src_x: gridded_w,
                src_y: 0,
                dst_x: gridded_w,
                dst_y: 0,
                width: sw - gridded_w,
                height: gridded_h,
            });
        }
        if gridded_h < sh {
            rects.push(Rectangle {
                src_x: 0,
                src_y: gridded_h,
                dst_x: 0,
                dst_y: gridded_h,
                width: sw,
                height: sh - gridded_h,
            });
        }

        Ok(RectangleCollection::new(rects, src_w, src_h, src_w, src_h))
    }
}

/// Which (c, p) table rows a page uses: characters at odd indices accumulate
/// into the c sum, even indices into the p sum, both taken mod 8.
pub fn key_indices(filename: &str) -> (usize, usize) {
    let mut c: usize = 0;
    let mut p: usize = 0;
    for (i, ch) in filename.chars().enumerate() {
        if i % 2 == 0 {
            p += ch as usize;
        } else {
            c += ch as usize;
        }
    }
    (c % KEY_TABLE_ROWS, p % KEY_TABLE_ROWS)
}

fn parse_pair(c: &str, p: &str) -> Result<(KeyType, KeyPair), DescrambleError> {
    if c.starts_with('=') && p.starts_with('=') {
        Ok((KeyType::Type1, KeyPair::Type1(parse_type1(c, p)?)))
    } else if starts_with_digit(c) && starts_with_digit(p) {
        Ok((
            KeyType::Type2,
            KeyPair::Type2 {
                c: parse_type2(c)?,
                p: parse_type2(p)?,
            },
        ))
    } else {
        debug!(ctbl = %c, ptbl = %p, "got unknown key type");
        Err(DescrambleError::UnknownKeyType(format!("{c} / {p}")))
    }
}

fn parse_type1(c: &str, p: &str) -> Result<Type1Key, DescrambleError> {
    let invalid = || DescrambleError::InvalidType1Key(format!("{c} / {p}"));
    let cm = re_type1_key().captures(c).ok_or_else(invalid)?;
    let pm = re_type1_key().captures(p).ok_or_else(invalid)?;

    // The pair must agree on everything except the sign: the source key
    // carries '+', the destination key '-'.
    if cm[1] != pm[1] || cm[2] != pm[2] || cm[4] != pm[4] || &cm[3] != "+" || &pm[3] != "-" {
        debug!(ctbl = %c, ptbl = %p, "type 1 key verification failed");
        return Err(invalid());
    }

    let h: i32 = cm[1].parse().map_err(|_| invalid())?;
    let v: i32 = cm[2].parse().map_err(|_| invalid())?;
    let padding: i32 = cm[4].parse().map_err(|_| invalid())?;
    if h < 1 || v < 1 || h > 8 || v > 8 || h * v > 64 {
        debug!(h, v, "invalid h and v values");
        return Err(invalid());
    }

    let src_payload = cm[5].to_string();
    let dst_payload = pm[5].to_string();
    let target_len = (h + v + h * v) as usize;
    if src_payload.len() != target_len || dst_payload.len() != target_len {
        debug!(h, v, "payload does not match target length");
        return Err(invalid());
    }

    Ok(Type1Key {
        h,
        v,
        padding,
        src_payload,
        dst_payload,
    })
}

fn parse_type2(key: &str) -> Result<Type2Key, DescrambleError> {
    let invalid = || DescrambleError::InvalidType2Key(key.to_string());
    let m = re_type2_key().captures(key).ok_or_else(invalid)?;

    let ndx: i32 = m[1].parse().map_err(|_| invalid())?;
    let ndy: i32 = m[2].parse().map_err(|_| invalid())?;
    let data = &m[3];
    if ndx < 1 || ndy < 1 {
        return Err(invalid());
    }
    if data.len() != (ndx * ndy * 2) as usize {
        debug!(ndx, ndy, data, "type 2 payload length does not match grid");
        return Err(invalid());
    }

    // Piece sizes by position in the payload: interior cells are 2x2 half
    // cells, the last column/row 1x2 / 2x1, the corner 1x1.
    let interior_end = (ndx - 1) * (ndy - 1) - 1;
    let column_end = interior_end + (ndx - 1);
    let row_end = column_end + (ndy - 1);
    let bytes = data.as_bytes();
    let mut pieces = Vec::with_capacity((ndx * ndy) as usize);
    for i in 0..ndx * ndy {
        let (width, height) = if i <= interior_end {
            (2, 2)
        } else if i <= column_end {
            (2, 1)
        } else if i <= row_end {
            (1, 2)
        } else {
            (1, 1)
        };
        pieces.push(Type2Piece {
            x: decode_half_cell(bytes[(i * 2) as usize]),
            y: decode_half_cell(bytes[(i * 2 + 1) as usize]),
            width,
            height,
        });
    }

    Ok(Type2Key { ndx, ndy, pieces })
}

fn decode_half_cell(ch: u8) -> i32 {
    match HALF_CELL_ALPHABET.bytes().position(|c| c == ch) {
        Some(idx) => 1 + idx as i32 * 2,
        None => match HALF_CELL_ALPHABET.bytes().position(|c| c == ch.to_ascii_uppercase()) {
            Some(idx) => idx as i32 * 2,
            // unreachable for keys matching the regex
            None => -2,
        },
    }
}

/// Split a Type-1 payload into the T (per-column), N (per-row) and P
/// (permutation) arrays.
fn decode_tnp(payload: &str, h: i32, v: i32) -> (Vec<i32>, Vec<i32>, Vec<i32>) {
    let lookup = |b: u8| {
        if (b as usize) < TNP_TABLE.len() {
            TNP_TABLE[b as usize]
        } else {
            -1
        }
    };
    let bytes = payload.as_bytes();
    let t = (0..h as usize).map(|i| lookup(bytes[i])).collect();
    let n = (0..v as usize).map(|i| lookup(bytes[h as usize + i])).collect();
    let p = (0..(h * v) as usize)
        .map(|i| lookup(bytes[(h + v) as usize + i]))
        .collect();
    (t, n, p)
}

fn starts_with_digit(s: &str) -> bool {
    s.as_bytes().first().is_some_and(|b| b.is_ascii_digit())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;

    fn table(key: &str) -> Vec<String> {
        vec![key.to_string(); KEY_TABLE_ROWS]
    }

    fn coordinate_image(w: u32, h: u32) -> RgbaImage {
        RgbaImage::from_fn(w, h, |x, y| {
            Rgba([(x % 251) as u8, (y % 251) as u8, ((x + y) % 251) as u8, 255])
        })
    }

    #[test]
    fn key_index_selection() {
        // even positions feed p, odd positions feed c
        let (c, p) = key_indices("ab");
        assert_eq!(c, (b'b' as usize) % 8);
        assert_eq!(p, (b'a' as usize) % 8);
        assert_eq!(key_indices(""), (0, 0));
    }

    #[test]
    fn rejects_malformed_tables() {
        let c = table("=1-1+0-AAA");
        assert!(matches!(
            BinbDescrambler::new(&c, &c[..4].to_vec()),
            Err(DescrambleError::MismatchedTables { .. })
        ));
        assert!(matches!(
            BinbDescrambler::new(&[], &[]),
            Err(DescrambleError::EmptyTables)
        ));

        // both keys carrying '+' fails the sign arrangement check
        assert!(BinbDescrambler::new(&c, &c).is_err());

        // mixed Type-1 / Type-2 rows
        let mut mixed = table("3-3-aabaabbbacbccacbcc");
        mixed[3] = "=1-1+0-AAA".to_string();
        let p = table("3-3-aabaabbbacbccacbcc");
        assert!(BinbDescrambler::new(&mixed, &p).is_err());

        // payload length not matching h+v+h*v
        assert!(BinbDescrambler::new(&table("=2-2+0-AAA"), &table("=2-2-0-AAA")).is_err());

        // unknown key shape
        assert!(matches!(
            BinbDescrambler::new(&table("?what"), &table("?what")),
            Err(DescrambleError::UnknownKeyType(_))
        ));
    }

    #[test]
    fn type1_trivial_keys_preserve_pixels() {
        let ds =
            BinbDescrambler::new(&table("=1-1+0-AAA"), &table("=1-1-0-AAA")).unwrap();
        let img = coordinate_image(128, 128);
        let mut png = Vec::new();
        img.write_to(&mut std::io::Cursor::new(&mut png), image::ImageFormat::Png)
            .unwrap();
        let out = ds.descramble("0001.jpg", &png).unwrap();
        assert_eq!(out.dimensions(), (128, 128));
        assert!(out.pixels().eq(img.pixels()));
    }

    // Destination coverage must be exact and source coverage at most one for
    // any valid pair; checked on a padded 4x4 grid with a non-trivial
    // permutation.
    #[test]
    fn type1_padded_collection_is_a_bijection() {
        let src_payload = format!("DDDD{}{}", "DDDD", "ABCDEFGHIJKLMNOP");
        let dst_payload = format!("DDDD{}{}", "DDDD", "PONMLKJIHGFEDCBA");
        let ds = BinbDescrambler::new(
            &table(&format!("=4-4+2-{src_payload}")),
            &table(&format!("=4-4-2-{dst_payload}")),
        )
        .unwrap();

        let col = ds.collection_for(0, 0, 800, 1200).unwrap();
        let (dst_w, dst_h) = col.dst_dimensions();
        assert_eq!((dst_w, dst_h), (784, 1184));

        let mut dst_cov = vec![0u8; (dst_w * dst_h) as usize];
        let mut src_cov = vec![0u8; 800 * 1200];
        for r in col.rectangles() {
            for y in 0..r.height {
                for x in 0..r.width {
                    dst_cov[((r.dst_y + y) as u32 * dst_w + (r.dst_x + x) as u32) as usize] += 1;
                    src_cov[((r.src_y + y) * 800 + r.src_x + x) as usize] += 1;
                }
            }
        }
        assert!(dst_cov.iter().all(|&c| c == 1));
        assert!(src_cov.iter().all(|&c| c <= 1));
    }

    #[test]
    fn type2_identity_grid_preserves_pixels() {
        // 3x3 grid where every piece sits at its own position
        let key = "3-3-aabaabbbacbccacbcc";
        let ds = BinbDescrambler::new(&table(key), &table(key)).unwrap();
        let img = coordinate_image(640, 640);
        let mut png = Vec::new();
        img.write_to(&mut std::io::Cursor::new(&mut png), image::ImageFormat::Png)
            .unwrap();
        let out = ds.descramble("p005", &png).unwrap();
        assert_eq!(out.dimensions(), (640, 640));
        assert!(out.pixels().eq(img.pixels()));
    }

    #[test]
    fn type2_small_images_are_rejected() {
        let key = "3-3-aabaabbbacbccacbcc";
        let ds = BinbDescrambler::new(&table(key), &table(key)).unwrap();
        assert!(matches!(
            ds.collection_for(0, 0, 63, 640),
            Err(DescrambleError::InvalidDimensions { .. })
        ));
    }

    #[test]
    fn collections_are_memoised_per_cell_and_resolution() {
        let ds =
            BinbDescrambler::new(&table("=1-1+0-AAA"), &table("=1-1-0-AAA")).unwrap();
        let first = ds.collection_for(2, 5, 320, 320).unwrap();
        let second = ds.collection_for(2, 5, 320, 320).unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        // a resolution change invalidates that cell only
        let third = ds.collection_for(2, 5, 400, 400).unwrap();
        assert!(!Arc::ptr_eq(&first, &third));
    }
}
