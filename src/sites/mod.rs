//! Site plugin implementations.

pub mod binb_api;
pub mod booklive;
pub mod bookwalker;
pub mod dummy;
pub mod ebookjapan;

use std::sync::Arc;

use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::PngEncoder;
use image::{DynamicImage, ExtendedColorType, ImageEncoder, RgbaImage};

use crate::download::sink::SinkWriter;
use crate::plugin::Plugin;

/// Every registered plugin, in dispatch order.
pub fn registry() -> Vec<Arc<dyn Plugin>> {
    vec![
        Arc::new(dummy::Dummy::new()),
        Arc::new(booklive::BookLive::new()),
        Arc::new(bookwalker::BookWalker::new()),
        Arc::new(ebookjapan::EBookJapan::new()),
    ]
}

/// Encode a reconstructed page into the chosen output codec and close the
/// writer, which records the artifact.
pub(crate) fn encode_page(
    mut writer: SinkWriter,
    img: &RgbaImage,
    lossless: bool,
    quality: u8,
) -> anyhow::Result<()> {
    if lossless {
        PngEncoder::new(&mut writer).write_image(
            img.as_raw(),
            img.width(),
            img.height(),
            ExtendedColorType::Rgba8,
        )?;
    } else {
        // JPEG has no alpha channel
        let rgb = DynamicImage::ImageRgba8(img.clone()).to_rgb8();
        let quality = quality.clamp(1, 100);
        let mut encoder = JpegEncoder::new_with_quality(&mut writer, quality);
        encoder.encode(&rgb, rgb.width(), rgb.height(), ExtendedColorType::Rgb8)?;
    }
    writer.close()?;
    Ok(())
}

/// `0001.jpg`, with a `-<n>` suffix for subpages past the first.
pub(crate) fn page_file_name(page: usize, subpage: usize, ext: &str) -> String {
    if subpage > 0 {
        format!("{:04}-{}.{}", page + 1, subpage, ext)
    } else {
        format!("{:04}.{}", page + 1, ext)
    }
}

pub(crate) fn output_ext(lossless: bool) -> &'static str {
    if lossless { "png" } else { "jpg" }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_names_are_zero_padded() {
        assert_eq!(page_file_name(0, 0, "jpg"), "0001.jpg");
        assert_eq!(page_file_name(11, 0, "png"), "0012.png");
        assert_eq!(page_file_name(11, 2, "jpg"), "0012-2.jpg");
    }
}
