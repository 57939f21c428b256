//! Cover generation and the missing-page placeholder.

use std::{collections::BTreeSet, io::Cursor, sync::OnceLock};

use bytes::Bytes;
use image::{ImageFormat, Rgba, RgbaImage};
use thiserror::Error;

/// Long side of a generated cover.
pub const COVER_MAX_DIM: u32 = 320;

const PLACEHOLDER_W: u32 = 32;
const PLACEHOLDER_H: u32 = 45;
const PNG_MAGIC: &[u8] = b"\x89PNG\r\n\x1a\n";

#[derive(Debug, Error)]
pub enum CoverErr {
    #[error("image decode error: {0}")]
    Image(#[from] image::ImageError),

    #[error("no eligible cover page")]
    NoCandidate,
}

#[derive(Debug, Clone)]
pub struct EncodedImage {
    pub data: Bytes,
    pub width: u32,
    pub height: u32,
}

/// The image written for every page path a sidecar references but the
/// archive does not contain. Distinctively coloured so a rendered gap is
/// obvious, and deliberately a PNG regardless of the path's extension so it
/// can be recognised later (see [`is_placeholder_page`]).
pub fn placeholder_png() -> Bytes {
    static PNG: OnceLock<Bytes> = OnceLock::new();
    PNG.get_or_init(|| {
        let img = RgbaImage::from_pixel(PLACEHOLDER_W, PLACEHOLDER_H, Rgba([255, 0, 144, 255]));
        let mut out = Cursor::new(Vec::new());
        image::DynamicImage::ImageRgba8(img)
            .write_to(&mut out, ImageFormat::Png)
            .expect("BUG: encoding a fixed-size png cannot fail");
        Bytes::from(out.into_inner())
    })
    .clone()
}

/// A page is treated as a fabricated placeholder when its path was recorded
/// missing at ingest, or when its bytes are a PNG while its path claims a
/// different extension. Ambiguous pages are refused rather than guessed at,
/// so they can never become covers.
pub fn is_placeholder_page(path: &str, data: &[u8], missing_page_paths: &BTreeSet<String>) -> bool {
    if missing_page_paths.contains(path) {
        return true;
    }
    let ext = hondana_core::rpath::ext(hondana_core::rpath::base_name(path));
    data.starts_with(PNG_MAGIC) && ext != "png"
}

/// Picks the first page in canonical order that is a real, present image.
pub fn select_cover_page<'a>(
    pages: &'a [(String, Bytes)],
    missing_page_paths: &BTreeSet<String>,
) -> Option<&'a (String, Bytes)> {
    pages
        .iter()
        .find(|(path, data)| !is_placeholder_page(path, data, missing_page_paths))
}

/// Downscales a page to a cover (long side at most [`COVER_MAX_DIM`])
/// encoded as JPEG.
pub fn generate_cover(page: &[u8]) -> Result<EncodedImage, CoverErr> {
    let img = image::load_from_memory(page)?;
    let thumb = img.thumbnail(COVER_MAX_DIM, COVER_MAX_DIM);
    let mut out = Cursor::new(Vec::new());
    thumb.to_rgb8().write_to(&mut out, ImageFormat::Jpeg)?;
    Ok(EncodedImage {
        data: Bytes::from(out.into_inner()),
        width: thumb.width(),
        height: thumb.height(),
    })
}

/// Decodes just enough of an image to learn its dimensions.
pub fn probe_dimensions(data: &[u8]) -> Option<(u32, u32)> {
    image::load_from_memory(data)
        .map(|img| (img.width(), img.height()))
        .ok()
}
