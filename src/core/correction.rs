//! Canvas correction: resamples a snapshot whose size drifted from
//! `logical size × scale` back onto the exact expected size.

use image::imageops::{self, FilterType};
use image::{Rgba, RgbaImage};

use crate::core::request::PixelSize;

/// Returns `source` untouched when it already has the `target` size.
/// Otherwise scales it uniformly to fit, centers it on a `backdrop` filled
/// bitmap of exactly `target`, and returns that.
pub fn correct_canvas(source: RgbaImage, target: PixelSize, backdrop: [u8; 4]) -> RgbaImage {
    let (sw, sh) = source.dimensions();
    if (sw, sh) == (target.width, target.height) {
        return source;
    }

    let mut dest = RgbaImage::from_pixel(target.width, target.height, Rgba(backdrop));
    if sw == 0 || sh == 0 {
        return dest;
    }

    let factor = (target.width as f64 / sw as f64).min(target.height as f64 / sh as f64);
    let width = ((sw as f64 * factor).round() as u32).clamp(1, target.width);
    let height = ((sh as f64 * factor).round() as u32).clamp(1, target.height);

    let resized = imageops::resize(&source, width, height, FilterType::Lanczos3);
    let x = (target.width - width) / 2;
    let y = (target.height - height) / 2;
    imageops::overlay(&mut dest, &resized, x as i64, y as i64);

    tracing::debug!(
        "Corrected snapshot {}x{} -> {} (content {}x{} at {},{})",
        sw,
        sh,
        target,
        width,
        height,
        x,
        y
    );

    dest
}
