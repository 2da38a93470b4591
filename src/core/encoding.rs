//! Format encoding and the download filename contract.

use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::PngEncoder;
use image::{ExtendedColorType, ImageEncoder, RgbImage, RgbaImage};

use crate::core::error::EncodingError;
use crate::core::request::{Blob, ImageFormat};

const DEFAULT_DISPLAY_NAME: &str = "business-card";

/// Encodes `image` as `format`. JPEG has no alpha channel, so translucent
/// pixels are composited over `backdrop` first.
pub fn encode(
    image: &RgbaImage,
    format: ImageFormat,
    quality: u8,
    backdrop: [u8; 4],
) -> Result<Blob, EncodingError> {
    let (width, height) = image.dimensions();
    let mut bytes = Vec::new();

    match format {
        ImageFormat::Png => PngEncoder::new(&mut bytes)
            .write_image(image.as_raw(), width, height, ExtendedColorType::Rgba8)
            .map_err(|e| EncodingError::Encoder {
                format: "png",
                cause: e.to_string(),
            })?,
        ImageFormat::Jpeg => {
            let flattened = flatten(image, backdrop);
            JpegEncoder::new_with_quality(&mut bytes, quality)
                .write_image(flattened.as_raw(), width, height, ExtendedColorType::Rgb8)
                .map_err(|e| EncodingError::Encoder {
                    format: "jpeg",
                    cause: e.to_string(),
                })?
        }
    }

    if bytes.is_empty() {
        return Err(EncodingError::Empty(format.mime_type()));
    }

    Ok(Blob {
        bytes,
        mime_type: format.mime_type(),
    })
}

fn flatten(image: &RgbaImage, backdrop: [u8; 4]) -> RgbImage {
    let blend = |src: u8, dst: u8, alpha: u32| -> u8 {
        ((src as u32 * alpha + dst as u32 * (255 - alpha) + 127) / 255) as u8
    };

    RgbImage::from_fn(image.width(), image.height(), |x, y| {
        let [r, g, b, a] = image.get_pixel(x, y).0;
        let alpha = a as u32;
        image::Rgb([
            blend(r, backdrop[0], alpha),
            blend(g, backdrop[1], alpha),
            blend(b, backdrop[2], alpha),
        ])
    })
}

/// `{displayName}-{variant}.{ext}`, falling back to `business-card` when the
/// user has no usable display name.
pub fn export_filename(display_name: Option<&str>, variant: &str, format: ImageFormat) -> String {
    let name = display_name
        .map(sanitize)
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| DEFAULT_DISPLAY_NAME.to_string());
    let variant = sanitize(variant);

    if variant.is_empty() {
        format!("{}.{}", name, format.extension())
    } else {
        format!("{}-{}.{}", name, variant, format.extension())
    }
}

fn sanitize(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for word in value.split_whitespace() {
        let cleaned: String = word
            .chars()
            .filter(|c| c.is_alphanumeric() || matches!(c, '-' | '_' | '.'))
            .collect();
        let cleaned = cleaned.trim_matches('.');
        if cleaned.is_empty() {
            continue;
        }
        if !out.is_empty() {
            out.push('-');
        }
        out.push_str(cleaned);
    }
    out
}
