use std::fmt;

use serde::Serialize;

use crate::core::card::{LOGICAL_HEIGHT, LOGICAL_WIDTH, parse_hex_color};
use crate::core::error::{ExportError, ResourceWarning};

pub const DEFAULT_SCALE: f64 = 2.0;
pub const MAX_SCALE: f64 = 4.0;
pub const DEFAULT_JPEG_QUALITY: f32 = 0.92;
/// Largest accepted side of a card, in logical pixels.
pub const MAX_LOGICAL_SIDE: u32 = 4096;
/// Largest bitmap an export may allocate, in pixels.
pub const MAX_PIXELS: u64 = 40_000_000;

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    #[default]
    Png,
    Jpeg,
}

impl ImageFormat {
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "png" => Some(ImageFormat::Png),
            "jpeg" | "jpg" => Some(ImageFormat::Jpeg),
            _ => None,
        }
    }

    pub fn mime_type(&self) -> &'static str {
        match self {
            ImageFormat::Png => "image/png",
            ImageFormat::Jpeg => "image/jpeg",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            ImageFormat::Png => "png",
            ImageFormat::Jpeg => "jpg",
        }
    }
}

impl fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ImageFormat::Png => "png",
            ImageFormat::Jpeg => "jpeg",
        })
    }
}

/// Integer bitmap dimensions.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelSize {
    pub width: u32,
    pub height: u32,
}

impl PixelSize {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl fmt::Display for PixelSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// `width × height` at `scale`, rounded per side. `None` when a side rounds
/// to zero or the bitmap would exceed [`MAX_PIXELS`].
pub fn bounded_pixels(width: f64, height: f64, scale: f64) -> Option<PixelSize> {
    let side = |value: f64| {
        let scaled = (value * scale).round();
        (scaled.is_finite() && scaled >= 1.0 && scaled <= u32::MAX as f64).then_some(scaled as u32)
    };
    let size = PixelSize::new(side(width)?, side(height)?);
    (size.width as u64)
        .checked_mul(size.height as u64)
        .filter(|&pixels| pixels <= MAX_PIXELS)
        .map(|_| size)
}

/// Fractional box measured from a rendered card.
#[derive(Serialize, Debug, Clone, Copy, PartialEq)]
pub struct BoxSize {
    pub width: f64,
    pub height: f64,
}

/// Parameters of a single export.
#[derive(Debug, Clone, PartialEq)]
pub struct ExportRequest {
    pub format: ImageFormat,
    /// 0..=1, only read for JPEG.
    pub quality: f32,
    pub scale: f64,
    pub logical_width: u32,
    pub logical_height: u32,
    /// Backdrop behind transparent pixels. PNG stays transparent without it.
    pub background: Option<String>,
    pub variant: String,
}

impl Default for ExportRequest {
    fn default() -> Self {
        Self {
            format: ImageFormat::Png,
            quality: DEFAULT_JPEG_QUALITY,
            scale: DEFAULT_SCALE,
            logical_width: LOGICAL_WIDTH,
            logical_height: LOGICAL_HEIGHT,
            background: None,
            variant: "card".to_string(),
        }
    }
}

impl ExportRequest {
    pub fn validate(&self) -> Result<(), ExportError> {
        if !self.scale.is_finite() || self.scale <= 0.0 {
            return Err(ExportError::InvalidRequest(format!(
                "scale must be a positive number, got {}",
                self.scale
            )));
        }
        if self.scale > MAX_SCALE {
            return Err(ExportError::InvalidRequest(format!(
                "scale {} exceeds the maximum of {}",
                self.scale, MAX_SCALE
            )));
        }
        if !(0.0..=1.0).contains(&self.quality) {
            return Err(ExportError::InvalidRequest(format!(
                "quality must be within 0..=1, got {}",
                self.quality
            )));
        }
        let sides = 1..=MAX_LOGICAL_SIDE;
        if !sides.contains(&self.logical_width) || !sides.contains(&self.logical_height) {
            return Err(ExportError::InvalidRequest(format!(
                "logical size must be within 1..={} per side, got {}x{}",
                MAX_LOGICAL_SIDE, self.logical_width, self.logical_height
            )));
        }
        if bounded_pixels(self.logical_width as f64, self.logical_height as f64, self.scale)
            .is_none()
        {
            return Err(ExportError::InvalidRequest(format!(
                "{}x{} at scale {} is not a bitmap of 1..={} pixels",
                self.logical_width, self.logical_height, self.scale, MAX_PIXELS
            )));
        }
        if let Some(background) = &self.background {
            if parse_hex_color(background).is_none() {
                return Err(ExportError::InvalidRequest(format!(
                    "background must be a hex color, got {:?}",
                    background
                )));
            }
        }
        Ok(())
    }

    /// Output dimensions: logical size times scale.
    pub fn expected_pixels(&self) -> PixelSize {
        PixelSize::new(
            (self.logical_width as f64 * self.scale).round() as u32,
            (self.logical_height as f64 * self.scale).round() as u32,
        )
    }

    /// Neutral fill for pixels the card does not cover.
    pub fn backdrop(&self) -> [u8; 4] {
        if let Some(color) = self.background.as_deref().and_then(parse_hex_color) {
            return color;
        }
        match self.format {
            ImageFormat::Png => [0, 0, 0, 0],
            ImageFormat::Jpeg => [255, 255, 255, 255],
        }
    }

    /// JPEG encoder quality in 1..=100.
    pub fn encoder_quality(&self) -> u8 {
        (self.quality * 100.0).round().clamp(1.0, 100.0) as u8
    }
}

/// Encoded bytes plus their MIME type.
#[derive(Debug, Clone, PartialEq)]
pub struct Blob {
    pub bytes: Vec<u8>,
    pub mime_type: &'static str,
}

/// Outcome of a successful export.
#[derive(Debug, Clone)]
pub struct ExportResult {
    pub blob: Blob,
    pub pixel_width: u32,
    pub pixel_height: u32,
    pub byte_size: usize,
    pub format: ImageFormat,
    /// Box the backend measured before rasterizing.
    pub measured: BoxSize,
    /// Whether the snapshot had to be resampled to the expected size.
    pub corrected: bool,
    pub backend: &'static str,
    pub warnings: Vec<ResourceWarning>,
}

/// Pipeline states. A failed export reports the state it failed in.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExportStage {
    Idle,
    AwaitingResources,
    Rasterizing,
    Correcting,
    Encoding,
    Done,
}

impl fmt::Display for ExportStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ExportStage::Idle => "idle",
            ExportStage::AwaitingResources => "awaiting_resources",
            ExportStage::Rasterizing => "rasterizing",
            ExportStage::Correcting => "correcting",
            ExportStage::Encoding => "encoding",
            ExportStage::Done => "done",
        })
    }
}
