//! Layout-normalizing snapshot.
//!
//! The card handed in by the caller is never touched. Rendering works on a
//! [`SnapshotClone`]: preview-only styling (zoom, shadow, border) is stripped
//! from the clone, CSS backgrounds are materialized as image layers when the
//! backend cannot paint them, and the clone is dropped once the backend
//! returns, on every exit path.

use image::RgbaImage;
use url::Url;

use crate::core::card::{Card, CardLayer, LayerKind, LayerStyle};
use crate::core::error::RasterizationError;
use crate::core::request::{BoxSize, PixelSize};
use crate::core::resources::ResourceBundle;

/// What a backend can reliably paint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// `Some(true)` when CSS `background-image` is captured. `None` means
    /// unknown and is treated like `Some(false)`.
    pub css_backgrounds: Option<bool>,
}

/// Availability of a backend's pooled workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    pub available: usize,
    pub capacity: usize,
}

/// Input of one backend invocation.
pub struct SnapshotJob<'a> {
    /// Normalized clone of the card.
    pub card: &'a Card,
    pub resources: &'a ResourceBundle,
    /// Resolution multiplier. Applied explicitly, ambient device pixel ratio
    /// is never consulted.
    pub scale: f64,
    /// Per-resource bound for any in-page waiting the backend does.
    pub resource_timeout_ms: u64,
    pub settle_delay_ms: u64,
}

/// Bitmap produced by a backend together with the box it measured.
pub struct Snapshot {
    pub image: RgbaImage,
    pub measured: BoxSize,
}

impl Snapshot {
    pub fn pixel_size(&self) -> PixelSize {
        PixelSize::new(self.image.width(), self.image.height())
    }
}

/// A DOM-to-bitmap strategy.
pub trait Rasterizer: Send + Sync {
    fn name(&self) -> &'static str;

    fn capabilities(&self) -> Capabilities;

    /// Renders the job's card. Blocking; the pipeline calls it off the
    /// async runtime.
    fn rasterize(&self, job: &SnapshotJob<'_>) -> Result<Snapshot, RasterizationError>;

    fn status(&self) -> Option<PoolStatus> {
        None
    }
}

/// Bitmap size for a measured box at `scale`.
pub fn scaled_size(measured: BoxSize, scale: f64) -> PixelSize {
    PixelSize::new(
        ((measured.width * scale).round() as u32).max(1),
        ((measured.height * scale).round() as u32).max(1),
    )
}

/// Detached, normalized copy of a card that exists for one snapshot.
pub struct SnapshotClone {
    card: Card,
    substituted: usize,
}

impl SnapshotClone {
    pub fn prepare(source: &Card, capabilities: Capabilities, force_substitution: bool) -> Self {
        let mut card = source.clone();

        card.frame.zoom = None;
        card.frame.shadow = None;
        card.frame.border_width = 0.0;
        card.frame.border_color = None;

        let captures_backgrounds = capabilities.css_backgrounds == Some(true);
        let substituted = if force_substitution || !captures_backgrounds {
            substitute_css_background(&mut card)
        } else {
            0
        };

        tracing::debug!(
            card = %card.id,
            substituted,
            "Prepared snapshot clone"
        );

        Self { card, substituted }
    }

    pub fn card(&self) -> &Card {
        &self.card
    }

    /// Number of CSS backgrounds replaced by image layers.
    pub fn substituted(&self) -> usize {
        self.substituted
    }
}

impl Drop for SnapshotClone {
    fn drop(&mut self) {
        tracing::trace!(card = %self.card.id, "Snapshot clone discarded");
    }
}

/// Replaces the root's CSS `background-image` with an equivalent background
/// layer underneath every other layer. Returns how many were replaced.
fn substitute_css_background(card: &mut Card) -> usize {
    let Some(url) = card.frame.background_image.take() else {
        return 0;
    };
    if url.trim().is_empty() {
        return 0;
    }

    let lowest = card.layers.iter().map(|l| l.z_index).min().unwrap_or(0);
    let layer = CardLayer {
        id: "__css-background".to_string(),
        kind: LayerKind::Background,
        x: 0.0,
        y: 0.0,
        width: Some(card.width),
        height: Some(card.height),
        content: url,
        style: LayerStyle {
            fit: card.frame.background_fit,
            ..LayerStyle::default()
        },
        z_index: lowest.saturating_sub(1),
    };
    card.layers.insert(0, layer);
    1
}

/// Refuses to snapshot a card that paints an image the application origin
/// may not read back.
pub fn ensure_untainted(
    card: &Card,
    resources: &ResourceBundle,
    app_origin: Option<&Url>,
) -> Result<(), RasterizationError> {
    let tainted = card.image_urls().into_iter().find(|url| {
        resources
            .get(url)
            .is_some_and(|resource| !resource.is_cors_safe(app_origin))
    });

    match tainted {
        Some(url) => Err(RasterizationError::TaintedCanvas {
            url: url.to_string(),
        }),
        None => Ok(()),
    }
}
