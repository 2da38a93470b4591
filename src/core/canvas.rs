//! Manual canvas backend: paints card layers straight onto a tiny-skia pixmap.

use std::path::Path;
use std::sync::Arc;

use fontdb::Database;
use image::{Rgba, RgbaImage};
use tiny_skia::{
    Color, ColorU8, FillRule, FilterQuality, IntSize, Mask, Paint, PathBuilder, Pattern, Pixmap,
    Rect, Shader, SpreadMode, Transform,
};

use crate::core::card::{Card, CardLayer, ImageFit, LayerKind, TextAlign, parse_hex_color};
use crate::core::error::RasterizationError;
use crate::core::fonts::{FontBook, FontData, GlyphPath, SYSTEM_FONTS, glyph_transform};
use crate::core::request::{BoxSize, bounded_pixels};
use crate::core::resources::ResourceBundle;
use crate::core::snapshot::{Capabilities, Rasterizer, Snapshot, SnapshotJob, scaled_size};

const NAME: &str = "canvas";
const AVATAR_PLACEHOLDER: [u8; 4] = [229, 231, 235, 255];
const LINE_HEIGHT: f32 = 1.2;

pub struct CanvasRasterizer {
    system_fonts: Arc<Database>,
    fallback_font: Option<FontData>,
}

impl CanvasRasterizer {
    pub fn new(fallback_font_path: Option<&Path>) -> anyhow::Result<Self> {
        let fallback_font = fallback_font_path.map(FontData::from_file).transpose()?;
        Ok(Self::with_fonts(SYSTEM_FONTS.clone(), fallback_font))
    }

    /// Uses `system_fonts` instead of the fonts installed on the host.
    pub fn with_fonts(system_fonts: Arc<Database>, fallback_font: Option<FontData>) -> Self {
        Self {
            system_fonts,
            fallback_font,
        }
    }
}

impl Rasterizer for CanvasRasterizer {
    fn name(&self) -> &'static str {
        NAME
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            css_backgrounds: Some(false),
        }
    }

    fn rasterize(&self, job: &SnapshotJob<'_>) -> Result<Snapshot, RasterizationError> {
        let card = job.card;
        let measured = BoxSize {
            width: card.width,
            height: card.height,
        };
        let size = scaled_size(measured, job.scale);
        let allocation = RasterizationError::Allocation {
            width: size.width,
            height: size.height,
        };
        if bounded_pixels(measured.width, measured.height, job.scale).is_none() {
            return Err(allocation);
        }
        let pixmap = Pixmap::new(size.width, size.height).ok_or(allocation)?;

        let base = Transform::from_scale(job.scale as f32, job.scale as f32);
        let mask = clip_mask(card, size.width, size.height, base);

        let mut painter = Painter {
            pixmap,
            base,
            mask,
            card_box: (card.width, card.height),
            resources: job.resources,
            fonts: FontBook::new(
                card,
                job.resources,
                &self.system_fonts,
                self.fallback_font.as_ref(),
            ),
        };

        painter.paint_frame(card);
        for layer in card.layers_in_paint_order() {
            painter.paint_layer(layer);
        }

        Ok(Snapshot {
            image: to_rgba_image(&painter.pixmap),
            measured,
        })
    }
}

struct Painter<'a> {
    pixmap: Pixmap,
    base: Transform,
    mask: Option<Mask>,
    card_box: (f64, f64),
    resources: &'a ResourceBundle,
    fonts: FontBook<'a>,
}

impl Painter<'_> {
    fn paint_frame(&mut self, card: &Card) {
        if let Some(color) = card.frame.background_color.as_deref().and_then(parse_hex_color) {
            if let Some(rect) = Rect::from_xywh(0.0, 0.0, card.width as f32, card.height as f32) {
                let paint = solid(color);
                self.pixmap.fill_rect(rect, &paint, self.base, self.mask.as_ref());
            }
        }
        if card.frame.background_image.is_some() {
            tracing::debug!(card = %card.id, "CSS background left unpainted by the canvas backend");
        }
    }

    fn paint_layer(&mut self, layer: &CardLayer) {
        match layer.kind {
            LayerKind::Background => self.paint_image(layer),
            LayerKind::Avatar => self.paint_avatar(layer),
            LayerKind::Text => self.paint_text(layer),
        }
    }

    fn image(&self, url: &str) -> Option<Pixmap> {
        let resource = self.resources.get(url)?;
        decode_pixmap(&resource.bytes)
    }

    fn paint_image(&mut self, layer: &CardLayer) {
        let Some(image) = self.image(&layer.content) else {
            return;
        };
        let (width, height) = layer_box(layer, self.card_box.0, self.card_box.1);
        let placement = fit_image(
            layer.style.fit,
            (image.width() as f32, image.height() as f32),
            (layer.x as f32, layer.y as f32, width, height),
        );

        let Some(rect) = placement.paint_rect else {
            return;
        };
        let paint = Paint {
            shader: image_shader(&image, placement.transform),
            anti_alias: true,
            ..Paint::default()
        };
        self.pixmap.fill_rect(rect, &paint, self.base, self.mask.as_ref());
    }

    fn paint_avatar(&mut self, layer: &CardLayer) {
        let (width, height) = layer_box(layer, 96.0, 96.0);
        let radius = width.min(height) / 2.0;
        let Some(circle) = PathBuilder::from_circle(
            layer.x as f32 + width / 2.0,
            layer.y as f32 + height / 2.0,
            radius,
        ) else {
            return;
        };

        let image = self.image(&layer.content);
        let paint = match &image {
            Some(image) => {
                let placement = fit_image(
                    ImageFit::Cover,
                    (image.width() as f32, image.height() as f32),
                    (layer.x as f32, layer.y as f32, width, height),
                );
                Paint {
                    shader: image_shader(image, placement.transform),
                    anti_alias: true,
                    ..Paint::default()
                }
            }
            None => solid(AVATAR_PLACEHOLDER),
        };

        self.pixmap
            .fill_path(&circle, &paint, FillRule::Winding, self.base, self.mask.as_ref());
    }

    fn paint_text(&mut self, layer: &CardLayer) {
        if layer.content.trim().is_empty() {
            return;
        }
        let style = &layer.style;
        let Some(font) = self.fonts.resolve(style.font_family.as_deref(), style.font_weight) else {
            tracing::warn!(layer = %layer.id, "No font available, text layer skipped");
            return;
        };
        let Some(face) = font.face() else {
            return;
        };

        let size = style.font_size as f32;
        let units_to_px = size / face.units_per_em() as f32;
        let line_height = size * LINE_HEIGHT;
        let glyph_height = (face.ascender() - face.descender()) as f32 * units_to_px;
        let first_baseline =
            layer.y as f32 + (line_height - glyph_height) / 2.0 + face.ascender() as f32 * units_to_px;
        let paint = solid(parse_hex_color(&style.color).unwrap_or([0, 0, 0, 255]));

        for (line_index, line) in layer.content.lines().enumerate() {
            let glyphs: Vec<(ttf_parser::GlyphId, f32)> = line
                .chars()
                .map(|c| {
                    let id = face.glyph_index(c).unwrap_or(ttf_parser::GlyphId(0));
                    let advance = face.glyph_hor_advance(id).unwrap_or(0) as f32 * units_to_px;
                    (id, advance)
                })
                .collect();
            let line_width: f32 = glyphs.iter().map(|(_, advance)| advance).sum();

            let mut pen_x = layer.x as f32;
            if let Some(box_width) = layer.width {
                let slack = box_width as f32 - line_width;
                pen_x += match style.text_align {
                    TextAlign::Left => 0.0,
                    TextAlign::Center => slack / 2.0,
                    TextAlign::Right => slack,
                };
            }
            let baseline = first_baseline + line_index as f32 * line_height;

            for (id, advance) in glyphs {
                if let Some(path) = GlyphPath::build(&face, id) {
                    let transform = self
                        .base
                        .pre_concat(glyph_transform(units_to_px, pen_x, baseline));
                    self.pixmap
                        .fill_path(&path, &paint, FillRule::Winding, transform, self.mask.as_ref());
                }
                pen_x += advance;
            }
        }
    }
}

fn solid(rgba: [u8; 4]) -> Paint<'static> {
    let mut paint = Paint::default();
    paint.set_color(Color::from_rgba8(rgba[0], rgba[1], rgba[2], rgba[3]));
    paint.anti_alias = true;
    paint
}

fn image_shader(image: &Pixmap, transform: Transform) -> Shader<'_> {
    Pattern::new(
        image.as_ref(),
        SpreadMode::Pad,
        FilterQuality::Bicubic,
        1.0,
        transform,
    )
}

/// Box of a layer in card units, defaulting missing sides to `fallback`.
fn layer_box(layer: &CardLayer, fallback_width: f64, fallback_height: f64) -> (f32, f32) {
    (
        layer.width.unwrap_or(fallback_width) as f32,
        layer.height.unwrap_or(fallback_height) as f32,
    )
}

struct Placement {
    /// Image space to card space.
    transform: Transform,
    /// Area to fill with the image pattern.
    paint_rect: Option<Rect>,
}

fn fit_image(fit: ImageFit, image: (f32, f32), target: (f32, f32, f32, f32)) -> Placement {
    let (iw, ih) = image;
    let (x, y, w, h) = target;
    let (sx, sy) = match fit {
        ImageFit::Fill => (w / iw, h / ih),
        ImageFit::Cover => {
            let s = (w / iw).max(h / ih);
            (s, s)
        }
        ImageFit::Contain => {
            let s = (w / iw).min(h / ih);
            (s, s)
        }
    };
    let tx = x + (w - iw * sx) / 2.0;
    let ty = y + (h - ih * sy) / 2.0;

    let paint_rect = match fit {
        ImageFit::Contain => Rect::from_xywh(tx, ty, iw * sx, ih * sy),
        _ => Rect::from_xywh(x, y, w, h),
    };

    Placement {
        transform: Transform::from_row(sx, 0.0, 0.0, sy, tx, ty),
        paint_rect,
    }
}

fn clip_mask(card: &Card, width: u32, height: u32, base: Transform) -> Option<Mask> {
    let radius = card.frame.border_radius as f32;
    if radius <= 0.0 {
        return None;
    }
    let path = rounded_rect(card.width as f32, card.height as f32, radius)?;
    let mut mask = Mask::new(width, height)?;
    mask.fill_path(&path, FillRule::Winding, true, base);
    Some(mask)
}

fn rounded_rect(w: f32, h: f32, radius: f32) -> Option<tiny_skia::Path> {
    let r = radius.min(w / 2.0).min(h / 2.0);
    let mut pb = PathBuilder::new();
    pb.move_to(r, 0.0);
    pb.line_to(w - r, 0.0);
    pb.quad_to(w, 0.0, w, r);
    pb.line_to(w, h - r);
    pb.quad_to(w, h, w - r, h);
    pb.line_to(r, h);
    pb.quad_to(0.0, h, 0.0, h - r);
    pb.line_to(0.0, r);
    pb.quad_to(0.0, 0.0, r, 0.0);
    pb.close();
    pb.finish()
}

fn decode_pixmap(bytes: &[u8]) -> Option<Pixmap> {
    let decoded = image::load_from_memory(bytes).ok()?.to_rgba8();
    let (width, height) = decoded.dimensions();

    let mut data = Vec::with_capacity(decoded.as_raw().len());
    for pixel in decoded.pixels() {
        let c = ColorU8::from_rgba(pixel[0], pixel[1], pixel[2], pixel[3]).premultiply();
        data.extend_from_slice(&[c.red(), c.green(), c.blue(), c.alpha()]);
    }
    Pixmap::from_vec(data, IntSize::from_wh(width, height)?)
}

fn to_rgba_image(pixmap: &Pixmap) -> RgbaImage {
    let mut out = RgbaImage::new(pixmap.width(), pixmap.height());
    for (dst, src) in out.pixels_mut().zip(pixmap.pixels()) {
        let c = src.demultiply();
        *dst = Rgba([c.red(), c.green(), c.blue(), c.alpha()]);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::card::{CardFrame, FontSource, LayerStyle};
    use crate::core::resources::{LoadedResource, ResourceKind};
    use std::io::Cursor;
    use std::sync::Arc;

    fn png(width: u32, height: u32, color: [u8; 4]) -> Vec<u8> {
        let img = RgbaImage::from_pixel(width, height, Rgba(color));
        let mut out = Cursor::new(Vec::new());
        img.write_to(&mut out, image::ImageFormat::Png).unwrap();
        out.into_inner()
    }

    fn layer(kind: LayerKind, content: &str) -> CardLayer {
        CardLayer {
            id: content.to_string(),
            kind,
            x: 0.0,
            y: 0.0,
            width: None,
            height: None,
            content: content.to_string(),
            style: LayerStyle::default(),
            z_index: 0,
        }
    }

    fn card(layers: Vec<CardLayer>) -> Card {
        Card {
            id: "card".into(),
            width: 350.0,
            height: 500.0,
            frame: CardFrame::default(),
            layers,
            fonts: vec![],
        }
    }

    fn bundle(entries: &[(&str, Vec<u8>)]) -> ResourceBundle {
        let mut bundle = ResourceBundle::default();
        for (url, bytes) in entries {
            bundle.insert(
                *url,
                LoadedResource {
                    kind: ResourceKind::Image,
                    resolved: None,
                    bytes: Arc::new(bytes.clone()),
                    content_type: Some("image/png".into()),
                    allow_origin: None,
                },
            );
        }
        bundle
    }

    fn render(card: &Card, resources: &ResourceBundle, scale: f64) -> Snapshot {
        CanvasRasterizer::new(None)
            .unwrap()
            .rasterize(&SnapshotJob {
                card,
                resources,
                scale,
                resource_timeout_ms: 0,
                settle_delay_ms: 0,
            })
            .unwrap()
    }

    #[test]
    fn renders_at_measured_box_times_scale() {
        let mut drifted = card(vec![]);
        drifted.width = 352.0;
        let snapshot = render(&drifted, &ResourceBundle::default(), 2.0);
        assert_eq!((snapshot.image.width(), snapshot.image.height()), (704, 1000));
        assert_eq!(snapshot.measured.width, 352.0);
    }

    #[test]
    fn background_layer_covers_card() {
        let mut card = card(vec![{
            let mut bg = layer(LayerKind::Background, "bg.png");
            bg.width = Some(350.0);
            bg.height = Some(500.0);
            bg
        }]);
        card.frame.background_color = Some("#ffffff".into());
        let resources = bundle(&[("bg.png", png(7, 10, [200, 0, 0, 255]))]);

        let snapshot = render(&card, &resources, 1.0);
        assert_eq!(snapshot.image.get_pixel(175, 250).0, [200, 0, 0, 255]);
        assert_eq!(snapshot.image.get_pixel(2, 2).0, [200, 0, 0, 255]);
    }

    #[test]
    fn missing_avatar_gets_placeholder() {
        let mut avatar = layer(LayerKind::Avatar, "missing.png");
        avatar.x = 100.0;
        avatar.y = 100.0;
        avatar.width = Some(100.0);
        avatar.height = Some(100.0);

        let snapshot = render(&card(vec![avatar]), &ResourceBundle::default(), 1.0);
        assert_eq!(snapshot.image.get_pixel(150, 150).0, AVATAR_PLACEHOLDER);
        // outside the circle, inside the box
        assert_eq!(snapshot.image.get_pixel(102, 102).0[3], 0);
    }

    #[test]
    fn rounded_frame_clips_corners() {
        let mut card = card(vec![]);
        card.frame.background_color = Some("#0000ff".into());
        card.frame.border_radius = 24.0;

        let snapshot = render(&card, &ResourceBundle::default(), 1.0);
        assert_eq!(snapshot.image.get_pixel(0, 0).0[3], 0);
        assert_eq!(snapshot.image.get_pixel(175, 250).0, [0, 0, 255, 255]);
    }

    #[test]
    fn css_background_is_not_painted() {
        let mut card = card(vec![]);
        card.frame.background_image = Some("bg.png".into());
        let resources = bundle(&[("bg.png", png(7, 10, [200, 0, 0, 255]))]);

        let snapshot = render(&card, &resources, 1.0);
        assert_eq!(snapshot.image.get_pixel(175, 250).0[3], 0);
    }

    const TUFFY: &[u8] = include_bytes!("../../tests/fixtures/Tuffy.ttf");

    fn text_card(align: TextAlign) -> (Card, ResourceBundle) {
        let mut text = layer(LayerKind::Text, "HHHH");
        text.y = 100.0;
        text.width = Some(350.0);
        text.style = LayerStyle {
            font_size: 32.0,
            font_family: Some("Brand Sans".into()),
            text_align: align,
            ..LayerStyle::default()
        };
        let mut card = card(vec![text]);
        card.fonts.push(FontSource {
            family: "Brand Sans".into(),
            url: "/brand.ttf".into(),
            weight: 400,
        });

        let mut resources = ResourceBundle::default();
        resources.insert(
            "/brand.ttf",
            LoadedResource {
                kind: ResourceKind::Font,
                resolved: None,
                bytes: Arc::new(TUFFY.to_vec()),
                content_type: Some("font/ttf".into()),
                allow_origin: None,
            },
        );
        (card, resources)
    }

    /// Horizontal extent of painted pixels, if any.
    fn ink_span(image: &RgbaImage) -> Option<(u32, u32)> {
        let xs: Vec<u32> = image
            .enumerate_pixels()
            .filter(|(_, _, p)| p.0[3] > 0)
            .map(|(x, _, _)| x)
            .collect();
        Some((*xs.iter().min()?, *xs.iter().max()?))
    }

    fn render_without_system_fonts(card: &Card, resources: &ResourceBundle) -> Snapshot {
        CanvasRasterizer::with_fonts(Arc::new(Database::new()), None)
            .rasterize(&SnapshotJob {
                card,
                resources,
                scale: 1.0,
                resource_timeout_ms: 0,
                settle_delay_ms: 0,
            })
            .unwrap()
    }

    #[test]
    fn text_is_painted_with_web_font() {
        let (card, resources) = text_card(TextAlign::Left);
        let snapshot = render_without_system_fonts(&card, &resources);

        let inked_rows: Vec<u32> = snapshot
            .image
            .enumerate_pixels()
            .filter(|(_, _, p)| p.0[3] > 0)
            .map(|(_, y, _)| y)
            .collect();
        assert!(!inked_rows.is_empty());
        // a single 32px line starting at y = 100
        assert!(inked_rows.iter().all(|&y| (90..=145).contains(&y)));
    }

    #[test]
    fn text_alignment_moves_ink() {
        let span = |align| {
            let (card, resources) = text_card(align);
            ink_span(&render_without_system_fonts(&card, &resources).image).unwrap()
        };
        let left = span(TextAlign::Left);
        let center = span(TextAlign::Center);
        let right = span(TextAlign::Right);

        assert!(left.0 < 10);
        assert!(left.0 < center.0 && center.0 < right.0);
        let center_mid = (center.0 + center.1) as i64 / 2;
        assert!((center_mid - 175).abs() <= 10, "center at {}", center_mid);
        assert!(right.1 >= 330 && right.1 < 350);
    }

    #[test]
    fn text_without_any_font_is_skipped() {
        let (mut card, _) = text_card(TextAlign::Left);
        card.fonts.clear();
        let snapshot = render_without_system_fonts(&card, &ResourceBundle::default());
        assert_eq!(ink_span(&snapshot.image), None);
    }

    #[test]
    fn oversized_box_is_an_allocation_error() {
        let mut huge = card(vec![]);
        huge.width = 1.0e9;
        huge.height = 1.0e9;
        let err = CanvasRasterizer::with_fonts(Arc::new(Database::new()), None)
            .rasterize(&SnapshotJob {
                card: &huge,
                resources: &ResourceBundle::default(),
                scale: 4.0,
                resource_timeout_ms: 0,
                settle_delay_ms: 0,
            })
            .err();
        assert!(matches!(err, Some(RasterizationError::Allocation { .. })));
    }

    #[test]
    fn contain_fit_letterboxes() {
        let placement = fit_image(ImageFit::Contain, (100.0, 100.0), (0.0, 0.0, 350.0, 500.0));
        let rect = placement.paint_rect.unwrap();
        assert_eq!((rect.x(), rect.y(), rect.width(), rect.height()), (0.0, 75.0, 350.0, 350.0));
    }
}
