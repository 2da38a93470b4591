//! Font lookup and glyph outlines for the canvas backend.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use fontdb::{Database, Family, Query, Weight};
use once_cell::sync::Lazy;
use tiny_skia::{PathBuilder, Transform};

use crate::core::card::Card;
use crate::core::resources::ResourceBundle;

pub static SYSTEM_FONTS: Lazy<Arc<Database>> = Lazy::new(|| {
    let mut db = Database::new();
    db.load_system_fonts();
    tracing::debug!("Loaded {} system font face(s)", db.len());
    Arc::new(db)
});

/// Parsed-on-demand font file.
#[derive(Clone)]
pub struct FontData {
    bytes: Arc<Vec<u8>>,
    index: u32,
}

impl FontData {
    pub fn new(bytes: Arc<Vec<u8>>, index: u32) -> Option<Self> {
        ttf_parser::Face::parse(&bytes, index).ok()?;
        Some(Self { bytes, index })
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)
            .with_context(|| format!("reading fallback font {}", path.display()))?;
        Self::new(Arc::new(bytes), 0)
            .ok_or_else(|| anyhow!("{} is not a TrueType/OpenType font", path.display()))
    }

    pub fn face(&self) -> Option<ttf_parser::Face<'_>> {
        ttf_parser::Face::parse(&self.bytes, self.index).ok()
    }
}

/// Resolves family/weight pairs: card web fonts first, then system fonts,
/// then the configured fallback.
pub struct FontBook<'a> {
    web: Vec<(String, u16, FontData)>,
    system: &'a Database,
    fallback: Option<&'a FontData>,
    cache: HashMap<(Option<String>, u16), Option<FontData>>,
}

impl<'a> FontBook<'a> {
    pub fn new(
        card: &Card,
        resources: &ResourceBundle,
        system: &'a Database,
        fallback: Option<&'a FontData>,
    ) -> Self {
        let web = card
            .fonts
            .iter()
            .filter_map(|source| {
                let loaded = resources.get(&source.url)?;
                match FontData::new(loaded.bytes.clone(), 0) {
                    Some(data) => Some((source.family.to_lowercase(), source.weight, data)),
                    None => {
                        tracing::debug!(
                            url = %source.url,
                            "Web font is not a raw TrueType/OpenType face; skipping"
                        );
                        None
                    }
                }
            })
            .collect();

        Self {
            web,
            system,
            fallback,
            cache: HashMap::new(),
        }
    }

    pub fn resolve(&mut self, family: Option<&str>, weight: u16) -> Option<FontData> {
        let key = (family.map(str::to_lowercase), weight);
        if let Some(hit) = self.cache.get(&key) {
            return hit.clone();
        }

        let found = self
            .web_font(key.0.as_deref(), weight)
            .or_else(|| system_font(self.system, family, weight))
            .or_else(|| self.fallback.cloned());

        self.cache.insert(key, found.clone());
        found
    }

    fn web_font(&self, family: Option<&str>, weight: u16) -> Option<FontData> {
        let family = family?;
        self.web
            .iter()
            .filter(|(name, _, _)| name == family)
            .min_by_key(|(_, w, _)| w.abs_diff(weight))
            .map(|(_, _, data)| data.clone())
    }
}

fn system_font(db: &Database, family: Option<&str>, weight: u16) -> Option<FontData> {
    let mut families = Vec::with_capacity(2);
    if let Some(name) = family {
        families.push(Family::Name(name));
    }
    families.push(Family::SansSerif);

    let id = db
        .query(&Query {
            families: &families,
            weight: Weight(weight),
            ..Query::default()
        })
        .or_else(|| db.faces().next().map(|face| face.id))?;

    let (bytes, index) = db.with_face_data(id, |data, index| (data.to_vec(), index))?;
    FontData::new(Arc::new(bytes), index)
}

/// Collects a ttf-parser outline into a tiny-skia path in font units (y-up).
pub struct GlyphPath {
    builder: PathBuilder,
}

impl GlyphPath {
    pub fn build(face: &ttf_parser::Face<'_>, glyph: ttf_parser::GlyphId) -> Option<tiny_skia::Path> {
        let mut outline = Self {
            builder: PathBuilder::new(),
        };
        face.outline_glyph(glyph, &mut outline)?;
        outline.builder.finish()
    }
}

impl ttf_parser::OutlineBuilder for GlyphPath {
    fn move_to(&mut self, x: f32, y: f32) {
        self.builder.move_to(x, y);
    }

    fn line_to(&mut self, x: f32, y: f32) {
        self.builder.line_to(x, y);
    }

    fn quad_to(&mut self, x1: f32, y1: f32, x: f32, y: f32) {
        self.builder.quad_to(x1, y1, x, y);
    }

    fn curve_to(&mut self, x1: f32, y1: f32, x2: f32, y2: f32, x: f32, y: f32) {
        self.builder.cubic_to(x1, y1, x2, y2, x, y);
    }

    fn close(&mut self) {
        self.builder.close();
    }
}

/// Maps font units to card coordinates with the baseline origin at `(x, y)`.
#[inline]
pub fn glyph_transform(units_to_px: f32, x: f32, y: f32) -> Transform {
    Transform::from_row(units_to_px, 0.0, 0.0, -units_to_px, x, y)
}
