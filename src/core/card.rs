use serde::{Deserialize, Serialize};

/// Design-time width of a card in logical pixels.
pub const LOGICAL_WIDTH: u32 = 350;
/// Design-time height of a card in logical pixels.
pub const LOGICAL_HEIGHT: u32 = 500;

/// A business card composition: a root box with a frame and positioned layers.
///
/// `width`/`height` are the rendered box of the card as the preview laid it
/// out. They usually equal the logical size but can drift by sub-pixel
/// amounts, which the correction stage absorbs.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Card {
    pub id: String,

    #[serde(default = "default_width")]
    pub width: f64,

    #[serde(default = "default_height")]
    pub height: f64,

    #[serde(default)]
    pub frame: CardFrame,

    #[serde(default)]
    pub layers: Vec<CardLayer>,

    /// Web fonts referenced by text layers.
    #[serde(default)]
    pub fonts: Vec<FontSource>,
}

fn default_width() -> f64 {
    LOGICAL_WIDTH as f64
}

fn default_height() -> f64 {
    LOGICAL_HEIGHT as f64
}

/// Styling of the card root element.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct CardFrame {
    pub background_color: Option<String>,

    /// CSS `background-image` of the root. Not every backend can paint it.
    pub background_image: Option<String>,

    #[serde(default)]
    pub background_fit: ImageFit,

    #[serde(default)]
    pub border_radius: f64,

    #[serde(default)]
    pub border_width: f64,

    pub border_color: Option<String>,

    /// Drop shadow used by the on-screen preview.
    pub shadow: Option<String>,

    /// Preview zoom (CSS `transform: scale(..)`) applied by the editor.
    pub zoom: Option<f64>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ImageFit {
    #[default]
    Cover,
    Contain,
    Fill,
}

impl ImageFit {
    pub fn as_css(&self) -> &'static str {
        match self {
            ImageFit::Cover => "cover",
            ImageFit::Contain => "contain",
            ImageFit::Fill => "fill",
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LayerKind {
    Background,
    Text,
    Avatar,
}

/// One renderable element of the card, positioned relative to the card box.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CardLayer {
    pub id: String,
    pub kind: LayerKind,

    #[serde(default)]
    pub x: f64,

    #[serde(default)]
    pub y: f64,

    /// Box size. Backgrounds default to the whole card, text to its content.
    pub width: Option<f64>,
    pub height: Option<f64>,

    /// Text for text layers, image URL for background and avatar layers.
    pub content: String,

    #[serde(default)]
    pub style: LayerStyle,

    #[serde(default)]
    pub z_index: i32,
}

impl CardLayer {
    pub fn is_image(&self) -> bool {
        matches!(self.kind, LayerKind::Background | LayerKind::Avatar)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct LayerStyle {
    #[serde(default = "default_font_size")]
    pub font_size: f64,

    #[serde(default = "default_color")]
    pub color: String,

    #[serde(default = "default_font_weight")]
    pub font_weight: u16,

    pub font_family: Option<String>,

    #[serde(default)]
    pub text_align: TextAlign,

    #[serde(default)]
    pub fit: ImageFit,
}

impl Default for LayerStyle {
    fn default() -> Self {
        Self {
            font_size: default_font_size(),
            color: default_color(),
            font_weight: default_font_weight(),
            font_family: None,
            text_align: TextAlign::default(),
            fit: ImageFit::default(),
        }
    }
}

fn default_font_size() -> f64 {
    16.0
}

fn default_color() -> String {
    "#000000".to_string()
}

fn default_font_weight() -> u16 {
    400
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum TextAlign {
    #[default]
    Left,
    Center,
    Right,
}

/// A web font face the card's text depends on.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct FontSource {
    pub family: String,
    pub url: String,

    #[serde(default = "default_font_weight")]
    pub weight: u16,
}

impl Card {
    /// A card has a rendered box when both sides are finite and positive.
    pub fn has_rendered_box(&self) -> bool {
        self.width.is_finite() && self.height.is_finite() && self.width > 0.0 && self.height > 0.0
    }

    /// Layers in paint order, lowest `z_index` first. Ties keep document order.
    pub fn layers_in_paint_order(&self) -> Vec<&CardLayer> {
        let mut layers: Vec<&CardLayer> = self.layers.iter().collect();
        layers.sort_by_key(|layer| layer.z_index);
        layers
    }

    /// Every image URL the card paints, including the CSS background.
    pub fn image_urls(&self) -> Vec<&str> {
        let mut urls: Vec<&str> = self
            .frame
            .background_image
            .as_deref()
            .into_iter()
            .collect();
        urls.extend(
            self.layers
                .iter()
                .filter(|layer| layer.is_image() && !layer.content.is_empty())
                .map(|layer| layer.content.as_str()),
        );
        urls
    }
}

/// Parses `#rgb`, `#rrggbb` and `#rrggbbaa` into RGBA bytes.
pub fn parse_hex_color(value: &str) -> Option<[u8; 4]> {
    let hex = value.trim().strip_prefix('#')?;
    let channel = |s: &str| u8::from_str_radix(s, 16).ok();

    match hex.len() {
        3 => {
            let mut out = [255u8; 4];
            for (i, c) in hex.chars().enumerate() {
                let v = c.to_digit(16)? as u8;
                out[i] = v * 17;
            }
            Some(out)
        }
        6 => Some([
            channel(&hex[0..2])?,
            channel(&hex[2..4])?,
            channel(&hex[4..6])?,
            255,
        ]),
        8 => Some([
            channel(&hex[0..2])?,
            channel(&hex[2..4])?,
            channel(&hex[4..6])?,
            channel(&hex[6..8])?,
        ]),
        _ => None,
    }
}
