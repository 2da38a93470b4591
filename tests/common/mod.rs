#![allow(dead_code)]

use std::collections::HashMap;
use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;

use card_renderer::core::canvas::CanvasRasterizer;
use card_renderer::core::card::{Card, CardFrame, CardLayer, LayerKind, LayerStyle};
use card_renderer::core::pipeline::{ExportEngine, PipelineSettings};
use card_renderer::core::resources::{FetchError, FetchedResource, GateSettings, ResourceFetcher};
use futures::future::BoxFuture;
use image::{ImageFormat, Rgba, RgbaImage};
use url::Url;

pub const APP_ORIGIN: &str = "https://cards.example.com";

#[derive(Clone)]
pub enum Reply {
    Ok {
        bytes: Vec<u8>,
        allow_origin: Option<String>,
    },
    Status(u16),
    Hang,
}

/// Serves canned responses keyed by absolute URL.
#[derive(Default)]
pub struct MemoryFetcher {
    replies: HashMap<String, (Duration, Reply)>,
}

impl MemoryFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn image(self, url: &str, bytes: Vec<u8>) -> Self {
        self.reply(url, Duration::ZERO, Reply::Ok { bytes, allow_origin: None })
    }

    pub fn cors_image(self, url: &str, bytes: Vec<u8>, allow_origin: &str) -> Self {
        self.reply(
            url,
            Duration::ZERO,
            Reply::Ok {
                bytes,
                allow_origin: Some(allow_origin.to_string()),
            },
        )
    }

    pub fn slow_image(self, url: &str, delay: Duration, bytes: Vec<u8>) -> Self {
        self.reply(url, delay, Reply::Ok { bytes, allow_origin: None })
    }

    pub fn reply(mut self, url: &str, delay: Duration, reply: Reply) -> Self {
        self.replies.insert(url.to_string(), (delay, reply));
        self
    }
}

impl ResourceFetcher for MemoryFetcher {
    fn fetch<'a>(&'a self, url: &'a Url) -> BoxFuture<'a, Result<FetchedResource, FetchError>> {
        Box::pin(async move {
            let Some((delay, reply)) = self.replies.get(url.as_str()).cloned() else {
                return Err(FetchError::Status(404));
            };
            tokio::time::sleep(delay).await;
            match reply {
                Reply::Ok {
                    bytes,
                    allow_origin,
                } => Ok(FetchedResource {
                    bytes,
                    content_type: Some("image/png".to_string()),
                    allow_origin,
                }),
                Reply::Status(code) => Err(FetchError::Status(code)),
                Reply::Hang => std::future::pending().await,
            }
        })
    }
}

pub fn settings() -> PipelineSettings {
    PipelineSettings {
        gate: GateSettings {
            resource_timeout: Duration::from_millis(200),
            resource_budget: Duration::from_millis(400),
            settle_delay: Duration::from_millis(10),
            app_origin: Some(Url::parse(APP_ORIGIN).unwrap()),
        },
        ..PipelineSettings::default()
    }
}

pub fn canvas_engine(fetcher: MemoryFetcher) -> ExportEngine {
    canvas_engine_with(fetcher, settings())
}

pub fn canvas_engine_with(fetcher: MemoryFetcher, settings: PipelineSettings) -> ExportEngine {
    ExportEngine::with_parts(
        Arc::new(fetcher),
        Arc::new(CanvasRasterizer::new(None).unwrap()),
        settings,
    )
}

pub fn solid_png(width: u32, height: u32, color: [u8; 4]) -> Vec<u8> {
    let image = RgbaImage::from_pixel(width, height, Rgba(color));
    let mut bytes = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
        .unwrap();
    bytes
}

pub fn decode(bytes: &[u8]) -> RgbaImage {
    image::load_from_memory(bytes).unwrap().to_rgba8()
}

pub fn image_layer(id: &str, kind: LayerKind, url: &str, z_index: i32) -> CardLayer {
    let (x, y, size) = match kind {
        LayerKind::Avatar => (125.0, 60.0, Some(100.0)),
        _ => (0.0, 0.0, None),
    };
    CardLayer {
        id: id.to_string(),
        kind,
        x,
        y,
        width: size,
        height: size,
        content: url.to_string(),
        style: LayerStyle::default(),
        z_index,
    }
}

/// A plain white card with a background layer and an avatar.
pub fn business_card(id: &str) -> Card {
    Card {
        id: id.to_string(),
        width: 350.0,
        height: 500.0,
        frame: CardFrame {
            background_color: Some("#ffffff".to_string()),
            ..CardFrame::default()
        },
        layers: vec![
            image_layer("background", LayerKind::Background, "/assets/bg.png", 0),
            image_layer("avatar", LayerKind::Avatar, "/assets/avatar.png", 1),
        ],
        fonts: vec![],
    }
}

pub fn asset(path: &str) -> String {
    format!("{}{}", APP_ORIGIN, path)
}
