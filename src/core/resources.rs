//! Resource readiness gate.
//!
//! Before a card is rasterized every image and web font it references is
//! fetched, each bounded by its own timeout and all of them by an overall
//! budget. Failures never abort the export: the resource is dropped, a
//! [`ResourceWarning`] is recorded and the card is painted without it.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::{Engine as _, engine::general_purpose};
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use reqwest::header::{ACCESS_CONTROL_ALLOW_ORIGIN, CONTENT_TYPE, ORIGIN};
use thiserror::Error;
use url::Url;

use crate::core::card::Card;
use crate::core::error::ResourceWarning;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Image,
    Font,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ResourceKind::Image => "image",
            ResourceKind::Font => "font",
        })
    }
}

/// Raw response of a resource fetch.
#[derive(Debug, Clone)]
pub struct FetchedResource {
    pub bytes: Vec<u8>,
    pub content_type: Option<String>,
    /// Value of the `Access-Control-Allow-Origin` response header.
    pub allow_origin: Option<String>,
}

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("invalid url: {0}")]
    InvalidUrl(String),

    #[error("http status {0}")]
    Status(u16),

    #[error("network error: {0}")]
    Network(String),

    #[error("malformed data url: {0}")]
    DataUrl(String),
}

/// Source of remote resources. Implementations must not retry internally;
/// the gate owns timing.
pub trait ResourceFetcher: Send + Sync {
    fn fetch<'a>(&'a self, url: &'a Url) -> BoxFuture<'a, Result<FetchedResource, FetchError>>;
}

/// Fetches resources over HTTP(S), announcing the application origin so
/// CORS-aware servers answer with `Access-Control-Allow-Origin`.
pub struct HttpFetcher {
    client: reqwest::Client,
    origin: Option<String>,
}

impl HttpFetcher {
    pub fn new(app_origin: Option<&Url>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("card-renderer/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            origin: app_origin.map(|url| url.origin().ascii_serialization()),
        })
    }
}

impl ResourceFetcher for HttpFetcher {
    fn fetch<'a>(&'a self, url: &'a Url) -> BoxFuture<'a, Result<FetchedResource, FetchError>> {
        Box::pin(async move {
            let mut request = self.client.get(url.clone());
            if let Some(origin) = &self.origin {
                request = request.header(ORIGIN, origin);
            }

            let response = request
                .send()
                .await
                .map_err(|e| FetchError::Network(e.to_string()))?;

            let status = response.status();
            if !status.is_success() {
                return Err(FetchError::Status(status.as_u16()));
            }

            let header = |name: reqwest::header::HeaderName| {
                response
                    .headers()
                    .get(name)
                    .and_then(|v| v.to_str().ok())
                    .map(String::from)
            };
            let content_type = header(CONTENT_TYPE);
            let allow_origin = header(ACCESS_CONTROL_ALLOW_ORIGIN);

            let bytes = response
                .bytes()
                .await
                .map_err(|e| FetchError::Network(e.to_string()))?;

            Ok(FetchedResource {
                bytes: bytes.to_vec(),
                content_type,
                allow_origin,
            })
        })
    }
}

/// A settled, usable resource.
#[derive(Debug, Clone)]
pub struct LoadedResource {
    pub kind: ResourceKind,
    /// Absolute URL it was fetched from. `None` for inline `data:` URLs.
    pub resolved: Option<Url>,
    pub bytes: Arc<Vec<u8>>,
    pub content_type: Option<String>,
    pub allow_origin: Option<String>,
}

impl LoadedResource {
    /// Whether painting this resource keeps the bitmap readable from
    /// `app_origin`, following the browser canvas taint rules.
    pub fn is_cors_safe(&self, app_origin: Option<&Url>) -> bool {
        let Some(url) = &self.resolved else {
            return true;
        };
        if app_origin.is_some_and(|origin| origin.origin() == url.origin()) {
            return true;
        }
        match self.allow_origin.as_deref().map(str::trim) {
            Some("*") => true,
            Some(allowed) => app_origin.is_some_and(|origin| {
                origin.origin().ascii_serialization() == allowed.trim_end_matches('/')
            }),
            None => false,
        }
    }

    /// MIME type for inlining. Images are sniffed from their bytes; the
    /// response header is only trusted when it is a bare `type/subtype`.
    pub fn mime_type(&self) -> String {
        let declared = self.content_type.as_deref().and_then(mime_token);
        match self.kind {
            ResourceKind::Image => image::guess_format(&self.bytes)
                .ok()
                .map(|format| format.to_mime_type().to_string())
                .or(declared)
                .unwrap_or_else(|| "application/octet-stream".to_string()),
            ResourceKind::Font => declared.unwrap_or_else(|| "font/ttf".to_string()),
        }
    }

    pub fn to_data_url(&self) -> String {
        format!(
            "data:{};base64,{}",
            self.mime_type(),
            general_purpose::STANDARD.encode(self.bytes.as_slice())
        )
    }
}

#[derive(Debug)]
pub enum ResourceOutcome {
    Loaded(LoadedResource),
    Failed(String),
    TimedOut,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PendingResource {
    /// URL exactly as written in the card.
    pub url: String,
    pub kind: ResourceKind,
}

/// Resources one export waits on. Lives only for the duration of the gate.
#[derive(Debug, Default)]
pub struct ResourceWaitSet {
    members: Vec<PendingResource>,
}

impl ResourceWaitSet {
    pub fn for_card(card: &Card) -> Self {
        let mut seen = HashSet::new();
        let mut members = Vec::new();

        let images = card
            .image_urls()
            .into_iter()
            .map(|url| (url, ResourceKind::Image));
        let fonts = card
            .fonts
            .iter()
            .map(|font| (font.url.as_str(), ResourceKind::Font));

        for (url, kind) in images.chain(fonts) {
            if url.trim().is_empty() || !seen.insert(url.to_string()) {
                continue;
            }
            members.push(PendingResource {
                url: url.to_string(),
                kind,
            });
        }

        Self { members }
    }

    pub fn members(&self) -> &[PendingResource] {
        &self.members
    }

    pub fn image_count(&self) -> usize {
        self.members
            .iter()
            .filter(|m| m.kind == ResourceKind::Image)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

/// Everything the gate managed to load, keyed by the URL written in the card.
#[derive(Debug, Default, Clone)]
pub struct ResourceBundle {
    loaded: HashMap<String, LoadedResource>,
    pub warnings: Vec<ResourceWarning>,
}

impl ResourceBundle {
    pub fn get(&self, url: &str) -> Option<&LoadedResource> {
        self.loaded.get(url)
    }

    pub fn insert(&mut self, url: impl Into<String>, resource: LoadedResource) {
        self.loaded.insert(url.into(), resource);
    }

    pub fn len(&self) -> usize {
        self.loaded.len()
    }

    pub fn is_empty(&self) -> bool {
        self.loaded.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct GateSettings {
    pub resource_timeout: Duration,
    pub resource_budget: Duration,
    pub settle_delay: Duration,
    pub app_origin: Option<Url>,
}

impl Default for GateSettings {
    fn default() -> Self {
        Self {
            resource_timeout: Duration::from_millis(4000),
            resource_budget: Duration::from_millis(8000),
            settle_delay: Duration::from_millis(250),
            app_origin: None,
        }
    }
}

pub struct ResourceGate {
    fetcher: Arc<dyn ResourceFetcher>,
    settings: GateSettings,
}

impl ResourceGate {
    pub fn new(fetcher: Arc<dyn ResourceFetcher>, settings: GateSettings) -> Self {
        Self { fetcher, settings }
    }

    pub fn settings(&self) -> &GateSettings {
        &self.settings
    }

    /// Waits until every resource of `card` has loaded, failed or timed out.
    /// Never fails; problems end up in [`ResourceBundle::warnings`].
    pub async fn wait_for(&self, card: &Card) -> ResourceBundle {
        let wait_set = ResourceWaitSet::for_card(card);
        let started = Instant::now();
        let deadline = tokio::time::Instant::now() + self.settings.resource_budget;

        let mut outcomes: Vec<Option<ResourceOutcome>> =
            wait_set.members().iter().map(|_| None).collect();
        let mut pending: FuturesUnordered<_> = wait_set
            .members()
            .iter()
            .enumerate()
            .map(|(index, member)| async move { (index, self.settle(member).await) })
            .collect();

        loop {
            let next = tokio::time::timeout_at(deadline, pending.next()).await;
            match next {
                Ok(Some((index, outcome))) => outcomes[index] = Some(outcome),
                Ok(None) => break,
                Err(_) => {
                    tracing::warn!(
                        "Resource budget of {:?} exhausted with {} resource(s) pending",
                        self.settings.resource_budget,
                        pending.len()
                    );
                    break;
                }
            }
        }
        drop(pending);

        if wait_set.image_count() == 0 && !self.settings.settle_delay.is_zero() {
            tokio::time::sleep(self.settings.settle_delay).await;
        }

        let mut bundle = ResourceBundle::default();
        for (member, outcome) in wait_set.members().iter().zip(outcomes) {
            let reason = match outcome.unwrap_or(ResourceOutcome::TimedOut) {
                ResourceOutcome::Loaded(resource) => {
                    bundle.insert(member.url.clone(), resource);
                    continue;
                }
                ResourceOutcome::Failed(reason) => reason,
                ResourceOutcome::TimedOut => "timed out".to_string(),
            };

            tracing::warn!(
                url = %member.url,
                kind = %member.kind,
                "Resource not loaded, exporting without it: {}",
                reason
            );
            bundle.warnings.push(ResourceWarning {
                url: member.url.clone(),
                kind: member.kind.to_string(),
                reason,
            });
        }

        tracing::debug!(
            "Resource gate settled {} of {} resource(s) in {:?}",
            bundle.len(),
            wait_set.members().len(),
            started.elapsed()
        );

        bundle
    }

    async fn settle(&self, member: &PendingResource) -> ResourceOutcome {
        if member.url.starts_with("data:") {
            return match decode_data_url(&member.url) {
                Ok(fetched) => self.accept(member.kind, None, fetched),
                Err(e) => ResourceOutcome::Failed(e.to_string()),
            };
        }

        let url = match self.resolve(&member.url) {
            Ok(url) => url,
            Err(e) => return ResourceOutcome::Failed(e.to_string()),
        };

        match tokio::time::timeout(self.settings.resource_timeout, self.fetcher.fetch(&url)).await {
            Ok(Ok(fetched)) => self.accept(member.kind, Some(url), fetched),
            Ok(Err(e)) => ResourceOutcome::Failed(e.to_string()),
            Err(_) => ResourceOutcome::TimedOut,
        }
    }

    fn accept(&self, kind: ResourceKind, resolved: Option<Url>, fetched: FetchedResource) -> ResourceOutcome {
        if fetched.bytes.is_empty() {
            return ResourceOutcome::Failed("empty response".to_string());
        }
        if kind == ResourceKind::Image && image::guess_format(&fetched.bytes).is_err() {
            return ResourceOutcome::Failed("response is not a decodable image".to_string());
        }

        ResourceOutcome::Loaded(LoadedResource {
            kind,
            resolved,
            bytes: Arc::new(fetched.bytes),
            content_type: fetched.content_type,
            allow_origin: fetched.allow_origin,
        })
    }

    fn resolve(&self, raw: &str) -> Result<Url, FetchError> {
        match Url::parse(raw) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => Ok(url),
            Ok(url) => Err(FetchError::InvalidUrl(format!(
                "unsupported scheme {}",
                url.scheme()
            ))),
            Err(url::ParseError::RelativeUrlWithoutBase) => self
                .settings
                .app_origin
                .as_ref()
                .ok_or_else(|| {
                    FetchError::InvalidUrl(format!("relative url {raw} without application origin"))
                })?
                .join(raw)
                .map_err(|e| FetchError::InvalidUrl(e.to_string())),
            Err(e) => Err(FetchError::InvalidUrl(e.to_string())),
        }
    }
}

/// `type/subtype` of a `Content-Type` value, lowercased, or `None` when it
/// carries anything besides token characters.
fn mime_token(content_type: &str) -> Option<String> {
    let essence = content_type.split(';').next()?.trim().to_ascii_lowercase();
    let (kind, subtype) = essence.split_once('/')?;
    let is_token = |part: &str| {
        !part.is_empty()
            && part
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
    };
    (is_token(kind) && is_token(subtype)).then_some(essence)
}

/// Decodes an RFC 2397 `data:` URL.
pub fn decode_data_url(raw: &str) -> Result<FetchedResource, FetchError> {
    let rest = raw
        .strip_prefix("data:")
        .ok_or_else(|| FetchError::DataUrl("missing data: prefix".to_string()))?;
    let (meta, payload) = rest
        .split_once(',')
        .ok_or_else(|| FetchError::DataUrl("missing ',' separator".to_string()))?;

    let (mime, is_base64) = match meta.strip_suffix(";base64") {
        Some(mime) => (mime, true),
        None => (meta, false),
    };

    let bytes = if is_base64 {
        general_purpose::STANDARD
            .decode(payload.trim())
            .map_err(|e| FetchError::DataUrl(e.to_string()))?
    } else {
        payload.as_bytes().to_vec()
    };

    Ok(FetchedResource {
        bytes,
        content_type: (!mime.is_empty()).then(|| mime.to_string()),
        allow_origin: None,
    })
}
