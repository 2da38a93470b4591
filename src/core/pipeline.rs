//! The export pipeline: readiness gate, snapshot, correction, encoding.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, bail};
use parking_lot::Mutex;
use url::Url;

use crate::core::canvas::CanvasRasterizer;
use crate::core::card::Card;
use crate::core::chrome::ChromeRasterizer;
use crate::core::correction::correct_canvas;
use crate::core::encoding::encode;
use crate::core::error::{EncodingError, ExportError, RasterizationError};
use crate::core::request::{
    ExportRequest, ExportResult, ExportStage, MAX_LOGICAL_SIDE, MAX_PIXELS, bounded_pixels,
};
use crate::core::resources::{GateSettings, HttpFetcher, ResourceBundle, ResourceFetcher, ResourceGate};
use crate::core::snapshot::{PoolStatus, Rasterizer, Snapshot, SnapshotClone, SnapshotJob, ensure_untainted};
use crate::settings::Config;

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub gate: GateSettings,
    pub rasterization_budget: Duration,
    pub enforce_cors: bool,
    pub force_background_substitution: bool,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            gate: GateSettings::default(),
            rasterization_budget: Duration::from_millis(15_000),
            enforce_cors: true,
            force_background_substitution: false,
        }
    }
}

impl PipelineSettings {
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let app_origin = config
            .app_origin
            .as_deref()
            .map(Url::parse)
            .transpose()
            .context("app_origin is not a valid URL")?;

        Ok(Self {
            gate: GateSettings {
                resource_timeout: Duration::from_millis(config.resource_timeout_ms),
                resource_budget: Duration::from_millis(config.resource_budget_ms),
                settle_delay: Duration::from_millis(config.settle_delay_ms),
                app_origin,
            },
            rasterization_budget: Duration::from_millis(config.rasterization_budget_ms),
            enforce_cors: config.enforce_cors,
            force_background_substitution: config.force_background_substitution,
        })
    }
}

/// Cards with an export running.
#[derive(Clone, Default)]
struct InFlight {
    cards: Arc<Mutex<HashSet<String>>>,
}

/// Marks a card busy until dropped.
struct InFlightGuard {
    cards: Arc<Mutex<HashSet<String>>>,
    card_id: String,
}

impl InFlight {
    fn try_acquire(&self, card_id: &str) -> Option<InFlightGuard> {
        if !self.cards.lock().insert(card_id.to_string()) {
            return None;
        }
        Some(InFlightGuard {
            cards: self.cards.clone(),
            card_id: card_id.to_string(),
        })
    }

    fn len(&self) -> usize {
        self.cards.lock().len()
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.cards.lock().remove(&self.card_id);
    }
}

struct Progress {
    card_id: String,
    stage: ExportStage,
    started: Instant,
}

impl Progress {
    fn new(card_id: &str) -> Self {
        Self {
            card_id: card_id.to_string(),
            stage: ExportStage::Idle,
            started: Instant::now(),
        }
    }

    fn enter(&mut self, next: ExportStage) {
        tracing::debug!(
            card = %self.card_id,
            "Export stage {} -> {} after {:?}",
            self.stage,
            next,
            self.started.elapsed()
        );
        self.stage = next;
    }
}

pub struct EngineHealth {
    pub backend: &'static str,
    pub in_flight: usize,
    pub pool: Option<PoolStatus>,
}

pub struct ExportEngine {
    gate: ResourceGate,
    rasterizer: Arc<dyn Rasterizer>,
    settings: PipelineSettings,
    in_flight: InFlight,
}

impl ExportEngine {
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        let settings = PipelineSettings::from_config(config)?;
        let fetcher = Arc::new(HttpFetcher::new(settings.gate.app_origin.as_ref())?);

        let rasterizer: Arc<dyn Rasterizer> = match config.backend.as_str() {
            "canvas" => Arc::new(CanvasRasterizer::new(
                config.fallback_font_path.as_deref().map(Path::new),
            )?),
            "chrome" => Arc::new(ChromeRasterizer::new(config.browser_pool_size)?),
            other => bail!("unknown rasterization backend {:?}", other),
        };

        Ok(Self::with_parts(fetcher, rasterizer, settings))
    }

    pub fn with_parts(
        fetcher: Arc<dyn ResourceFetcher>,
        rasterizer: Arc<dyn Rasterizer>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            gate: ResourceGate::new(fetcher, settings.gate.clone()),
            rasterizer,
            settings,
            in_flight: InFlight::default(),
        }
    }

    pub fn backend(&self) -> &'static str {
        self.rasterizer.name()
    }

    pub fn health(&self) -> EngineHealth {
        EngineHealth {
            backend: self.rasterizer.name(),
            in_flight: self.in_flight.len(),
            pool: self.rasterizer.status(),
        }
    }

    /// Exports `card` as described by `request`.
    ///
    /// Only one export per card id runs at a time; a concurrent call fails
    /// with [`ExportError::Busy`]. Dropping the returned future stops waiting
    /// but lets an already started rasterization finish in the background,
    /// and the card stays busy until it does.
    pub async fn export_card(
        &self,
        card: &Card,
        request: &ExportRequest,
    ) -> Result<ExportResult, ExportError> {
        let result = self.run(card, request).await;
        match &result {
            Ok(done) => tracing::info!(
                card = %card.id,
                "Exported {}x{} {} ({} bytes, corrected: {}, warnings: {})",
                done.pixel_width,
                done.pixel_height,
                done.format,
                done.byte_size,
                done.corrected,
                done.warnings.len()
            ),
            Err(e) => tracing::error!(card = %card.id, stage = %e.stage(), "Export failed: {}", e),
        }
        result
    }

    async fn run(&self, card: &Card, request: &ExportRequest) -> Result<ExportResult, ExportError> {
        request.validate()?;
        if card.id.trim().is_empty() {
            return Err(ExportError::ElementNotFound("card has no id".to_string()));
        }
        if !card.has_rendered_box() {
            return Err(ExportError::ElementNotFound(format!(
                "card {} has no rendered box ({}x{})",
                card.id, card.width, card.height
            )));
        }
        let max_side = MAX_LOGICAL_SIDE as f64;
        if card.width > max_side
            || card.height > max_side
            || bounded_pixels(card.width, card.height, request.scale).is_none()
        {
            return Err(ExportError::InvalidRequest(format!(
                "card box {}x{} cannot be rendered at scale {} (at most {} per side and {} pixels)",
                card.width, card.height, request.scale, MAX_LOGICAL_SIDE, MAX_PIXELS
            )));
        }

        let guard = self
            .in_flight
            .try_acquire(&card.id)
            .ok_or_else(|| ExportError::Busy {
                card_id: card.id.clone(),
            })?;
        let mut progress = Progress::new(&card.id);

        progress.enter(ExportStage::AwaitingResources);
        let resources = self.gate.wait_for(card).await;
        let warnings = resources.warnings.clone();

        progress.enter(ExportStage::Rasterizing);
        let clone = SnapshotClone::prepare(
            card,
            self.rasterizer.capabilities(),
            self.settings.force_background_substitution,
        );
        if self.settings.enforce_cors {
            ensure_untainted(clone.card(), &resources, self.settings.gate.app_origin.as_ref())?;
        }
        let (snapshot, guard) = self.rasterize(clone, resources, request.scale, guard).await?;

        let expected = request.expected_pixels();
        let produced = snapshot.pixel_size();
        let corrected = produced != expected;
        let measured = snapshot.measured;
        let format = request.format;
        let quality = request.encoder_quality();
        let backdrop = request.backdrop();

        if corrected {
            progress.enter(ExportStage::Correcting);
            tracing::debug!(
                card = %card.id,
                "Snapshot is {} but {} was expected",
                produced,
                expected
            );
        }

        let (image, blob, mut progress) = tokio::task::spawn_blocking(move || {
            let image = correct_canvas(snapshot.image, expected, backdrop);
            progress.enter(ExportStage::Encoding);
            let blob = encode(&image, format, quality, backdrop);
            (image, blob, progress)
        })
        .await
        .map_err(|e| EncodingError::Join(e.to_string()))?;
        let blob = blob?;
        drop(guard);

        progress.enter(ExportStage::Done);
        Ok(ExportResult {
            pixel_width: image.width(),
            pixel_height: image.height(),
            byte_size: blob.bytes.len(),
            blob,
            format,
            measured,
            corrected,
            backend: self.rasterizer.name(),
            warnings,
        })
    }

    /// Runs the backend off the async runtime, bounded by the rasterization
    /// budget. The busy guard travels with the blocking task.
    async fn rasterize(
        &self,
        clone: SnapshotClone,
        resources: ResourceBundle,
        scale: f64,
        guard: InFlightGuard,
    ) -> Result<(Snapshot, InFlightGuard), ExportError> {
        let rasterizer = self.rasterizer.clone();
        let gate = self.gate.settings();
        let resource_timeout_ms = gate.resource_timeout.as_millis() as u64;
        let settle_delay_ms = gate.settle_delay.as_millis() as u64;

        let task = tokio::task::spawn_blocking(move || {
            let job = SnapshotJob {
                card: clone.card(),
                resources: &resources,
                scale,
                resource_timeout_ms,
                settle_delay_ms,
            };
            let snapshot = rasterizer.rasterize(&job);
            drop(clone);
            (snapshot, guard)
        });

        let budget = self.settings.rasterization_budget;
        match tokio::time::timeout(budget, task).await {
            Ok(Ok((snapshot, guard))) => Ok((snapshot?, guard)),
            Ok(Err(e)) => Err(RasterizationError::Join(e.to_string()).into()),
            Err(_) => Err(RasterizationError::Timeout(budget.as_millis() as u64).into()),
        }
    }
}
