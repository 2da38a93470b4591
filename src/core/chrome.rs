use std::ffi::OsStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{Result, anyhow};
use base64::{Engine as _, engine::general_purpose};
use crossbeam::queue::ArrayQueue;
use headless_chrome::protocol::cdp::{Emulation, Page};
use headless_chrome::{Browser, LaunchOptions, Tab};
use serde::Deserialize;

use crate::core::error::RasterizationError;
use crate::core::request::BoxSize;
use crate::core::snapshot::{Capabilities, PoolStatus, Rasterizer, Snapshot, SnapshotJob};
use crate::core::template;

const NAME: &str = "chrome";
/// Space around the card so shadows or rounding never hit the viewport edge.
const VIEWPORT_MARGIN: u32 = 32;

struct TabGuard {
    tab: Arc<Tab>,
}

impl TabGuard {
    fn new(tab: Arc<Tab>) -> Self {
        Self { tab }
    }

    fn as_ref(&self) -> &Arc<Tab> {
        &self.tab
    }
}

impl Drop for TabGuard {
    fn drop(&mut self) {
        if let Err(e) = self.tab.close(true) {
            tracing::warn!("Failed to close tab during cleanup: {}", e);
        } else {
            tracing::debug!("Tab closed successfully");
        }
    }
}

/// Idle browsers ready for reuse plus a cap on how many may exist.
struct BrowserPool {
    idle: ArrayQueue<Browser>,
    launched: AtomicUsize,
    launch_options: LaunchOptions<'static>,
}

/// A browser checked out of the pool. Returned on drop unless it broke.
struct PooledBrowser<'a> {
    pool: &'a BrowserPool,
    browser: Option<Browser>,
    healthy: bool,
}

impl PooledBrowser<'_> {
    fn browser(&self) -> Result<&Browser> {
        self.browser
            .as_ref()
            .ok_or_else(|| anyhow!("browser already released"))
    }

    fn mark_broken(&mut self) {
        self.healthy = false;
    }
}

impl Drop for PooledBrowser<'_> {
    fn drop(&mut self) {
        let Some(browser) = self.browser.take() else {
            return;
        };
        if !self.healthy {
            tracing::warn!("Discarding unhealthy browser instance");
            self.pool.launched.fetch_sub(1, Ordering::SeqCst);
            return;
        }
        if self.pool.idle.push(browser).is_err() {
            self.pool.launched.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl BrowserPool {
    fn new(capacity: usize, launch_options: LaunchOptions<'static>) -> Self {
        Self {
            idle: ArrayQueue::new(capacity.max(1)),
            launched: AtomicUsize::new(0),
            launch_options,
        }
    }

    fn acquire(&self) -> Result<PooledBrowser<'_>> {
        while let Some(browser) = self.idle.pop() {
            // Check if browser exists and is alive
            match browser.new_tab() {
                Ok(tab) => {
                    let _ = tab.close(true);
                    return Ok(self.checkout(browser));
                }
                Err(_) => {
                    tracing::warn!("Browser health check failed, recreating");
                    self.launched.fetch_sub(1, Ordering::SeqCst);
                }
            }
        }

        tracing::info!(
            "Launching browser instance ({} running)",
            self.launched.load(Ordering::SeqCst)
        );
        let browser = Browser::new(self.launch_options.clone())?;
        self.launched.fetch_add(1, Ordering::SeqCst);
        Ok(self.checkout(browser))
    }

    fn checkout(&self, browser: Browser) -> PooledBrowser<'_> {
        PooledBrowser {
            pool: self,
            browser: Some(browser),
            healthy: true,
        }
    }

    fn status(&self) -> PoolStatus {
        PoolStatus {
            available: self.idle.len(),
            capacity: self.idle.capacity(),
        }
    }
}

#[derive(Deserialize, Debug)]
struct PageReport {
    missing: bool,
    #[serde(default)]
    outcomes: Vec<ImageReport>,
    #[serde(default)]
    x: f64,
    #[serde(default)]
    y: f64,
    #[serde(default)]
    width: f64,
    #[serde(default)]
    height: f64,
}

#[derive(Deserialize, Debug)]
struct ImageReport {
    layer: String,
    outcome: String,
}

/// Snapshots the card in an isolated headless Chrome tab.
pub struct ChromeRasterizer {
    pool: BrowserPool,
}

impl ChromeRasterizer {
    pub fn new(pool_size: usize) -> Result<Self> {
        let launch_options = LaunchOptions::default_builder()
            .headless(true)
            .sandbox(false)
            .args(vec![
                OsStr::new("--no-sandbox"),
                OsStr::new("--disable-setuid-sandbox"),
                OsStr::new("--disable-dev-shm-usage"),
                OsStr::new("--disable-gpu"),
                OsStr::new("--disable-extensions"),
                OsStr::new("--disable-background-networking"),
                OsStr::new("--disable-sync"),
                OsStr::new("--metrics-recording-only"),
                OsStr::new("--mute-audio"),
                OsStr::new("--no-first-run"),
                OsStr::new("--disable-default-apps"),
                OsStr::new("--hide-scrollbars"),
            ])
            .build()
            .map_err(|_| anyhow!("Could not find Chrome/Chromium binary"))?;

        Ok(Self {
            pool: BrowserPool::new(pool_size, launch_options),
        })
    }

    fn capture(&self, tab: &Arc<Tab>, job: &SnapshotJob<'_>) -> Result<Snapshot> {
        let card = job.card;
        let viewport_width = card.width.ceil() as u32 + VIEWPORT_MARGIN * 2;
        let viewport_height = card.height.ceil() as u32 + VIEWPORT_MARGIN * 2;

        // Pin the device scale factor; the export scale is applied at capture.
        tab.call_method(Emulation::SetDeviceMetricsOverride {
            width: viewport_width,
            height: viewport_height,
            device_scale_factor: 1.0,
            mobile: false,
            scale: None,
            screen_width: Some(viewport_width),
            screen_height: Some(viewport_height),
            position_x: Some(0),
            position_y: Some(0),
            dont_set_visible_size: None,
            screen_orientation: None,
            viewport: None,
            display_feature: None,
            device_posture: None,
        })?;

        let html = template::card_html(card, job.resources);
        let data_url = format!(
            "data:text/html;base64,{}",
            general_purpose::STANDARD.encode(&html)
        );
        tab.navigate_to(&data_url)?;
        tab.wait_until_navigated()?;

        let script = template::readiness_script(job.resource_timeout_ms, job.settle_delay_ms);
        let report: PageReport = {
            let value = tab
                .evaluate(&script, true)?
                .value
                .ok_or_else(|| anyhow!("No value returned from readiness script"))?;
            let json = value
                .as_str()
                .ok_or_else(|| anyhow!("Readiness script returned non-string value"))?;
            serde_json::from_str(json)?
        };

        if report.missing {
            return Err(anyhow!("#{} not present in rendered page", template::ROOT_ID));
        }
        for image in report.outcomes.iter().filter(|i| i.outcome != "loaded") {
            tracing::warn!(layer = %image.layer, "In-page image {}", image.outcome);
        }
        if report.width <= 0.0 || report.height <= 0.0 {
            return Err(anyhow!(
                "card measured as {}x{}",
                report.width,
                report.height
            ));
        }

        let png = tab.capture_screenshot(
            Page::CaptureScreenshotFormatOption::Png,
            None,
            Some(Page::Viewport {
                x: report.x,
                y: report.y,
                width: report.width,
                height: report.height,
                scale: job.scale,
            }),
            true,
        )?;

        let image = image::load_from_memory(&png)?.to_rgba8();
        Ok(Snapshot {
            image,
            measured: BoxSize {
                width: report.width,
                height: report.height,
            },
        })
    }
}

impl Rasterizer for ChromeRasterizer {
    fn name(&self) -> &'static str {
        NAME
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            css_backgrounds: Some(true),
        }
    }

    fn rasterize(&self, job: &SnapshotJob<'_>) -> Result<Snapshot, RasterizationError> {
        let mut browser = self
            .pool
            .acquire()
            .map_err(|e| RasterizationError::backend(NAME, e))?;

        let tab = match browser.browser().and_then(|b| b.new_tab()) {
            Ok(tab) => tab,
            Err(e) => {
                browser.mark_broken();
                return Err(RasterizationError::backend(NAME, e));
            }
        };
        let tab_guard = TabGuard::new(tab);

        self.capture(tab_guard.as_ref(), job)
            .map_err(|e| RasterizationError::backend(NAME, e))
    }

    fn status(&self) -> Option<PoolStatus> {
        Some(self.pool.status())
    }
}
