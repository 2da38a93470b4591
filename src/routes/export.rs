use std::sync::Arc;

use base64::{Engine as _, engine::general_purpose};
use poem::web::Data;
use poem_openapi::{
    OpenApi, Tags,
    payload::{Attachment, Json},
};

use crate::{
    AppState,
    core::{
        card::Card,
        encoding::export_filename,
        error::ExportError,
        request::{ExportRequest, ImageFormat},
        usage::UsageEntry,
    },
    schemas::export::{
        Base64Response, BrowserPoolStatus, ExportCardRequest, ExportResponse, ExportWarning,
        HealthResponse,
    },
};

#[derive(Tags)]
enum ApiExportTags {
    Export,
}

pub struct ApiExport;

fn parse_card(value: Option<serde_json::Value>) -> Result<Card, ExportError> {
    let value = value.ok_or_else(|| {
        ExportError::ElementNotFound("request did not include a card".to_string())
    })?;
    serde_json::from_value(value)
        .map_err(|e| ExportError::InvalidRequest(format!("card is malformed: {}", e)))
}

#[OpenApi()]
impl ApiExport {
    /// Export Card
    ///
    /// Capture a business card as a PNG or JPEG image.
    /// The image is always 350x500 times `scale` pixels.
    ///
    /// # Example Request
    /// ```json
    /// {
    ///   "card": {
    ///     "id": "card-42",
    ///     "frame": { "background_color": "#ffffff", "border_radius": 16 },
    ///     "layers": [
    ///       { "id": "name", "kind": "text", "x": 24, "y": 320, "content": "Jordan Lee" }
    ///     ]
    ///   },
    ///   "options": { "format": "png", "scale": 2, "variant": "front" },
    ///   "user": { "id": "u-1", "display_name": "Jordan Lee" }
    /// }
    /// ```
    #[oai(path = "/export", method = "post", tag = "ApiExportTags::Export")]
    async fn export(
        &self,
        Json(json): Json<ExportCardRequest>,
        state: Data<&Arc<AppState>>,
    ) -> ExportResponse {
        let request = match ExportRequest::try_from(&json.options) {
            Ok(request) => request,
            Err(e) => return ExportResponse::from(&e),
        };
        let card = match parse_card(json.card) {
            Ok(card) => card,
            Err(e) => {
                tracing::warn!("Export rejected: {}", e);
                return ExportResponse::from(&e);
            }
        };

        tracing::info!(
            "Exporting: card={}, format={}, scale={}",
            card.id,
            request.format,
            request.scale
        );

        let result = match state.engine.export_card(&card, &request).await {
            Ok(result) => result,
            Err(e) => return ExportResponse::from(&e),
        };

        let display_name = json
            .user
            .as_ref()
            .and_then(|user| user.display_name.as_deref());
        let filename = export_filename(display_name, &request.variant, result.format);

        if let Some(user) = &json.user {
            state.usage.record(UsageEntry {
                user_id: user.id.clone(),
                format: result.format.to_string(),
                file_size: result.byte_size,
                filename: filename.clone(),
            });
        }

        if json.options.return_base64.unwrap_or(false) {
            return ExportResponse::Base64(Json(Base64Response {
                data: general_purpose::STANDARD.encode(&result.blob.bytes),
                mime_type: result.blob.mime_type.to_string(),
                filename,
                pixel_width: result.pixel_width,
                pixel_height: result.pixel_height,
                byte_size: result.byte_size as u64,
                backend: result.backend.to_string(),
                corrected: result.corrected,
                warnings: result.warnings.iter().map(ExportWarning::from).collect(),
            }));
        }

        let attachment = Attachment::new(result.blob.bytes).filename(filename);
        match result.format {
            ImageFormat::Png => ExportResponse::Png(attachment),
            ImageFormat::Jpeg => ExportResponse::Jpeg(attachment),
        }
    }

    #[oai(path = "/health", method = "get")]
    async fn health(&self, state: Data<&Arc<AppState>>) -> Json<HealthResponse> {
        let health = state.engine.health();

        Json(HealthResponse {
            status: "healthy".to_string(),
            backend: health.backend.to_string(),
            in_flight: health.in_flight as u64,
            browser_pool: health.pool.map(|pool| BrowserPoolStatus {
                available: pool.available as u64,
                capacity: pool.capacity as u64,
            }),
        })
    }
}
