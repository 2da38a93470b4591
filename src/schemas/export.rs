use poem_openapi::{
    ApiResponse, Object,
    payload::{Attachment, Json},
};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use super::common::ExportFailureResponse;
use crate::core::error::{ExportError, ResourceWarning};
use crate::core::request::{ExportRequest, ImageFormat};

#[derive(Object, Deserialize, Clone, Debug, Default)]
pub struct ExportOptions {
    /// Output format (png, jpeg, jpg)
    /// Default: png
    pub format: Option<String>,

    /// JPEG quality between 0 and 1
    /// Default: 0.92
    pub quality: Option<f32>,

    /// Pixel ratio applied to the logical card size (350x500)
    /// Default: 2
    pub scale: Option<f64>,

    /// Design size of the card in logical pixels
    /// Default: 350x500
    pub logical_width: Option<u32>,
    pub logical_height: Option<u32>,

    /// Hex color painted behind transparent pixels
    pub background: Option<String>,

    /// Suffix of the download filename (e.g. "front")
    /// Default: card
    pub variant: Option<String>,

    /// Return base64 encoded string instead of binary
    pub return_base64: Option<bool>,
}

impl TryFrom<&ExportOptions> for ExportRequest {
    type Error = ExportError;

    fn try_from(options: &ExportOptions) -> Result<Self, Self::Error> {
        let format = match options.format.as_deref() {
            None => ImageFormat::Png,
            Some(value) => ImageFormat::parse(value).ok_or_else(|| {
                ExportError::InvalidRequest(format!("unsupported format {:?}", value))
            })?,
        };

        let defaults = ExportRequest::default();
        let request = ExportRequest {
            format,
            quality: options.quality.unwrap_or(defaults.quality),
            scale: options.scale.unwrap_or(defaults.scale),
            logical_width: options.logical_width.unwrap_or(defaults.logical_width),
            logical_height: options.logical_height.unwrap_or(defaults.logical_height),
            background: options.background.clone(),
            variant: options.variant.clone().unwrap_or(defaults.variant),
        };
        request.validate()?;
        Ok(request)
    }
}

#[derive(Object, Deserialize, Clone, Debug)]
pub struct UserIdentity {
    pub id: String,

    /// Used for the download filename
    pub display_name: Option<String>,
}

#[derive(Object, Deserialize, Clone, Debug)]
pub struct ExportCardRequest {
    /// Card layout as edited by the user
    pub card: Option<JsonValue>,

    #[oai(default)]
    #[serde(default)]
    pub options: ExportOptions,

    /// Signed-in user; exports are recorded in the usage log when present
    pub user: Option<UserIdentity>,
}

#[derive(Object, Serialize, Clone, Debug)]
pub struct ExportWarning {
    pub url: String,
    pub kind: String,
    pub reason: String,
}

impl From<&ResourceWarning> for ExportWarning {
    fn from(warning: &ResourceWarning) -> Self {
        Self {
            url: warning.url.clone(),
            kind: warning.kind.clone(),
            reason: warning.reason.clone(),
        }
    }
}

#[derive(Object, Serialize)]
pub struct Base64Response {
    /// Base64 encoded image data
    pub data: String,

    /// MIME type of the image
    pub mime_type: String,

    pub filename: String,
    pub pixel_width: u32,
    pub pixel_height: u32,
    pub byte_size: u64,

    /// Rasterization backend that produced the image
    pub backend: String,

    /// Whether the snapshot had to be resampled to the requested size
    pub corrected: bool,

    /// Resources that were skipped
    pub warnings: Vec<ExportWarning>,
}

#[derive(ApiResponse)]
pub enum ExportResponse {
    #[oai(status = 200, content_type = "image/png")]
    Png(Attachment<Vec<u8>>),

    #[oai(status = 200, content_type = "image/jpeg")]
    Jpeg(Attachment<Vec<u8>>),

    #[oai(status = 200, content_type = "application/json")]
    Base64(Json<Base64Response>),

    #[oai(status = 400)]
    BadRequest(Json<ExportFailureResponse>),

    #[oai(status = 404)]
    NotFound(Json<ExportFailureResponse>),

    #[oai(status = 409)]
    Conflict(Json<ExportFailureResponse>),

    #[oai(status = 422)]
    UnprocessableEntity(Json<ExportFailureResponse>),
}

impl From<&ExportError> for ExportResponse {
    fn from(err: &ExportError) -> Self {
        let body = Json(ExportFailureResponse::from(err));
        match err {
            ExportError::InvalidRequest(_) => ExportResponse::BadRequest(body),
            ExportError::ElementNotFound(_) => ExportResponse::NotFound(body),
            ExportError::Busy { .. } => ExportResponse::Conflict(body),
            ExportError::Rasterization(_) | ExportError::Encoding(_) => {
                ExportResponse::UnprocessableEntity(body)
            }
        }
    }
}

#[derive(Object, Serialize)]
pub struct BrowserPoolStatus {
    pub available: u64,
    pub capacity: u64,
}

#[derive(Object, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub backend: String,

    /// Cards with an export currently running
    pub in_flight: u64,

    /// Only reported by the chrome backend
    pub browser_pool: Option<BrowserPoolStatus>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn options_default_to_png_at_double_scale() {
        let request = ExportRequest::try_from(&ExportOptions::default()).unwrap();
        assert_eq!(request.format, ImageFormat::Png);
        assert_eq!(request.scale, 2.0);
        assert_eq!(request.variant, "card");
        assert_eq!(request.expected_pixels().width, 700);
    }

    #[test]
    fn jpg_alias_is_accepted() {
        let options = ExportOptions {
            format: Some("JPG".into()),
            quality: Some(0.8),
            ..Default::default()
        };
        let request = ExportRequest::try_from(&options).unwrap();
        assert_eq!(request.format, ImageFormat::Jpeg);
        assert_eq!(request.encoder_quality(), 80);
    }

    #[test]
    fn invalid_options_are_rejected() {
        let options = ExportOptions {
            format: Some("gif".into()),
            ..Default::default()
        };
        assert!(matches!(
            ExportRequest::try_from(&options),
            Err(ExportError::InvalidRequest(_))
        ));

        let options = ExportOptions {
            scale: Some(9.0),
            ..Default::default()
        };
        assert!(ExportRequest::try_from(&options).is_err());
    }
}
