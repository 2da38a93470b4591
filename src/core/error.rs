//! Error taxonomy of the export pipeline.

use std::fmt;

use serde::Serialize;
use thiserror::Error;

use crate::core::request::ExportStage;

/// Fatal failure of an export. Non-fatal resource problems are reported as
/// [`ResourceWarning`]s on the result instead.
#[derive(Error, Debug)]
pub enum ExportError {
    /// The card root is absent or has no rendered box.
    #[error("Card element not found: {0}")]
    ElementNotFound(String),

    #[error("Invalid export request: {0}")]
    InvalidRequest(String),

    /// Another export of the same card is still running.
    #[error("Card {card_id} is already being exported")]
    Busy { card_id: String },

    #[error("Rasterization failed: {0}")]
    Rasterization(#[from] RasterizationError),

    #[error("Encoding failed: {0}")]
    Encoding(#[from] EncodingError),
}

impl ExportError {
    /// Stage the pipeline was in when the error was raised.
    pub fn stage(&self) -> ExportStage {
        match self {
            ExportError::ElementNotFound(_)
            | ExportError::InvalidRequest(_)
            | ExportError::Busy { .. } => ExportStage::Idle,
            ExportError::Rasterization(_) => ExportStage::Rasterizing,
            ExportError::Encoding(_) => ExportStage::Encoding,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ExportError::ElementNotFound(_) => "element_not_found",
            ExportError::InvalidRequest(_) => "invalid_request",
            ExportError::Busy { .. } => "busy",
            ExportError::Rasterization(_) => "rasterization_error",
            ExportError::Encoding(_) => "encoding_error",
        }
    }

    /// Short status line for the UI.
    pub fn user_message(&self) -> &'static str {
        match self {
            ExportError::ElementNotFound(_) => "The card is not ready to export yet.",
            ExportError::InvalidRequest(_) => "The export settings are not valid.",
            ExportError::Busy { .. } => "An export of this card is already in progress.",
            ExportError::Rasterization(RasterizationError::TaintedCanvas { .. }) => {
                "An image on the card could not be captured."
            }
            ExportError::Rasterization(RasterizationError::Timeout(_)) => {
                "Capturing the card took too long."
            }
            ExportError::Rasterization(_) => "The card could not be captured.",
            ExportError::Encoding(_) => "The image file could not be created.",
        }
    }

    /// Suggested fallback, when there is one.
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            ExportError::Rasterization(RasterizationError::TaintedCanvas { .. }) => {
                Some("Serve the image from the application origin or through the image proxy.")
            }
            ExportError::Rasterization(_) => Some("Try the alternate export method."),
            ExportError::Encoding(_) => Some("Try exporting as PNG or at a lower scale."),
            ExportError::Busy { .. } => Some("Wait for the current export to finish."),
            _ => None,
        }
    }
}

#[derive(Error, Debug)]
pub enum RasterizationError {
    /// A cross-origin image without CORS approval would taint the bitmap.
    #[error("cross-origin image without CORS headers would taint the canvas: {url}")]
    TaintedCanvas { url: String },

    #[error("could not allocate a {width}x{height} bitmap")]
    Allocation { width: u32, height: u32 },

    #[error("rasterization exceeded its budget of {0}ms")]
    Timeout(u64),

    #[error("{backend} backend failed: {cause}")]
    Backend { backend: &'static str, cause: String },

    #[error("rasterization task aborted: {0}")]
    Join(String),
}

impl RasterizationError {
    pub fn backend(backend: &'static str, cause: impl fmt::Display) -> Self {
        RasterizationError::Backend {
            backend,
            cause: cause.to_string(),
        }
    }
}

#[derive(Error, Debug)]
pub enum EncodingError {
    #[error("{0} encoder produced no data")]
    Empty(&'static str),

    #[error("{format} encoder failed: {cause}")]
    Encoder { format: &'static str, cause: String },

    /// The correction and encoding task panicked or was cancelled.
    #[error("encoding task aborted: {0}")]
    Join(String),
}

/// Non-fatal problem with one resource. The export proceeds without it.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct ResourceWarning {
    pub url: String,
    pub kind: String,
    pub reason: String,
}

impl fmt::Display for ResourceWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}: {}", self.kind, self.url, self.reason)
    }
}
