use poem_openapi::Object;

use crate::core::error::ExportError;

#[derive(Object, Debug)]
pub struct ExportFailureResponse {
    /// Pipeline stage the export failed in
    pub stage: String,

    /// Machine-readable error kind (e.g. "busy", "rasterization_error")
    pub kind: String,

    /// Message suitable for the UI
    pub message: String,

    /// Suggested fallback, if any
    pub hint: Option<String>,

    pub detail: String,
}

impl From<&ExportError> for ExportFailureResponse {
    fn from(err: &ExportError) -> Self {
        Self {
            stage: err.stage().to_string(),
            kind: err.kind().to_string(),
            message: err.user_message().to_string(),
            hint: err.hint().map(str::to_string),
            detail: err.to_string(),
        }
    }
}
