use serde::{Deserialize, Serialize};

/// Error body a non-2xx backend response carries. The client surfaces the
/// message verbatim when the body parses; otherwise it falls back to the
/// HTTP status line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiError {
    pub message: String,
}

impl ApiError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// Best-effort decode of an error body; `None` when the payload is not
    /// the expected shape.
    pub fn from_body(body: &str) -> Option<Self> {
        serde_json::from_str(body).ok()
    }
}
