use shared::error::ApiError;
use thiserror::Error;

/// Failure taxonomy for the sync engine and its collaborators.
///
/// `NoPartnerSelected` is a guard condition: history fetches treat it as a
/// silent no-op and it never reaches the presentation layer through the
/// error state.
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("not authenticated")]
    NotAuthenticated,
    /// Token or channel authorization denied. Terminal; never retried
    /// automatically.
    #[error("access denied: {0}")]
    AccessDenied(String),
    /// Request-level transport failure. Transient; the user re-triggers.
    #[error("network failure: {0}")]
    Network(#[from] reqwest::Error),
    /// Non-2xx response. Carries the backend's message payload verbatim
    /// when the body parses as one.
    #[error("backend rejected request ({status}): {message}")]
    BackendRejected { status: u16, message: String },
    #[error("no conversation partner selected")]
    NoPartnerSelected,
    /// Broker connection or subscription plumbing failure.
    #[error("transport failure: {0}")]
    Transport(String),
}

/// Folds a non-2xx response into `BackendRejected`, preferring the backend's
/// own error message over the raw body.
pub(crate) async fn rejected(response: reqwest::Response) -> ChatError {
    let status = response.status().as_u16();
    let message = match response.text().await {
        Ok(body) => ApiError::from_body(&body)
            .map(|err| err.message)
            .unwrap_or_else(|| {
                if body.is_empty() {
                    format!("HTTP {status}")
                } else {
                    body
                }
            }),
        Err(_) => format!("HTTP {status}"),
    };
    ChatError::BackendRejected { status, message }
}
