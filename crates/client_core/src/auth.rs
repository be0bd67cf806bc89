use async_trait::async_trait;
use shared::domain::UserId;

use crate::error::ChatError;

/// The identity provider seam. Token acquisition may perform its own network
/// round-trips and silent refresh; the engine only ever asks for a token and
/// the current subject.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// A currently-valid bearer token for the given audience.
    async fn bearer_token(&self, audience: &str) -> Result<String, ChatError>;

    /// Subject id of the signed-in user, if any.
    fn subject_id(&self) -> Option<UserId>;

    fn is_authenticated(&self) -> bool {
        self.subject_id().is_some()
    }
}

/// Null object for contexts with no identity provider wired up.
pub struct MissingTokenProvider;

#[async_trait]
impl TokenProvider for MissingTokenProvider {
    async fn bearer_token(&self, _audience: &str) -> Result<String, ChatError> {
        Err(ChatError::NotAuthenticated)
    }

    fn subject_id(&self) -> Option<UserId> {
        None
    }
}

/// Fixed subject and token. Useful for demos and tests.
pub struct StaticTokenProvider {
    subject: UserId,
    token: String,
}

impl StaticTokenProvider {
    pub fn new(subject: impl Into<UserId>, token: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            token: token.into(),
        }
    }
}

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn bearer_token(&self, _audience: &str) -> Result<String, ChatError> {
        Ok(self.token.clone())
    }

    fn subject_id(&self) -> Option<UserId> {
        Some(self.subject.clone())
    }
}
