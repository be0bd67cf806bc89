//! User roster and profile endpoints. Conversation partners come from this
//! directory rather than any hard-wired pairing.

use std::sync::Arc;

use shared::{
    domain::Presence,
    protocol::{ProfileUpdate, StatusUpdate, UserProfile},
};
use tracing::warn;

use crate::{
    auth::TokenProvider,
    config::ClientConfig,
    error::{rejected, ChatError},
};

pub struct UserDirectory {
    http: reqwest::Client,
    config: ClientConfig,
    tokens: Arc<dyn TokenProvider>,
}

impl UserDirectory {
    pub fn new(config: ClientConfig, tokens: Arc<dyn TokenProvider>) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
            tokens,
        }
    }

    async fn bearer(&self) -> Result<String, ChatError> {
        if !self.tokens.is_authenticated() {
            return Err(ChatError::NotAuthenticated);
        }
        self.tokens.bearer_token(&self.config.auth_audience).await
    }

    /// Every member of the group, the local user included.
    pub async fn fetch_users(&self) -> Result<Vec<UserProfile>, ChatError> {
        let token = self.bearer().await?;
        let response = self
            .http
            .get(self.config.endpoint("/users"))
            .bearer_auth(token)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(rejected(response).await);
        }
        Ok(response.json().await?)
    }

    /// The roster of possible conversation partners: everyone but the local
    /// subject.
    pub async fn other_users(&self) -> Result<Vec<UserProfile>, ChatError> {
        let me = self.tokens.subject_id().ok_or(ChatError::NotAuthenticated)?;
        let mut users = self.fetch_users().await?;
        users.retain(|profile| profile.user_id != me);
        Ok(users)
    }

    /// Fetches (creating on first sight, server-side) the local profile.
    pub async fn fetch_me(&self) -> Result<UserProfile, ChatError> {
        let token = self.bearer().await?;
        let response = self
            .http
            .get(self.config.endpoint("/users/me"))
            .bearer_auth(token)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(rejected(response).await);
        }
        Ok(response.json().await?)
    }

    pub async fn update_profile(&self, update: ProfileUpdate) -> Result<UserProfile, ChatError> {
        let token = self.bearer().await?;
        let response = self
            .http
            .put(self.config.endpoint("/users/profile"))
            .bearer_auth(token)
            .json(&update)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(rejected(response).await);
        }
        Ok(response.json().await?)
    }

    /// Best-effort presence update. Failures are logged and swallowed;
    /// presence is advisory.
    pub async fn update_status(&self, status: Presence) {
        let result: Result<(), ChatError> = async {
            let token = self.bearer().await?;
            let response = self
                .http
                .put(self.config.endpoint("/users/status"))
                .bearer_auth(token)
                .json(&StatusUpdate { status })
                .send()
                .await?;
            if !response.status().is_success() {
                return Err(rejected(response).await);
            }
            Ok(())
        }
        .await;

        if let Err(err) = result {
            warn!("directory: status update failed: {err}");
        }
    }
}

#[cfg(test)]
#[path = "tests/directory_tests.rs"]
mod tests;
