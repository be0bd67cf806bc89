use std::time::Duration;

use anyhow::Context;
use url::Url;

/// Client-side knobs. Defaults match the reference deployment; the two
/// deployment-specific values can be overridden from the environment.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base URL of the REST backend, without a trailing slash.
    pub api_base_url: String,
    /// Audience requested from the identity provider for API tokens.
    pub auth_audience: String,
    /// Inactivity window after which a local typing burst ends.
    pub typing_debounce: Duration,
    /// Pause between sequential deletes in a bulk clear.
    pub clear_chat_delay: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_base_url: "http://127.0.0.1:3000/api/v1".into(),
            auth_audience: "chat-api".into(),
            typing_debounce: Duration::from_secs(3),
            clear_chat_delay: Duration::from_millis(150),
        }
    }
}

pub fn load_config() -> ClientConfig {
    let mut config = ClientConfig::default();

    if let Ok(v) = std::env::var("CHAT_API_BASE_URL") {
        config.api_base_url = v;
    }
    if let Ok(v) = std::env::var("CHAT_AUTH_AUDIENCE") {
        config.auth_audience = v;
    }

    config
}

impl ClientConfig {
    pub fn endpoint(&self, path: &str) -> String {
        format!("{}{path}", self.api_base_url.trim_end_matches('/'))
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        Url::parse(&self.api_base_url)
            .with_context(|| format!("invalid api_base_url: {}", self.api_base_url))?;
        Ok(())
    }
}
