//! Client configuration.
//!
//! Configuration is resolved once at construction, either explicitly through the
//! builder methods or from the environment via [`AvidoConfig::from_env`]. A config
//! missing its app id or API key is still usable: the client downgrades every
//! tracking operation to a no-op rather than failing the host application.

use std::time::Duration;

/// Default collector origin
pub const DEFAULT_API_URL: &str = "https://api.avido.io/v0";

/// Identifies this SDK in every emitted event
pub const RUNTIME: &str = "avido-rs";

/// Configuration for the Avido client
#[derive(Debug, Clone)]
pub struct AvidoConfig {
    pub app_id: Option<String>,
    pub api_key: Option<String>,
    pub api_url: String,
    /// When enabled, events are only emitted from call chains that carry an
    /// evaluation binding. Defaults to true.
    pub only_send_evals: bool,
    pub runtime: String,
    pub timeout: Option<Duration>,
}

impl Default for AvidoConfig {
    fn default() -> Self {
        Self {
            app_id: None,
            api_key: None,
            api_url: DEFAULT_API_URL.to_string(),
            only_send_evals: true,
            runtime: RUNTIME.to_string(),
            timeout: None,
        }
    }
}

impl AvidoConfig {
    /// Create a config with the given credentials
    pub fn new(app_id: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            app_id: Some(app_id.into()),
            api_key: Some(api_key.into()),
            ..Default::default()
        }
    }

    /// Resolve configuration from the environment.
    ///
    /// Reads `AVIDO_APP_ID`, `AVIDO_API_KEY`, `AVIDO_API_URL` and
    /// `AVIDO_ONLY_SEND_EVALS` after loading a `.env` file if one is present.
    pub fn from_env() -> Self {
        dotenv::dotenv().ok();

        let mut config = Self::default();
        if let Ok(app_id) = std::env::var("AVIDO_APP_ID") {
            config.app_id = Some(app_id);
        }
        if let Ok(api_key) = std::env::var("AVIDO_API_KEY") {
            config.api_key = Some(api_key);
        }
        if let Ok(api_url) = std::env::var("AVIDO_API_URL") {
            config.api_url = api_url;
        }
        if let Ok(flag) = std::env::var("AVIDO_ONLY_SEND_EVALS") {
            config.only_send_evals = parse_bool(&flag).unwrap_or(config.only_send_evals);
        }
        config
    }

    /// Override the collector origin
    pub fn with_api_url(mut self, api_url: impl Into<String>) -> Self {
        self.api_url = api_url.into();
        self
    }

    /// Override the evaluation-gating mode
    pub fn with_only_send_evals(mut self, only_send_evals: bool) -> Self {
        self.only_send_evals = only_send_evals;
        self
    }

    /// Override the runtime tag attached to every event
    pub fn with_runtime(mut self, runtime: impl Into<String>) -> Self {
        self.runtime = runtime.into();
        self
    }

    /// Set a request timeout for the HTTP transport
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Whether the config carries everything the transport needs
    pub fn is_complete(&self) -> bool {
        self.app_id.as_deref().is_some_and(|s| !s.is_empty())
            && self.api_key.as_deref().is_some_and(|s| !s.is_empty())
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Some(true),
        "false" | "0" | "no" => Some(false),
        _ => None,
    }
}
