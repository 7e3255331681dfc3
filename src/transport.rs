//! HTTP transport to the Avido collector.
//!
//! The queue only needs one thing from the outside world: "send this batch,
//! tell me whether it worked". That contract lives behind [`IngestionTransport`]
//! so the queue can be exercised against in-process fakes, with
//! [`HttpTransport`] as the production implementation. Webhook validation rides
//! on the same client and credentials.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use tracing::debug;

use crate::config::AvidoConfig;
use crate::error::{AvidoError, Result};
use crate::event::Event;

/// Headers accompanying a webhook delivery from Avido
#[derive(Debug, Clone)]
pub struct WebhookHeaders {
    pub signature: String,
    pub timestamp: String,
}

/// What the event queue needs from the remote collector
#[async_trait]
pub trait IngestionTransport: Send + Sync {
    /// Deliver one batch of events. `Ok(())` confirms the batch may be
    /// dropped from the queue.
    async fn send_batch(&self, events: &[Event]) -> Result<()>;
}

/// Transport speaking the collector's HTTP interface
pub struct HttpTransport {
    client: Client,
    api_url: String,
    app_id: String,
    api_key: String,
}

impl HttpTransport {
    /// Build a transport from a complete config.
    ///
    /// Fails with `ConfigError` when the app id or API key is missing; the
    /// client checks completeness first and downgrades to no-op tracking
    /// instead of surfacing this.
    pub fn new(config: &AvidoConfig) -> Result<Self> {
        let app_id = config
            .app_id
            .clone()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| AvidoError::ConfigError("AVIDO_APP_ID is not set".to_string()))?;
        let api_key = config
            .api_key
            .clone()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| AvidoError::ConfigError("AVIDO_API_KEY is not set".to_string()))?;

        let mut client_builder = Client::builder();
        if let Some(timeout) = config.timeout {
            client_builder = client_builder.timeout(timeout);
        }
        let client = client_builder.build()?;

        Ok(Self {
            client,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            app_id,
            api_key,
        })
    }

    /// Ask the collector whether a webhook payload is authentic.
    ///
    /// Forwards the raw payload together with the delivery's signature and
    /// timestamp headers; the collector answers `{"valid": true}` for a
    /// genuine delivery.
    pub async fn validate_webhook(
        &self,
        payload: &Value,
        headers: &WebhookHeaders,
    ) -> Result<bool> {
        let response = self
            .client
            .post(format!("{}/validate-webhook", self.api_url))
            .bearer_auth(&self.api_key)
            .header("x-avido-app-id", &self.app_id)
            .header("x-avido-signature", &headers.signature)
            .header("x-avido-timestamp", &headers.timestamp)
            .json(payload)
            .send()
            .await?;

        let body: Value = response.json().await?;
        Ok(body["valid"].as_bool().unwrap_or(false))
    }
}

#[async_trait]
impl IngestionTransport for HttpTransport {
    async fn send_batch(&self, events: &[Event]) -> Result<()> {
        debug!("Sending {} event(s) to collector", events.len());

        let response = self
            .client
            .post(format!("{}/ingest", self.api_url))
            .bearer_auth(&self.api_key)
            .header("x-avido-app-id", &self.app_id)
            .json(&serde_json::json!({ "events": events }))
            .send()
            .await?;

        // The ingestion contract treats any response the request survived as
        // acceptance; only transport-level failure keeps events queued.
        debug!("Collector responded with status {}", response.status());
        Ok(())
    }
}
