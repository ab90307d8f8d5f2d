//! Mail delivery transport.
//!
//! One HTTP transport serves every provider: providers differ only in
//! the credentials and template identifiers carried on the request.

use crate::error::{DispatchError, DispatchResult};
use crate::models::Provider;
use async_trait::async_trait;
use core_config::env_or_default;
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;

/// A rendered email ready for delivery.
#[derive(Debug, Clone)]
pub struct OutboundEmail {
    pub to_email: String,
    pub to_name: String,
    pub subject: String,
    pub html_body: String,
    pub variables: BTreeMap<String, String>,
}

/// What the provider acknowledged.
#[derive(Debug, Clone)]
pub struct DeliveryReceipt {
    pub message_id: Option<String>,
}

#[async_trait]
pub trait MailTransport: Send + Sync {
    /// Deliver one email through the given provider account.
    async fn deliver(
        &self,
        provider: &Provider,
        email: &OutboundEmail,
    ) -> DispatchResult<DeliveryReceipt>;

    fn name(&self) -> &'static str;
}

#[derive(Debug, Clone)]
pub struct HttpTransportConfig {
    /// Send endpoint of the relay API.
    pub api_url: String,
    /// Connection-level timeout; the per-attempt deadline is enforced
    /// above this layer by the sender.
    pub timeout: Duration,
}

impl HttpTransportConfig {
    pub fn from_env() -> Self {
        Self {
            api_url: env_or_default("MAIL_API_URL", "https://api.emailjs.com/api/v1.0/email/send"),
            timeout: Duration::from_secs(10),
        }
    }
}

pub struct HttpTransport {
    config: HttpTransportConfig,
    client: reqwest::Client,
}

#[derive(Serialize)]
struct SendRequest<'a> {
    service_id: &'a str,
    template_id: &'a str,
    public_key: &'a str,
    private_key: &'a str,
    recipient: &'a str,
    recipient_name: &'a str,
    subject: &'a str,
    body: &'a str,
    variables: &'a BTreeMap<String, String>,
}

impl HttpTransport {
    pub fn new(config: HttpTransportConfig) -> DispatchResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|err| DispatchError::Config(format!("HTTP client init failed: {err}")))?;
        Ok(Self { config, client })
    }
}

#[async_trait]
impl MailTransport for HttpTransport {
    async fn deliver(
        &self,
        provider: &Provider,
        email: &OutboundEmail,
    ) -> DispatchResult<DeliveryReceipt> {
        let request = SendRequest {
            service_id: &provider.service_id,
            template_id: &provider.template_id,
            public_key: &provider.public_key,
            private_key: &provider.private_key,
            recipient: &email.to_email,
            recipient_name: &email.to_name,
            subject: &email.subject,
            body: &email.html_body,
            variables: &email.variables,
        };

        let response = self
            .client
            .post(&self.config.api_url)
            .json(&request)
            .send()
            .await
            .map_err(|err| {
                if err.is_timeout() {
                    DispatchError::TransportTimeout {
                        provider: provider.id.clone(),
                        timeout_ms: self.config.timeout.as_millis() as u64,
                    }
                } else {
                    DispatchError::TransportError {
                        provider: provider.id.clone(),
                        status: err.status().map(|s| s.as_u16()),
                        detail: err.to_string(),
                    }
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let detail = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable response body>".to_string());
            return Err(DispatchError::TransportError {
                provider: provider.id.clone(),
                status: Some(status.as_u16()),
                detail,
            });
        }

        let message_id = response
            .headers()
            .get("x-message-id")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        debug!(provider = %provider.id, ?message_id, "Provider accepted delivery");
        Ok(DeliveryReceipt { message_id })
    }

    fn name(&self) -> &'static str {
        "http"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_build_is_checked_at_construction() {
        let transport = HttpTransport::new(HttpTransportConfig {
            api_url: "https://relay.example.com/send".to_string(),
            timeout: Duration::from_secs(10),
        })
        .unwrap();
        assert_eq!(transport.name(), "http");
    }
}
