//! Webhook delivery over HTTP (Discord-compatible JSON payloads).

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use serde::Serialize;

use crate::{
    errors::Error,
    messaging::{
        port::{AlertSink, WebhookTransport},
        types::{Embed, OutboundMessage, Severity, WebhookIdentity},
    },
    Result,
};

const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Serialize)]
struct WebhookPayload<'a> {
    content: &'a str,
    #[serde(skip_serializing_if = "no_embeds")]
    embeds: &'a [Embed],
    #[serde(skip_serializing_if = "Option::is_none")]
    username: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    avatar_url: Option<&'a str>,
}

fn no_embeds(embeds: &&[Embed]) -> bool {
    embeds.is_empty()
}

fn payload<'a>(
    message: &'a OutboundMessage,
    identity: Option<&'a WebhookIdentity>,
) -> WebhookPayload<'a> {
    WebhookPayload {
        content: &message.content,
        embeds: &message.embeds,
        username: identity.map(|i| i.username.as_str()),
        avatar_url: identity.and_then(|i| i.avatar_url.as_deref()),
    }
}

/// Webhook URLs embed a secret token; only the id part goes into logs.
pub fn redact_webhook_url(url: &str) -> String {
    match url.rfind('/') {
        Some(idx) if idx + 1 < url.len() => format!("{}/***", &url[..idx]),
        _ => url.to_string(),
    }
}

#[derive(Clone)]
pub struct HttpWebhookTransport {
    http: reqwest::Client,
}

impl HttpWebhookTransport {
    pub fn new() -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(WEBHOOK_TIMEOUT)
            .user_agent("relay/0.1")
            .build()
            .map_err(|e| Error::External(format!("http client: {e}")))?;
        Ok(Self { http })
    }
}

#[async_trait]
impl WebhookTransport for HttpWebhookTransport {
    async fn deliver(
        &self,
        url: &str,
        message: &OutboundMessage,
        identity: Option<&WebhookIdentity>,
    ) -> Result<()> {
        let target = redact_webhook_url(url);
        let resp = self
            .http
            .post(url)
            .json(&payload(message, identity))
            .send()
            .await
            .map_err(|e| Error::Transport {
                target: target.clone(),
                reason: e.to_string(),
            })?;

        let status = resp.status();
        if status.as_u16() == 429 {
            return Err(Error::RateLimited { target });
        }
        if !status.is_success() {
            return Err(Error::Transport {
                target,
                reason: format!("http {status}"),
            });
        }
        Ok(())
    }
}

/// AlertSink that posts alerts to a webhook.
pub struct WebhookAlertSink {
    transport: Arc<dyn WebhookTransport>,
    url: String,
    identity: WebhookIdentity,
}

impl WebhookAlertSink {
    pub fn new(transport: Arc<dyn WebhookTransport>, url: String, username: String) -> Self {
        Self {
            transport,
            url,
            identity: WebhookIdentity {
                username,
                avatar_url: None,
            },
        }
    }
}

pub fn alert_text(severity: Severity, text: &str) -> String {
    let icon = match severity {
        Severity::Info => ":green_circle:",
        Severity::Warning => ":warning:",
        Severity::Critical => ":red_circle:",
    };
    format!("{icon} {text}")
}

#[async_trait]
impl AlertSink for WebhookAlertSink {
    async fn notify(&self, severity: Severity, text: &str) -> Result<()> {
        let message = OutboundMessage {
            content: alert_text(severity, text),
            embeds: Vec::new(),
        };
        self.transport
            .deliver(&self.url, &message, Some(&self.identity))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn payload_omits_identity_and_empty_embeds() {
        let msg = OutboundMessage {
            content: "hi".to_string(),
            embeds: Vec::new(),
        };
        let v = serde_json::to_value(payload(&msg, None)).unwrap();
        assert_eq!(v, serde_json::json!({ "content": "hi" }));
    }

    #[test]
    fn payload_carries_identity_override() {
        let msg = OutboundMessage {
            content: "hi".to_string(),
            embeds: vec![Embed {
                title: Some("t".to_string()),
                ..Embed::default()
            }],
        };
        let identity = WebhookIdentity {
            username: "Ashley".to_string(),
            avatar_url: Some("https://cdn/a.png".to_string()),
        };
        let v = serde_json::to_value(payload(&msg, Some(&identity))).unwrap();
        assert_eq!(v["username"], "Ashley");
        assert_eq!(v["avatar_url"], "https://cdn/a.png");
        assert_eq!(v["embeds"][0]["title"], "t");
    }

    #[test]
    fn redacts_webhook_token() {
        assert_eq!(
            redact_webhook_url("https://discord.com/api/webhooks/123/secret"),
            "https://discord.com/api/webhooks/123/***"
        );
        assert_eq!(redact_webhook_url("nourl"), "nourl");
    }

    #[derive(Default)]
    struct RecordingTransport {
        calls: Mutex<Vec<(String, String, Option<String>)>>,
    }

    #[async_trait]
    impl WebhookTransport for RecordingTransport {
        async fn deliver(
            &self,
            url: &str,
            message: &OutboundMessage,
            identity: Option<&WebhookIdentity>,
        ) -> Result<()> {
            self.calls.lock().unwrap().push((
                url.to_string(),
                message.content.clone(),
                identity.map(|i| i.username.clone()),
            ));
            Ok(())
        }
    }

    #[tokio::test]
    async fn alert_sink_prefixes_severity() {
        let transport = Arc::new(RecordingTransport::default());
        let sink = WebhookAlertSink::new(
            transport.clone(),
            "https://hook/1/x".to_string(),
            "relay status".to_string(),
        );
        sink.notify(Severity::Warning, "listener degraded")
            .await
            .unwrap();

        let calls = transport.calls.lock().unwrap().clone();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].1, ":warning: listener degraded");
        assert_eq!(calls[0].2.as_deref(), Some("relay status"));
    }
}
