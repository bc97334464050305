use crate::error::{NotifyError, Result};
use crate::plugin::ChannelPlugin;
use crate::utils::{render_template, truncate_string, MAX_BODY_LENGTH};
use crate::{Notification, NotificationChannel};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;

const MAX_ATTEMPTS: u32 = 3;

/// POSTs a JSON document to a fixed URL. The body is either the notification
/// context (plus an `event` field) or a user-supplied template with
/// `{{key}}` placeholders.
pub struct WebhookChannel {
    instance_id: String,
    url: String,
    headers: HashMap<String, String>,
    client: reqwest::Client,
    body_template: Option<String>,
}

impl WebhookChannel {
    pub fn new(instance_id: &str, url: &str, body_template: Option<String>) -> Self {
        Self {
            instance_id: instance_id.to_string(),
            url: url.to_string(),
            headers: HashMap::new(),
            client: reqwest::Client::new(),
            body_template,
        }
    }

    pub fn with_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Result<Self> {
        self.client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(self)
    }

    pub fn render_body(&self, notification: &Notification) -> Result<String> {
        if let Some(template) = &self.body_template {
            return Ok(render_template(template, &notification.context));
        }
        let mut doc = notification.context.clone();
        doc.insert(
            "event".to_string(),
            Value::String(notification.event.to_string()),
        );
        Ok(serde_json::to_string(&doc)?)
    }

    async fn post_once(&self, body: &str) -> Result<()> {
        let mut request = self
            .client
            .post(self.url.as_str())
            .header("Content-Type", "application/json");
        for (name, value) in &self.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        let resp = request.body(body.to_string()).send().await?;
        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        let text = match resp.text().await {
            Ok(text) => truncate_string(&text, MAX_BODY_LENGTH),
            Err(e) => format!("[failed to read response body: {e}]"),
        };
        Err(NotifyError::Endpoint {
            endpoint: self.url.clone(),
            status: status.as_u16(),
            body: text,
        })
    }
}

#[async_trait]
impl NotificationChannel for WebhookChannel {
    async fn send(&self, notification: &Notification) -> Result<()> {
        let body = self.render_body(notification)?;

        let mut last_err = None;
        for attempt in 0..MAX_ATTEMPTS {
            match self.post_once(&body).await {
                Ok(()) => {
                    tracing::debug!(
                        channel = %self.instance_id,
                        attempt = attempt + 1,
                        "Webhook delivered"
                    );
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!(
                        channel = %self.instance_id,
                        attempt = attempt + 1,
                        error = %e,
                        "Webhook send failed, retrying"
                    );
                    last_err = Some(e);
                }
            }
            if attempt + 1 < MAX_ATTEMPTS {
                tokio::time::sleep(Duration::from_millis(100 * 2u64.pow(attempt))).await;
            }
        }

        match last_err {
            Some(e) => {
                tracing::error!(url = %self.url, error = %e, "Webhook failed after {MAX_ATTEMPTS} attempts");
                Err(e)
            }
            None => Ok(()),
        }
    }

    fn channel_type(&self) -> &str {
        "webhook"
    }

    fn instance_id(&self) -> &str {
        &self.instance_id
    }
}

// Plugin

#[derive(Deserialize)]
struct WebhookConfig {
    url: String,
    body_template: Option<String>,
    #[serde(default)]
    headers: HashMap<String, String>,
    timeout_ms: Option<u64>,
}

pub struct WebhookPlugin;

impl ChannelPlugin for WebhookPlugin {
    fn kind(&self) -> &'static str {
        "webhook"
    }

    fn check(&self, config: &Value) -> Result<()> {
        let parsed = serde_json::from_value::<WebhookConfig>(config.clone())
            .map_err(|e| NotifyError::InvalidConfig(format!("webhook: {e}")))?;
        if !(parsed.url.starts_with("http://") || parsed.url.starts_with("https://")) {
            return Err(NotifyError::InvalidConfig(format!(
                "webhook: url must be http(s), got '{}'",
                parsed.url
            )));
        }
        Ok(())
    }

    fn build(&self, instance_id: &str, config: &Value) -> Result<Box<dyn NotificationChannel>> {
        let cfg: WebhookConfig = serde_json::from_value(config.clone())?;
        let mut channel =
            WebhookChannel::new(instance_id, &cfg.url, cfg.body_template).with_headers(cfg.headers);
        if let Some(ms) = cfg.timeout_ms {
            channel = channel.with_timeout(Duration::from_millis(ms))?;
        }
        Ok(Box::new(channel))
    }

    fn redact(&self, config: &Value) -> Value {
        let mut redacted = config.clone();
        if let Some(headers) = redacted.get_mut("headers").and_then(Value::as_object_mut) {
            for value in headers.values_mut() {
                *value = Value::String("***".to_string());
            }
        }
        redacted
    }
}
