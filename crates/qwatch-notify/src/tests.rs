use crate::channels::webhook::WebhookChannel;
use crate::error::{NotifyError, Result};
use crate::manager::{ChannelConfig, NotificationManager};
use crate::plugin::ChannelRegistry;
use crate::{DispatchSummary, Notification, NotificationChannel, NotificationDispatcher};
use async_trait::async_trait;
use qwatch_common::types::{NotificationEvent, TemplateContext};
use serde_json::json;
use std::sync::{Arc, Mutex};

struct RecordingChannel {
    id: String,
    fail: bool,
    sent: Arc<Mutex<Vec<NotificationEvent>>>,
}

#[async_trait]
impl NotificationChannel for RecordingChannel {
    async fn send(&self, notification: &Notification) -> Result<()> {
        if self.fail {
            return Err(NotifyError::InvalidConfig("forced failure".into()));
        }
        self.sent.lock().unwrap().push(notification.event);
        Ok(())
    }

    fn channel_type(&self) -> &str {
        "recording"
    }

    fn instance_id(&self) -> &str {
        &self.id
    }
}

fn context() -> TemplateContext {
    let mut ctx = TemplateContext::new();
    ctx.insert("rule_id".into(), json!("r1"));
    ctx.insert("title".into(), json!("Queue wait time high"));
    ctx.insert("value".into(), json!(42.0));
    ctx
}

fn entry(id: &str, kind: &str, config: serde_json::Value) -> ChannelConfig {
    ChannelConfig {
        id: id.into(),
        channel_type: kind.into(),
        config,
    }
}

#[test]
fn registry_lists_builtin_kinds() {
    let registry = ChannelRegistry::default();
    assert_eq!(registry.kinds(), vec!["log", "webhook"]);
    assert!(ChannelRegistry::empty().kinds().is_empty());
}

#[test]
fn registry_rejects_unknown_type() {
    let registry = ChannelRegistry::default();
    let result = registry.build(&entry("p1", "pager", json!({})));
    assert!(matches!(result, Err(NotifyError::UnknownChannelType(t)) if t == "pager"));
}

#[test]
fn registry_rejects_blank_id() {
    let registry = ChannelRegistry::default();
    let result = registry.build(&entry("  ", "log", serde_json::Value::Null));
    assert!(matches!(result, Err(NotifyError::InvalidConfig(_))));
}

#[test]
fn webhook_config_requires_http_url() {
    let registry = ChannelRegistry::default();
    let built = registry
        .build(&entry("w1", "webhook", json!({ "url": "https://hooks.example.com/x" })))
        .unwrap();
    assert_eq!(built.channel.instance_id(), "w1");
    assert_eq!(built.channel.channel_type(), "webhook");
    assert!(registry
        .build(&entry("w2", "webhook", json!({ "url": "ftp://example.com" })))
        .is_err());
    assert!(registry.build(&entry("w3", "webhook", json!({}))).is_err());
}

#[test]
fn webhook_redacts_headers() {
    let registry = ChannelRegistry::default();
    let built = registry
        .build(&entry(
            "w1",
            "webhook",
            json!({
                "url": "https://hooks.example.com/x",
                "headers": { "Authorization": "Bearer secret" }
            }),
        ))
        .unwrap();
    assert_eq!(built.redacted["headers"]["Authorization"], "***");
    assert_eq!(built.redacted["url"], "https://hooks.example.com/x");
}

#[test]
fn log_plugin_accepts_null_and_template() {
    let registry = ChannelRegistry::default();
    assert!(registry.build(&entry("l1", "log", serde_json::Value::Null)).is_ok());
    assert!(registry
        .build(&entry("l2", "log", json!({ "template": "{{title}}" })))
        .is_ok());
    assert!(registry
        .build(&entry("l3", "log", json!({ "bogus": true })))
        .is_err());
}

#[test]
fn webhook_body_defaults_to_context_with_event() {
    let channel = WebhookChannel::new("w1", "https://hooks.example.com/x", None);
    let notification = Notification {
        event: NotificationEvent::AlertTriggered,
        context: context(),
    };
    let body: serde_json::Value =
        serde_json::from_str(&channel.render_body(&notification).unwrap()).unwrap();
    assert_eq!(body["event"], "alert.triggered");
    assert_eq!(body["rule_id"], "r1");
}

#[test]
fn webhook_body_uses_template() {
    let channel = WebhookChannel::new(
        "w1",
        "https://hooks.example.com/x",
        Some(r#"{"text":"{{title}} ({{value}})"}"#.into()),
    );
    let notification = Notification {
        event: NotificationEvent::AlertReset,
        context: context(),
    };
    assert_eq!(
        channel.render_body(&notification).unwrap(),
        r#"{"text":"Queue wait time high (42.00)"}"#
    );
}

#[tokio::test]
async fn manager_dispatches_by_channel_id() {
    let sent = Arc::new(Mutex::new(Vec::new()));
    let mut manager = NotificationManager::new();
    manager.register(Box::new(RecordingChannel {
        id: "ok".into(),
        fail: false,
        sent: sent.clone(),
    }));
    manager.register(Box::new(RecordingChannel {
        id: "broken".into(),
        fail: true,
        sent: sent.clone(),
    }));

    let summary = manager
        .dispatch(
            NotificationEvent::AlertTriggered,
            &context(),
            &["ok".to_string(), "broken".to_string(), "missing".to_string()],
        )
        .await;

    assert_eq!(
        summary,
        DispatchSummary {
            delivered: 1,
            failed: 1,
            unknown: 1
        }
    );
    assert_eq!(*sent.lock().unwrap(), vec![NotificationEvent::AlertTriggered]);
}

#[tokio::test]
async fn manager_from_configs_registers_channels() {
    let registry = ChannelRegistry::default();
    let configs = vec![
        ChannelConfig {
            id: "ops-log".into(),
            channel_type: "log".into(),
            config: serde_json::Value::Null,
        },
        ChannelConfig {
            id: "ops-hook".into(),
            channel_type: "webhook".into(),
            config: json!({ "url": "http://127.0.0.1:9/hook" }),
        },
    ];
    let manager = NotificationManager::from_configs(&registry, &configs).unwrap();
    assert_eq!(manager.channel_ids(), vec!["ops-hook", "ops-log"]);

    let summary = manager
        .dispatch(
            NotificationEvent::AlertReset,
            &context(),
            &["ops-log".to_string()],
        )
        .await;
    assert_eq!(summary.delivered, 1);
}

#[test]
fn manager_from_configs_fails_on_bad_entry() {
    let registry = ChannelRegistry::default();
    let configs = vec![ChannelConfig {
        id: "bad".into(),
        channel_type: "webhook".into(),
        config: json!({ "url": 5 }),
    }];
    assert!(NotificationManager::from_configs(&registry, &configs).is_err());
}

#[test]
fn manager_from_configs_rejects_repeated_id() {
    let registry = ChannelRegistry::default();
    let configs = vec![
        entry("ops", "log", serde_json::Value::Null),
        entry("ops", "webhook", json!({ "url": "https://hooks.example.com/x" })),
    ];
    let err = NotificationManager::from_configs(&registry, &configs)
        .err()
        .unwrap();
    assert!(err.to_string().contains("declared twice"));
}
