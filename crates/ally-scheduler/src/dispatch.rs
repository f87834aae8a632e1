//! Notification dispatch: actually sends notifications to configured channels.
//! Supports: Telegram Bot API, HTTP Webhook, and the local log.

use ally_core::config::NotifyConfig;
use ally_core::error::{AllyError, Result};

use crate::notify::{Notification, NotifyPriority};

/// Notification target configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotifyTarget {
    /// Telegram Bot API: send via `sendMessage`.
    Telegram { bot_token: String, chat_id: String },
    /// Generic HTTP webhook: POST with JSON body.
    Webhook { url: String },
    /// Write to the tracing log only.
    Log,
}

/// Dispatch a notification to a target channel.
pub async fn dispatch(notification: &Notification, target: &NotifyTarget) -> Result<()> {
    match target {
        NotifyTarget::Telegram { bot_token, chat_id } => {
            send_telegram(bot_token, chat_id, notification).await
        }
        NotifyTarget::Webhook { url } => send_webhook(url, notification).await,
        NotifyTarget::Log => {
            tracing::info!("📢 {}: {}", notification.title, notification.body);
            Ok(())
        }
    }
}

/// Send notification via Telegram Bot API.
async fn send_telegram(bot_token: &str, chat_id: &str, notification: &Notification) -> Result<()> {
    let url = format!("https://api.telegram.org/bot{bot_token}/sendMessage");
    let priority_emoji = match notification.priority {
        NotifyPriority::Urgent => "🚨",
        NotifyPriority::High => "⚠️",
        NotifyPriority::Normal => "📚",
        NotifyPriority::Low => "ℹ️",
    };

    let text = format!(
        "{} *{}*\n\n{}\n\n_{}_",
        priority_emoji,
        escape_markdown(&notification.title),
        escape_markdown(&notification.body),
        notification.timestamp.format("%H:%M UTC")
    );

    let client = reqwest::Client::new();
    let resp = client
        .post(&url)
        .json(&serde_json::json!({
            "chat_id": chat_id,
            "text": text,
            "parse_mode": "Markdown"
        }))
        .timeout(std::time::Duration::from_secs(10))
        .send()
        .await
        .map_err(|e| AllyError::Notify(format!("Telegram send failed: {e}")))?;

    if resp.status().is_success() {
        tracing::info!("✅ Telegram notification sent: {}", notification.title);
        Ok(())
    } else {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        Err(AllyError::Notify(format!("Telegram API error {status}: {body}")))
    }
}

/// Send notification via generic HTTP webhook.
async fn send_webhook(url: &str, notification: &Notification) -> Result<()> {
    let client = reqwest::Client::new();
    let resp = client
        .post(url)
        .json(notification)
        .timeout(std::time::Duration::from_secs(10))
        .send()
        .await
        .map_err(|e| AllyError::Notify(format!("Webhook send failed: {e}")))?;

    if resp.status().is_success() {
        tracing::info!("✅ Webhook notification sent to {}: {}", url, notification.title);
        Ok(())
    } else {
        Err(AllyError::Notify(format!("Webhook error {}", resp.status())))
    }
}

/// Escape Telegram MarkdownV1 special characters.
fn escape_markdown(s: &str) -> String {
    s.replace('_', "\\_")
        .replace('*', "\\*")
        .replace('[', "\\[")
        .replace('`', "\\`")
}

/// Dispatch to all targets in order.
pub async fn dispatch_all(
    notification: &Notification,
    targets: &[(String, NotifyTarget)],
) -> Vec<(String, Result<()>)> {
    let mut results = Vec::new();
    for (name, target) in targets {
        let result = dispatch(notification, target).await;
        results.push((name.clone(), result));
    }
    results
}

/// Build targets from config. The log target is always present.
pub fn targets_from_config(config: &NotifyConfig) -> Vec<(String, NotifyTarget)> {
    let mut targets = vec![("log".to_string(), NotifyTarget::Log)];

    if let (Some(bot_token), Some(chat_id)) = (&config.telegram_bot_token, &config.telegram_chat_id)
        && !bot_token.is_empty()
        && !chat_id.is_empty()
    {
        targets.push((
            "telegram".to_string(),
            NotifyTarget::Telegram {
                bot_token: bot_token.clone(),
                chat_id: chat_id.clone(),
            },
        ));
    }

    if let Some(url) = config.webhook_url.as_ref().filter(|u| !u.is_empty()) {
        targets.push(("webhook".to_string(), NotifyTarget::Webhook { url: url.clone() }));
    }

    targets
}
