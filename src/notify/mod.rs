//! # Notification Sinks
//! Structured alerts leave the pipeline through here: a Discord webhook
//! POST or an authenticated bot-API POST to a channel, chosen per source.
//! Both honor the sink's own rate limiting (`Retry-After`).

pub mod bot;
pub mod discord;

use anyhow::{bail, Result};

use crate::detect::PriceDropEvent;
use crate::fetch::types::Item;
use crate::store::Sink;

pub use bot::DiscordBotNotifier;
pub use discord::DiscordWebhookNotifier;

/// One outbound alert, fully resolved (item + routing).
#[derive(Debug, Clone)]
pub enum Notification {
    NewListing {
        item: Item,
        source_name: String,
        sink: Sink,
    },
    PriceDrop {
        item: Item,
        event: PriceDropEvent,
        source_name: String,
        sink: Sink,
    },
}

impl Notification {
    pub fn item(&self) -> &Item {
        match self {
            Notification::NewListing { item, .. } | Notification::PriceDrop { item, .. } => item,
        }
    }

    pub fn sink(&self) -> &Sink {
        match self {
            Notification::NewListing { sink, .. } | Notification::PriceDrop { sink, .. } => sink,
        }
    }
}

#[async_trait::async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, notification: &Notification) -> Result<()>;
}

/// Routes each notification to the sink its source configured: the bot
/// API when a token and channel are available, the webhook otherwise.
pub struct NotifierMux {
    webhook: DiscordWebhookNotifier,
    bot: Option<DiscordBotNotifier>,
}

impl NotifierMux {
    pub fn new(bot_token: Option<String>) -> Self {
        Self {
            webhook: DiscordWebhookNotifier::new(),
            bot: bot_token
                .filter(|t| !t.trim().is_empty())
                .map(DiscordBotNotifier::new),
        }
    }

    pub fn from_env() -> Self {
        Self::new(std::env::var("DISCORD_BOT_TOKEN").ok())
    }
}

#[async_trait::async_trait]
impl Notifier for NotifierMux {
    async fn send(&self, notification: &Notification) -> Result<()> {
        let sink = notification.sink();
        if let (Some(bot), Some(channel)) = (&self.bot, sink.channel_id.as_deref()) {
            if !channel.is_empty() {
                return bot.send(channel, notification).await;
            }
        }
        if let Some(webhook_url) = sink.webhook_url.as_deref() {
            return self.webhook.send(webhook_url, notification).await;
        }
        bail!("source has neither a webhook nor a bot channel configured");
    }
}

/// Retry-After from a throttled response, with a fallback.
pub(crate) fn retry_after_secs(response: &reqwest::Response, default_secs: f64) -> f64 {
    response
        .headers()
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<f64>().ok())
        .unwrap_or(default_secs)
}
