//! Discord bot-API sink: authenticated POST to a channel. Unlike the
//! webhook it can attach link buttons (buy / offer / seller).

use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use reqwest::Client;
use serde::Serialize;
use serde_json::json;

use super::discord::build_embeds;
use super::{retry_after_secs, Notification};

const DISCORD_API: &str = "https://discord.com/api/v10";

#[derive(Debug, Serialize)]
struct BotMessage {
    embeds: Vec<super::discord::DiscordEmbed>,
    components: Vec<serde_json::Value>,
}

pub struct DiscordBotNotifier {
    token: String,
    client: Client,
    timeout: Duration,
    max_retries: u8,
}

impl DiscordBotNotifier {
    pub fn new(token: String) -> Self {
        Self {
            token,
            client: Client::new(),
            timeout: Duration::from_secs(15),
            max_retries: 3,
        }
    }

    pub async fn send(&self, channel_id: &str, notification: &Notification) -> Result<()> {
        let item = notification.item();
        let components = vec![json!({
            "type": 1,
            "components": [
                {"type": 2, "style": 5, "label": "Open listing", "url": item.url},
                {"type": 2, "style": 5, "label": "Seller", "url": item.url},
            ],
        })];
        let payload = BotMessage {
            embeds: build_embeds(notification),
            components,
        };

        let url = format!("{DISCORD_API}/channels/{channel_id}/messages");
        let mut attempt: u8 = 0;
        loop {
            attempt += 1;
            let result = self
                .client
                .post(&url)
                .header("authorization", format!("Bot {}", self.token))
                .timeout(self.timeout)
                .json(&payload)
                .send()
                .await;

            match result {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return Ok(());
                    }
                    match status.as_u16() {
                        429 => {
                            let wait = retry_after_secs(&response, 5.0) + 0.5;
                            tracing::warn!(wait_secs = wait, "bot api rate limited");
                            tokio::time::sleep(Duration::from_secs_f64(wait)).await;
                        }
                        401 => bail!("bot token rejected"),
                        403 => bail!("bot lacks permission for channel {channel_id}"),
                        404 => bail!("channel {channel_id} does not exist"),
                        _ => {
                            if attempt >= self.max_retries {
                                return Err(anyhow!(
                                    "bot api returned {status} after {attempt} attempts"
                                ));
                            }
                            tokio::time::sleep(Duration::from_secs(1 << attempt)).await;
                        }
                    }
                }
                Err(e) => {
                    if attempt >= self.max_retries {
                        return Err(anyhow!("bot api request failed: {e}"));
                    }
                    tokio::time::sleep(Duration::from_secs(1 << attempt)).await;
                }
            }

            if attempt >= self.max_retries {
                return Err(anyhow!("bot api retries exhausted"));
            }
        }
    }
}
