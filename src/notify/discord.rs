//! Discord webhook sink plus the embed payload shared with the bot sink.

use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use reqwest::Client;
use serde::Serialize;

use super::{retry_after_secs, Notification};
use crate::fetch::types::Item;

#[derive(Debug, Serialize)]
pub(crate) struct EmbedAuthor {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

#[derive(Debug, Serialize)]
pub(crate) struct EmbedField {
    pub name: String,
    pub value: String,
    pub inline: bool,
}

#[derive(Debug, Serialize)]
pub(crate) struct EmbedImage {
    pub url: String,
}

#[derive(Debug, Serialize)]
pub(crate) struct EmbedFooter {
    pub text: String,
}

#[derive(Debug, Default, Serialize)]
pub(crate) struct DiscordEmbed {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<EmbedAuthor>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub color: u32,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<EmbedField>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<EmbedImage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub footer: Option<EmbedFooter>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

#[derive(Debug, Serialize)]
pub(crate) struct WebhookPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    pub embeds: Vec<DiscordEmbed>,
}

/// Seller score as star glyphs on a 5-star scale.
fn stars(score: f32) -> String {
    let score = score.clamp(0.0, 5.0);
    let full = score.floor() as usize;
    let half = usize::from(score - score.floor() >= 0.5);
    let empty = 5 - full - half;
    format!(
        "{}{}{}",
        "⭐".repeat(full),
        if half == 1 { "✨" } else { "" },
        "☆".repeat(empty)
    )
}

fn rating_line(item: &Item) -> String {
    if item.seller.feedback_count > 0 {
        format!("{} ({})", stars(item.seller.feedback_score), item.seller.feedback_count)
    } else {
        "☆☆☆☆☆ no ratings yet".to_string()
    }
}

fn iso_ts(ts: i64) -> Option<String> {
    chrono::DateTime::from_timestamp(ts, 0).map(|dt| dt.to_rfc3339())
}

/// Builds the embed list for an alert: one main embed plus up to two
/// gallery embeds for the remaining photos.
pub(crate) fn build_embeds(notification: &Notification) -> Vec<DiscordEmbed> {
    let item = notification.item();
    let color = notification.sink().embed_color;

    let mut fields = vec![
        EmbedField {
            name: "Added".into(),
            // Both Discord timestamp renderings: full date and live "ago".
            value: format!("<t:{0}:F>\n<t:{0}:R>", item.created_at_ts),
            inline: true,
        },
        EmbedField {
            name: "Size".into(),
            value: item.size.clone(),
            inline: true,
        },
        EmbedField {
            name: "Brand".into(),
            value: item.brand.clone(),
            inline: true,
        },
        EmbedField {
            name: "Condition".into(),
            value: item.status.clone(),
            inline: true,
        },
        EmbedField {
            name: "Rating".into(),
            value: rating_line(item),
            inline: true,
        },
    ];

    let description = match notification {
        Notification::NewListing { .. } => {
            fields.push(EmbedField {
                name: "Price".into(),
                value: format!("**{}**", item.price.display()),
                inline: true,
            });
            None
        }
        Notification::PriceDrop { event, .. } => {
            fields.push(EmbedField {
                name: "Price".into(),
                value: format!("**{}**", item.price.display()),
                inline: true,
            });
            Some(format!(
                "Price dropped: ~~{}.{:02}~~ → **{}** (−{}.{:02} {})",
                event.previous_minor / 100,
                (event.previous_minor % 100).abs(),
                item.price.display(),
                event.drop_minor / 100,
                (event.drop_minor % 100).abs(),
                item.price.currency,
            ))
        }
    };

    let seller_name = item
        .seller
        .login
        .clone()
        .map(|login| match &item.seller.country {
            Some(cc) if !cc.is_empty() => format!("{login} ({cc})"),
            _ => login,
        })
        .unwrap_or_else(|| "—".to_string());

    let mut main = DiscordEmbed {
        author: Some(EmbedAuthor {
            name: seller_name,
            url: Some(item.url.clone()),
        }),
        title: Some(item.title.clone()),
        description,
        url: Some(item.url.clone()),
        color,
        fields,
        image: item.photos.first().map(|p| EmbedImage { url: p.clone() }),
        footer: None,
        timestamp: iso_ts(item.created_at_ts),
    };
    if item.hidden {
        main.footer = Some(EmbedFooter {
            text: "⚠️ This listing is hidden upstream and cannot be bought.".into(),
        });
    }

    let mut embeds = vec![main];
    for photo in item.photos.iter().skip(1).take(2) {
        embeds.push(DiscordEmbed {
            url: Some(item.url.clone()),
            color,
            image: Some(EmbedImage { url: photo.clone() }),
            ..Default::default()
        });
    }
    embeds
}

#[derive(Clone)]
pub struct DiscordWebhookNotifier {
    client: Client,
    timeout: Duration,
    max_retries: u8,
}

impl Default for DiscordWebhookNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl DiscordWebhookNotifier {
    pub fn new() -> Self {
        Self {
            client: Client::new(),
            timeout: Duration::from_secs(10),
            max_retries: 3,
        }
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout = Duration::from_secs(secs);
        self
    }

    pub async fn send(&self, webhook_url: &str, notification: &Notification) -> Result<()> {
        let payload = WebhookPayload {
            content: None,
            embeds: build_embeds(notification),
        };

        let mut attempt: u8 = 0;
        loop {
            attempt += 1;
            let result = self
                .client
                .post(webhook_url)
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
                    if status.as_u16() == 429 {
                        let wait = retry_after_secs(&response, 5.0) + 1.0;
                        tracing::warn!(wait_secs = wait, "webhook rate limited");
                        tokio::time::sleep(Duration::from_secs_f64(wait)).await;
                    } else if matches!(status.as_u16(), 400 | 401 | 403 | 404) {
                        bail!("webhook rejected with {status}");
                    } else if attempt < self.max_retries {
                        tokio::time::sleep(Duration::from_millis(500u64 << (attempt - 1))).await;
                    } else {
                        return Err(anyhow!("webhook returned {status} after {attempt} attempts"));
                    }
                }
                Err(e) => {
                    if attempt >= self.max_retries {
                        return Err(anyhow!("webhook request failed: {e}"));
                    }
                    tokio::time::sleep(Duration::from_millis(500u64 << (attempt - 1))).await;
                }
            }

            if attempt >= self.max_retries {
                return Err(anyhow!("webhook retries exhausted"));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::PriceDropEvent;
    use crate::fetch::types::{Price, SellerRef};
    use crate::store::Sink;

    fn item() -> Item {
        Item {
            external_id: "11".into(),
            title: "Wool coat".into(),
            brand: "Acme".into(),
            size: "M".into(),
            status: "Good".into(),
            price: Price {
                amount_minor: 4550,
                currency: "EUR".into(),
            },
            url: "https://www.example.de/items/11".into(),
            photos: vec![
                "https://img/1.jpg".into(),
                "https://img/2.jpg".into(),
                "https://img/3.jpg".into(),
            ],
            created_at_ts: 1700000000,
            hidden: true,
            seller: SellerRef {
                id: Some(9),
                login: Some("anna".into()),
                country: Some("DE".into()),
                feedback_count: 12,
                feedback_score: 4.6,
            },
        }
    }

    #[test]
    fn star_rendering_handles_halves() {
        assert_eq!(stars(5.0), "⭐⭐⭐⭐⭐");
        assert_eq!(stars(4.5), "⭐⭐⭐⭐✨");
        assert_eq!(stars(0.0), "☆☆☆☆☆");
    }

    #[test]
    fn new_listing_embed_carries_photos_and_hidden_footer() {
        let n = Notification::NewListing {
            item: item(),
            source_name: "coats".into(),
            sink: Sink {
                webhook_url: Some("https://discord.example/hook".into()),
                channel_id: None,
                embed_color: 0x57F287,
            },
        };
        let embeds = build_embeds(&n);
        assert_eq!(embeds.len(), 3);
        assert!(embeds[0].footer.is_some());
        assert_eq!(embeds[0].title.as_deref(), Some("Wool coat"));
        assert!(embeds[0].image.is_some());
        let price_field = embeds[0].fields.iter().find(|f| f.name == "Price").unwrap();
        assert_eq!(price_field.value, "**45.50 EUR**");
    }

    #[test]
    fn price_drop_embed_describes_the_drop() {
        let n = Notification::PriceDrop {
            item: item(),
            event: PriceDropEvent {
                fingerprint: "fp".into(),
                previous_minor: 6550,
                current_minor: 4550,
                drop_minor: 2000,
                drops_so_far: 1,
            },
            source_name: "coats".into(),
            sink: Sink::default(),
        };
        let embeds = build_embeds(&n);
        let desc = embeds[0].description.as_deref().unwrap();
        assert!(desc.contains("65.50"));
        assert!(desc.contains("45.50 EUR"));
        assert!(desc.contains("20.00"));
    }
}
