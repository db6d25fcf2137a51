//! # Catalog Payload Parsing
//! The upstream is loose about field shapes: `size` is a string or an
//! object, `status` a string, object or bare id, `price` a string or an
//! object, timestamps live in two places. Every one of those "which shape
//! did we get this time" decisions is confined to this module; the rest of
//! the pipeline only ever sees the fixed `Item` representation.

use serde_json::Value;

use crate::fetch::types::{Item, Price, SellerRef};
use crate::ratings::normalize_score;

/// Condition labels for the bare-id status shape.
const STATUS_MAP: &[(i64, &str)] = &[
    (1, "New with tags"),
    (2, "New without tags"),
    (3, "Very good"),
    (4, "Good"),
    (5, "Satisfactory"),
];

/// Parses the catalog response body. Unparseable entries are skipped, not
/// fatal — one malformed listing must not sink the whole page.
pub fn parse_items(body: &Value, host: &str, now_ts: i64) -> Vec<Item> {
    let Some(entries) = body.get("items").and_then(Value::as_array) else {
        return Vec::new();
    };
    entries
        .iter()
        .filter_map(|entry| parse_item(entry, host, now_ts))
        .collect()
}

fn parse_item(v: &Value, host: &str, now_ts: i64) -> Option<Item> {
    let external_id = match v.get("id") {
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::String(s)) if !s.is_empty() => s.clone(),
        _ => return None,
    };

    let title = str_or(v.get("title"), "Untitled");
    let brand = str_or(v.get("brand_title"), "—");
    let size = parse_size(v);
    let (status, _status_id) = parse_status(v);
    let price = parse_price(v.get("price"));

    let base = format!("https://{host}");
    let url = match v.get("url").and_then(Value::as_str) {
        Some(raw) if raw.starts_with("http") => raw.to_string(),
        Some(raw) => format!("{base}{raw}"),
        None => format!("{base}/items/{external_id}"),
    };

    let photos = parse_photos(v);
    let created_at_ts = parse_timestamp(v, now_ts);
    let hidden = v
        .get("is_hidden")
        .map(|h| h.as_bool().unwrap_or(h.as_i64().unwrap_or(0) != 0))
        .unwrap_or(false);

    Some(Item {
        external_id,
        title,
        brand,
        size,
        status,
        price,
        url,
        photos,
        created_at_ts,
        hidden,
        seller: parse_seller(v.get("user")),
    })
}

fn str_or(v: Option<&Value>, default: &str) -> String {
    v.and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .unwrap_or(default)
        .to_string()
}

fn parse_size(v: &Value) -> String {
    let raw = v.get("size_title").or_else(|| v.get("size"));
    match raw {
        Some(Value::String(s)) if !s.is_empty() => s.clone(),
        Some(Value::Object(o)) => o
            .get("title")
            .and_then(Value::as_str)
            .unwrap_or("—")
            .to_string(),
        _ => "—".to_string(),
    }
}

fn parse_status(v: &Value) -> (String, Option<i64>) {
    match v.get("status") {
        Some(Value::String(s)) if !s.is_empty() => (s.clone(), None),
        Some(Value::Object(o)) => {
            let id = o.get("id").and_then(Value::as_i64);
            let title = o
                .get("title")
                .and_then(Value::as_str)
                .map(str::to_string)
                .or_else(|| id.and_then(status_label))
                .unwrap_or_else(|| "—".to_string());
            (title, id)
        }
        _ => {
            let id = v.get("status_id").and_then(Value::as_i64);
            (
                id.and_then(status_label).unwrap_or_else(|| "—".to_string()),
                id,
            )
        }
    }
}

fn status_label(id: i64) -> Option<String> {
    STATUS_MAP
        .iter()
        .find(|(k, _)| *k == id)
        .map(|(_, label)| (*label).to_string())
}

fn parse_price(v: Option<&Value>) -> Price {
    match v {
        Some(Value::Object(o)) => Price {
            amount_minor: o.get("amount").map(decimal_minor).unwrap_or(0),
            currency: o
                .get("currency_code")
                .and_then(Value::as_str)
                .unwrap_or("PLN")
                .to_string(),
        },
        Some(other) => Price {
            amount_minor: decimal_minor(other),
            currency: "PLN".to_string(),
        },
        None => Price {
            amount_minor: 0,
            currency: "PLN".to_string(),
        },
    }
}

/// `"12.5"`, `12.5` or `12` → 1250 / 1200 minor units.
fn decimal_minor(v: &Value) -> i64 {
    let parsed = match v {
        Value::String(s) => s.trim().parse::<f64>().ok(),
        Value::Number(n) => n.as_f64(),
        _ => None,
    };
    parsed.map(|x| (x * 100.0).round() as i64).unwrap_or(0)
}

fn parse_photos(v: &Value) -> Vec<String> {
    let mut photos: Vec<String> = v
        .get("photos")
        .and_then(Value::as_array)
        .map(|arr| {
            arr.iter()
                .take(3)
                .filter_map(|p| {
                    p.get("url")
                        .or_else(|| p.get("full_size_url"))
                        .and_then(Value::as_str)
                        .map(str::to_string)
                })
                .collect()
        })
        .unwrap_or_default();
    if photos.is_empty() {
        if let Some(url) = v
            .get("photo")
            .and_then(|p| p.get("url"))
            .and_then(Value::as_str)
        {
            photos.push(url.to_string());
        }
    }
    photos.truncate(3);
    photos
}

/// `created_at_ts` when present, else the main photo's high-resolution
/// timestamp, else "now" (the listing just appeared in a newest-first feed).
fn parse_timestamp(v: &Value, now_ts: i64) -> i64 {
    if let Some(ts) = v.get("created_at_ts").and_then(Value::as_i64) {
        return ts;
    }
    if let Some(ts) = v
        .get("photo")
        .and_then(|p| p.get("high_resolution"))
        .and_then(|h| h.get("timestamp"))
        .and_then(Value::as_i64)
    {
        return ts;
    }
    now_ts
}

fn parse_seller(v: Option<&Value>) -> SellerRef {
    let Some(Value::Object(user)) = v else {
        return SellerRef::default();
    };
    let feedback_count = user
        .get("feedback_count")
        .or_else(|| user.get("positive_feedback_count"))
        .and_then(Value::as_u64)
        .unwrap_or(0) as u32;
    let raw_score = user
        .get("feedback_reputation")
        .or_else(|| user.get("reputation"))
        .or_else(|| user.get("feedback_score"))
        .and_then(Value::as_f64)
        .unwrap_or(0.0) as f32;
    SellerRef {
        id: user.get("id").and_then(Value::as_i64),
        login: user
            .get("login")
            .and_then(Value::as_str)
            .map(str::to_string),
        country: user
            .get("country_iso_code")
            .or_else(|| user.get("country_code"))
            .and_then(Value::as_str)
            .map(|c| c.to_uppercase()),
        feedback_count,
        feedback_score: normalize_score(raw_score),
    }
}
