//! # Query URL → API Parameters
//! Sources store search URLs copied out of the marketplace UI. The API
//! wants a different parameter shape, so this module maps UI filter keys
//! to API filter keys, strips pagination and session-replay noise, forces
//! deterministic newest-first ordering and asks for hidden listings too.
//! All of that lives here so the rest of the fetch path only sees a clean
//! `ApiRequest`.

use anyhow::{Context, Result};
use url::Url;

/// UI filter key → API filter key. Unknown keys pass through unchanged.
const PARAM_MAP: &[(&str, &str)] = &[
    ("catalog[]", "catalog_ids[]"),
    ("status[]", "status_ids[]"),
    ("size_ids[]", "size_ids[]"),
    ("brand_ids[]", "brand_ids[]"),
    ("color_ids[]", "color_ids[]"),
    ("material_ids[]", "material_ids[]"),
    ("country_ids[]", "country_ids[]"),
    ("city_ids[]", "city_ids[]"),
    ("disposal[]", "disposal[]"),
    ("price_from", "price_from"),
    ("price_to", "price_to"),
    ("currency", "currency"),
    ("search_text", "search_text"),
];

/// Dropped outright: pagination, session replay, tracking.
const SKIP_PARAMS: &[&str] = &[
    "time",
    "search_id",
    "page",
    "disabled_personalization",
    "ref",
    "utm_source",
    "utm_medium",
    "utm_campaign",
];

#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub host: String,
    pub endpoint: String,
    pub params: Vec<(String, String)>,
}

/// Builds the catalog API request for a stored UI search URL.
pub fn build_api_request(query_url: &str, per_page: u32) -> Result<ApiRequest> {
    let url = Url::parse(query_url).with_context(|| format!("parsing source url {query_url}"))?;
    let host = url
        .host_str()
        .with_context(|| format!("source url {query_url} has no host"))?
        .to_string();

    let mut params: Vec<(String, String)> = Vec::new();

    // Brand page shorthand: /brand/<id>-<slug> carries the filter in the
    // path instead of the query string.
    let segments: Vec<&str> = url
        .path_segments()
        .map(|s| s.filter(|p| !p.is_empty()).collect())
        .unwrap_or_default();
    if segments.len() >= 2 && segments[0] == "brand" {
        if let Some(brand_id) = segments[1].split('-').next() {
            if !brand_id.is_empty() {
                params.push(("brand_ids[]".to_string(), brand_id.to_string()));
            }
        }
    }

    for (key, value) in url.query_pairs() {
        if value.is_empty() || SKIP_PARAMS.contains(&key.as_ref()) || key == "order" {
            continue;
        }
        let mapped = PARAM_MAP
            .iter()
            .find(|(ui, _)| *ui == key.as_ref())
            .map(|(_, api)| *api)
            .unwrap_or(key.as_ref());
        params.push((mapped.to_string(), value.into_owned()));
    }

    params.push(("per_page".to_string(), per_page.to_string()));
    params.push(("order".to_string(), "newest_first".to_string()));
    params.push(("with_disabled_items".to_string(), "1".to_string()));

    Ok(ApiRequest {
        endpoint: format!("https://{host}/api/v2/catalog/items"),
        host,
        params,
    })
}

/// Rate-limit / session key for a host: the registrable tail is enough to
/// group one marketplace country site together.
pub fn domain_key(host: &str) -> String {
    host.rsplit('.').next().unwrap_or(host).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn param<'a>(req: &'a ApiRequest, key: &str) -> Vec<&'a str> {
        req.params
            .iter()
            .filter(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
            .collect()
    }

    #[test]
    fn maps_ui_filters_and_strips_noise() {
        let req = build_api_request(
            "https://www.example.pl/catalog?catalog[]=79&status[]=2&search_text=hoodie&page=3&time=1712&search_id=abc&utm_source=share",
            20,
        )
        .unwrap();
        assert_eq!(req.endpoint, "https://www.example.pl/api/v2/catalog/items");
        assert_eq!(param(&req, "catalog_ids[]"), vec!["79"]);
        assert_eq!(param(&req, "status_ids[]"), vec!["2"]);
        assert_eq!(param(&req, "search_text"), vec!["hoodie"]);
        assert!(param(&req, "page").is_empty());
        assert!(param(&req, "time").is_empty());
        assert!(param(&req, "search_id").is_empty());
        assert!(param(&req, "utm_source").is_empty());
    }

    #[test]
    fn forces_newest_first_and_hidden_items() {
        let req =
            build_api_request("https://www.example.de/catalog?order=relevance&search_text=cap", 20)
                .unwrap();
        assert_eq!(param(&req, "order"), vec!["newest_first"]);
        assert_eq!(param(&req, "with_disabled_items"), vec!["1"]);
        assert_eq!(param(&req, "per_page"), vec!["20"]);
    }

    #[test]
    fn brand_path_shorthand_becomes_filter() {
        let req = build_api_request("https://www.example.pl/brand/53-nike", 10).unwrap();
        assert_eq!(param(&req, "brand_ids[]"), vec!["53"]);
    }

    #[test]
    fn rejects_urls_without_host() {
        assert!(build_api_request("not a url", 10).is_err());
    }

    #[test]
    fn domain_key_groups_by_tld() {
        assert_eq!(domain_key("www.example.pl"), "pl");
        assert_eq!(domain_key("www.example.de"), "de");
        assert_eq!(domain_key("localhost"), "localhost");
    }
}
