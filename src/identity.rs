//! # Identity Pool
//! Randomized outbound browser identities: user agent, language, referer
//! and the engine-specific header set. Pure selection, no state.
//!
//! Firefox and Safari profiles deliberately omit the `Sec-Fetch-*` /
//! `Sec-Ch-Ua*` client hints; Chromium profiles carry them with a version
//! matching the user agent.

use rand::seq::IndexedRandom;
use rand::Rng;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Engine {
    Chromium,
    Gecko,
    WebKit,
}

/// One materialized browser identity for a single session lifetime.
#[derive(Debug, Clone)]
pub struct Identity {
    pub user_agent: &'static str,
    pub engine: Engine,
    pub accept_language: &'static str,
    pub referer: String,
}

const USER_AGENTS: &[(&str, Engine)] = &[
    // Chrome / Windows
    ("Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/133.0.0.0 Safari/537.36", Engine::Chromium),
    ("Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/132.0.0.0 Safari/537.36", Engine::Chromium),
    // Chrome / macOS
    ("Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/133.0.0.0 Safari/537.36", Engine::Chromium),
    ("Mozilla/5.0 (Macintosh; Intel Mac OS X 14_7_3) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/132.0.0.0 Safari/537.36", Engine::Chromium),
    // Firefox / Windows
    ("Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:135.0) Gecko/20100101 Firefox/135.0", Engine::Gecko),
    ("Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:134.0) Gecko/20100101 Firefox/134.0", Engine::Gecko),
    // Firefox / macOS
    ("Mozilla/5.0 (Macintosh; Intel Mac OS X 14.7; rv:135.0) Gecko/20100101 Firefox/135.0", Engine::Gecko),
    // Edge / Windows
    ("Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/133.0.0.0 Safari/537.36 Edg/133.0.0.0", Engine::Chromium),
    // Safari / macOS
    ("Mozilla/5.0 (Macintosh; Intel Mac OS X 14_7_3) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/18.3 Safari/605.1.15", Engine::WebKit),
    // Chrome / Linux
    ("Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/133.0.0.0 Safari/537.36", Engine::Chromium),
    ("Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/132.0.0.0 Safari/537.36", Engine::Chromium),
    // Firefox / Linux
    ("Mozilla/5.0 (X11; Ubuntu; Linux x86_64; rv:135.0) Gecko/20100101 Firefox/135.0", Engine::Gecko),
];

const ACCEPT_LANGUAGES: &[&str] = &[
    "pl-PL,pl;q=0.9,en-US;q=0.8,en;q=0.7",
    "pl,en-US;q=0.9,en;q=0.8",
    "pl-PL,pl;q=0.9,en;q=0.8",
    "pl;q=0.9,en-US;q=0.8,en;q=0.7,de;q=0.6",
    "en-US,en;q=0.9,pl;q=0.8",
];

const REFERER_PATHS: &[&str] = &[
    "/catalog",
    "/",
    "/catalog?order=newest_first",
    "/catalog?order=relevance",
    "/men",
    "/women",
];

/// Picks a plausible referer URL for `host`.
pub fn random_referer(host: &str) -> String {
    let path = REFERER_PATHS
        .choose(&mut rand::rng())
        .copied()
        .unwrap_or("/");
    format!("https://{host}{path}")
}

impl Identity {
    /// Chrome major version parsed out of the user agent, for client hints.
    fn chromium_major(&self) -> &'static str {
        for part in self.user_agent.split_whitespace() {
            if let Some(rest) = part.strip_prefix("Chrome/") {
                return rest.split('.').next().unwrap_or("133");
            }
        }
        "133"
    }

    /// Full default-header set for a session bound to this identity.
    pub fn header_map(&self, host: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        let mut put = |name: &'static str, value: String| {
            if let Ok(v) = HeaderValue::from_str(&value) {
                headers.insert(HeaderName::from_static(name), v);
            }
        };

        put("user-agent", self.user_agent.to_string());
        put("accept", "application/json, text/plain, */*".to_string());
        put("accept-language", self.accept_language.to_string());
        put("referer", self.referer.clone());
        put("origin", format!("https://{host}"));

        if self.engine == Engine::Chromium {
            let major = self.chromium_major();
            put("sec-fetch-dest", "empty".to_string());
            put("sec-fetch-mode", "cors".to_string());
            put("sec-fetch-site", "same-origin".to_string());
            put(
                "sec-ch-ua",
                format!(
                    "\"Not(A:Brand\";v=\"99\", \"Google Chrome\";v=\"{major}\", \"Chromium\";v=\"{major}\""
                ),
            );
            put("sec-ch-ua-mobile", "?0".to_string());
            let platform = ["\"Windows\"", "\"macOS\"", "\"Linux\""]
                .choose(&mut rand::rng())
                .copied()
                .unwrap_or("\"Windows\"");
            put("sec-ch-ua-platform", platform.to_string());
        }

        headers
    }
}

/// Strategy seam so the selection policy can be swapped without touching
/// fetch or dedup logic.
pub trait ChooseIdentity: Send + Sync {
    fn next_identity(&self, host: &str) -> Identity;
}

/// Uniformly random selection over the fixed pool.
#[derive(Debug, Default)]
pub struct IdentityPool;

impl IdentityPool {
    pub fn new() -> Self {
        Self
    }
}

impl ChooseIdentity for IdentityPool {
    fn next_identity(&self, host: &str) -> Identity {
        let mut rng = rand::rng();
        let idx = rng.random_range(0..USER_AGENTS.len());
        let (user_agent, engine) = USER_AGENTS[idx];
        let accept_language = ACCEPT_LANGUAGES
            .choose(&mut rng)
            .copied()
            .unwrap_or(ACCEPT_LANGUAGES[0]);
        Identity {
            user_agent,
            engine,
            accept_language,
            referer: random_referer(host),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chromium_identities_carry_client_hints() {
        let id = Identity {
            user_agent: USER_AGENTS[0].0,
            engine: Engine::Chromium,
            accept_language: ACCEPT_LANGUAGES[0],
            referer: random_referer("www.example.pl"),
        };
        let h = id.header_map("www.example.pl");
        assert!(h.contains_key("sec-ch-ua"));
        assert!(h.contains_key("sec-fetch-mode"));
        let ua = h.get("user-agent").unwrap().to_str().unwrap();
        let major = ua.split("Chrome/").nth(1).unwrap().split('.').next().unwrap();
        assert!(h.get("sec-ch-ua").unwrap().to_str().unwrap().contains(major));
    }

    #[test]
    fn gecko_identities_omit_client_hints() {
        let id = Identity {
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:135.0) Gecko/20100101 Firefox/135.0",
            engine: Engine::Gecko,
            accept_language: ACCEPT_LANGUAGES[0],
            referer: random_referer("www.example.pl"),
        };
        let h = id.header_map("www.example.pl");
        assert!(!h.contains_key("sec-ch-ua"));
        assert!(!h.contains_key("sec-fetch-mode"));
        assert!(h.contains_key("referer"));
    }

    #[test]
    fn pool_yields_identities_for_any_host() {
        let pool = IdentityPool::new();
        for _ in 0..50 {
            let id = pool.next_identity("www.example.de");
            assert!(!id.user_agent.is_empty());
            assert!(id.referer.starts_with("https://www.example.de/"));
        }
    }
}
