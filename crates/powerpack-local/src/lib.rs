//! reqwest-backed vendor clients for `research-powerpack`.

use powerpack_core::Error;
use serde::Serialize;

pub mod attachments;
pub mod markdown;
pub mod openrouter;
pub mod pool;
pub mod reddit;
pub mod scrapedo;
pub mod serper;

/// Read an env var, treating blank values as unset.
pub fn env_nonempty(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

pub fn has_env(key: &str) -> bool {
    env_nonempty(key).is_some()
}

pub(crate) fn map_reqwest_err(e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::Timeout(e.to_string())
    } else if e.is_decode() {
        Error::Parse(e.to_string())
    } else {
        Error::Network(e.to_string())
    }
}

/// `Retry-After` in delta-seconds form. HTTP-date values are ignored.
pub(crate) fn retry_after_ms(headers: &reqwest::header::HeaderMap) -> Option<u64> {
    let secs: f64 = headers
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse()
        .ok()?;
    (secs >= 0.0).then(|| (secs * 1000.0) as u64)
}

pub fn http_client() -> Result<reqwest::Client, Error> {
    reqwest::Client::builder()
        .user_agent(concat!("research-powerpack/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| Error::Network(e.to_string()))
}

/// Which tool families are usable with the current environment. Booleans only.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct Capabilities {
    pub search: bool,
    pub reddit: bool,
    pub scraping: bool,
    pub llm: bool,
}

impl Capabilities {
    pub fn from_env() -> Self {
        Self {
            search: has_env("SERPER_API_KEY"),
            reddit: has_env("REDDIT_CLIENT_ID") && has_env("REDDIT_CLIENT_SECRET"),
            scraping: has_env("SCRAPEDO_API_KEY"),
            llm: has_env("OPENROUTER_API_KEY"),
        }
    }

    /// Env var names that are unset, in a stable order.
    pub fn missing_env() -> Vec<&'static str> {
        [
            "SERPER_API_KEY",
            "REDDIT_CLIENT_ID",
            "REDDIT_CLIENT_SECRET",
            "SCRAPEDO_API_KEY",
            "OPENROUTER_API_KEY",
        ]
        .into_iter()
        .filter(|k| !has_env(k))
        .collect()
    }

    pub fn enabled_tools(&self) -> Vec<&'static str> {
        let mut v = Vec::new();
        if self.search {
            v.push("web_search");
            v.push("search_reddit");
        }
        if self.reddit {
            v.push("get_reddit_post");
        }
        if self.scraping {
            v.push("scrape_links");
        }
        if self.llm {
            v.push("deep_research");
        }
        v
    }
}

/// Load `KEY=VALUE` lines from `POWERPACK_ENV_FILE` without overriding the process env.
///
/// Returns the number of variables set. Values are never logged.
pub fn load_env_file_from_env() -> usize {
    let Some(p) = env_nonempty("POWERPACK_ENV_FILE") else {
        return 0;
    };
    let Ok(txt) = std::fs::read_to_string(&p) else {
        tracing::warn!(
            target: "powerpack::config",
            path = %p,
            "POWERPACK_ENV_FILE is not readable"
        );
        return 0;
    };
    apply_env_lines(&txt)
}

fn apply_env_lines(txt: &str) -> usize {
    let mut n = 0;
    for raw in txt.lines() {
        let s = raw.trim();
        if s.is_empty() || s.starts_with('#') {
            continue;
        }
        let s = s.strip_prefix("export ").unwrap_or(s);
        let Some((k, v)) = s.split_once('=') else {
            continue;
        };
        let k = k.trim();
        let v = v.trim().trim_matches('"').trim_matches('\'');
        if k.is_empty() {
            continue;
        }
        if std::env::var_os(k).is_none() {
            std::env::set_var(k, v);
            n += 1;
        }
    }
    n
}
