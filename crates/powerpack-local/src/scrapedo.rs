use crate::pool::{with_retry_if, RetryPolicy};
use crate::{env_nonempty, map_reqwest_err, retry_after_ms};
use powerpack_core::{Error, Result, ScrapeBackend, ScrapeMode, ScrapePage};
use serde::Serialize;
use std::time::Duration;

const DEFAULT_ENDPOINT: &str = "https://api.scrape.do/";
const PREMIUM_GEO: &str = "us";

#[derive(Debug, Clone)]
pub struct ScrapeDoClient {
    client: reqwest::Client,
    token: String,
    endpoint: String,
}

impl ScrapeDoClient {
    pub fn new(client: reqwest::Client, token: impl Into<String>) -> Self {
        Self {
            client,
            token: token.into(),
            endpoint: DEFAULT_ENDPOINT.to_string(),
        }
    }

    pub fn from_env(client: reqwest::Client) -> Result<Self> {
        let token = env_nonempty("SCRAPEDO_API_KEY")
            .ok_or_else(|| Error::NotConfigured("missing SCRAPEDO_API_KEY".to_string()))?;
        let mut c = Self::new(client, token);
        if let Some(ep) = env_nonempty("POWERPACK_SCRAPEDO_ENDPOINT") {
            c.endpoint = ep;
        }
        Ok(c)
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    fn params(&self, url: &str, mode: ScrapeMode) -> Vec<(&'static str, String)> {
        let mut p = vec![("token", self.token.clone()), ("url", url.to_string())];
        match mode {
            ScrapeMode::Basic => {}
            ScrapeMode::Render => p.push(("render", "true".to_string())),
            ScrapeMode::Premium => {
                p.push(("super", "true".to_string()));
                p.push(("geoCode", PREMIUM_GEO.to_string()));
            }
        }
        p
    }
}

#[async_trait::async_trait]
impl ScrapeBackend for ScrapeDoClient {
    async fn scrape(&self, url: &str, mode: ScrapeMode, timeout: Duration) -> Result<ScrapePage> {
        tracing::debug!(target: "powerpack::scrapedo", url, mode = mode.as_str(), "scrape");
        let resp = self
            .client
            .get(&self.endpoint)
            .query(&self.params(url, mode))
            .timeout(timeout)
            .send()
            .await
            .map_err(map_reqwest_err)?;

        let status = resp.status().as_u16();
        match status {
            // Scrape.do's own account errors; target-site statuses pass through below.
            401 => {
                let body = resp.text().await.unwrap_or_default();
                if body.to_ascii_lowercase().contains("credit") {
                    return Err(Error::Quota("scrape.do: no credits left".to_string()));
                }
                return Err(Error::Auth("scrape.do rejected the token".to_string()));
            }
            429 => {
                let ra = retry_after_ms(resp.headers());
                return Err(Error::RateLimited {
                    message: "scrape.do concurrency limit reached".to_string(),
                    retry_after_ms: ra,
                });
            }
            _ => {}
        }
        let body = resp.text().await.map_err(map_reqwest_err)?;
        Ok(ScrapePage { status, body })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ScrapeAttempt {
    pub mode: ScrapeMode,
    pub outcome: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScrapeOutcome {
    pub url: String,
    pub mode: ScrapeMode,
    pub status: u16,
    #[serde(skip)]
    pub html: String,
    pub attempts: Vec<ScrapeAttempt>,
}

fn stops_ladder(e: &Error) -> bool {
    matches!(
        e,
        Error::Auth(_) | Error::Quota(_) | Error::NotConfigured(_) | Error::InvalidInput(_)
    )
}

fn is_rate_limit(e: &Error) -> bool {
    matches!(e, Error::RateLimited { .. })
}

/// Escalate basic -> render -> premium until a mode returns a usable page.
///
/// Account-level errors (bad token, no credits) stop immediately. A 404/410 from the target
/// also stops: no proxy mode makes a missing page appear. Within a mode only rate limits are
/// retried on the policy schedule; timeouts and network errors move on to the next mode.
pub async fn scrape_with_fallback<B>(
    backend: &B,
    url: &str,
    timeout: Duration,
    policy: &RetryPolicy,
) -> Result<ScrapeOutcome>
where
    B: ScrapeBackend + ?Sized,
{
    let mut attempts = Vec::new();
    let mut last_err: Option<Error> = None;

    for mode in ScrapeMode::LADDER {
        let res = with_retry_if(policy, "scrapedo", is_rate_limit, || {
            backend.scrape(url, mode, timeout)
        })
        .await;
        match res {
            Ok(page) if (200..300).contains(&page.status) && !page.body.trim().is_empty() => {
                attempts.push(ScrapeAttempt {
                    mode,
                    outcome: "ok".to_string(),
                });
                return Ok(ScrapeOutcome {
                    url: url.to_string(),
                    mode,
                    status: page.status,
                    html: page.body,
                    attempts,
                });
            }
            Ok(page) => {
                let outcome = if (200..300).contains(&page.status) {
                    "empty body".to_string()
                } else {
                    format!("HTTP {}", page.status)
                };
                attempts.push(ScrapeAttempt { mode, outcome });
                let err = if (200..300).contains(&page.status) {
                    Error::Parse(format!("empty body from {url}"))
                } else {
                    Error::Http {
                        status: page.status,
                        message: format!("target returned HTTP {} for {url}", page.status),
                    }
                };
                if matches!(page.status, 404 | 410) {
                    return Err(err);
                }
                tracing::warn!(
                    target: "powerpack::scrapedo",
                    url,
                    mode = mode.as_str(),
                    status = page.status,
                    "escalating scrape mode"
                );
                last_err = Some(err);
            }
            Err(e) if stops_ladder(&e) => return Err(e),
            Err(e) => {
                attempts.push(ScrapeAttempt {
                    mode,
                    outcome: e.to_string(),
                });
                tracing::warn!(
                    target: "powerpack::scrapedo",
                    url,
                    mode = mode.as_str(),
                    error = %e,
                    "escalating scrape mode"
                );
                last_err = Some(e);
            }
        }
    }
    Err(last_err.unwrap_or_else(|| Error::Network(format!("no scrape mode succeeded for {url}"))))
}
