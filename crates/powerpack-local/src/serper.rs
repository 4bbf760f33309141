use crate::pool::{bounded_map, with_retry, RetryPolicy};
use crate::{env_nonempty, map_reqwest_err, retry_after_ms};
use powerpack_core::{Error, Result, SearchHit, SearchProvider, SearchResponse};
use serde::Deserialize;
use std::time::Instant;

const DEFAULT_ENDPOINT: &str = "https://google.serper.dev/search";
const TIMEOUT_MS: u64 = 20_000;

fn serper_api_key_from_env() -> Option<String> {
    env_nonempty("SERPER_API_KEY")
}

#[derive(Debug, Clone)]
pub struct SerperClient {
    client: reqwest::Client,
    api_key: String,
    endpoint: String,
}

impl SerperClient {
    pub fn new(client: reqwest::Client, api_key: impl Into<String>) -> Self {
        Self {
            client,
            api_key: api_key.into(),
            endpoint: DEFAULT_ENDPOINT.to_string(),
        }
    }

    pub fn from_env(client: reqwest::Client) -> Result<Self> {
        let api_key = serper_api_key_from_env()
            .ok_or_else(|| Error::NotConfigured("missing SERPER_API_KEY".to_string()))?;
        let mut c = Self::new(client, api_key);
        if let Some(ep) = env_nonempty("POWERPACK_SERPER_ENDPOINT") {
            c.endpoint = ep;
        }
        Ok(c)
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }
}

#[async_trait::async_trait]
impl SearchProvider for SerperClient {
    fn name(&self) -> &'static str {
        "serper"
    }

    async fn search(&self, query: &str, num: usize) -> Result<SearchResponse> {
        let t0 = Instant::now();
        let num = num.clamp(1, 100);
        tracing::debug!(target: "powerpack::serper", query, num, "search");

        let resp = self
            .client
            .post(&self.endpoint)
            .timeout(std::time::Duration::from_millis(TIMEOUT_MS))
            .header("X-API-KEY", &self.api_key)
            .json(&serde_json::json!({ "q": query, "num": num }))
            .send()
            .await
            .map_err(map_reqwest_err)?;

        let status = resp.status();
        if !status.is_success() {
            let ra = retry_after_ms(resp.headers());
            let body = resp.text().await.unwrap_or_default();
            // Serper reports exhausted credit as a 400 with a message body.
            if status.as_u16() == 400 && body.to_ascii_lowercase().contains("credits") {
                return Err(Error::Quota(format!("serper: {}", body.trim())));
            }
            return Err(Error::from_status(
                status.as_u16(),
                format!("serper search HTTP {status}"),
                ra,
            ));
        }

        let parsed: SerperResponse = resp
            .json()
            .await
            .map_err(|e| Error::Parse(format!("serper: {e}")))?;
        Ok(parsed.into_response(query, t0.elapsed().as_millis()))
    }
}

/// Run every query through `provider` with bounded concurrency. One result per query, in
/// input order; individual failures do not abort the batch.
pub async fn search_many<P>(
    provider: &P,
    queries: &[String],
    num: usize,
    limit: usize,
    policy: &RetryPolicy,
) -> Vec<Result<SearchResponse>>
where
    P: SearchProvider + ?Sized,
{
    bounded_map(queries.iter(), limit, |q| async move {
        with_retry(policy, provider.name(), || provider.search(q, num)).await
    })
    .await
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct SerperResponse {
    #[serde(default)]
    organic: Vec<SerperOrganic>,
    #[serde(default)]
    related_searches: Vec<SerperRelated>,
}

#[derive(Debug, Deserialize)]
struct SerperOrganic {
    #[serde(default)]
    title: String,
    link: String,
    #[serde(default)]
    snippet: Option<String>,
    #[serde(default)]
    position: Option<usize>,
    #[serde(default)]
    date: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SerperRelated {
    query: String,
}

impl SerperResponse {
    fn into_response(self, query: &str, elapsed_ms: u128) -> SearchResponse {
        let hits = self
            .organic
            .into_iter()
            .enumerate()
            .filter(|(_, o)| !o.link.trim().is_empty())
            .map(|(i, o)| SearchHit {
                url: o.link,
                title: o.title,
                snippet: o.snippet.filter(|s| !s.trim().is_empty()),
                position: o.position.unwrap_or(i + 1),
                date: o.date,
            })
            .collect();
        SearchResponse {
            query: query.to_string(),
            hits,
            related: self.related_searches.into_iter().map(|r| r.query).collect(),
            elapsed_ms,
        }
    }
}
