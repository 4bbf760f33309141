//! Reddit: OAuth (client credentials) post + comment fetching, and helpers for
//! Reddit-scoped web search.

use crate::{env_nonempty, map_reqwest_err, retry_after_ms};
use powerpack_core::{CommentSort, Error, PostRef, RedditBackend, RedditComment, RedditPost, Result};
use serde::Deserialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

const DEFAULT_AUTH_ENDPOINT: &str = "https://www.reddit.com/api/v1/access_token";
const DEFAULT_API_BASE: &str = "https://oauth.reddit.com";
const USER_AGENT: &str = concat!("research-powerpack/", env!("CARGO_PKG_VERSION"));
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(60);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_DEPTH: usize = 10;

/// Parse a Reddit thread URL (`reddit.com/r/<sub>/comments/<id>/...`, `redd.it/<id>`).
pub fn parse_post_url(raw: &str) -> Result<PostRef> {
    let u = url::Url::parse(raw.trim())
        .map_err(|e| Error::InvalidInput(format!("not a URL: {raw} ({e})")))?;
    let host = u.host_str().unwrap_or("").to_ascii_lowercase();
    let segs: Vec<&str> = u
        .path_segments()
        .map(|s| s.filter(|p| !p.is_empty()).collect())
        .unwrap_or_default();

    if host == "redd.it" {
        if let Some(id) = segs.first() {
            return Ok(PostRef {
                subreddit: String::new(),
                id: id.to_string(),
            });
        }
    }
    if host == "reddit.com" || host.ends_with(".reddit.com") {
        match segs.as_slice() {
            ["r", sub, "comments", id, ..] => {
                return Ok(PostRef {
                    subreddit: sub.to_string(),
                    id: id.to_string(),
                })
            }
            ["comments", id, ..] => {
                return Ok(PostRef {
                    subreddit: String::new(),
                    id: id.to_string(),
                })
            }
            _ => {}
        }
    }
    Err(Error::InvalidInput(format!(
        "not a Reddit post URL: {raw} (expected reddit.com/r/<sub>/comments/<id>/...)"
    )))
}

pub fn is_reddit_thread(url: &str) -> bool {
    parse_post_url(url).is_ok_and(|p| !p.subreddit.is_empty())
}

pub fn subreddit_of(url: &str) -> Option<String> {
    parse_post_url(url)
        .ok()
        .map(|p| p.subreddit)
        .filter(|s| !s.is_empty())
}

/// Scope a web query to Reddit threads, optionally only after a date (`YYYY-MM-DD`).
pub fn reddit_search_query(query: &str, date_after: Option<&str>) -> String {
    let mut q = query.trim().to_string();
    if !q.to_ascii_lowercase().contains("site:") {
        q.push_str(" site:reddit.com");
    }
    if let Some(d) = date_after.map(str::trim).filter(|d| !d.is_empty()) {
        q.push_str(&format!(" after:{d}"));
    }
    q
}

#[derive(Debug, Clone)]
struct CachedToken {
    value: String,
    expires_at: Instant,
}

#[derive(Debug, Clone)]
pub struct RedditClient {
    client: reqwest::Client,
    client_id: String,
    client_secret: String,
    auth_endpoint: String,
    api_base: String,
    token: Arc<Mutex<Option<CachedToken>>>,
}

impl RedditClient {
    pub fn new(
        client: reqwest::Client,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
    ) -> Self {
        Self {
            client,
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            auth_endpoint: DEFAULT_AUTH_ENDPOINT.to_string(),
            api_base: DEFAULT_API_BASE.to_string(),
            token: Arc::new(Mutex::new(None)),
        }
    }

    pub fn from_env(client: reqwest::Client) -> Result<Self> {
        let id = env_nonempty("REDDIT_CLIENT_ID");
        let secret = env_nonempty("REDDIT_CLIENT_SECRET");
        let (Some(id), Some(secret)) = (id, secret) else {
            return Err(Error::NotConfigured(
                "missing REDDIT_CLIENT_ID / REDDIT_CLIENT_SECRET".to_string(),
            ));
        };
        let mut c = Self::new(client, id, secret);
        if let Some(ep) = env_nonempty("POWERPACK_REDDIT_AUTH_ENDPOINT") {
            c.auth_endpoint = ep;
        }
        if let Some(base) = env_nonempty("POWERPACK_REDDIT_API_BASE") {
            c.api_base = base;
        }
        Ok(c)
    }

    pub fn with_endpoints(
        mut self,
        auth_endpoint: impl Into<String>,
        api_base: impl Into<String>,
    ) -> Self {
        self.auth_endpoint = auth_endpoint.into();
        self.api_base = api_base.into();
        self
    }

    async fn access_token(&self) -> Result<String> {
        let mut guard = self.token.lock().await;
        if let Some(t) = guard.as_ref() {
            if t.expires_at > Instant::now() + TOKEN_REFRESH_MARGIN {
                return Ok(t.value.clone());
            }
        }

        tracing::debug!(target: "powerpack::reddit", "refreshing oauth token");
        let resp = self
            .client
            .post(&self.auth_endpoint)
            .timeout(REQUEST_TIMEOUT)
            .header(reqwest::header::USER_AGENT, USER_AGENT)
            .basic_auth(&self.client_id, Some(&self.client_secret))
            .form(&[("grant_type", "client_credentials")])
            .send()
            .await
            .map_err(map_reqwest_err)?;
        let status = resp.status();
        if !status.is_success() {
            let ra = retry_after_ms(resp.headers());
            return Err(Error::from_status(
                status.as_u16(),
                format!("reddit token HTTP {status}"),
                ra,
            ));
        }
        let tok: TokenResponse = resp
            .json()
            .await
            .map_err(|e| Error::Parse(format!("reddit token: {e}")))?;
        if tok.access_token.is_empty() {
            return Err(Error::Auth("reddit returned an empty access token".to_string()));
        }
        let value = tok.access_token.clone();
        *guard = Some(CachedToken {
            value: tok.access_token,
            expires_at: Instant::now() + Duration::from_secs(tok.expires_in.unwrap_or(3600)),
        });
        Ok(value)
    }

    async fn invalidate_token(&self) {
        *self.token.lock().await = None;
    }

    fn comments_url(&self, post: &PostRef) -> String {
        let base = self.api_base.trim_end_matches('/');
        if post.subreddit.is_empty() {
            format!("{base}/comments/{}", post.id)
        } else {
            format!("{base}/r/{}/comments/{}", post.subreddit, post.id)
        }
    }

    async fn get_thread(
        &self,
        post: &PostRef,
        sort: CommentSort,
        max_comments: usize,
        token: &str,
    ) -> Result<reqwest::Response> {
        let limit = max_comments.clamp(1, 500).to_string();
        let depth = MAX_DEPTH.to_string();
        self.client
            .get(self.comments_url(post))
            .timeout(REQUEST_TIMEOUT)
            .header(reqwest::header::USER_AGENT, USER_AGENT)
            .bearer_auth(token)
            .query(&[
                ("limit", limit.as_str()),
                ("depth", depth.as_str()),
                ("sort", sort.as_str()),
                ("raw_json", "1"),
            ])
            .send()
            .await
            .map_err(map_reqwest_err)
    }
}

#[async_trait::async_trait]
impl RedditBackend for RedditClient {
    async fn fetch_post(
        &self,
        post: &PostRef,
        sort: CommentSort,
        max_comments: usize,
    ) -> Result<RedditPost> {
        tracing::debug!(
            target: "powerpack::reddit",
            id = %post.id,
            subreddit = %post.subreddit,
            "fetch post"
        );
        let token = self.access_token().await?;
        let mut resp = self.get_thread(post, sort, max_comments, &token).await?;

        // A revoked/expired token gets one refresh.
        if resp.status().as_u16() == 401 {
            self.invalidate_token().await;
            let token = self.access_token().await?;
            resp = self.get_thread(post, sort, max_comments, &token).await?;
        }

        let status = resp.status();
        if !status.is_success() {
            let ra = retry_after_ms(resp.headers()).or_else(|| ratelimit_reset_ms(resp.headers()));
            return Err(match status.as_u16() {
                404 => Error::Http {
                    status: 404,
                    message: format!("reddit post {} not found", post.id),
                },
                s => Error::from_status(s, format!("reddit comments HTTP {status}"), ra),
            });
        }
        let v: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| Error::Parse(format!("reddit thread: {e}")))?;
        parse_thread(&v, max_comments)
    }
}

fn ratelimit_reset_ms(headers: &reqwest::header::HeaderMap) -> Option<u64> {
    let secs: f64 = headers.get("x-ratelimit-reset")?.to_str().ok()?.trim().parse().ok()?;
    Some((secs * 1000.0) as u64)
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct PostData {
    #[serde(default)]
    id: String,
    #[serde(default)]
    subreddit: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    author: String,
    #[serde(default)]
    selftext: String,
    #[serde(default)]
    url: String,
    #[serde(default)]
    permalink: String,
    #[serde(default)]
    score: i64,
    #[serde(default)]
    upvote_ratio: Option<f64>,
    #[serde(default)]
    num_comments: u64,
    #[serde(default)]
    created_utc: Option<f64>,
}

fn listing_children(v: &serde_json::Value) -> &[serde_json::Value] {
    v.get("data")
        .and_then(|d| d.get("children"))
        .and_then(|c| c.as_array())
        .map(|a| a.as_slice())
        .unwrap_or(&[])
}

fn is_removed(body: &str) -> bool {
    matches!(body.trim(), "" | "[deleted]" | "[removed]")
}

fn walk_comments(
    children: &[serde_json::Value],
    depth: usize,
    op: &str,
    max: usize,
    out: &mut Vec<RedditComment>,
) {
    for child in children {
        if out.len() >= max {
            return;
        }
        if child.get("kind").and_then(|k| k.as_str()) != Some("t1") {
            continue;
        }
        let Some(d) = child.get("data") else {
            continue;
        };
        let body = d.get("body").and_then(|b| b.as_str()).unwrap_or("");
        let author = d
            .get("author")
            .and_then(|a| a.as_str())
            .unwrap_or("[deleted]")
            .to_string();
        if !is_removed(body) {
            out.push(RedditComment {
                is_op: !op.is_empty() && author == op,
                author,
                body: body.trim().to_string(),
                score: d.get("score").and_then(|s| s.as_i64()).unwrap_or(0),
                depth,
            });
        }
        // `replies` is "" when empty, otherwise a listing.
        if let Some(replies) = d.get("replies").filter(|r| r.is_object()) {
            walk_comments(listing_children(replies), depth + 1, op, max, out);
        }
    }
}

fn parse_thread(v: &serde_json::Value, max_comments: usize) -> Result<RedditPost> {
    let parts = v
        .as_array()
        .filter(|a| !a.is_empty())
        .ok_or_else(|| {
            Error::Parse("reddit thread: expected [post, comments] listings".to_string())
        })?;
    let post_thing = listing_children(&parts[0])
        .first()
        .and_then(|t| t.get("data"))
        .ok_or_else(|| Error::Parse("reddit thread: missing post".to_string()))?;
    let pd: PostData = serde_json::from_value(post_thing.clone())
        .map_err(|e| Error::Parse(format!("reddit post: {e}")))?;

    let mut comments = Vec::new();
    if let Some(listing) = parts.get(1) {
        walk_comments(listing_children(listing), 0, &pd.author, max_comments, &mut comments);
    }

    Ok(RedditPost {
        subreddit: pd.subreddit,
        id: pd.id,
        title: pd.title,
        author: pd.author,
        selftext: pd.selftext,
        url: pd.url,
        permalink: format!("https://www.reddit.com{}", pd.permalink),
        score: pd.score,
        upvote_ratio: pd.upvote_ratio,
        num_comments: pd.num_comments,
        created_utc: pd.created_utc,
        comments,
    })
}
