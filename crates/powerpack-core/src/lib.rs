//! Backend-agnostic types and shaping logic for `research-powerpack`.
//!
//! Nothing in this crate performs IO. Vendor adapters live in `powerpack-local`; the
//! MCP surface lives in `research-powerpack`.

use serde::{Deserialize, Serialize};
use std::time::Duration;

pub mod batch;
pub mod budget;
pub mod errors;
pub mod ranking;
pub mod report;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("not configured: {0}")]
    NotConfigured(String),
    #[error("rate limited: {message}")]
    RateLimited {
        message: String,
        retry_after_ms: Option<u64>,
    },
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("quota exhausted: {0}")]
    Quota(String),
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },
    #[error("network error: {0}")]
    Network(String),
    #[error("parse error: {0}")]
    Parse(String),
    #[error("llm failed: {0}")]
    Llm(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Map a non-success HTTP status from a vendor API into an error.
    pub fn from_status(
        status: u16,
        message: impl Into<String>,
        retry_after_ms: Option<u64>,
    ) -> Self {
        let message = message.into();
        match status {
            429 => Self::RateLimited {
                message,
                retry_after_ms,
            },
            401 | 403 => Self::Auth(message),
            402 => Self::Quota(message),
            408 | 504 => Self::Timeout(message),
            _ => Self::Http { status, message },
        }
    }

    /// Whether repeating the same call later can reasonably succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::RateLimited { .. } | Self::Timeout(_) | Self::Network(_) => true,
            Self::Http { status, .. } => *status >= 500,
            Self::InvalidInput(_)
            | Self::NotConfigured(_)
            | Self::Auth(_)
            | Self::Quota(_)
            | Self::Parse(_)
            | Self::Llm(_) => false,
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited {
                retry_after_ms: Some(ms),
                ..
            } => Some(Duration::from_millis(*ms)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SearchHit {
    pub url: String,
    pub title: String,
    pub snippet: Option<String>,
    /// 1-based rank in the provider response.
    pub position: usize,
    pub date: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResponse {
    pub query: String,
    pub hits: Vec<SearchHit>,
    pub related: Vec<String>,
    pub elapsed_ms: u128,
}

#[async_trait::async_trait]
pub trait SearchProvider: Send + Sync {
    fn name(&self) -> &'static str;
    async fn search(&self, query: &str, num: usize) -> Result<SearchResponse>;
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ScrapeMode {
    /// Plain proxied fetch.
    Basic,
    /// Headless browser rendering.
    Render,
    /// Residential proxy pinned to a geo.
    Premium,
}

impl ScrapeMode {
    pub const LADDER: [ScrapeMode; 3] = [Self::Basic, Self::Render, Self::Premium];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Basic => "basic",
            Self::Render => "render",
            Self::Premium => "premium",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScrapePage {
    pub status: u16,
    pub body: String,
}

#[async_trait::async_trait]
pub trait ScrapeBackend: Send + Sync {
    async fn scrape(&self, url: &str, mode: ScrapeMode, timeout: Duration) -> Result<ScrapePage>;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    /// Falls back to the backend's default model when unset.
    pub model: Option<String>,
    pub messages: Vec<ChatMessage>,
    pub max_tokens: Option<u64>,
    pub temperature: Option<f64>,
    /// "low" | "medium" | "high"
    pub reasoning_effort: Option<String>,
    /// Enable provider-side web search with this many results.
    pub web_search_results: Option<u32>,
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ChatResponse {
    pub model: String,
    pub content: String,
    pub citations: Vec<Citation>,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Citation {
    pub url: String,
    pub title: Option<String>,
}

#[async_trait::async_trait]
pub trait LlmBackend: Send + Sync {
    fn default_model(&self) -> &str;
    async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse>;
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum CommentSort {
    #[default]
    Top,
    Best,
    New,
    Controversial,
    Old,
}

impl CommentSort {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Top => "top",
            Self::Best => "confidence",
            Self::New => "new",
            Self::Controversial => "controversial",
            Self::Old => "old",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "top" => Some(Self::Top),
            "best" | "confidence" => Some(Self::Best),
            "new" => Some(Self::New),
            "controversial" => Some(Self::Controversial),
            "old" => Some(Self::Old),
            _ => None,
        }
    }
}

/// Identifies one Reddit submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PostRef {
    pub subreddit: String,
    pub id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RedditComment {
    pub author: String,
    pub body: String,
    pub score: i64,
    pub depth: usize,
    pub is_op: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct RedditPost {
    pub subreddit: String,
    pub id: String,
    pub title: String,
    pub author: String,
    pub selftext: String,
    pub url: String,
    pub permalink: String,
    pub score: i64,
    pub upvote_ratio: Option<f64>,
    pub num_comments: u64,
    pub created_utc: Option<f64>,
    pub comments: Vec<RedditComment>,
}

#[async_trait::async_trait]
pub trait RedditBackend: Send + Sync {
    async fn fetch_post(
        &self,
        post: &PostRef,
        sort: CommentSort,
        max_comments: usize,
    ) -> Result<RedditPost>;
}
