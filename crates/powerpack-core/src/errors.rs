//! Structured, agent-facing error objects.
//!
//! Tool handlers never fail at the protocol level. Instead every failure is turned into a
//! [`ToolError`] that tells the calling agent what went wrong, whether retrying makes
//! sense, how to fix it, and which other tools can cover the same need.

use crate::Error;
use serde::Serialize;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    InvalidInput,
    NotConfigured,
    RateLimited,
    AuthFailed,
    QuotaExhausted,
    Timeout,
    UpstreamError,
    NetworkError,
    ParseError,
    PartialFailure,
    UnexpectedError,
}

impl ErrorCode {
    pub const ALL: [ErrorCode; 11] = [
        Self::InvalidInput,
        Self::NotConfigured,
        Self::RateLimited,
        Self::AuthFailed,
        Self::QuotaExhausted,
        Self::Timeout,
        Self::UpstreamError,
        Self::NetworkError,
        Self::ParseError,
        Self::PartialFailure,
        Self::UnexpectedError,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::InvalidInput => "invalid_input",
            Self::NotConfigured => "not_configured",
            Self::RateLimited => "rate_limited",
            Self::AuthFailed => "auth_failed",
            Self::QuotaExhausted => "quota_exhausted",
            Self::Timeout => "timeout",
            Self::UpstreamError => "upstream_error",
            Self::NetworkError => "network_error",
            Self::ParseError => "parse_error",
            Self::PartialFailure => "partial_failure",
            Self::UnexpectedError => "unexpected_error",
        }
    }

    pub fn retryable(self) -> bool {
        match self {
            Self::RateLimited
            | Self::Timeout
            | Self::UpstreamError
            | Self::NetworkError
            | Self::PartialFailure => true,
            // Bad input, missing keys and exhausted credit need a change before a retry helps.
            Self::InvalidInput
            | Self::NotConfigured
            | Self::AuthFailed
            | Self::QuotaExhausted
            | Self::ParseError
            | Self::UnexpectedError => false,
        }
    }

    pub fn retry_hint(self) -> &'static str {
        match self {
            Self::RateLimited => "Wait before retrying; reduce batch size to stay under the provider rate limit.",
            Self::Timeout => "Retry once; if it times out again, send fewer items per call.",
            Self::UpstreamError => "The provider returned a server error. Retry in a few seconds.",
            Self::NetworkError => "Check connectivity, then retry.",
            Self::PartialFailure => "Retry only the failed items listed in the report.",
            Self::InvalidInput => "Fix the input and call again; retrying unchanged will fail.",
            Self::NotConfigured => "Configure the missing credentials; retrying unchanged will fail.",
            Self::AuthFailed => "Check the API key; retrying unchanged will fail.",
            Self::QuotaExhausted => "Top up provider credits or wait for the quota window to reset.",
            Self::ParseError => "The provider response had an unexpected shape; retrying rarely helps.",
            Self::UnexpectedError => "Report this; retrying unchanged is unlikely to help.",
        }
    }
}

impl From<&Error> for ErrorCode {
    fn from(e: &Error) -> Self {
        match e {
            Error::InvalidInput(_) => Self::InvalidInput,
            Error::NotConfigured(_) => Self::NotConfigured,
            Error::RateLimited { .. } => Self::RateLimited,
            Error::Auth(_) => Self::AuthFailed,
            Error::Quota(_) => Self::QuotaExhausted,
            Error::Timeout(_) => Self::Timeout,
            Error::Http { .. } | Error::Llm(_) => Self::UpstreamError,
            Error::Network(_) => Self::NetworkError,
            Error::Parse(_) => Self::ParseError,
        }
    }
}

/// The tools this server exposes, for remediation and alternative hints.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Tool {
    WebSearch,
    SearchReddit,
    GetRedditPost,
    ScrapeLinks,
    DeepResearch,
}

impl Tool {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::WebSearch => "web_search",
            Self::SearchReddit => "search_reddit",
            Self::GetRedditPost => "get_reddit_post",
            Self::ScrapeLinks => "scrape_links",
            Self::DeepResearch => "deep_research",
        }
    }

    /// Env vars the tool needs, in the order they should be reported.
    pub fn required_env(self) -> &'static [&'static str] {
        match self {
            Self::WebSearch | Self::SearchReddit => &["SERPER_API_KEY"],
            Self::GetRedditPost => &["REDDIT_CLIENT_ID", "REDDIT_CLIENT_SECRET"],
            Self::ScrapeLinks => &["SCRAPEDO_API_KEY"],
            Self::DeepResearch => &["OPENROUTER_API_KEY"],
        }
    }

    pub fn provider(self) -> &'static str {
        match self {
            Self::WebSearch | Self::SearchReddit => "Serper",
            Self::GetRedditPost => "Reddit",
            Self::ScrapeLinks => "Scrape.do",
            Self::DeepResearch => "OpenRouter",
        }
    }

    pub fn alternatives(self) -> &'static [&'static str] {
        match self {
            Self::WebSearch => &["deep_research", "search_reddit"],
            Self::SearchReddit => &["web_search", "deep_research"],
            Self::GetRedditPost => &["scrape_links", "search_reddit"],
            Self::ScrapeLinks => &["deep_research", "web_search"],
            Self::DeepResearch => &["web_search", "scrape_links"],
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolError {
    pub code: ErrorCode,
    pub message: String,
    pub retryable: bool,
    pub retry_hint: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
    pub how_to_fix: Vec<String>,
    pub alternatives: Vec<String>,
}

impl ToolError {
    pub fn new(tool: Tool, code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            retryable: code.retryable(),
            retry_hint: code.retry_hint().to_string(),
            retry_after_ms: None,
            how_to_fix: remediation(tool, code),
            alternatives: tool.alternatives().iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn from_error(tool: Tool, err: &Error) -> Self {
        let mut e = Self::new(tool, ErrorCode::from(err), err.to_string());
        // The code is coarse (4xx and 5xx share `upstream_error`); the error itself decides.
        e.retryable = err.is_retryable();
        if e.code == ErrorCode::UpstreamError && !e.retryable {
            e.retry_hint = match err {
                Error::Llm(_) => "The model call failed; retrying unchanged is unlikely to help.",
                _ => "The provider rejected the request; retrying unchanged will fail.",
            }
            .to_string();
            e.how_to_fix = vec![
                format!(
                    "{} refused this request; check the item (URL, permalink or question) and change it.",
                    tool.provider()
                ),
                "Try an alternative tool listed below.".to_string(),
            ];
        }
        if let Some(d) = err.retry_after() {
            let ms = d.as_millis() as u64;
            e.retry_after_ms = Some(ms);
            e.retry_hint = format!("Wait about {}s before retrying.", ms.div_ceil(1000));
        }
        e
    }

    pub fn with_fix(mut self, step: impl Into<String>) -> Self {
        self.how_to_fix.insert(0, step.into());
        self
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_else(|_| {
            serde_json::json!({
                "code": self.code.as_str(),
                "message": self.message,
                "retryable": self.retryable,
            })
        })
    }
}

fn remediation(tool: Tool, code: ErrorCode) -> Vec<String> {
    let provider = tool.provider();
    match code {
        ErrorCode::NotConfigured => {
            let vars = tool.required_env().join(", ");
            vec![
                format!("Set {vars} in the server environment (or in the file named by POWERPACK_ENV_FILE)."),
                "Restart the MCP server so it picks up the new environment.".to_string(),
                "Run `research-powerpack doctor` to confirm which capabilities are enabled.".to_string(),
            ]
        }
        ErrorCode::InvalidInput => vec![
            "Check the parameter bounds in the tool description.".to_string(),
            "Remove blank or duplicate items and split very large batches.".to_string(),
        ],
        ErrorCode::RateLimited => vec![
            format!("{provider} is rate limiting this key; wait, then retry with a smaller batch."),
        ],
        ErrorCode::AuthFailed => vec![format!(
            "{provider} rejected the credentials; verify {} is correct and active.",
            tool.required_env().join(" / ")
        )],
        ErrorCode::QuotaExhausted => vec![format!(
            "The {provider} account is out of credits; top up or switch keys."
        )],
        ErrorCode::Timeout => vec![
            "Send fewer items per call or raise the timeout parameter where available.".to_string(),
        ],
        ErrorCode::UpstreamError | ErrorCode::NetworkError => {
            vec![format!("{provider} could not be reached reliably; retry shortly.")]
        }
        ErrorCode::PartialFailure => vec![
            "Re-run the tool with only the failed items.".to_string(),
        ],
        ErrorCode::ParseError | ErrorCode::UnexpectedError => vec![
            "Try an alternative tool listed below.".to_string(),
        ],
    }
}
