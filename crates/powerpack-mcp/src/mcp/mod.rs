use rmcp::{
    handler::server::router::tool::ToolRouter as RmcpToolRouter,
    handler::server::wrapper::Parameters,
    model::{CallToolResult, ServerCapabilities, ServerInfo},
    tool, tool_handler, tool_router,
    transport::stdio,
    ErrorData as McpError, ServiceExt,
};
use powerpack_core::batch::{
    REDDIT_QUERIES, REDDIT_URLS, RESEARCH_QUESTIONS, SCRAPE_URLS, WEB_SEARCH_KEYWORDS,
};
use powerpack_core::budget::{REDDIT_COMMENT_TOKENS, RESEARCH_TOKENS, SCRAPE_TOKENS};
use powerpack_core::errors::Tool;
use powerpack_core::report::{Report, Section};
use powerpack_core::LlmBackend;
use powerpack_local::openrouter::{
    extraction_model_from_env, research_model_from_env, OpenRouterClient,
};
use powerpack_local::pool::{
    RetryPolicy, LLM_CONCURRENCY, REDDIT_CONCURRENCY, SCRAPE_CONCURRENCY, SEARCH_CONCURRENCY,
};
use powerpack_local::reddit::RedditClient;
use powerpack_local::scrapedo::ScrapeDoClient;
use powerpack_local::serper::SerperClient;
use powerpack_local::Capabilities;
use std::time::Instant;

mod envelope;
mod reddit;
mod research;
mod scrape;
mod search;
mod usage;

use envelope::ToolOutput;
use usage::Usage;

#[derive(Clone)]
pub(crate) struct ResearchMcp {
    tool_router: RmcpToolRouter<Self>,
    http: reqwest::Client,
    usage: Usage,
    retry: RetryPolicy,
}

#[tool_router]
impl ResearchMcp {
    pub(crate) fn new() -> Result<Self, McpError> {
        let http = powerpack_local::http_client()
            .map_err(|e| McpError::internal_error(e.to_string(), None))?;
        Ok(Self {
            tool_router: Self::tool_router(),
            http,
            usage: Usage::default(),
            retry: RetryPolicy::default(),
        })
    }

    #[cfg(test)]
    fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    #[tool(
        description = "Search Google for many keywords at once (Serper). Results are merged and ranked across keywords by position-weighted score; URLs found by several keywords are marked as consensus. Returns a markdown report."
    )]
    async fn web_search(
        &self,
        params: Parameters<Option<search::WebSearchArgs>>,
    ) -> Result<CallToolResult, McpError> {
        let kind = "web_search";
        let t0 = Instant::now();
        self.usage.inc_tool(kind);
        let args = params.0.unwrap_or_default();

        let out = match search::validate_web_search(args) {
            Err(e) => ToolOutput::from_error(Tool::WebSearch, &e),
            Ok(input) => match SerperClient::from_env(self.http.clone()) {
                Err(e) => ToolOutput::from_error(Tool::WebSearch, &e),
                Ok(client) => search::web_search(&client, &self.usage, &self.retry, input).await,
            },
        };
        Ok(out.into_call_result(kind, t0))
    }

    #[tool(
        description = "Find Reddit threads for many queries at once (Google, scoped to reddit.com, optional date_after=YYYY-MM-DD). Threads are ranked across queries; use get_reddit_post to read them."
    )]
    async fn search_reddit(
        &self,
        params: Parameters<Option<search::SearchRedditArgs>>,
    ) -> Result<CallToolResult, McpError> {
        let kind = "search_reddit";
        let t0 = Instant::now();
        self.usage.inc_tool(kind);
        let args = params.0.unwrap_or_default();

        let out = match search::validate_search_reddit(args) {
            Err(e) => ToolOutput::from_error(Tool::SearchReddit, &e),
            Ok(input) => match SerperClient::from_env(self.http.clone()) {
                Err(e) => ToolOutput::from_error(Tool::SearchReddit, &e),
                Ok(client) => search::search_reddit(&client, &self.usage, &self.retry, input).await,
            },
        };
        Ok(out.into_call_result(kind, t0))
    }

    #[tool(
        description = "Fetch Reddit posts with their comment trees (Reddit API). Comments share a fixed token budget across posts; failed URLs are reported without failing the batch."
    )]
    async fn get_reddit_post(
        &self,
        params: Parameters<Option<reddit::GetRedditPostArgs>>,
    ) -> Result<CallToolResult, McpError> {
        let kind = "get_reddit_post";
        let t0 = Instant::now();
        self.usage.inc_tool(kind);
        let args = params.0.unwrap_or_default();

        let out = match reddit::validate(args) {
            Err(e) => ToolOutput::from_error(Tool::GetRedditPost, &e),
            Ok(input) => match RedditClient::from_env(self.http.clone()) {
                Err(e) => ToolOutput::from_error(Tool::GetRedditPost, &e),
                Ok(client) => {
                    reddit::get_reddit_post(&client, &self.usage, &self.retry, input).await
                }
            },
        };
        Ok(out.into_call_result(kind, t0))
    }

    #[tool(
        description = "Scrape web pages to clean markdown (Scrape.do; escalates basic -> JS render -> premium proxy). Optionally set use_llm=true with what_to_extract to have an LLM pull out specific information."
    )]
    async fn scrape_links(
        &self,
        params: Parameters<Option<scrape::ScrapeLinksArgs>>,
    ) -> Result<CallToolResult, McpError> {
        let kind = "scrape_links";
        let t0 = Instant::now();
        self.usage.inc_tool(kind);
        let args = params.0.unwrap_or_default();

        let out = match scrape::validate(args) {
            Err(e) => ToolOutput::from_error(Tool::ScrapeLinks, &e),
            Ok(input) => match ScrapeDoClient::from_env(self.http.clone()) {
                Err(e) => ToolOutput::from_error(Tool::ScrapeLinks, &e),
                Ok(client) => {
                    // The extractor is optional; without a key the tool returns markdown.
                    let llm = if input.use_llm {
                        let model = extraction_model_from_env();
                        OpenRouterClient::from_env(self.http.clone(), Some(model)).ok()
                    } else {
                        None
                    };
                    let llm_ref = llm.as_ref().map(|c| c as &dyn LlmBackend);
                    scrape::scrape_links(&client, llm_ref, &self.usage, &self.retry, input).await
                }
            },
        };
        Ok(out.into_call_result(kind, t0))
    }

    #[tool(
        description = "Answer research questions with a web-enabled LLM (OpenRouter). Each question may attach local files (optional line ranges) as context. Answers list their cited sources."
    )]
    async fn deep_research(
        &self,
        params: Parameters<Option<research::DeepResearchArgs>>,
    ) -> Result<CallToolResult, McpError> {
        let kind = "deep_research";
        let t0 = Instant::now();
        self.usage.inc_tool(kind);
        let args = params.0.unwrap_or_default();

        let out = match research::validate(args) {
            Err(e) => ToolOutput::from_error(Tool::DeepResearch, &e),
            Ok(questions) => match OpenRouterClient::from_env(self.http.clone(), None) {
                Err(e) => ToolOutput::from_error(Tool::DeepResearch, &e),
                Ok(client) => {
                    research::deep_research(&client, &self.usage, &self.retry, questions).await
                }
            },
        };
        Ok(out.into_call_result(kind, t0))
    }

    #[tool(description = "Report configured capabilities, limits, version and usage counters (no secrets)")]
    async fn research_meta(&self) -> Result<CallToolResult, McpError> {
        let kind = "research_meta";
        let t0 = Instant::now();
        self.usage.inc_tool(kind);

        let caps = Capabilities::from_env();
        let missing = Capabilities::missing_env();
        let enabled = caps.enabled_tools();
        let stats = self.usage.snapshot();
        let limits = serde_json::json!({
            "web_search": {"keywords_max": WEB_SEARCH_KEYWORDS.max, "results_per_keyword_max": search::MAX_RESULTS_PER_KEYWORD, "concurrency": SEARCH_CONCURRENCY},
            "search_reddit": {"queries_max": REDDIT_QUERIES.max, "concurrency": SEARCH_CONCURRENCY},
            "get_reddit_post": {"urls_max": REDDIT_URLS.max, "max_comments_max": reddit::MAX_COMMENTS_LIMIT, "comment_tokens_total": REDDIT_COMMENT_TOKENS, "concurrency": REDDIT_CONCURRENCY},
            "scrape_links": {"urls_max": SCRAPE_URLS.max, "tokens_total": SCRAPE_TOKENS, "timeout_s_max": scrape::MAX_TIMEOUT_S, "concurrency": SCRAPE_CONCURRENCY, "llm_concurrency": LLM_CONCURRENCY},
            "deep_research": {"questions_max": RESEARCH_QUESTIONS.max, "tokens_total": RESEARCH_TOKENS, "concurrency": LLM_CONCURRENCY},
        });

        let yes_no = |b: bool| if b { "configured" } else { "not configured" };
        let mut report = Report::new("research-powerpack status")
            .summary(format!("Version {}", env!("CARGO_PKG_VERSION")))
            .summary(format!(
                "{} of 5 research tools enabled: {}",
                enabled.len(),
                if enabled.is_empty() { "none".to_string() } else { enabled.join(", ") }
            ));
        let caps_body = format!(
            "| Capability | Status |\n|---|---|\n| Search (Serper) | {} |\n| Reddit API | {} |\n| Scraping (Scrape.do) | {} |\n| LLM (OpenRouter) | {} |\n",
            yes_no(caps.search),
            yes_no(caps.reddit),
            yes_no(caps.scraping),
            yes_no(caps.llm)
        );
        report = report.section(Section::new("Capabilities", caps_body));
        let mut usage_body = String::new();
        for (tool, n) in &stats.tool_calls {
            usage_body.push_str(&format!("- `{tool}`: {n} call(s)\n"));
        }
        for (p, u) in &stats.providers {
            usage_body.push_str(&format!(
                "- {p}: {} call(s), {} ok, {} rate limited\n",
                u.calls, u.ok, u.rate_limited
            ));
        }
        report = report.section(Section::new("Usage since start", usage_body));
        if !missing.is_empty() {
            report = report.next_step(format!(
                "Set {} to enable the remaining tools, then restart the server.",
                missing.join(", ")
            ));
        }
        report = report.next_step("Run `research-powerpack doctor` from a shell for the same report.");

        let payload = serde_json::json!({
            "name": "research-powerpack",
            "version": env!("CARGO_PKG_VERSION"),
            "configured": caps,
            "enabled_tools": enabled,
            "missing_env": missing,
            "models": {
                "research": research_model_from_env(),
                "extraction": extraction_model_from_env(),
            },
            "limits": limits,
            "usage": stats,
        });
        Ok(ToolOutput::success(report.render(), payload).into_call_result(kind, t0))
    }
}

#[tool_handler]
impl rmcp::ServerHandler for ResearchMcp {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            instructions: Some(
                "Research tools: batch web search with consensus ranking, Reddit search and thread fetch, page scraping to markdown, and web-enabled deep research. Every tool returns a markdown report; structured content carries the same data as JSON."
                    .to_string(),
            ),
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            ..Default::default()
        }
    }
}

pub(crate) async fn serve_stdio() -> Result<(), McpError> {
    let svc = ResearchMcp::new()?;
    tracing::info!(
        target: "powerpack::mcp",
        tools = ?Capabilities::from_env().enabled_tools(),
        "serving on stdio"
    );
    let running = svc
        .serve(stdio())
        .await
        .map_err(|e| McpError::internal_error(e.to_string(), None))?;
    running
        .waiting()
        .await
        .map_err(|e| McpError::internal_error(e.to_string(), None))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        extract::Query,
        http::StatusCode,
        routing::{get, post},
        Json, Router,
    };
    use std::collections::HashMap;
    use std::net::SocketAddr;

    fn p<T>(v: T) -> Parameters<Option<T>> {
        Parameters(Some(v))
    }

    static ENV_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

    struct EnvGuard {
        // Env vars are process-global; hold the lock for the whole test.
        _lock: std::sync::MutexGuard<'static, ()>,
        saved: Vec<(String, Option<String>)>,
    }

    impl EnvGuard {
        fn new(keys: &[&str]) -> Self {
            let lock = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
            let saved: Vec<(String, Option<String>)> = keys
                .iter()
                .map(|k| (k.to_string(), std::env::var(k).ok()))
                .collect();
            for (k, _) in &saved {
                std::env::remove_var(k);
            }
            Self { _lock: lock, saved }
        }

        fn set(&self, k: &str, v: &str) {
            std::env::set_var(k, v);
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (k, v) in self.saved.drain(..) {
                match v {
                    Some(val) => std::env::set_var(k, val),
                    None => std::env::remove_var(k),
                }
            }
        }
    }

    const ENV_KEYS: [&str; 10] = [
        "SERPER_API_KEY",
        "POWERPACK_SERPER_ENDPOINT",
        "SCRAPEDO_API_KEY",
        "POWERPACK_SCRAPEDO_ENDPOINT",
        "OPENROUTER_API_KEY",
        "OPENROUTER_BASE_URL",
        "REDDIT_CLIENT_ID",
        "REDDIT_CLIENT_SECRET",
        "POWERPACK_REDDIT_AUTH_ENDPOINT",
        "POWERPACK_REDDIT_API_BASE",
    ];

    async fn serve(app: Router) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    fn svc() -> ResearchMcp {
        ResearchMcp::new().unwrap().with_retry_policy(RetryPolicy::none())
    }

    fn text_of(r: &CallToolResult) -> String {
        r.content
            .first()
            .and_then(|c| c.as_text())
            .map(|t| t.text.clone())
            .unwrap_or_default()
    }

    fn payload_of(r: &CallToolResult) -> serde_json::Value {
        r.structured_content.clone().expect("structured content")
    }

    #[tokio::test]
    async fn invalid_input_wins_over_missing_config() {
        let _g = EnvGuard::new(&ENV_KEYS);
        let r = svc()
            .web_search(p(search::WebSearchArgs::default()))
            .await
            .unwrap();
        let v = payload_of(&r);
        assert_eq!(v["ok"], false);
        assert_eq!(v["kind"], "web_search");
        assert_eq!(v["schema_version"], 1);
        assert_eq!(v["error"]["code"], "invalid_input");
    }

    #[tokio::test]
    async fn missing_keys_are_not_configured_with_remediation() {
        let _g = EnvGuard::new(&ENV_KEYS);
        let s = svc();
        let r = s
            .get_reddit_post(p(reddit::GetRedditPostArgs {
                urls: vec!["https://www.reddit.com/r/rust/comments/abc/x/".into()],
                ..Default::default()
            }))
            .await
            .unwrap();
        let v = payload_of(&r);
        assert_eq!(v["error"]["code"], "not_configured");
        assert_eq!(v["error"]["retryable"], false);
        let txt = text_of(&r);
        assert!(txt.starts_with("# get_reddit_post failed"));
        assert!(txt.contains("REDDIT_CLIENT_ID, REDDIT_CLIENT_SECRET"));

        let r = s
            .deep_research(p(research::DeepResearchArgs {
                questions: vec![research::QuestionArg {
                    question: "why".into(),
                    file_attachments: None,
                }],
            }))
            .await
            .unwrap();
        assert_eq!(payload_of(&r)["error"]["code"], "not_configured");
    }

    #[tokio::test]
    async fn web_search_against_fake_serper() {
        let g = EnvGuard::new(&ENV_KEYS);
        let app = Router::new().route(
            "/search",
            post(|Json(body): Json<serde_json::Value>| async move {
                let q = body["q"].as_str().unwrap_or("").to_string();
                if q == "broken" {
                    return (StatusCode::INTERNAL_SERVER_ERROR, Json(serde_json::json!({})));
                }
                (
                    StatusCode::OK,
                    Json(serde_json::json!({
                        "organic": [
                            {"title": "Shared", "link": "https://shared.example/", "position": 1},
                            {"title": format!("Only {q}"), "link": format!("https://{q}.example/"), "position": 2}
                        ],
                        "relatedSearches": [{"query": format!("{q} tips")}]
                    })),
                )
            }),
        );
        let addr = serve(app).await;
        g.set("SERPER_API_KEY", "k");
        g.set("POWERPACK_SERPER_ENDPOINT", &format!("http://{addr}/search"));

        let s = svc();
        let r = s
            .web_search(p(search::WebSearchArgs {
                keywords: vec!["alpha".into(), "beta".into(), "broken".into()],
                results_per_keyword: Some(5),
            }))
            .await
            .unwrap();
        let v = payload_of(&r);
        assert_eq!(v["ok"], true, "{}", text_of(&r));
        assert_eq!(v["succeeded"], 2);
        assert_eq!(v["results"][0]["url"], "https://shared.example/");
        assert_eq!(v["results"][0]["consensus"], true);
        assert_eq!(v["error"]["code"], "partial_failure");
        let txt = text_of(&r);
        assert!(txt.starts_with("# Web search: 3 keyword(s)"));
        assert!(txt.contains("## Summary"));
        assert!(txt.contains("## Next Steps"));

        let meta = s.research_meta().await.unwrap();
        let m = payload_of(&meta);
        assert_eq!(m["configured"]["search"], true);
        assert_eq!(m["usage"]["tool_calls"]["web_search"], 1);
        assert_eq!(m["usage"]["providers"]["serper"]["calls"], 3);
    }

    #[tokio::test]
    async fn scrape_links_against_fake_scrapedo() {
        let g = EnvGuard::new(&ENV_KEYS);
        let app = Router::new().route(
            "/",
            get(|Query(q): Query<HashMap<String, String>>| async move {
                if q.get("token").map(String::as_str) != Some("tok") {
                    return (StatusCode::UNAUTHORIZED, "bad token".to_string());
                }
                let url = q.get("url").cloned().unwrap_or_default();
                (
                    StatusCode::OK,
                    format!("<html><head><title>Doc</title></head><body><article><p>Body of {url}</p></article></body></html>"),
                )
            }),
        );
        let addr = serve(app).await;
        g.set("SCRAPEDO_API_KEY", "tok");
        g.set("POWERPACK_SCRAPEDO_ENDPOINT", &format!("http://{addr}/"));

        let r = svc()
            .scrape_links(p(scrape::ScrapeLinksArgs {
                urls: vec!["https://docs.example/page".into()],
                use_llm: Some(true),
                ..Default::default()
            }))
            .await
            .unwrap();
        let v = payload_of(&r);
        assert_eq!(v["ok"], true, "{}", text_of(&r));
        assert_eq!(v["pages"][0]["mode"], "basic");
        assert_eq!(v["pages"][0]["title"], "Doc");
        // No OPENROUTER_API_KEY: falls back to markdown with a warning.
        assert_eq!(v["use_llm"], false);
        assert!(text_of(&r).contains("Body of https://docs.example/page"));
    }

    #[tokio::test]
    async fn research_meta_reports_booleans_only() {
        let g = EnvGuard::new(&ENV_KEYS);
        g.set("OPENROUTER_API_KEY", "sk-secret-value");
        let r = svc().research_meta().await.unwrap();
        let v = payload_of(&r);
        assert_eq!(v["configured"]["llm"], true);
        assert_eq!(v["configured"]["search"], false);
        assert_eq!(v["enabled_tools"], serde_json::json!(["deep_research"]));
        assert!(!v.to_string().contains("sk-secret-value"));
        assert!(!text_of(&r).contains("sk-secret-value"));
        assert!(text_of(&r).contains("SERPER_API_KEY"));
    }
}
