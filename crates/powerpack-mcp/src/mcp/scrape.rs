//! `scrape_links`: Scrape.do mode ladder, markdown cleanup, optional LLM extraction.

use super::envelope::{failure_item, partial_failure, ToolOutput};
use super::usage::Usage;
use powerpack_core::batch::SCRAPE_URLS;
use powerpack_core::budget::{estimate_tokens, truncate_to_tokens, TokenBudget, SCRAPE_TOKENS};
use powerpack_core::errors::{Tool, ToolError};
use powerpack_core::report::{Report, Section};
use powerpack_core::{
    ChatMessage, ChatRequest, Error, LlmBackend, Result, ScrapeBackend, ScrapeMode,
};
use powerpack_local::markdown::{extract_title, to_markdown};
use powerpack_local::pool::{
    bounded_map, with_retry, RetryPolicy, LLM_CONCURRENCY, SCRAPE_CONCURRENCY,
};
use powerpack_local::scrapedo::{scrape_with_fallback, ScrapeOutcome};
use schemars::JsonSchema;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::time::{Duration, Instant};

pub(crate) const DEFAULT_TIMEOUT_S: u64 = 30;
pub(crate) const MIN_TIMEOUT_S: u64 = 5;
pub(crate) const MAX_TIMEOUT_S: u64 = 120;
const URL_BUDGET: TokenBudget = TokenBudget::new(SCRAPE_TOKENS, 1_000, 8_000);
const MARKDOWN_WIDTH: usize = 100;
/// Page text sent to the extraction model is clipped to this many tokens.
const LLM_INPUT_TOKENS: usize = 24_000;
const EXTRACTION_TIMEOUT_MS: u64 = 90_000;
const DEFAULT_EXTRACTION: &str = "the main content: key facts, figures, definitions, and conclusions";

const EXTRACTION_SYSTEM_PROMPT: &str = "You extract information from the text of a web page. \
Use only the page content provided. Reply in concise markdown with headings or bullets. \
Keep numbers, names, versions and dates exact. If the page does not contain what was asked \
for, say so in one sentence.";

#[derive(Debug, Deserialize, JsonSchema, Default)]
pub(crate) struct ScrapeLinksArgs {
    /// http(s) URLs to scrape (1-50).
    #[serde(default)]
    pub urls: Vec<String>,
    /// Post-process each page with an LLM (needs OPENROUTER_API_KEY). Default false.
    #[serde(default)]
    pub use_llm: Option<bool>,
    /// What the LLM should pull out of each page, e.g. "pricing tiers and limits".
    #[serde(default)]
    pub what_to_extract: Option<String>,
    /// Per-request timeout in seconds (5-120, default 30).
    #[serde(default)]
    pub timeout_s: Option<u64>,
}

#[derive(Debug, Clone)]
pub(crate) struct ScrapeLinksInput {
    pub targets: Vec<(String, Result<String>)>,
    pub use_llm: bool,
    pub what_to_extract: Option<String>,
    pub timeout: Duration,
}

fn check_url(raw: &str) -> Result<String> {
    let u = reqwest::Url::parse(raw)
        .map_err(|e| Error::InvalidInput(format!("not a URL: {raw} ({e})")))?;
    if !matches!(u.scheme(), "http" | "https") || u.host_str().is_none() {
        return Err(Error::InvalidInput(format!(
            "only http(s) URLs with a host can be scraped: {raw}"
        )));
    }
    Ok(u.to_string())
}

pub(crate) fn validate(args: ScrapeLinksArgs) -> Result<ScrapeLinksInput> {
    let urls = SCRAPE_URLS.normalize(args.urls)?;
    let targets: Vec<(String, Result<String>)> = urls
        .into_iter()
        .map(|u| {
            let checked = check_url(&u);
            (u, checked)
        })
        .collect();
    if targets.iter().all(|(_, r)| r.is_err()) {
        if let Some((_, Err(e))) = targets.first() {
            return Err(e.clone());
        }
    }
    let timeout_s = args.timeout_s.unwrap_or(DEFAULT_TIMEOUT_S);
    if !(MIN_TIMEOUT_S..=MAX_TIMEOUT_S).contains(&timeout_s) {
        return Err(Error::InvalidInput(format!(
            "timeout_s must be between {MIN_TIMEOUT_S} and {MAX_TIMEOUT_S}, got {timeout_s}"
        )));
    }
    Ok(ScrapeLinksInput {
        targets,
        use_llm: args.use_llm.unwrap_or(false),
        what_to_extract: args
            .what_to_extract
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty()),
        timeout: Duration::from_secs(timeout_s),
    })
}

struct Page {
    outcome: ScrapeOutcome,
    title: Option<String>,
    markdown: String,
}

async fn extract_with_llm(
    llm: &dyn LlmBackend,
    usage: &Usage,
    policy: &RetryPolicy,
    page: &Page,
    instructions: &str,
    max_tokens: usize,
) -> Result<String> {
    let (content, _) = truncate_to_tokens(&page.markdown, LLM_INPUT_TOKENS);
    let req = ChatRequest {
        messages: vec![
            ChatMessage::system(EXTRACTION_SYSTEM_PROMPT),
            ChatMessage::user(format!(
                "Extract: {instructions}\n\nURL: {}\n\n---\n\n{content}",
                page.outcome.url
            )),
        ],
        max_tokens: Some(max_tokens as u64),
        temperature: Some(0.1),
        timeout_ms: EXTRACTION_TIMEOUT_MS,
        ..Default::default()
    };
    let t0 = Instant::now();
    let r = with_retry(policy, "openrouter", || llm.chat(&req)).await;
    usage.record_result("openrouter", &r, t0.elapsed().as_millis() as u64);
    let resp = r?;
    if resp.content.trim().is_empty() {
        return Err(Error::Llm("extraction model returned empty content".to_string()));
    }
    Ok(resp.content)
}

pub(crate) async fn scrape_links(
    backend: &dyn ScrapeBackend,
    llm: Option<&dyn LlmBackend>,
    usage: &Usage,
    policy: &RetryPolicy,
    input: ScrapeLinksInput,
) -> ToolOutput {
    let tool = Tool::ScrapeLinks;
    let timeout = input.timeout;
    let mut warnings: Vec<String> = Vec::new();

    let valid: Vec<&str> = input
        .targets
        .iter()
        .filter_map(|(_, r)| r.as_deref().ok())
        .collect();
    let scraped = bounded_map(valid, SCRAPE_CONCURRENCY, |url| async move {
        let t0 = Instant::now();
        let r = scrape_with_fallback(backend, url, timeout, policy).await;
        usage.record_result("scrapedo", &r, t0.elapsed().as_millis() as u64);
        r.map(|outcome| Page {
            title: extract_title(&outcome.html),
            markdown: to_markdown(&outcome.html, MARKDOWN_WIDTH),
            outcome,
        })
    })
    .await;

    let mut scraped = scraped.into_iter();
    let mut results: Vec<(String, Result<Page>)> = Vec::with_capacity(input.targets.len());
    for (raw, checked) in input.targets {
        let r = match checked {
            Ok(_) => scraped
                .next()
                .unwrap_or_else(|| Err(Error::Network(format!("no result for {raw}")))),
            Err(e) => Err(e),
        };
        results.push((raw, r));
    }

    let n = results.len();
    let pages: Vec<(&str, &Page)> = results
        .iter()
        .filter_map(|(u, r)| r.as_ref().ok().map(|p| (u.as_str(), p)))
        .collect();
    let failures: Vec<(&str, &Error)> = results
        .iter()
        .filter_map(|(u, r)| r.as_ref().err().map(|e| (u.as_str(), e)))
        .collect();
    let failure_items: Vec<serde_json::Value> = failures
        .iter()
        .map(|(u, e)| failure_item("url", u, e))
        .collect();

    if pages.is_empty() {
        let err = match failures.first() {
            Some((_, e)) => {
                let mut te = ToolError::from_error(tool, e);
                te.message = format!("all {n} URLs failed; first error: {}", te.message);
                te
            }
            None => ToolError::from_error(tool, &Error::Network("nothing scraped".to_string())),
        };
        let details = serde_json::json!({ "failures": failure_items });
        return ToolOutput::failure_with(tool, err, details);
    }

    let per_url = URL_BUDGET.per_item(pages.len());

    let llm = match (input.use_llm, llm) {
        (true, Some(l)) => Some(l),
        (true, None) => {
            warnings.push(
                "use_llm=true but OPENROUTER_API_KEY is not set; returned cleaned markdown instead"
                    .to_string(),
            );
            None
        }
        (false, _) => {
            if input.what_to_extract.is_some() {
                warnings.push("what_to_extract is only used with use_llm=true".to_string());
            }
            None
        }
    };
    let instructions = input
        .what_to_extract
        .clone()
        .unwrap_or_else(|| DEFAULT_EXTRACTION.to_string());

    let extracted: Vec<Option<String>> = match llm {
        Some(l) => {
            let instructions = instructions.as_str();
            bounded_map(pages.iter(), LLM_CONCURRENCY, |(url, page)| async move {
                match extract_with_llm(l, usage, policy, page, instructions, per_url).await {
                    Ok(text) => Some(text),
                    Err(e) => {
                        tracing::warn!(
                            target: "powerpack::scrape",
                            url = *url,
                            error = %e,
                            "llm extraction failed; using markdown"
                        );
                        None
                    }
                }
            })
            .await
        }
        None => vec![None; pages.len()],
    };
    let llm_failed = llm.is_some() && extracted.iter().any(Option::is_none);
    if llm_failed {
        let count = extracted.iter().filter(|e| e.is_none()).count();
        warnings.push(format!(
            "LLM extraction failed for {count} page(s); cleaned markdown returned for those"
        ));
    }

    let mut report = Report::new(format!("Scraped {} of {n} URL(s)", pages.len()));
    let mut pages_json = Vec::new();
    let mut modes: BTreeMap<&'static str, usize> = BTreeMap::new();
    let mut truncated_count = 0usize;

    for ((url, page), extraction) in pages.iter().zip(extracted) {
        *modes.entry(page.outcome.mode.as_str()).or_insert(0) += 1;
        let via_llm = extraction.is_some();
        let raw = extraction.unwrap_or_else(|| page.markdown.clone());
        let (content, truncated) = truncate_to_tokens(&raw, per_url);
        if truncated {
            truncated_count += 1;
        }
        let tokens = estimate_tokens(&content);
        let heading = page.title.clone().unwrap_or_else(|| url.to_string());
        let mut body = format!(
            "Source: {url} | mode: {} | HTTP {} | ~{tokens} tokens",
            page.outcome.mode.as_str(),
            page.outcome.status
        );
        if via_llm {
            body.push_str(" | LLM extraction");
        }
        if truncated {
            body.push_str(" | truncated");
        }
        let text = if content.trim().is_empty() {
            "_No readable text on this page._"
        } else {
            content.as_str()
        };
        let _ = write!(body, "\n\n{text}");
        report = report.section(Section::new(heading, body));
        pages_json.push(serde_json::json!({
            "url": url,
            "final_url": page.outcome.url,
            "title": page.title,
            "mode": page.outcome.mode,
            "status": page.outcome.status,
            "attempts": page.outcome.attempts,
            "tokens": tokens,
            "truncated": truncated,
            "llm_extracted": via_llm,
        }));
    }

    if !failures.is_empty() {
        let mut body = String::new();
        for (u, e) in &failures {
            let _ = writeln!(body, "- {u}: {e}");
        }
        report = report.section(Section::new("Failed", body));
    }

    let mode_list = modes
        .iter()
        .map(|(m, c)| format!("{m} {c}"))
        .collect::<Vec<_>>()
        .join(", ");
    report = report
        .summary(format!("{} of {n} URL(s) scraped ({mode_list})", pages.len()))
        .summary(format!("About {per_url} tokens per page; {truncated_count} page(s) truncated"));
    if llm.is_some() {
        report = report.summary(format!("LLM extraction: {instructions}"));
    }
    for w in &warnings {
        report = report.summary(format!("Warning: {w}"));
    }

    if llm.is_none() {
        report = report.next_step(
            "Pass `use_llm: true` with `what_to_extract` to pull specific facts instead of full pages.",
        );
    }
    report = report.next_step("Synthesize across these pages with `deep_research`.");
    if truncated_count > 0 {
        report = report.next_step("Scrape fewer URLs per call to give each page a larger token budget.");
    }
    if !failures.is_empty() {
        report = report.next_step("Retry only the failed URLs, or find alternatives with `web_search`.");
    }

    let premium_used = modes.contains_key(ScrapeMode::Premium.as_str());
    let mut payload = serde_json::json!({
        "requested": n,
        "scraped": pages.len(),
        "tokens_per_page": per_url,
        "use_llm": llm.is_some(),
        "premium_mode_used": premium_used,
        "pages": pages_json,
        "warnings": warnings,
        "failures": failure_items,
    });
    if !failures.is_empty() {
        payload["error"] = partial_failure(tool, failures.len(), n, "URLs").to_json();
    }
    ToolOutput::success(report.render(), payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use powerpack_core::{ChatResponse, ScrapePage};

    struct FakeScrape;

    #[async_trait::async_trait]
    impl ScrapeBackend for FakeScrape {
        async fn scrape(&self, url: &str, mode: ScrapeMode, _t: Duration) -> Result<ScrapePage> {
            if url.contains("missing") {
                return Ok(ScrapePage {
                    status: 404,
                    body: "nope".into(),
                });
            }
            // Needs rendering: basic mode returns an empty shell.
            if url.contains("spa") && mode == ScrapeMode::Basic {
                return Ok(ScrapePage {
                    status: 200,
                    body: String::new(),
                });
            }
            Ok(ScrapePage {
                status: 200,
                body: format!(
                    "<html><head><title>Page {}</title></head><body><nav>menu</nav><main><p>Content for {url}.</p></main></body></html>",
                    url.len()
                ),
            })
        }
    }

    struct FakeLlm;

    #[async_trait::async_trait]
    impl LlmBackend for FakeLlm {
        fn default_model(&self) -> &str {
            "fake"
        }

        async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse> {
            let user = &req.messages[1].content;
            if user.contains("llmfail") {
                return Err(Error::Llm("boom".into()));
            }
            Ok(ChatResponse {
                model: "fake".into(),
                content: format!("EXTRACTED {}", user.lines().next().unwrap_or("")),
                ..Default::default()
            })
        }
    }

    fn input(urls: &[&str], use_llm: bool, what: Option<&str>) -> ScrapeLinksInput {
        validate(ScrapeLinksArgs {
            urls: urls.iter().map(|s| s.to_string()).collect(),
            use_llm: Some(use_llm),
            what_to_extract: what.map(str::to_string),
            timeout_s: None,
        })
        .unwrap()
    }

    #[test]
    fn validate_checks_scheme_and_timeout() {
        assert!(matches!(
            validate(ScrapeLinksArgs {
                urls: vec!["ftp://x.com/a".into()],
                ..Default::default()
            }),
            Err(Error::InvalidInput(_))
        ));
        assert!(validate(ScrapeLinksArgs {
            urls: vec!["https://x.com".into()],
            timeout_s: Some(1),
            ..Default::default()
        })
        .is_err());
        let ok = validate(ScrapeLinksArgs {
            urls: vec!["https://x.com".into(), "not a url".into()],
            ..Default::default()
        })
        .unwrap();
        assert_eq!(ok.timeout, Duration::from_secs(DEFAULT_TIMEOUT_S));
        assert!(ok.targets[1].1.is_err());
    }

    #[tokio::test]
    async fn scrapes_escalates_and_reports_failures() {
        let out = scrape_links(
            &FakeScrape,
            None,
            &Usage::default(),
            &RetryPolicy::none(),
            input(
                &["https://a.com/doc", "https://b.com/spa", "https://c.com/missing"],
                false,
                None,
            ),
        )
        .await;
        assert!(out.ok, "{}", out.markdown);
        assert_eq!(out.payload["scraped"], 2);
        assert_eq!(out.payload["pages"][1]["mode"], "render");
        assert_eq!(out.payload["failures"][0]["url"], "https://c.com/missing");
        assert_eq!(out.payload["error"]["code"], "partial_failure");
        assert!(out.markdown.contains("Content for https://a.com/doc."));
        assert!(!out.markdown.contains("menu"));
        assert!(out.markdown.contains("use_llm: true"));
    }

    #[tokio::test]
    async fn llm_extraction_with_fallback_on_failure() {
        let usage = Usage::default();
        let out = scrape_links(
            &FakeScrape,
            Some(&FakeLlm),
            &usage,
            &RetryPolicy::none(),
            input(
                &["https://a.com/ok", "https://b.com/llmfail"],
                true,
                Some("prices"),
            ),
        )
        .await;
        assert!(out.ok);
        assert!(out.markdown.contains("EXTRACTED Extract: prices"));
        assert!(out.markdown.contains("Content for https://b.com/llmfail."));
        assert_eq!(out.payload["pages"][0]["llm_extracted"], true);
        assert_eq!(out.payload["pages"][1]["llm_extracted"], false);
        assert!(out.payload["warnings"][0]
            .as_str()
            .unwrap()
            .contains("LLM extraction failed for 1"));
        assert_eq!(usage.snapshot().providers["openrouter"].calls, 2);
    }

    #[tokio::test]
    async fn use_llm_without_backend_warns_and_returns_markdown() {
        let out = scrape_links(
            &FakeScrape,
            None,
            &Usage::default(),
            &RetryPolicy::none(),
            input(&["https://a.com/x"], true, None),
        )
        .await;
        assert!(out.ok);
        assert_eq!(out.payload["use_llm"], false);
        assert!(out.payload["warnings"][0]
            .as_str()
            .unwrap()
            .contains("OPENROUTER_API_KEY"));
    }

    #[tokio::test]
    async fn all_failed_is_an_error() {
        let out = scrape_links(
            &FakeScrape,
            None,
            &Usage::default(),
            &RetryPolicy::none(),
            input(&["https://a.com/missing"], false, None),
        )
        .await;
        assert!(!out.ok);
        assert_eq!(out.payload["error"]["code"], "upstream_error");
        assert!(out.markdown.starts_with("# scrape_links failed"));
    }
}
