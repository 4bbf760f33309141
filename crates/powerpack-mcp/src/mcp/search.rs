//! `web_search` and `search_reddit`: Serper fan-out, cross-query ranking, markdown report.

use super::envelope::{failure_item, partial_failure, ToolOutput};
use super::usage::Usage;
use powerpack_core::batch::{REDDIT_QUERIES, WEB_SEARCH_KEYWORDS};
use powerpack_core::errors::{Tool, ToolError};
use powerpack_core::ranking::{default_consensus_threshold, rank, RankedUrl};
use powerpack_core::report::{table_cell, Report, Section};
use powerpack_core::{Error, Result, SearchProvider, SearchResponse};
use powerpack_local::pool::{RetryPolicy, SEARCH_CONCURRENCY};
use powerpack_local::reddit::{is_reddit_thread, reddit_search_query, subreddit_of};
use powerpack_local::serper::search_many;
use schemars::JsonSchema;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt::Write as _;

pub(crate) const DEFAULT_RESULTS_PER_KEYWORD: usize = 10;
pub(crate) const MAX_RESULTS_PER_KEYWORD: usize = 20;
const REDDIT_RESULTS_PER_QUERY: usize = 10;
const MAX_LISTED: usize = 50;
const MAX_RELATED: usize = 5;

#[derive(Debug, Deserialize, JsonSchema, Default)]
pub(crate) struct WebSearchArgs {
    /// Keywords to search; each one is a separate Google query (1-100).
    #[serde(default)]
    pub keywords: Vec<String>,
    /// Results to request per keyword (1-20, default 10).
    #[serde(default)]
    pub results_per_keyword: Option<usize>,
}

#[derive(Debug, Deserialize, JsonSchema, Default)]
pub(crate) struct SearchRedditArgs {
    /// Queries to run against Reddit threads (1-50).
    #[serde(default)]
    pub queries: Vec<String>,
    /// Only threads after this date (YYYY-MM-DD).
    #[serde(default)]
    pub date_after: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct WebSearchInput {
    pub keywords: Vec<String>,
    pub num: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct SearchRedditInput {
    pub queries: Vec<String>,
    pub date_after: Option<String>,
}

pub(crate) fn validate_web_search(args: WebSearchArgs) -> Result<WebSearchInput> {
    let keywords = WEB_SEARCH_KEYWORDS.normalize(args.keywords)?;
    let num = args
        .results_per_keyword
        .unwrap_or(DEFAULT_RESULTS_PER_KEYWORD);
    if !(1..=MAX_RESULTS_PER_KEYWORD).contains(&num) {
        return Err(Error::InvalidInput(format!(
            "results_per_keyword must be between 1 and {MAX_RESULTS_PER_KEYWORD}, got {num}"
        )));
    }
    Ok(WebSearchInput { keywords, num })
}

fn is_iso_date(s: &str) -> bool {
    let b = s.as_bytes();
    if b.len() != 10 || b[4] != b'-' || b[7] != b'-' {
        return false;
    }
    let digits = |r: std::ops::Range<usize>| -> Option<u32> {
        let part = &s[r];
        part.bytes()
            .all(|c| c.is_ascii_digit())
            .then(|| part.parse().ok())
            .flatten()
    };
    matches!(
        (digits(0..4), digits(5..7), digits(8..10)),
        (Some(_), Some(m), Some(d)) if (1..=12).contains(&m) && (1..=31).contains(&d)
    )
}

pub(crate) fn validate_search_reddit(args: SearchRedditArgs) -> Result<SearchRedditInput> {
    let queries = REDDIT_QUERIES.normalize(args.queries)?;
    let date_after = args
        .date_after
        .map(|d| d.trim().to_string())
        .filter(|d| !d.is_empty());
    if let Some(d) = &date_after {
        if !is_iso_date(d) {
            return Err(Error::InvalidInput(format!(
                "date_after must be YYYY-MM-DD, got {d:?}"
            )));
        }
    }
    Ok(SearchRedditInput {
        queries,
        date_after,
    })
}

struct FanOut {
    ok: Vec<SearchResponse>,
    failures: Vec<(String, Error)>,
}

/// Run `queries` and relabel each response with the caller-facing `labels[i]`.
async fn fan_out(
    provider: &dyn SearchProvider,
    usage: &Usage,
    policy: &RetryPolicy,
    labels: &[String],
    queries: &[String],
    num: usize,
) -> FanOut {
    let results = search_many(provider, queries, num, SEARCH_CONCURRENCY, policy).await;
    let mut out = FanOut {
        ok: Vec::new(),
        failures: Vec::new(),
    };
    for (label, r) in labels.iter().zip(results) {
        let elapsed = r.as_ref().map(|s| s.elapsed_ms as u64).unwrap_or(0);
        usage.record_result(provider.name(), &r, elapsed);
        match r {
            Ok(mut resp) => {
                resp.query = label.clone();
                out.ok.push(resp);
            }
            Err(e) => out.failures.push((label.clone(), e)),
        }
    }
    out
}

fn all_failed(tool: Tool, key: &str, plural: &str, failures: &[(String, Error)]) -> ToolOutput {
    let items: Vec<serde_json::Value> = failures
        .iter()
        .map(|(q, e)| failure_item(key, q, e))
        .collect();
    let err = match failures.first() {
        Some((_, e)) => {
            let mut te = ToolError::from_error(tool, e);
            te.message = format!(
                "all {} {plural} failed; first error: {}",
                failures.len(),
                te.message
            );
            te
        }
        None => ToolError::from_error(tool, &Error::Network("no results".to_string())),
    };
    ToolOutput::failure_with(tool, err, serde_json::json!({ "failures": items }))
}

fn link_title(r: &RankedUrl) -> String {
    let t = r.title.trim();
    let t = if t.is_empty() { r.url.as_str() } else { t };
    t.replace('[', "(").replace(']', ")")
}

fn render_ranked(list: &[RankedUrl], total_queries: usize, with_subreddit: bool) -> String {
    let mut out = String::new();
    for (i, r) in list.iter().enumerate() {
        let marker = if r.consensus { " **[consensus]**" } else { "" };
        let _ = writeln!(out, "{}. [{}]({}){marker}", i + 1, link_title(r), r.url);
        let mut meta = format!(
            "score {:.2}, in {}/{} queries, best #{}",
            r.score, r.frequency, total_queries, r.best_position
        );
        if with_subreddit {
            if let Some(sub) = subreddit_of(&r.url) {
                meta = format!("r/{sub}, {meta}");
            }
        }
        if let Some(d) = &r.date {
            let _ = write!(meta, ", {d}");
        }
        let _ = writeln!(out, "   - {meta}");
        if let Some(s) = r.snippet.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            let _ = writeln!(out, "   - {}", s.replace('\n', " "));
        }
    }
    out
}

fn per_query_table(header: &str, fan: &FanOut, order: &[String]) -> String {
    let mut out = format!("| {header} | Results | Status |\n|---|---|---|\n");
    for q in order {
        let row = match fan.ok.iter().find(|r| &r.query == q) {
            Some(r) => format!("| {} | {} | ok |", table_cell(q), r.hits.len()),
            None => {
                let msg = fan
                    .failures
                    .iter()
                    .find(|(f, _)| f == q)
                    .map(|(_, e)| e.to_string())
                    .unwrap_or_default();
                format!("| {} | 0 | failed: {} |", table_cell(q), table_cell(&msg))
            }
        };
        out.push_str(&row);
        out.push('\n');
    }
    out
}

fn related_searches(ok: &[SearchResponse]) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for r in ok {
        for q in &r.related {
            if out.len() >= MAX_RELATED {
                return out;
            }
            if !out.iter().any(|x| x.eq_ignore_ascii_case(q)) {
                out.push(q.clone());
            }
        }
    }
    out
}

pub(crate) async fn web_search(
    provider: &dyn SearchProvider,
    usage: &Usage,
    policy: &RetryPolicy,
    input: WebSearchInput,
) -> ToolOutput {
    let tool = Tool::WebSearch;
    let fan = fan_out(
        provider,
        usage,
        policy,
        &input.keywords,
        &input.keywords,
        input.num,
    )
    .await;
    if fan.ok.is_empty() {
        return all_failed(tool, "keyword", "keywords", &fan.failures);
    }

    let threshold = default_consensus_threshold(fan.ok.len());
    let ranked = rank(&fan.ok, Some(threshold));
    let consensus = ranked.iter().filter(|r| r.consensus).count();
    let listed = &ranked[..ranked.len().min(MAX_LISTED)];
    let related = related_searches(&fan.ok);
    let n = input.keywords.len();

    let mut report = Report::new(format!("Web search: {n} keyword(s)"))
        .summary(format!(
            "{n} keyword(s) searched: {} succeeded, {} failed",
            fan.ok.len(),
            fan.failures.len()
        ))
        .summary(format!(
            "{} unique URLs; {consensus} reached consensus (found by {threshold}+ keywords)",
            ranked.len()
        ));
    if ranked.len() > listed.len() {
        report = report.summary(format!("Showing the top {} by score", listed.len()));
    }
    report = report
        .section(Section::new(
            "Ranked results",
            render_ranked(listed, fan.ok.len(), false),
        ))
        .section(Section::new(
            "Per-keyword results",
            per_query_table("Keyword", &fan, &input.keywords),
        ));

    report = if consensus > 0 {
        report.next_step("Read the consensus URLs in full with `scrape_links`.")
    } else {
        report.next_step("Read the top-ranked URLs in full with `scrape_links`.")
    };
    if !related.is_empty() {
        let list = related
            .iter()
            .map(|q| format!("`{q}`"))
            .collect::<Vec<_>>()
            .join(", ");
        report = report.next_step(format!("Broaden coverage with related searches: {list}."));
    }
    report = report.next_step("Check community discussion of the same topic with `search_reddit`.");
    if !fan.failures.is_empty() {
        report = report.next_step("Re-run `web_search` with only the failed keywords.");
    }
    let report = report.footer("Score = sum of position weights (CTR curve) across keywords");

    let mut payload = serde_json::json!({
        "keywords": n,
        "results_per_keyword": input.num,
        "succeeded": fan.ok.len(),
        "failed": fan.failures.len(),
        "consensus_threshold": threshold,
        "unique_urls": ranked.len(),
        "results": listed,
        "related_searches": related,
        "failures": fan
            .failures
            .iter()
            .map(|(q, e)| failure_item("keyword", q, e))
            .collect::<Vec<_>>(),
    });
    if !fan.failures.is_empty() {
        payload["error"] = partial_failure(tool, fan.failures.len(), n, "keywords").to_json();
    }
    ToolOutput::success(report.render(), payload)
}

pub(crate) async fn search_reddit(
    provider: &dyn SearchProvider,
    usage: &Usage,
    policy: &RetryPolicy,
    input: SearchRedditInput,
) -> ToolOutput {
    let tool = Tool::SearchReddit;
    let scoped: Vec<String> = input
        .queries
        .iter()
        .map(|q| reddit_search_query(q, input.date_after.as_deref()))
        .collect();
    let fan = fan_out(
        provider,
        usage,
        policy,
        &input.queries,
        &scoped,
        REDDIT_RESULTS_PER_QUERY,
    )
    .await;
    if fan.ok.is_empty() {
        return all_failed(tool, "query", "queries", &fan.failures);
    }

    let threshold = default_consensus_threshold(fan.ok.len());
    let threads: Vec<RankedUrl> = rank(&fan.ok, Some(threshold))
        .into_iter()
        .filter(|r| is_reddit_thread(&r.url))
        .collect();
    let listed = &threads[..threads.len().min(MAX_LISTED)];

    let mut subs: BTreeMap<String, usize> = BTreeMap::new();
    for r in &threads {
        if let Some(s) = subreddit_of(&r.url) {
            *subs.entry(s.to_ascii_lowercase()).or_insert(0) += 1;
        }
    }
    let mut top_subs: Vec<(String, usize)> = subs.into_iter().collect();
    top_subs.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

    let n = input.queries.len();
    let plural = if n == 1 { "y" } else { "ies" };
    let mut report = Report::new(format!("Reddit search: {n} quer{plural}"))
        .summary(format!(
            "{n} quer{plural} searched: {} succeeded, {} failed",
            fan.ok.len(),
            fan.failures.len()
        ))
        .summary(format!(
            "{} unique threads; {} reached consensus (found by {threshold}+ queries)",
            threads.len(),
            threads.iter().filter(|r| r.consensus).count()
        ));
    if let Some(d) = &input.date_after {
        report = report.summary(format!("Limited to threads after {d}"));
    }
    if !top_subs.is_empty() {
        let list = top_subs
            .iter()
            .take(5)
            .map(|(s, c)| format!("r/{s} ({c})"))
            .collect::<Vec<_>>()
            .join(", ");
        report = report.summary(format!("Top subreddits: {list}"));
    }
    let body = if threads.is_empty() {
        "No Reddit threads matched. Try broader wording or drop `date_after`.".to_string()
    } else {
        render_ranked(listed, fan.ok.len(), true)
    };
    report = report
        .section(Section::new("Threads", body))
        .section(Section::new(
            "Per-query results",
            per_query_table("Query", &fan, &input.queries),
        ));
    if !threads.is_empty() {
        let urls = listed
            .iter()
            .take(10)
            .map(|r| format!("\"{}\"", r.url))
            .collect::<Vec<_>>()
            .join(", ");
        report = report.next_step(format!(
            "Fetch the top threads with comments: `get_reddit_post` with `urls: [{urls}]`."
        ));
    }
    report = report.next_step("Cross-check claims from threads against sources with `web_search`.");
    if !fan.failures.is_empty() {
        report = report.next_step("Re-run `search_reddit` with only the failed queries.");
    }

    let mut payload = serde_json::json!({
        "queries": n,
        "date_after": input.date_after,
        "succeeded": fan.ok.len(),
        "failed": fan.failures.len(),
        "consensus_threshold": threshold,
        "unique_threads": threads.len(),
        "results": listed,
        "subreddits": top_subs
            .iter()
            .map(|(s, c)| serde_json::json!({"subreddit": s, "threads": c}))
            .collect::<Vec<_>>(),
        "failures": fan
            .failures
            .iter()
            .map(|(q, e)| failure_item("query", q, e))
            .collect::<Vec<_>>(),
    });
    if !fan.failures.is_empty() {
        payload["error"] = partial_failure(tool, fan.failures.len(), n, "queries").to_json();
    }
    ToolOutput::success(report.render(), payload)
}
