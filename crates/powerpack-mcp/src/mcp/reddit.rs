//! `get_reddit_post`: concurrent thread fetches sharing one comment token budget.

use super::envelope::{failure_item, partial_failure, ToolOutput};
use super::usage::Usage;
use powerpack_core::batch::REDDIT_URLS;
use powerpack_core::budget::{
    estimate_tokens, truncate_to_tokens, TokenBudget, REDDIT_COMMENT_TOKENS,
};
use powerpack_core::errors::{Tool, ToolError};
use powerpack_core::report::{Report, Section};
use powerpack_core::{CommentSort, Error, PostRef, RedditBackend, RedditPost, Result};
use powerpack_local::pool::{bounded_map, with_retry, RetryPolicy, REDDIT_CONCURRENCY};
use powerpack_local::reddit::parse_post_url;
use schemars::JsonSchema;
use serde::Deserialize;
use std::fmt::Write as _;
use std::time::Instant;

pub(crate) const DEFAULT_MAX_COMMENTS: usize = 100;
pub(crate) const MAX_COMMENTS_LIMIT: usize = 500;
const SELFTEXT_TOKENS: usize = 2_000;
const COMMENT_BUDGET: TokenBudget =
    TokenBudget::new(REDDIT_COMMENT_TOKENS, 500, REDDIT_COMMENT_TOKENS);

#[derive(Debug, Deserialize, JsonSchema, Default)]
pub(crate) struct GetRedditPostArgs {
    /// Reddit thread URLs, e.g. https://www.reddit.com/r/rust/comments/abc123/title/ (1-50).
    #[serde(default)]
    pub urls: Vec<String>,
    /// Include the comment tree (default true).
    #[serde(default)]
    pub fetch_comments: Option<bool>,
    /// Comments to fetch per post (1-500, default 100).
    #[serde(default)]
    pub max_comments: Option<usize>,
    /// Comment order: top | best | new | controversial | old (default top).
    #[serde(default)]
    pub sort: Option<String>,
}

#[derive(Debug, Clone)]
pub(crate) struct GetRedditPostInput {
    /// Every requested URL, in order, with its parsed post id or the parse error.
    pub targets: Vec<(String, Result<PostRef>)>,
    pub fetch_comments: bool,
    pub max_comments: usize,
    pub sort: CommentSort,
}

pub(crate) fn validate(args: GetRedditPostArgs) -> Result<GetRedditPostInput> {
    let urls = REDDIT_URLS.normalize(args.urls)?;
    let targets: Vec<(String, Result<PostRef>)> = urls
        .into_iter()
        .map(|u| {
            let parsed = parse_post_url(&u);
            (u, parsed)
        })
        .collect();
    if targets.iter().all(|(_, r)| r.is_err()) {
        if let Some((_, Err(e))) = targets.first() {
            return Err(e.clone());
        }
    }

    let max_comments = args.max_comments.unwrap_or(DEFAULT_MAX_COMMENTS);
    if !(1..=MAX_COMMENTS_LIMIT).contains(&max_comments) {
        return Err(Error::InvalidInput(format!(
            "max_comments must be between 1 and {MAX_COMMENTS_LIMIT}, got {max_comments}"
        )));
    }
    let sort = match args.sort.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        None => CommentSort::default(),
        Some(s) => CommentSort::parse(s).ok_or_else(|| {
            Error::InvalidInput(format!(
                "sort must be one of top, best, new, controversial, old; got {s:?}"
            ))
        })?,
    };
    Ok(GetRedditPostInput {
        targets,
        fetch_comments: args.fetch_comments.unwrap_or(true),
        max_comments,
        sort,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RenderedCounts {
    pub shown: usize,
    pub omitted: usize,
}

fn indent_body(body: &str, pad: &str) -> String {
    body.lines()
        .map(str::trim_end)
        .filter(|l| !l.is_empty())
        .collect::<Vec<_>>()
        .join(&format!("\n{pad}  "))
}

/// Render one post; comments stop once `comment_tokens` is spent.
pub(crate) fn render_post(
    post: &RedditPost,
    comment_tokens: usize,
    sort: CommentSort,
) -> (String, RenderedCounts) {
    let mut out = String::new();
    let ratio = post
        .upvote_ratio
        .map(|r| format!(" ({:.0}% upvoted)", r * 100.0))
        .unwrap_or_default();
    let _ = writeln!(
        out,
        "**u/{}** | {} points{ratio} | {} comments | [thread]({})",
        post.author, post.score, post.num_comments, post.permalink
    );
    if !post.url.is_empty() && !post.url.contains("reddit.com") {
        let _ = writeln!(out, "\nLink: {}", post.url);
    }
    let selftext = post.selftext.trim();
    if !selftext.is_empty() {
        let (text, _) = truncate_to_tokens(selftext, SELFTEXT_TOKENS);
        let _ = writeln!(out, "\n{text}");
    }

    let mut counts = RenderedCounts {
        shown: 0,
        omitted: 0,
    };
    if post.comments.is_empty() {
        return (out, counts);
    }

    let mut lines = String::new();
    let mut used = 0usize;
    for (i, c) in post.comments.iter().enumerate() {
        let pad = "  ".repeat(c.depth);
        let op = if c.is_op { " [OP]" } else { "" };
        let line = format!(
            "{pad}- **u/{}**{op} ({} points): {}\n",
            c.author,
            c.score,
            indent_body(&c.body, &pad)
        );
        let t = estimate_tokens(&line);
        if used + t > comment_tokens {
            if counts.shown == 0 {
                let (clipped, _) = truncate_to_tokens(&line, comment_tokens);
                lines.push_str(clipped.trim_end());
                lines.push('\n');
                counts.shown = 1;
                counts.omitted = post.comments.len() - 1;
            } else {
                counts.omitted = post.comments.len() - i;
            }
            break;
        }
        used += t;
        lines.push_str(&line);
        counts.shown += 1;
    }

    let _ = writeln!(
        out,
        "\n### Comments ({} of {} fetched, sorted by {})\n",
        counts.shown,
        post.comments.len(),
        match sort {
            CommentSort::Best => "best",
            s => s.as_str(),
        }
    );
    out.push_str(&lines);
    if counts.omitted > 0 {
        let _ = writeln!(
            out,
            "\n_{} more comment(s) omitted to fit the token budget._",
            counts.omitted
        );
    }
    (out, counts)
}

pub(crate) async fn get_reddit_post(
    backend: &dyn RedditBackend,
    usage: &Usage,
    policy: &RetryPolicy,
    input: GetRedditPostInput,
) -> ToolOutput {
    let tool = Tool::GetRedditPost;
    let limit = if input.fetch_comments {
        input.max_comments
    } else {
        0
    };
    let sort = input.sort;

    let valid: Vec<&PostRef> = input
        .targets
        .iter()
        .filter_map(|(_, r)| r.as_ref().ok())
        .collect();
    let fetched = bounded_map(valid, REDDIT_CONCURRENCY, |post| async move {
        let t0 = Instant::now();
        let r = with_retry(policy, "reddit", || backend.fetch_post(post, sort, limit)).await;
        usage.record_result("reddit", &r, t0.elapsed().as_millis() as u64);
        r
    })
    .await;

    let mut fetched = fetched.into_iter();
    let mut results: Vec<(String, Result<RedditPost>)> = Vec::with_capacity(input.targets.len());
    for (url, parsed) in input.targets {
        let r = match parsed {
            Ok(_) => fetched
                .next()
                .unwrap_or_else(|| Err(Error::Network(format!("no result for {url}")))),
            Err(e) => Err(e),
        };
        results.push((url, r));
    }

    let n = results.len();
    let ok_count = results.iter().filter(|(_, r)| r.is_ok()).count();
    let failures: Vec<(&str, &Error)> = results
        .iter()
        .filter_map(|(u, r)| r.as_ref().err().map(|e| (u.as_str(), e)))
        .collect();
    let failure_items: Vec<serde_json::Value> = failures
        .iter()
        .map(|(u, e)| failure_item("url", u, e))
        .collect();

    if ok_count == 0 {
        let err = match failures.first() {
            Some((_, e)) => {
                let mut te = ToolError::from_error(tool, e);
                te.message = format!("all {n} posts failed; first error: {}", te.message);
                te
            }
            None => ToolError::from_error(tool, &Error::Network("no posts fetched".to_string())),
        };
        let details = serde_json::json!({ "failures": failure_items });
        return ToolOutput::failure_with(tool, err, details);
    }

    let per_post = COMMENT_BUDGET.per_item(ok_count);
    let mut report = Report::new(format!("Reddit posts: {ok_count} of {n} fetched"));
    let mut posts_json = Vec::new();
    let mut shown_total = 0usize;
    let mut omitted_total = 0usize;

    for (url, r) in &results {
        let Ok(post) = r else { continue };
        let (body, counts) = render_post(post, per_post, sort);
        shown_total += counts.shown;
        omitted_total += counts.omitted;
        let heading = format!("r/{}: {}", post.subreddit, post.title.trim());
        report = report.section(Section::new(heading, body));
        posts_json.push(serde_json::json!({
            "url": url,
            "subreddit": post.subreddit,
            "id": post.id,
            "title": post.title,
            "author": post.author,
            "score": post.score,
            "upvote_ratio": post.upvote_ratio,
            "num_comments": post.num_comments,
            "created_utc": post.created_utc,
            "permalink": post.permalink,
            "comments_fetched": post.comments.len(),
            "comments_shown": counts.shown,
            "comments_omitted": counts.omitted,
        }));
    }

    if !failures.is_empty() {
        let mut body = String::new();
        for (u, e) in &failures {
            let _ = writeln!(body, "- {u}: {e}");
        }
        report = report.section(Section::new("Failed", body));
    }

    report = report.summary(format!("{ok_count} of {n} post(s) fetched"));
    if input.fetch_comments {
        report = report.summary(format!(
            "{shown_total} comment(s) shown, about {per_post} tokens of comments per post"
        ));
        if omitted_total > 0 {
            report = report.summary(format!("{omitted_total} comment(s) omitted to fit the budget"));
        }
    } else {
        report = report.summary("Comments skipped (fetch_comments=false)");
    }

    report = report
        .next_step("Read pages linked from the threads with `scrape_links`.")
        .next_step("Find more discussions on the topic with `search_reddit`.");
    if omitted_total > 0 {
        report = report.next_step("Fetch fewer posts per call to give each post a larger comment budget.");
    }
    if !failures.is_empty() {
        report = report.next_step("Retry only the failed URLs with `get_reddit_post`.");
    }

    let mut payload = serde_json::json!({
        "requested": n,
        "fetched": ok_count,
        "sort": sort,
        "fetch_comments": input.fetch_comments,
        "comment_tokens_per_post": per_post,
        "comments_shown": shown_total,
        "comments_omitted": omitted_total,
        "posts": posts_json,
        "failures": failure_items,
    });
    if !failures.is_empty() {
        payload["error"] = partial_failure(tool, failures.len(), n, "posts").to_json();
    }
    ToolOutput::success(report.render(), payload)
}
