//! Scraped HTML to compact markdown.

use std::io::Cursor;

/// Tags whose whole subtree is noise for a reader.
const NOISE_TAGS: [&str; 10] = [
    "script", "style", "noscript", "nav", "footer", "header", "aside", "form", "iframe", "svg",
];

/// Page chrome that is content when it sits inside an article (its byline or title block).
const CHROME_TAGS: [&str; 2] = ["header", "footer"];

/// Detach noise subtrees from the parsed document. Nested noise goes with its outermost
/// ancestor; `<header>`/`<footer>` inside `<article>` or `<main>` are kept.
fn strip_noise(doc: &mut html_scraper::Html) {
    let Ok(sel) = html_scraper::Selector::parse(&NOISE_TAGS.join(",")) else {
        return;
    };
    let ids: Vec<_> = doc
        .select(&sel)
        .filter(|el| {
            let chrome = CHROME_TAGS.contains(&el.value().name());
            !chrome
                || !el.ancestors().any(|a| {
                    a.value()
                        .as_element()
                        .is_some_and(|e| matches!(e.name(), "article" | "main"))
                })
        })
        .map(|el| (*el).id())
        .collect();
    for id in ids {
        if let Some(mut node) = doc.tree.get_mut(id) {
            node.detach();
        }
    }
}

fn main_fragment(doc: &html_scraper::Html) -> Option<String> {
    for selector in ["main", "article", "[role=main]"] {
        let Ok(sel) = html_scraper::Selector::parse(selector) else {
            continue;
        };
        let best = doc
            .select(&sel)
            .max_by_key(|el| el.text().map(|t| t.trim().len()).sum::<usize>());
        if let Some(el) = best {
            if el.text().any(|t| !t.trim().is_empty()) {
                return Some(el.html());
            }
        }
    }
    None
}

/// Page title from `<title>`, falling back to the first `<h1>`.
pub fn extract_title(html: &str) -> Option<String> {
    let doc = html_scraper::Html::parse_document(html);
    for selector in ["title", "h1"] {
        let Ok(sel) = html_scraper::Selector::parse(selector) else {
            continue;
        };
        if let Some(el) = doc.select(&sel).next() {
            let t = el
                .text()
                .collect::<Vec<_>>()
                .join(" ")
                .split_whitespace()
                .collect::<Vec<_>>()
                .join(" ");
            if !t.is_empty() {
                return Some(t);
            }
        }
    }
    None
}

fn clean(md: &str) -> String {
    let mut out = String::with_capacity(md.len());
    let mut blank_run = 0usize;
    for line in md.lines() {
        let line = line.trim_end();
        // Links whose text rendered empty carry no information.
        let stub = line.trim();
        if stub == "[]" || stub == "*" || stub == "-" {
            continue;
        }
        if line.is_empty() {
            blank_run += 1;
            if blank_run > 1 {
                continue;
            }
        } else {
            blank_run = 0;
        }
        out.push_str(line);
        out.push('\n');
    }
    out.trim().to_string()
}

/// Convert scraped HTML into cleaned markdown text.
pub fn html_to_markdown(html: &str, width: usize) -> String {
    let mut doc = html_scraper::Html::parse_document(html);
    strip_noise(&mut doc);
    let source = main_fragment(&doc).unwrap_or_else(|| doc.root_element().html());
    let width = width.clamp(40, 400);
    let rendered = html2text::from_read(Cursor::new(source.as_bytes()), width)
        .unwrap_or_else(|_| source.clone());
    clean(&rendered)
}

/// Non-HTML bodies (plain text, JSON, markdown) only need whitespace cleanup.
pub fn looks_like_html(body: &str) -> bool {
    let head: String = body.chars().take(1024).collect::<String>().to_ascii_lowercase();
    head.contains("<html")
        || head.contains("<!doctype html")
        || head.contains("<body")
        || head.contains("<div")
}

pub fn to_markdown(body: &str, width: usize) -> String {
    if looks_like_html(body) {
        html_to_markdown(body, width)
    } else {
        clean(body)
    }
}
