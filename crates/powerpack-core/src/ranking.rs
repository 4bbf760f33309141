//! Cross-query aggregation: merge result lists from many queries and rank URLs by how
//! often and how high they appear.

use crate::SearchResponse;
use serde::Serialize;
use std::collections::{HashMap, HashSet};

/// Click-through-style weights for ranks 1..=10.
pub const POSITION_WEIGHTS: [f64; 10] = [
    100.0, 60.0, 48.89, 33.33, 28.89, 26.44, 24.44, 17.78, 13.33, 12.56,
];
/// Weight for anything past rank 10.
pub const TAIL_WEIGHT: f64 = 10.0;

const TRACKING_PARAMS: [&str; 4] = ["ref", "fbclid", "gclid", "ref_src"];

pub fn position_weight(position: usize) -> f64 {
    match position {
        0 => POSITION_WEIGHTS[0],
        p if p <= POSITION_WEIGHTS.len() => POSITION_WEIGHTS[p - 1],
        _ => TAIL_WEIGHT,
    }
}

/// Identity key for a URL: same page, different tracking noise, same key.
pub fn normalize_url(raw: &str) -> String {
    let Ok(mut u) = url::Url::parse(raw.trim()) else {
        return raw.trim().to_ascii_lowercase();
    };
    u.set_fragment(None);
    if let Some(host) = u.host_str() {
        let host = host.to_ascii_lowercase();
        let host = host.strip_prefix("www.").unwrap_or(&host).to_string();
        let _ = u.set_host(Some(&host));
    }
    let kept: Vec<(String, String)> = u
        .query_pairs()
        .filter(|(k, _)| {
            let k = k.to_ascii_lowercase();
            !k.starts_with("utm_") && !TRACKING_PARAMS.contains(&k.as_str())
        })
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    if kept.is_empty() {
        u.set_query(None);
    } else {
        u.query_pairs_mut().clear().extend_pairs(kept);
    }
    let path = u.path().to_string();
    if path.len() > 1 && path.ends_with('/') {
        u.set_path(path.trim_end_matches('/'));
    }
    let s = u.to_string();
    // Url renders "http://host/" for an empty path; keep root URLs bare.
    match s.strip_suffix('/') {
        Some(bare) if u.path() == "/" && u.query().is_none() => bare.to_string(),
        _ => s,
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RankedUrl {
    pub url: String,
    pub key: String,
    pub title: String,
    pub snippet: Option<String>,
    pub date: Option<String>,
    pub score: f64,
    pub frequency: usize,
    pub best_position: usize,
    pub queries: Vec<String>,
    pub consensus: bool,
}

pub fn default_consensus_threshold(query_count: usize) -> usize {
    query_count.clamp(1, 3)
}

pub fn rank(responses: &[SearchResponse], threshold: Option<usize>) -> Vec<RankedUrl> {
    let threshold = threshold
        .unwrap_or_else(|| default_consensus_threshold(responses.len()))
        .max(1);

    let mut order: Vec<RankedUrl> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    for resp in responses {
        let mut seen_here: HashSet<String> = HashSet::new();
        for hit in &resp.hits {
            let key = normalize_url(&hit.url);
            // A URL repeated within one query only counts at its best rank.
            if !seen_here.insert(key.clone()) {
                continue;
            }
            let w = position_weight(hit.position);
            match index.get(&key) {
                Some(&i) => {
                    let r = &mut order[i];
                    r.score += w;
                    r.frequency += 1;
                    r.queries.push(resp.query.clone());
                    if hit.position < r.best_position {
                        r.best_position = hit.position;
                        r.url = hit.url.clone();
                        r.title = hit.title.clone();
                        r.snippet = hit.snippet.clone();
                        r.date = hit.date.clone();
                    }
                }
                None => {
                    index.insert(key.clone(), order.len());
                    order.push(RankedUrl {
                        url: hit.url.clone(),
                        key,
                        title: hit.title.clone(),
                        snippet: hit.snippet.clone(),
                        date: hit.date.clone(),
                        score: w,
                        frequency: 1,
                        best_position: hit.position,
                        queries: vec![resp.query.clone()],
                        consensus: false,
                    });
                }
            }
        }
    }

    for r in &mut order {
        r.score = (r.score * 100.0).round() / 100.0;
        r.consensus = r.frequency >= threshold;
    }

    // sort_by is stable, so ties keep first-seen order.
    order.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| b.frequency.cmp(&a.frequency))
    });
    order
}
