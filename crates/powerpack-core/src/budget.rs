//! Token budgeting: split a fixed allowance across N items and clip text to fit.

pub const REDDIT_COMMENT_TOKENS: usize = 20_000;
pub const SCRAPE_TOKENS: usize = 32_000;
pub const RESEARCH_TOKENS: usize = 32_000;

/// Rough chars-per-token ratio for English prose.
pub const CHARS_PER_TOKEN: usize = 4;

pub const TRUNCATION_MARKER: &str = "\n\n[... truncated to fit token budget ...]";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenBudget {
    pub total: usize,
    pub floor: usize,
    pub cap: usize,
}

impl TokenBudget {
    pub const fn new(total: usize, floor: usize, cap: usize) -> Self {
        Self { total, floor, cap }
    }

    /// Per-item allowance when `n` items share this budget.
    pub fn per_item(&self, n: usize) -> usize {
        if n == 0 {
            return 0;
        }
        (self.total / n).min(self.cap).max(self.floor)
    }

    pub fn split(&self, n: usize) -> Vec<usize> {
        vec![self.per_item(n); n]
    }
}

pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(CHARS_PER_TOKEN)
}

/// Clip `text` to roughly `tokens` tokens. Returns the clipped text and whether anything
/// was dropped.
pub fn truncate_to_tokens(text: &str, tokens: usize) -> (String, bool) {
    let max_chars = tokens.saturating_mul(CHARS_PER_TOKEN);
    if text.chars().count() <= max_chars {
        return (text.to_string(), false);
    }
    let byte_end = text
        .char_indices()
        .nth(max_chars)
        .map(|(i, _)| i)
        .unwrap_or(text.len());
    let window = &text[..byte_end];

    // Prefer a clean paragraph/line break in the last fifth of the window.
    let min_cut = window.len() - window.len() / 5;
    let cut = window
        .rfind("\n\n")
        .filter(|&i| i >= min_cut)
        .or_else(|| window.rfind('\n').filter(|&i| i >= min_cut))
        .unwrap_or(window.len());

    let mut out = window[..cut].trim_end().to_string();
    out.push_str(TRUNCATION_MARKER);
    (out, true)
}
