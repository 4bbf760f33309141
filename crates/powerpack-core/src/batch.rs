//! Min/max bounds for batch-shaped tool inputs.

use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchBounds {
    pub field: &'static str,
    pub min: usize,
    pub max: usize,
}

pub const WEB_SEARCH_KEYWORDS: BatchBounds = BatchBounds {
    field: "keywords",
    min: 1,
    max: 100,
};
pub const REDDIT_QUERIES: BatchBounds = BatchBounds {
    field: "queries",
    min: 1,
    max: 50,
};
pub const REDDIT_URLS: BatchBounds = BatchBounds {
    field: "urls",
    min: 1,
    max: 50,
};
pub const SCRAPE_URLS: BatchBounds = BatchBounds {
    field: "urls",
    min: 1,
    max: 50,
};
pub const RESEARCH_QUESTIONS: BatchBounds = BatchBounds {
    field: "questions",
    min: 1,
    max: 10,
};

impl BatchBounds {
    pub fn validate(&self, len: usize) -> Result<()> {
        if len < self.min {
            return Err(Error::InvalidInput(format!(
                "{} needs at least {} item(s), got {len}",
                self.field, self.min
            )));
        }
        if len > self.max {
            return Err(Error::InvalidInput(format!(
                "{} accepts at most {} items, got {len}",
                self.field, self.max
            )));
        }
        Ok(())
    }

    /// Trim, drop blanks, dedup (first occurrence wins), then check bounds.
    pub fn normalize(&self, items: Vec<String>) -> Result<Vec<String>> {
        let mut seen = std::collections::HashSet::new();
        let out: Vec<String> = items
            .into_iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .filter(|s| seen.insert(s.clone()))
            .collect();
        self.validate(out.len())?;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_and_oversized_batches() {
        let b = BatchBounds {
            field: "urls",
            min: 2,
            max: 3,
        };
        let e = b.validate(1).unwrap_err();
        assert!(e.to_string().contains("at least 2"));
        assert!(b.validate(2).is_ok());
        assert!(b.validate(3).is_ok());
        let e = b.validate(4).unwrap_err();
        assert!(e.to_string().contains("at most 3"));
        assert!(e.to_string().contains("urls"));
    }

    #[test]
    fn normalize_trims_and_dedups_before_counting() {
        let v = WEB_SEARCH_KEYWORDS
            .normalize(vec![
                " rust ".to_string(),
                "rust".to_string(),
                "   ".to_string(),
                "tokio".to_string(),
            ])
            .unwrap();
        assert_eq!(v, vec!["rust".to_string(), "tokio".to_string()]);
    }

    #[test]
    fn normalize_fails_when_only_blanks_remain() {
        let e = RESEARCH_QUESTIONS
            .normalize(vec!["".to_string(), "  ".to_string()])
            .unwrap_err();
        assert!(matches!(e, Error::InvalidInput(_)));
    }
}
