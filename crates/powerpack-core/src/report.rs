//! Markdown report shape shared by every tool.
//!
//! Reports follow a fixed "70/20/10" layout: a short summary up top, the data sections
//! carrying most of the content, and a small next-steps block the agent can act on.

use crate::errors::ToolError;
use std::fmt::Write as _;

#[derive(Debug, Clone, Default)]
pub struct Section {
    pub heading: String,
    pub body: String,
}

impl Section {
    pub fn new(heading: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            heading: heading.into(),
            body: body.into(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Report {
    pub title: String,
    pub summary: Vec<String>,
    pub sections: Vec<Section>,
    pub next_steps: Vec<String>,
    pub footer: Option<String>,
}

impl Report {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Default::default()
        }
    }

    pub fn summary(mut self, line: impl Into<String>) -> Self {
        self.summary.push(line.into());
        self
    }

    pub fn section(mut self, s: Section) -> Self {
        self.sections.push(s);
        self
    }

    pub fn next_step(mut self, step: impl Into<String>) -> Self {
        self.next_steps.push(step.into());
        self
    }

    pub fn footer(mut self, f: impl Into<String>) -> Self {
        self.footer = Some(f.into());
        self
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "# {}\n", self.title.trim());

        if !self.summary.is_empty() {
            out.push_str("## Summary\n\n");
            for line in &self.summary {
                let _ = writeln!(out, "- {}", line.trim());
            }
            out.push('\n');
        }

        for s in &self.sections {
            let _ = writeln!(out, "## {}\n", s.heading.trim());
            let body = s.body.trim_end();
            if !body.is_empty() {
                let _ = writeln!(out, "{body}\n");
            }
        }

        if !self.next_steps.is_empty() {
            out.push_str("## Next Steps\n\n");
            for (i, step) in self.next_steps.iter().enumerate() {
                let _ = writeln!(out, "{}. {}", i + 1, step.trim());
            }
            out.push('\n');
        }

        if let Some(f) = &self.footer {
            let _ = writeln!(out, "---\n*{}*", f.trim());
        }
        out.trim_end().to_string() + "\n"
    }
}

pub fn render_error(tool: &str, e: &ToolError) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "# {tool} failed\n");
    let _ = writeln!(out, "**Error:** `{}` {}\n", e.code.as_str(), e.message);
    let _ = writeln!(
        out,
        "**Retryable:** {}. {}\n",
        if e.retryable { "yes" } else { "no" },
        e.retry_hint
    );
    if !e.how_to_fix.is_empty() {
        out.push_str("## How to fix\n\n");
        for (i, step) in e.how_to_fix.iter().enumerate() {
            let _ = writeln!(out, "{}. {step}", i + 1);
        }
        out.push('\n');
    }
    if !e.alternatives.is_empty() {
        out.push_str("## Alternatives\n\n");
        for alt in &e.alternatives {
            let _ = writeln!(out, "- `{alt}`");
        }
    }
    out.trim_end().to_string() + "\n"
}

/// Escape characters that would break a markdown table cell.
pub fn table_cell(s: &str) -> String {
    s.replace('|', "\\|").replace('\n', " ")
}
