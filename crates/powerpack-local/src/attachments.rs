//! Local file attachments inlined into deep-research prompts.

use powerpack_core::{Error, Result};
use serde::Deserialize;
use std::path::Path;
use tokio::io::AsyncBufReadExt;

/// Hard cap on the bytes one attachment contributes to a prompt.
pub const MAX_ATTACHMENT_BYTES: u64 = 256 * 1024;

#[derive(Debug, Clone, Deserialize, Default)]
pub struct FileAttachment {
    pub path: String,
    /// 1-based, inclusive.
    #[serde(default)]
    pub start_line: Option<usize>,
    /// 1-based, inclusive.
    #[serde(default)]
    pub end_line: Option<usize>,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone)]
pub struct LoadedAttachment {
    pub path: String,
    pub first_line: usize,
    pub last_line: usize,
    pub total_lines: usize,
    pub language: &'static str,
    pub description: Option<String>,
    pub content: String,
}

impl LoadedAttachment {
    /// Markdown block suitable for a prompt.
    pub fn to_prompt_block(&self) -> String {
        let mut out = format!(
            "### File: `{}` (lines {}-{} of {})\n",
            self.path, self.first_line, self.last_line, self.total_lines
        );
        if let Some(d) = &self.description {
            out.push_str(&format!("_{}_\n", d.trim()));
        }
        out.push_str(&format!("```{}\n{}\n```\n", self.language, self.content.trim_end()));
        out
    }
}

fn language_for(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .as_deref()
    {
        Some("rs") => "rust",
        Some("py") => "python",
        Some("ts") | Some("tsx") => "typescript",
        Some("js") | Some("jsx") | Some("mjs") => "javascript",
        Some("go") => "go",
        Some("java") => "java",
        Some("c") | Some("h") => "c",
        Some("cpp") | Some("cc") | Some("hpp") => "cpp",
        Some("json") => "json",
        Some("toml") => "toml",
        Some("yaml") | Some("yml") => "yaml",
        Some("md") => "markdown",
        Some("sh") => "bash",
        Some("sql") => "sql",
        _ => "",
    }
}

fn unreadable(path: &str, e: std::io::Error) -> Error {
    Error::InvalidInput(format!("cannot read {path}: {e}"))
}

/// Read the requested line range. Lines are streamed, so only the selected slice is held
/// in memory even for files past [`MAX_ATTACHMENT_BYTES`].
pub async fn load_attachment(a: &FileAttachment) -> Result<LoadedAttachment> {
    let path = Path::new(a.path.trim());
    if a.path.trim().is_empty() {
        return Err(Error::InvalidInput("attachment path is empty".to_string()));
    }
    let meta = tokio::fs::metadata(path)
        .await
        .map_err(|e| unreadable(&a.path, e))?;
    if !meta.is_file() {
        return Err(Error::InvalidInput(format!("{} is not a file", a.path)));
    }
    if meta.len() > MAX_ATTACHMENT_BYTES && a.start_line.is_none() && a.end_line.is_none() {
        return Err(Error::InvalidInput(format!(
            "{} is {} bytes; pass start_line/end_line to attach a slice (limit {MAX_ATTACHMENT_BYTES} bytes)",
            a.path,
            meta.len()
        )));
    }

    let first = a.start_line.unwrap_or(1).max(1);
    let wanted_last = a.end_line.unwrap_or(usize::MAX);
    let file = tokio::fs::File::open(path)
        .await
        .map_err(|e| unreadable(&a.path, e))?;
    let mut reader = tokio::io::BufReader::new(file);
    let mut buf = Vec::new();
    let mut selected: Vec<String> = Vec::new();
    let mut selected_bytes = 0u64;
    let mut total = 0usize;
    loop {
        buf.clear();
        let n = reader
            .read_until(b'\n', &mut buf)
            .await
            .map_err(|e| unreadable(&a.path, e))?;
        if n == 0 {
            break;
        }
        total += 1;
        if total < first || total > wanted_last {
            continue;
        }
        let raw = String::from_utf8_lossy(&buf);
        let line = raw.strip_suffix('\n').unwrap_or(&raw);
        let line = line.strip_suffix('\r').unwrap_or(line);
        selected_bytes += line.len() as u64 + u64::from(!selected.is_empty());
        if selected_bytes > MAX_ATTACHMENT_BYTES {
            return Err(Error::InvalidInput(format!(
                "selected range of {} exceeds {MAX_ATTACHMENT_BYTES} bytes",
                a.path
            )));
        }
        selected.push(line.to_string());
    }

    let last = wanted_last.min(total);
    if total > 0 && first > last {
        return Err(Error::InvalidInput(format!(
            "invalid line range {first}-{} for {} ({total} lines)",
            a.end_line.unwrap_or(total),
            a.path
        )));
    }

    Ok(LoadedAttachment {
        path: a.path.trim().to_string(),
        first_line: if total == 0 { 0 } else { first },
        last_line: last,
        total_lines: total,
        language: language_for(path),
        description: a.description.clone().filter(|d| !d.trim().is_empty()),
        content: selected.join("\n"),
    })
}
