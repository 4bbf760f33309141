//! `deep_research`: one web-enabled OpenRouter call per question, with optional local file
//! context and per-question token budgets.

use super::envelope::{failure_item, partial_failure, ToolOutput};
use super::usage::Usage;
use powerpack_core::batch::RESEARCH_QUESTIONS;
use powerpack_core::budget::{truncate_to_tokens, TokenBudget, RESEARCH_TOKENS};
use powerpack_core::errors::{Tool, ToolError};
use powerpack_core::report::{Report, Section};
use powerpack_core::{ChatMessage, ChatRequest, ChatResponse, Error, LlmBackend, Result};
use powerpack_local::attachments::{load_attachment, FileAttachment};
use powerpack_local::pool::{bounded_map, with_retry, RetryPolicy, LLM_CONCURRENCY};
use schemars::JsonSchema;
use serde::Deserialize;
use std::fmt::Write as _;
use std::time::Instant;

const QUESTION_BUDGET: TokenBudget = TokenBudget::new(RESEARCH_TOKENS, 2_000, 16_000);
/// Prompt-side budget for one question's attached files, split across the files.
const ATTACHMENT_BUDGET: TokenBudget = TokenBudget::new(24_000, 1_000, 12_000);
const RESEARCH_TIMEOUT_MS: u64 = 180_000;
const WEB_RESULTS: u32 = 20;
const MAX_ATTACHMENTS: usize = 10;
const MAX_QUESTION_CHARS: usize = 4_000;

const RESEARCH_SYSTEM_PROMPT: &str = "You are a research analyst with live web search. \
Answer the question thoroughly using current sources. Structure the answer in markdown: \
start with a short direct answer, then the supporting detail, then caveats or open \
questions. Prefer primary sources, give concrete numbers, versions and dates, and note \
where sources disagree. When files are attached, ground the answer in them and refer to \
them by path and line.";

#[derive(Debug, Deserialize, JsonSchema, Default, Clone)]
pub(crate) struct AttachmentArg {
    /// Path to a local text file.
    pub path: String,
    /// First line to include (1-based, inclusive).
    #[serde(default)]
    pub start_line: Option<usize>,
    /// Last line to include (1-based, inclusive).
    #[serde(default)]
    pub end_line: Option<usize>,
    /// Why this file matters to the question.
    #[serde(default)]
    pub description: Option<String>,
}

impl From<AttachmentArg> for FileAttachment {
    fn from(a: AttachmentArg) -> Self {
        FileAttachment {
            path: a.path,
            start_line: a.start_line,
            end_line: a.end_line,
            description: a.description,
        }
    }
}

#[derive(Debug, Deserialize, JsonSchema, Default, Clone)]
pub(crate) struct QuestionArg {
    /// A self-contained research question. Include context, constraints and what a good
    /// answer looks like.
    pub question: String,
    /// Local files to include as context (code, configs, notes).
    #[serde(default)]
    pub file_attachments: Option<Vec<AttachmentArg>>,
}

#[derive(Debug, Deserialize, JsonSchema, Default)]
pub(crate) struct DeepResearchArgs {
    /// Research questions, answered in parallel (1-10).
    #[serde(default)]
    pub questions: Vec<QuestionArg>,
}

#[derive(Debug, Clone)]
pub(crate) struct ResearchQuestion {
    pub question: String,
    pub attachments: Vec<FileAttachment>,
}

/// Trim questions, drop blank ones and fold exact duplicates into their first occurrence
/// (attachments are merged), then check the batch bounds.
pub(crate) fn validate(args: DeepResearchArgs) -> Result<Vec<ResearchQuestion>> {
    let mut out: Vec<ResearchQuestion> = Vec::new();
    for q in args.questions {
        let question = q.question.trim();
        if question.is_empty() {
            continue;
        }
        let attachments = q
            .file_attachments
            .unwrap_or_default()
            .into_iter()
            .map(FileAttachment::from);
        match out.iter_mut().find(|r| r.question == question) {
            Some(existing) => existing.attachments.extend(attachments),
            None => out.push(ResearchQuestion {
                question: question.to_string(),
                attachments: attachments.collect(),
            }),
        }
    }
    RESEARCH_QUESTIONS.validate(out.len())?;
    for (i, q) in out.iter().enumerate() {
        if q.question.chars().count() > MAX_QUESTION_CHARS {
            return Err(Error::InvalidInput(format!(
                "questions[{i}].question exceeds {MAX_QUESTION_CHARS} characters"
            )));
        }
        if q.attachments.len() > MAX_ATTACHMENTS {
            return Err(Error::InvalidInput(format!(
                "questions[{i}] has {} attachments; at most {MAX_ATTACHMENTS} allowed",
                q.attachments.len()
            )));
        }
    }
    Ok(out)
}

struct Prepared {
    prompt: String,
    attached: Vec<String>,
    warnings: Vec<String>,
}

async fn prepare(q: &ResearchQuestion) -> Prepared {
    let mut prompt = q.question.clone();
    let mut attached = Vec::new();
    let mut warnings = Vec::new();
    let mut blocks = String::new();
    let per_file = ATTACHMENT_BUDGET.per_item(q.attachments.len());
    for a in &q.attachments {
        match load_attachment(a).await {
            Ok(mut l) => {
                let (content, truncated) = truncate_to_tokens(&l.content, per_file);
                if truncated {
                    warnings.push(format!("{} truncated to about {per_file} tokens", l.path));
                    l.content = content;
                }
                attached.push(format!("{}:{}-{}", l.path, l.first_line, l.last_line));
                blocks.push_str(&l.to_prompt_block());
                blocks.push('\n');
            }
            Err(e) => warnings.push(format!("attachment skipped: {e}")),
        }
    }
    if !blocks.is_empty() {
        let _ = write!(prompt, "\n\n## Attached files\n\n{blocks}");
    }
    Prepared {
        prompt,
        attached,
        warnings,
    }
}

async fn ask(
    llm: &dyn LlmBackend,
    usage: &Usage,
    policy: &RetryPolicy,
    prompt: &str,
    max_tokens: usize,
) -> Result<ChatResponse> {
    let req = ChatRequest {
        messages: vec![
            ChatMessage::system(RESEARCH_SYSTEM_PROMPT),
            ChatMessage::user(prompt),
        ],
        max_tokens: Some(max_tokens as u64),
        reasoning_effort: Some("high".to_string()),
        web_search_results: Some(WEB_RESULTS),
        timeout_ms: RESEARCH_TIMEOUT_MS,
        ..Default::default()
    };
    let t0 = Instant::now();
    let r = with_retry(policy, "openrouter", || llm.chat(&req)).await;
    usage.record_result("openrouter", &r, t0.elapsed().as_millis() as u64);
    let resp = r?;
    if resp.content.trim().is_empty() {
        return Err(Error::Llm("research model returned an empty answer".to_string()));
    }
    Ok(resp)
}

fn render_answer(
    resp: &ChatResponse,
    budget: usize,
    attached: &[String],
    warnings: &[String],
) -> (String, bool) {
    let (answer, truncated) = truncate_to_tokens(resp.content.trim(), budget);
    let mut body = answer;
    if !resp.citations.is_empty() {
        body.push_str("\n\n**Sources**\n\n");
        for (i, c) in resp.citations.iter().enumerate() {
            let title = c.title.as_deref().map(str::trim).filter(|t| !t.is_empty());
            let _ = match title {
                Some(t) => writeln!(body, "{}. [{t}]({})", i + 1, c.url),
                None => writeln!(body, "{}. <{}>", i + 1, c.url),
            };
        }
    }
    if !attached.is_empty() {
        let _ = write!(body, "\n\n_Context files: {}_", attached.join(", "));
    }
    for w in warnings {
        let _ = write!(body, "\n\n_Warning: {w}_");
    }
    (body, truncated)
}

pub(crate) async fn deep_research(
    llm: &dyn LlmBackend,
    usage: &Usage,
    policy: &RetryPolicy,
    questions: Vec<ResearchQuestion>,
) -> ToolOutput {
    let tool = Tool::DeepResearch;
    let n = questions.len();
    let budget = QUESTION_BUDGET.per_item(n);

    let answered = bounded_map(questions.iter(), LLM_CONCURRENCY, |q| async move {
        let prepared = prepare(q).await;
        let r = ask(llm, usage, policy, &prepared.prompt, budget).await;
        (prepared, r)
    })
    .await;

    let failures: Vec<(usize, &Error)> = answered
        .iter()
        .enumerate()
        .filter_map(|(i, (_, r))| r.as_ref().err().map(|e| (i, e)))
        .collect();
    let failure_items: Vec<serde_json::Value> = failures
        .iter()
        .map(|(i, e)| failure_item("question", &questions[*i].question, e))
        .collect();
    let ok_count = n - failures.len();

    if ok_count == 0 {
        let err = match failures.first() {
            Some((_, e)) => {
                let mut te = ToolError::from_error(tool, e);
                if n > 1 {
                    te.message = format!("all {n} questions failed; first error: {}", te.message);
                }
                te
            }
            None => ToolError::from_error(tool, &Error::Llm("no answers".to_string())),
        };
        let details = serde_json::json!({ "failures": failure_items });
        return ToolOutput::failure_with(tool, err, details);
    }

    let mut report = Report::new(format!("Deep research: {n} question(s)"));
    let mut answers_json = Vec::new();
    let mut citations_total = 0usize;
    let mut model = String::new();

    for (i, (q, (prepared, r))) in questions.iter().zip(&answered).enumerate() {
        let heading = format!("Q{}: {}", i + 1, q.question.lines().next().unwrap_or(""));
        match r {
            Ok(resp) => {
                let (body, truncated) =
                    render_answer(resp, budget, &prepared.attached, &prepared.warnings);
                citations_total += resp.citations.len();
                if model.is_empty() {
                    model = resp.model.clone();
                }
                report = report.section(Section::new(heading, body));
                answers_json.push(serde_json::json!({
                    "question": q.question,
                    "ok": true,
                    "model": resp.model,
                    "citations": resp.citations,
                    "attachments": prepared.attached,
                    "warnings": prepared.warnings,
                    "truncated": truncated,
                    "prompt_tokens": resp.prompt_tokens,
                    "completion_tokens": resp.completion_tokens,
                }));
            }
            Err(e) => {
                report = report.section(Section::new(heading, format!("_Failed: {e}_")));
                answers_json.push(serde_json::json!({
                    "question": q.question,
                    "ok": false,
                    "error": e.to_string(),
                }));
            }
        }
    }

    report = report
        .summary(format!("{ok_count} of {n} question(s) answered"))
        .summary(format!("{citations_total} cited source(s); up to {budget} tokens per answer"));
    if !model.is_empty() {
        report = report.summary(format!("Model: {model}"));
    }
    report = report
        .next_step("Verify key claims by reading the cited sources with `scrape_links`.")
        .next_step("Ask narrower follow-up questions for any caveats or disagreements above.");
    if !failures.is_empty() {
        report = report.next_step("Re-run `deep_research` with only the failed questions.");
    }
    let report = report.footer("Answers are model-generated from live web results; check sources before relying on them");

    let mut payload = serde_json::json!({
        "questions": n,
        "answered": ok_count,
        "tokens_per_answer": budget,
        "model": model,
        "answers": answers_json,
        "failures": failure_items,
    });
    if !failures.is_empty() {
        payload["error"] = partial_failure(tool, failures.len(), n, "questions").to_json();
    }
    ToolOutput::success(report.render(), payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use powerpack_core::budget::estimate_tokens;
    use powerpack_core::Citation;
    use std::sync::Mutex;

    struct FakeLlm {
        requests: Mutex<Vec<ChatRequest>>,
    }

    #[async_trait::async_trait]
    impl LlmBackend for FakeLlm {
        fn default_model(&self) -> &str {
            "fake/model"
        }

        async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse> {
            self.requests.lock().unwrap().push(req.clone());
            let user = &req.messages[1].content;
            if user.contains("FAIL") {
                return Err(Error::Quota("out of credits".into()));
            }
            Ok(ChatResponse {
                model: "fake/model".into(),
                content: format!("Answer to: {}", user.lines().next().unwrap_or("")),
                citations: vec![Citation {
                    url: "https://source.example/a".into(),
                    title: Some("Source A".into()),
                }],
                prompt_tokens: 10,
                completion_tokens: 20,
            })
        }
    }

    fn fake() -> FakeLlm {
        FakeLlm {
            requests: Mutex::new(Vec::new()),
        }
    }

    fn q(text: &str) -> QuestionArg {
        QuestionArg {
            question: text.into(),
            file_attachments: None,
        }
    }

    #[test]
    fn validate_bounds_after_normalizing() {
        assert!(validate(DeepResearchArgs::default()).is_err());
        assert!(validate(DeepResearchArgs {
            questions: (0..11).map(|i| q(&format!("q{i}"))).collect(),
        })
        .is_err());
        assert!(matches!(
            validate(DeepResearchArgs {
                questions: vec![q("  "), q("\t")],
            }),
            Err(Error::InvalidInput(m)) if m.contains("questions")
        ));
        // Eleven raw entries, ten distinct questions once trimmed.
        let mut many: Vec<QuestionArg> = (0..10).map(|i| q(&format!("q{i}"))).collect();
        many.push(q("  q3  "));
        assert_eq!(validate(DeepResearchArgs { questions: many }).unwrap().len(), 10);
    }

    #[test]
    fn blank_questions_are_dropped_and_duplicates_folded() {
        let qs = validate(DeepResearchArgs {
            questions: vec![
                q("What is X?"),
                q("   "),
                QuestionArg {
                    question: "  What is X?  ".into(),
                    file_attachments: Some(vec![AttachmentArg {
                        path: "notes.md".into(),
                        ..Default::default()
                    }]),
                },
                q("What is Y?"),
            ],
        })
        .unwrap();
        let texts: Vec<&str> = qs.iter().map(|r| r.question.as_str()).collect();
        assert_eq!(texts, ["What is X?", "What is Y?"]);
        assert_eq!(qs[0].attachments.len(), 1);
        assert_eq!(qs[0].attachments[0].path, "notes.md");
    }

    #[tokio::test]
    async fn oversized_attachments_are_truncated() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("big.txt");
        // ~50k tokens of text, well past one question's attachment budget.
        let line = "lorem ipsum dolor sit amet consectetur adipiscing elit sed do\n";
        std::fs::write(&path, line.repeat(3_200)).unwrap();
        let qs = validate(DeepResearchArgs {
            questions: vec![QuestionArg {
                question: "Summarize".into(),
                file_attachments: Some(vec![AttachmentArg {
                    path: path.display().to_string(),
                    ..Default::default()
                }]),
            }],
        })
        .unwrap();
        let llm = fake();
        let out = deep_research(&llm, &Usage::default(), &RetryPolicy::none(), qs).await;
        assert!(out.ok);
        let prompt = llm.requests.lock().unwrap()[0].messages[1].content.clone();
        assert!(estimate_tokens(&prompt) <= ATTACHMENT_BUDGET.per_item(1) + 200);
        let warnings = out.payload["answers"][0]["warnings"].to_string();
        assert!(warnings.contains("truncated"), "{warnings}");
    }

    #[tokio::test]
    async fn answers_with_citations_web_plugin_and_budget() {
        let llm = fake();
        let usage = Usage::default();
        let qs = validate(DeepResearchArgs {
            questions: vec![q("What changed in Rust 1.80?"), q("Is tokio faster?")],
        })
        .unwrap();
        let out = deep_research(&llm, &usage, &RetryPolicy::none(), qs).await;
        assert!(out.ok, "{}", out.markdown);
        assert_eq!(out.payload["answered"], 2);
        assert_eq!(out.payload["tokens_per_answer"], 16_000);
        assert!(out.markdown.contains("## Q1: What changed in Rust 1.80?"));
        assert!(out.markdown.contains("Answer to: What changed in Rust 1.80?"));
        assert!(out.markdown.contains("1. [Source A](https://source.example/a)"));

        let reqs = llm.requests.lock().unwrap();
        assert_eq!(reqs.len(), 2);
        assert_eq!(reqs[0].web_search_results, Some(WEB_RESULTS));
        assert_eq!(reqs[0].reasoning_effort.as_deref(), Some("high"));
        assert_eq!(reqs[0].max_tokens, Some(16_000));
        assert_eq!(reqs[0].timeout_ms, RESEARCH_TIMEOUT_MS);
    }

    #[tokio::test]
    async fn attachments_are_inlined_and_bad_ones_warned() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("lib.rs");
        std::fs::write(&path, "fn one() {}\nfn two() {}\nfn three() {}\n").unwrap();
        let qs = validate(DeepResearchArgs {
            questions: vec![QuestionArg {
                question: "Review this".into(),
                file_attachments: Some(vec![
                    AttachmentArg {
                        path: path.display().to_string(),
                        start_line: Some(2),
                        end_line: Some(3),
                        description: None,
                    },
                    AttachmentArg {
                        path: dir.path().join("missing.rs").display().to_string(),
                        ..Default::default()
                    },
                ]),
            }],
        })
        .unwrap();
        let llm = fake();
        let out = deep_research(&llm, &Usage::default(), &RetryPolicy::none(), qs).await;
        assert!(out.ok);
        let prompt = llm.requests.lock().unwrap()[0].messages[1].content.clone();
        assert!(prompt.contains("## Attached files"));
        assert!(prompt.contains("```rust\nfn two() {}\nfn three() {}\n```"));
        assert!(!prompt.contains("fn one()"));
        assert_eq!(out.payload["answers"][0]["warnings"].as_array().map(Vec::len), Some(1));
        assert!(out.markdown.contains("attachment skipped"));
    }

    #[tokio::test]
    async fn partial_and_total_failures() {
        let llm = fake();
        let qs = validate(DeepResearchArgs {
            questions: vec![q("good one"), q("FAIL please")],
        })
        .unwrap();
        let out = deep_research(&llm, &Usage::default(), &RetryPolicy::none(), qs).await;
        assert!(out.ok);
        assert_eq!(out.payload["error"]["code"], "partial_failure");
        assert_eq!(out.payload["failures"][0]["question"], "FAIL please");
        assert!(out.markdown.contains("_Failed: quota exhausted"));

        let qs = validate(DeepResearchArgs {
            questions: vec![q("FAIL")],
        })
        .unwrap();
        let out = deep_research(&llm, &Usage::default(), &RetryPolicy::none(), qs).await;
        assert!(!out.ok);
        assert_eq!(out.payload["error"]["code"], "quota_exhausted");
    }
}
