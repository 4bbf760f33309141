use powerpack_core::errors::{ErrorCode, Tool, ToolError};
use powerpack_core::report::render_error;
use powerpack_core::Error;
use rmcp::model::{CallToolResult, Content};

pub(crate) const SCHEMA_VERSION: u64 = 1;

pub(crate) fn add_envelope_fields(payload: &mut serde_json::Value, kind: &str, elapsed_ms: u128) {
    payload["schema_version"] = serde_json::json!(SCHEMA_VERSION);
    payload["kind"] = serde_json::json!(kind);
    payload["elapsed_ms"] = serde_json::json!(elapsed_ms);
    // Keep `error` present on every payload so clients can branch on null vs object.
    if payload.get("error").is_none() {
        payload["error"] = serde_json::Value::Null;
    }
}

/// Structured content for machine consumers; the text block is the markdown report.
pub(crate) fn tool_result(markdown: String, payload: serde_json::Value) -> CallToolResult {
    let mut r = CallToolResult::structured(payload);
    r.content = vec![Content::text(markdown)];
    r
}

/// What a tool handler produces before the envelope is stamped on.
#[derive(Debug, Clone)]
pub(crate) struct ToolOutput {
    pub ok: bool,
    pub markdown: String,
    pub payload: serde_json::Value,
}

impl ToolOutput {
    pub(crate) fn success(markdown: String, mut payload: serde_json::Value) -> Self {
        payload["ok"] = serde_json::json!(true);
        Self {
            ok: true,
            markdown,
            payload,
        }
    }

    pub(crate) fn failure(tool: Tool, err: ToolError) -> Self {
        Self::failure_with(tool, err, serde_json::json!({}))
    }

    /// Failure that still carries per-item details (e.g. every URL failed).
    pub(crate) fn failure_with(tool: Tool, err: ToolError, mut payload: serde_json::Value) -> Self {
        payload["ok"] = serde_json::json!(false);
        payload["error"] = err.to_json();
        Self {
            ok: false,
            markdown: render_error(tool.as_str(), &err),
            payload,
        }
    }

    pub(crate) fn from_error(tool: Tool, err: &Error) -> Self {
        Self::failure(tool, ToolError::from_error(tool, err))
    }

    pub(crate) fn into_call_result(mut self, kind: &str, t0: std::time::Instant) -> CallToolResult {
        let elapsed_ms = t0.elapsed().as_millis();
        add_envelope_fields(&mut self.payload, kind, elapsed_ms);
        if self.ok {
            tracing::info!(
                target: "powerpack::mcp",
                tool = kind,
                elapsed_ms = elapsed_ms as u64,
                "tool call ok"
            );
        } else {
            let code = self.payload["error"]["code"].as_str().unwrap_or("");
            tracing::warn!(
                target: "powerpack::mcp",
                tool = kind,
                code,
                elapsed_ms = elapsed_ms as u64,
                "tool call failed"
            );
        }
        tool_result(self.markdown, self.payload)
    }
}

/// `partial_failure` error object for a batch where some items failed.
pub(crate) fn partial_failure(tool: Tool, failed: usize, total: usize, noun: &str) -> ToolError {
    ToolError::new(
        tool,
        ErrorCode::PartialFailure,
        format!("{failed} of {total} {noun} failed; results for the rest are included"),
    )
}

/// One failed batch item, shaped for the payload's `failures` array.
pub(crate) fn failure_item(key: &str, item: &str, err: &Error) -> serde_json::Value {
    serde_json::json!({
        key: item,
        "code": ErrorCode::from(err).as_str(),
        "message": err.to_string(),
        "retryable": err.is_retryable(),
    })
}
