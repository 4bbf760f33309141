use crate::{env_nonempty, map_reqwest_err, retry_after_ms};
use powerpack_core::{ChatMessage, ChatRequest, ChatResponse, Citation, Error, LlmBackend, Result};
use serde::{Deserialize, Serialize};

const DEFAULT_BASE_URL: &str = "https://openrouter.ai/api/v1";
pub const DEFAULT_RESEARCH_MODEL: &str = "x-ai/grok-4-fast";
pub const DEFAULT_EXTRACTION_MODEL: &str = "openai/gpt-4o-mini";
const APP_REFERER: &str = "https://github.com/research-powerpack/research-powerpack";
const APP_TITLE: &str = "research-powerpack";

pub fn research_model_from_env() -> String {
    env_nonempty("RESEARCH_MODEL").unwrap_or_else(|| DEFAULT_RESEARCH_MODEL.to_string())
}

pub fn extraction_model_from_env() -> String {
    env_nonempty("LLM_EXTRACTION_MODEL").unwrap_or_else(|| DEFAULT_EXTRACTION_MODEL.to_string())
}

#[derive(Debug, Clone)]
pub struct OpenRouterClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl OpenRouterClient {
    pub fn new(
        client: reqwest::Client,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            client,
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: api_key.into(),
            model: model.into(),
        }
    }

    /// `model` overrides `RESEARCH_MODEL`.
    pub fn from_env(client: reqwest::Client, model: Option<String>) -> Result<Self> {
        let api_key = env_nonempty("OPENROUTER_API_KEY")
            .ok_or_else(|| Error::NotConfigured("missing OPENROUTER_API_KEY".to_string()))?;
        let mut c = Self::new(client, api_key, model.unwrap_or_else(research_model_from_env));
        if let Some(base) = env_nonempty("OPENROUTER_BASE_URL") {
            c.base_url = base;
        }
        Ok(c)
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn endpoint_chat_completions(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }
}

#[async_trait::async_trait]
impl LlmBackend for OpenRouterClient {
    fn default_model(&self) -> &str {
        &self.model
    }

    async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse> {
        let model = req.model.clone().unwrap_or_else(|| self.model.clone());
        let body = ChatCompletionsRequest {
            model: model.clone(),
            messages: req.messages.clone(),
            max_tokens: req.max_tokens,
            temperature: req.temperature,
            reasoning: req
                .reasoning_effort
                .clone()
                .map(|effort| Reasoning { effort }),
            plugins: req.web_search_results.map(|n| {
                vec![Plugin {
                    id: "web".to_string(),
                    max_results: n,
                }]
            }),
            stream: false,
        };
        tracing::debug!(
            target: "powerpack::openrouter",
            model = %model,
            max_tokens = ?req.max_tokens,
            web = req.web_search_results.is_some(),
            "chat"
        );

        let resp = self
            .client
            .post(self.endpoint_chat_completions())
            .timeout(std::time::Duration::from_millis(req.timeout_ms.max(1_000)))
            .header(reqwest::header::AUTHORIZATION, format!("Bearer {}", self.api_key))
            .header("HTTP-Referer", APP_REFERER)
            .header("X-Title", APP_TITLE)
            .json(&body)
            .send()
            .await
            .map_err(map_reqwest_err)?;

        let status = resp.status();
        if !status.is_success() {
            let ra = retry_after_ms(resp.headers());
            return Err(Error::from_status(
                status.as_u16(),
                format!("openrouter chat.completions HTTP {status}"),
                ra,
            ));
        }

        let parsed: ChatCompletionsResponse = resp
            .json()
            .await
            .map_err(|e| Error::Parse(format!("openrouter: {e}")))?;
        parsed.into_chat_response(model)
    }
}

#[derive(Debug, Clone, Serialize)]
struct ChatCompletionsRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reasoning: Option<Reasoning>,
    #[serde(skip_serializing_if = "Option::is_none")]
    plugins: Option<Vec<Plugin>>,
    stream: bool,
}

#[derive(Debug, Clone, Serialize)]
struct Reasoning {
    effort: String,
}

#[derive(Debug, Clone, Serialize)]
struct Plugin {
    id: String,
    max_results: u32,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatCompletionsResponse {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
    #[serde(default)]
    error: Option<ApiError>,
}

#[derive(Debug, Clone, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Clone, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    annotations: Vec<Annotation>,
}

#[derive(Debug, Clone, Deserialize)]
struct Annotation {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    url_citation: Option<UrlCitation>,
}

#[derive(Debug, Clone, Deserialize)]
struct UrlCitation {
    url: String,
    #[serde(default)]
    title: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct Usage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

#[derive(Debug, Clone, Deserialize)]
struct ApiError {
    #[serde(default)]
    code: Option<serde_json::Value>,
    #[serde(default)]
    message: String,
}

impl ChatCompletionsResponse {
    fn into_chat_response(self, requested_model: String) -> Result<ChatResponse> {
        if let Some(e) = self.error {
            // Errors can arrive in a 200 body (mid-stream provider failures).
            let code = e.code.and_then(|c| c.as_u64()).unwrap_or(0) as u16;
            return Err(match code {
                0 => Error::Llm(e.message),
                c => Error::from_status(c, e.message, None),
            });
        }
        let Some(choice) = self.choices.into_iter().next() else {
            return Err(Error::Llm("openrouter returned no choices".to_string()));
        };
        let mut citations: Vec<Citation> = Vec::new();
        for a in choice.message.annotations {
            if a.kind != "url_citation" {
                continue;
            }
            if let Some(u) = a.url_citation {
                if !citations.iter().any(|c| c.url == u.url) {
                    citations.push(Citation {
                        url: u.url,
                        title: u.title,
                    });
                }
            }
        }
        let usage = self.usage.unwrap_or(Usage {
            prompt_tokens: 0,
            completion_tokens: 0,
        });
        Ok(ChatResponse {
            model: self.model.unwrap_or(requested_model),
            content: choice.message.content.unwrap_or_default(),
            citations,
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
        })
    }
}
