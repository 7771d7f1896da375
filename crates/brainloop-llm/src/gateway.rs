//! Generation gateway: the single path by which the worker reaches the
//! external completion API. Every call goes through the rate limiter and
//! the retry loop, and every outcome is recorded into the latency
//! histogram and `telemetry_llm_metrics`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use brainloop_config::CompletionConfig;
use brainloop_storage::{LlmMetricRow, OutputDb};
use serde_json::Value;

use crate::error::{LlmError, LlmResult};
use crate::histogram::LatencyHistogram;
use crate::ratelimit::{RateLimiter, retry_with_backoff};

const DEFAULT_ANTHROPIC_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// What kind of content the caller expects back, which determines how the
/// gateway shapes the system prompt and whether it strips code fences.
#[derive(Debug, Clone)]
pub enum PromptKind {
    /// Code generation in a specific language, with optional reference
    /// patterns serialized as a JSON block ahead of the user prompt.
    Code {
        /// Target language (`"go"`, `"python"`, `"sql"`, ...).
        language: String,
        /// Reference patterns the model should follow, if any.
        patterns: Option<Vec<String>>,
    },
    /// A structured digest over some external source.
    Digest {
        /// Source type the digest schema is shaped for.
        source_type: String,
    },
    /// No special shaping; the caller's prompts are used verbatim.
    Freeform,
}

/// One call to [`GenerationGateway::generate`].
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    /// Caller-supplied system prompt; the gateway may prepend to it.
    pub system_prompt: String,
    /// The user-facing prompt content.
    pub user_prompt: String,
    /// Sampling temperature.
    pub temperature: f64,
    /// What shaping to apply and whether to strip code fences.
    pub kind: PromptKind,
    /// Owning session, if this call is made on behalf of one.
    pub session_id: Option<String>,
}

/// The gateway's contract: `generate(system_prompt, user_prompt,
/// temperature) -> { content, prompt_tokens, completion_tokens,
/// latency_ms }`.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationResponse {
    /// Completion content, with code fences stripped for `PromptKind::Code`.
    pub content: String,
    /// Tokens in the prompt, as reported by the API.
    pub prompt_tokens: u32,
    /// Tokens in the completion, as reported by the API.
    pub completion_tokens: u32,
    /// Round-trip latency of the call that ultimately succeeded.
    pub latency_ms: u64,
}

/// The generation gateway. The only component permitted to call the
/// external completion API.
pub struct GenerationGateway {
    client: reqwest::Client,
    config: CompletionConfig,
    limiter: Arc<RateLimiter>,
    histogram: Arc<LatencyHistogram>,
    output_db: Arc<OutputDb>,
}

impl GenerationGateway {
    /// Build a gateway over shared rate-limiter, histogram, and storage
    /// handles.
    #[must_use]
    pub fn new(
        config: CompletionConfig,
        limiter: Arc<RateLimiter>,
        histogram: Arc<LatencyHistogram>,
        output_db: Arc<OutputDb>,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
            limiter,
            histogram,
            output_db,
        }
    }

    /// Run a single completion request through the rate limiter, the
    /// retry loop, and telemetry recording.
    pub async fn generate(&self, request: &GenerationRequest) -> LlmResult<GenerationResponse> {
        let api_key = self.config.api_key.clone().ok_or_else(|| LlmError::ApiKeyNotConfigured {
            provider: self.config.provider.clone(),
        })?;

        let system = shape_system_prompt(&request.system_prompt, &request.kind);

        let response = retry_with_backoff(
            &self.limiter,
            self.config.max_retries,
            Duration::from_millis(500),
            Duration::from_secs(30),
            Duration::from_secs(60),
            || self.call_once(&api_key, &system, request),
        )
        .await?;

        let now = chrono::Utc::now().timestamp();
        self.histogram.record("generate", response.latency_ms, now)?;
        self.output_db.record_llm_metric(&LlmMetricRow {
            timestamp: now,
            provider: self.config.provider.clone(),
            model: self.config.model.clone(),
            prompt_tokens: response.prompt_tokens,
            completion_tokens: response.completion_tokens,
            latency_ms: response.latency_ms,
            session_id: request.session_id.clone(),
        })?;

        Ok(response)
    }

    async fn call_once(&self, api_key: &str, system: &str, request: &GenerationRequest) -> LlmResult<GenerationResponse> {
        let body = serde_json::json!({
            "model": self.config.model,
            "max_tokens": self.config.max_tokens,
            "temperature": request.temperature,
            "system": system,
            "messages": [{ "role": "user", "content": request.user_prompt }],
        });

        let url = self.config.base_url.as_deref().unwrap_or(DEFAULT_ANTHROPIC_URL);

        let mut api_key_header = reqwest::header::HeaderValue::try_from(api_key)
            .map_err(|e| LlmError::InvalidResponse(format!("invalid API key characters: {e}")))?;
        api_key_header.set_sensitive(true);

        let started_at = Instant::now();
        let http_response = self
            .client
            .post(url)
            .header("x-api-key", api_key_header)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await?;
        let latency_ms = started_at.elapsed().as_millis() as u64;

        if !http_response.status().is_success() {
            let status = http_response.status().as_u16();
            let response_body = http_response.text().await.unwrap_or_default();
            return Err(LlmError::ApiStatus { status, body: response_body });
        }

        let parsed: Value = http_response.json().await.map_err(LlmError::Http)?;
        let content_blocks = parsed
            .get("content")
            .and_then(Value::as_array)
            .ok_or_else(|| LlmError::InvalidResponse("missing content array".to_string()))?;

        let mut text = String::new();
        for block in content_blocks {
            if let Some(chunk) = block.get("text").and_then(Value::as_str) {
                text.push_str(chunk);
            }
        }

        if matches!(request.kind, PromptKind::Code { .. }) {
            text = strip_code_fences(&text);
        }

        let usage = parsed.get("usage");
        let prompt_tokens = usage.and_then(|u| u.get("input_tokens")).and_then(Value::as_u64).unwrap_or(0) as u32;
        let completion_tokens = usage.and_then(|u| u.get("output_tokens")).and_then(Value::as_u64).unwrap_or(0) as u32;

        Ok(GenerationResponse {
            content: text,
            prompt_tokens,
            completion_tokens,
            latency_ms,
        })
    }
}

fn shape_system_prompt(system_prompt: &str, kind: &PromptKind) -> String {
    match kind {
        PromptKind::Code { language, patterns } => {
            let mut shaped = format!("You write {language} code. Respond with code only, no prose.\n\n");
            if let Some(patterns) = patterns {
                let patterns_json = serde_json::to_string(patterns).unwrap_or_default();
                shaped.push_str(&format!("Reference patterns: {patterns_json}\n\n"));
            }
            shaped.push_str(system_prompt);
            shaped
        }
        PromptKind::Digest { source_type } => {
            format!(
                "Produce a JSON digest describing a {source_type} source. Respond with JSON only.\n\n{system_prompt}"
            )
        }
        PromptKind::Freeform => system_prompt.to_string(),
    }
}

fn strip_code_fences(content: &str) -> String {
    let trimmed = content.trim();
    let Some(after_open) = trimmed.strip_prefix("```") else {
        return content.to_string();
    };
    let after_open = after_open.strip_prefix(|c: char| !c.is_whitespace() && c != '\n').unwrap_or(after_open);
    let body = after_open.trim_start_matches(['\n', '\r']);
    body.strip_suffix("```").unwrap_or(body).trim_end().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strip_code_fences_removes_language_tagged_fence() {
        let input = "```go\nfunc main() {}\n```";
        assert_eq!(strip_code_fences(input), "func main() {}");
    }

    #[test]
    fn strip_code_fences_removes_untagged_fence() {
        let input = "```\nSELECT 1;\n```";
        assert_eq!(strip_code_fences(input), "SELECT 1;");
    }

    #[test]
    fn strip_code_fences_is_a_no_op_without_fences() {
        let input = "plain text response";
        assert_eq!(strip_code_fences(input), "plain text response");
    }

    #[test]
    fn shape_system_prompt_prepends_language_and_patterns_for_code() {
        let kind = PromptKind::Code {
            language: "python".to_string(),
            patterns: Some(vec!["use type hints".to_string()]),
        };
        let shaped = shape_system_prompt("be concise", &kind);
        assert!(shaped.contains("python"));
        assert!(shaped.contains("use type hints"));
        assert!(shaped.contains("be concise"));
    }

    #[test]
    fn shape_system_prompt_prepends_schema_hint_for_digest() {
        let kind = PromptKind::Digest {
            source_type: "database".to_string(),
        };
        let shaped = shape_system_prompt("describe this", &kind);
        assert!(shaped.contains("database"));
        assert!(shaped.contains("JSON"));
    }

    #[test]
    fn shape_system_prompt_is_unchanged_for_freeform() {
        let shaped = shape_system_prompt("verbatim", &PromptKind::Freeform);
        assert_eq!(shaped, "verbatim");
    }
}
