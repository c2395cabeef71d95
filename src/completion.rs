//! Completion client: prompt assembly and SSE-streaming chat completions
//! against the configured generation API.

use crate::config::ApiConfig;
use crate::models::{ChatMessage, SearchResult};
use crate::tokenizer::Tokenizer;
use futures_util::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

const PROMPT_TEMPLATE: &str = "Use the following context to answer the question.\n\n__CONTEXT__\n\nQuestion: __QUESTION__";

#[derive(Debug, Error)]
pub enum CompletionError {
    #[error("completion protocol error: {0}")]
    Protocol(String),
    #[error("completion transport error: {0}")]
    Transport(String),
    #[error("completion response parse error: {0}")]
    Parse(String),
}

impl From<reqwest::Error> for CompletionError {
    fn from(err: reqwest::Error) -> Self {
        CompletionError::Transport(err.to_string())
    }
}

/// Where streamed tokens go. An explicit sink type rather than a raw
/// closure, so callers (HTTP SSE handler, CLI `chat` command) can each
/// supply their own destination without the client knowing about either.
pub trait CompletionSink: Send {
    fn on_token(&mut self, token: &str);
}

/// Collects streamed tokens into a single `String`, for non-interactive
/// callers (and tests) that just want the final text.
#[derive(Default)]
pub struct CollectingSink(pub String);

impl CompletionSink for CollectingSink {
    fn on_token(&mut self, token: &str) {
        self.0.push_str(token);
    }
}

pub struct CompletionClient {
    http: reqwest::Client,
    tokenizer: Arc<Tokenizer>,
}

impl CompletionClient {
    pub fn new(tokenizer: Arc<Tokenizer>) -> Self {
        Self {
            http: reqwest::Client::new(),
            tokenizer,
        }
    }

    /// Assemble the context block from ranked search results, truncating to
    /// fit `budget_tokens`. Labels each result with the configured format
    /// unless the content already starts with a label-shaped prefix.
    pub fn build_context(&self, results: &[SearchResult], label_format: &str, budget_tokens: usize) -> String {
        let mut out = String::new();
        let mut used = 0usize;

        for result in results {
            let basename = result
                .source_id
                .rsplit(['/', '\\'])
                .next()
                .unwrap_or(&result.source_id);
            let label = label_format.replacen("{}", basename, 1);
            let already_labeled = result.content.trim_start().starts_with(&label);

            let piece = if already_labeled {
                format!("{}\n\n", result.content)
            } else {
                format!("{label}\n{}\n\n", result.content)
            };

            let piece_tokens = self.tokenizer.count_tokens(&piece);
            if used + piece_tokens <= budget_tokens {
                out.push_str(&piece);
                used += piece_tokens;
                continue;
            }

            let remaining = budget_tokens.saturating_sub(used);
            if remaining == 0 {
                break;
            }
            // Proportional character truncation for the last partial item;
            // never pad past the limit.
            let ratio = remaining as f64 / piece_tokens.max(1) as f64;
            let char_budget = ((piece.chars().count() as f64) * ratio).floor() as usize;
            let truncated: String = piece.chars().take(char_budget).collect();
            out.push_str(&truncated);
            break;
        }

        out
    }

    pub fn build_prompt(context: &str, question: &str) -> String {
        PROMPT_TEMPLATE
            .replacen("__CONTEXT__", context, 1)
            .replacen("__QUESTION__", question, 1)
    }

    /// Non-streaming completion: returns the full response text.
    pub async fn complete(
        &self,
        api: &ApiConfig,
        messages: &[ChatMessage],
        prompt: &str,
        temperature: Option<f64>,
        max_tokens: usize,
    ) -> Result<String, CompletionError> {
        let body = self.request_body(api, messages, prompt, temperature, max_tokens, false);
        let response = self
            .http
            .post(&api.api_url)
            .header("Authorization", format!("Bearer {}", api.api_key))
            .timeout(Duration::from_millis(20_000))
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(CompletionError::Protocol(format!("generation API '{}' returned {}: {}", api.id, status, text)));
        }

        let json: serde_json::Value = response.json().await?;
        json.get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_str())
            .map(str::to_string)
            .ok_or_else(|| CompletionError::Parse("missing choices[0].message.content".to_string()))
    }

    /// Streaming completion: emits each delta token to `sink` as it
    /// arrives, returns the fully accumulated response text at the end.
    pub async fn stream(
        &self,
        api: &ApiConfig,
        messages: &[ChatMessage],
        prompt: &str,
        temperature: Option<f64>,
        max_tokens: usize,
        sink: &mut dyn CompletionSink,
    ) -> Result<String, CompletionError> {
        let body = self.request_body(api, messages, prompt, temperature, max_tokens, true);
        let response = self
            .http
            .post(&api.api_url)
            .header("Authorization", format!("Bearer {}", api.api_key))
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(CompletionError::Protocol(format!("generation API '{}' returned {}: {}", api.id, status, text)));
        }

        let mut stream = response.bytes_stream();
        let mut buffer = String::new();
        let mut accumulated = String::new();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            buffer.push_str(&String::from_utf8_lossy(&chunk));

            while let Some(pos) = buffer.find("\n\n") {
                let event = buffer[..pos].to_string();
                buffer.drain(..pos + 2);
                let Some(data) = event.strip_prefix("data:") else { continue };
                let data = data.trim();
                if data == "[DONE]" {
                    return Ok(accumulated);
                }
                let Ok(payload) = serde_json::from_str::<serde_json::Value>(data) else {
                    continue;
                };
                if let Some(delta) = payload.get("choices").and_then(|c| c.get(0)).and_then(|c| c.get("delta")) {
                    let token = delta
                        .get("content")
                        .or_else(|| delta.get("reasoning_content"))
                        .and_then(|v| v.as_str())
                        .unwrap_or("");
                    if !token.is_empty() {
                        accumulated.push_str(token);
                        sink.on_token(token);
                    }
                }
            }
        }

        Ok(accumulated)
    }

    fn request_body(
        &self,
        api: &ApiConfig,
        messages: &[ChatMessage],
        prompt: &str,
        temperature: Option<f64>,
        max_tokens: usize,
        stream: bool,
    ) -> serde_json::Value {
        let mut wire_messages: Vec<serde_json::Value> = messages
            .iter()
            .map(|m| serde_json::json!({ "role": m.role, "content": m.content }))
            .collect();
        if let Some(last) = wire_messages.last_mut() {
            last["content"] = serde_json::json!(prompt);
        } else {
            wire_messages.push(serde_json::json!({ "role": "user", "content": prompt }));
        }

        let mut body = serde_json::json!({
            "model": api.model,
            "messages": wire_messages,
            "stream": stream,
        });
        body[&api.max_tokens_name] = serde_json::json!(max_tokens);
        if api.temperature_support {
            if let Some(t) = temperature {
                body["temperature"] = serde_json::json!(t);
            }
        }
        body
    }

    /// Budget for context assembly: the API's own `context_length` if
    /// declared, else the generation section's configured fallback, minus
    /// headroom for the prompt template and the model's reply.
    pub fn context_budget(api: &ApiConfig, fallback_max_context_tokens: usize, reply_tokens: usize) -> usize {
        let total = api.context_length.unwrap_or(fallback_max_context_tokens);
        total.saturating_sub(reply_tokens).max(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SearchResult;

    fn client() -> CompletionClient {
        CompletionClient::new(Arc::new(Tokenizer::fallback()))
    }

    #[test]
    fn build_prompt_substitutes_both_placeholders() {
        let prompt = CompletionClient::build_prompt("some context", "what is this?");
        assert!(prompt.contains("some context"));
        assert!(prompt.contains("what is this?"));
        assert!(!prompt.contains("__CONTEXT__"));
        assert!(!prompt.contains("__QUESTION__"));
    }

    #[test]
    fn build_context_labels_each_result_once() {
        let c = client();
        let results = vec![SearchResult::whole_source("docs/readme.md", "hello there")];
        let context = c.build_context(&results, "[{}]", 10_000);
        assert!(context.contains("[readme.md]"));
        assert!(context.contains("hello there"));
    }

    #[test]
    fn build_context_truncates_to_budget() {
        let c = client();
        let long = "word ".repeat(5000);
        let results = vec![SearchResult::whole_source("a.txt", &long)];
        let context = c.build_context(&results, "[{}]", 5);
        assert!(c.tokenizer.count_tokens(&context) <= 20);
    }

    #[test]
    fn context_budget_prefers_api_context_length() {
        let api = ApiConfig {
            id: "x".into(),
            name: String::new(),
            api_url: String::new(),
            api_key: String::new(),
            model: "m".into(),
            query_format: "{}".into(),
            document_format: "{}".into(),
            max_tokens_name: "max_tokens".into(),
            temperature_support: true,
            stream: true,
            context_length: Some(8192),
            pricing_tpm: None,
        };
        assert_eq!(CompletionClient::context_budget(&api, 20_000, 500), 7692);
    }
}
