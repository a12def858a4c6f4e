//! Text generation capability and the OpenAI-compatible chat backend.
//!
//! The prompt is opaque here: callers build it, the generator sends it as a
//! single user message to whichever model tier the pipeline asks for.

use crate::error::{CoreError, CoreResult};
use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Tokens as they arrive. An `Err` item ends the stream.
pub type TokenStream = BoxStream<'static, CoreResult<String>>;

#[async_trait]
pub trait TextGenerator: Send + Sync {
    /// Start a streaming completion. Connection and HTTP failures surface here.
    async fn generate_stream(&self, prompt: &str, model: &str) -> CoreResult<TokenStream>;

    /// Single-shot completion.
    async fn generate(&self, prompt: &str, model: &str) -> CoreResult<String>;
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessageResponse,
}

#[derive(Deserialize)]
struct ChatMessageResponse {
    #[serde(default)]
    content: Option<String>,
}

/// One parsed line of a `text/event-stream` body.
#[derive(Debug, PartialEq)]
pub(crate) enum SseLine {
    Token(String),
    Done,
    Error(String),
    Skip,
}

pub(crate) fn parse_sse_line(line: &str) -> SseLine {
    let Some(data) = line.strip_prefix("data:") else {
        // comments (": OPENROUTER PROCESSING"), event names, blank keep-alives
        return SseLine::Skip;
    };
    let data = data.trim();
    if data == "[DONE]" {
        return SseLine::Done;
    }
    let value: serde_json::Value = match serde_json::from_str(data) {
        Ok(v) => v,
        Err(_) => return SseLine::Skip,
    };
    if let Some(err) = value.get("error") {
        let message = err
            .get("message")
            .and_then(|m| m.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| err.to_string());
        return SseLine::Error(message);
    }
    match value
        .pointer("/choices/0/delta/content")
        .and_then(|c| c.as_str())
    {
        Some(token) if !token.is_empty() => SseLine::Token(token.to_string()),
        _ => SseLine::Skip,
    }
}

/// OpenAI-compatible `/chat/completions` client (OpenRouter by default).
pub struct OpenRouterGenerator {
    api_url: String,
    api_key: String,
    app_name: String,
    temperature: Option<f32>,
    max_tokens: Option<u32>,
    client: reqwest::Client,
}

impl OpenRouterGenerator {
    pub fn new(
        api_url: impl Into<String>,
        api_key: impl Into<String>,
        timeout: Duration,
    ) -> CoreResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CoreError::Config(format!("http client: {}", e)))?;
        Ok(Self {
            api_url: api_url.into(),
            api_key: api_key.into().trim().to_string(),
            app_name: "companion".to_string(),
            temperature: Some(0.7),
            max_tokens: Some(400),
            client,
        })
    }

    pub fn with_app_name(mut self, name: impl Into<String>) -> Self {
        self.app_name = name.into();
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    async fn post(&self, prompt: &str, model: &str, stream: bool) -> CoreResult<reqwest::Response> {
        let url = format!("{}/chat/completions", self.api_url.trim_end_matches('/'));
        let body = ChatRequest {
            model,
            messages: vec![ChatMessage {
                role: "user",
                content: prompt,
            }],
            stream,
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        };

        let res = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .header("X-Title", &self.app_name)
            .json(&body)
            .send()
            .await
            .map_err(|e| CoreError::generation(model, e))?;

        if !res.status().is_success() {
            let status = res.status();
            let text = res.text().await.unwrap_or_default();
            return Err(CoreError::generation(
                model,
                format!("HTTP {}: {}", status, text),
            ));
        }
        Ok(res)
    }
}

#[async_trait]
impl TextGenerator for OpenRouterGenerator {
    async fn generate_stream(&self, prompt: &str, model: &str) -> CoreResult<TokenStream> {
        debug!(target: "companion::llm", "Streaming completion from {}", model);
        let res = self.post(prompt, model, true).await?;
        Ok(sse_tokens(res.bytes_stream(), model.to_string()))
    }

    async fn generate(&self, prompt: &str, model: &str) -> CoreResult<String> {
        debug!(target: "companion::llm", "Completion from {}", model);
        let res = self.post(prompt, model, false).await?;
        let parsed: ChatResponse = res
            .json()
            .await
            .map_err(|e| CoreError::generation(model, e))?;
        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .ok_or_else(|| CoreError::generation(model, "empty completion"))
    }
}

/// Turn a raw SSE byte stream into tokens. Lines may be split across network chunks.
pub(crate) fn sse_tokens<S, B, E>(bytes: S, model: String) -> TokenStream
where
    S: futures::Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send,
    E: std::fmt::Display + Send,
{
    let mut bytes = Box::pin(bytes);
    let stream = async_stream::try_stream! {
        let mut pending: Vec<u8> = Vec::new();
        let mut done = false;
        while !done {
            let Some(chunk) = bytes.next().await else { break };
            let chunk = chunk.map_err(|e| CoreError::generation(&model, e))?;
            pending.extend_from_slice(chunk.as_ref());

            while let Some(pos) = pending.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = pending.drain(..=pos).collect();
                let line = String::from_utf8_lossy(&line);
                match parse_sse_line(line.trim()) {
                    SseLine::Token(token) => yield token,
                    SseLine::Done => {
                        done = true;
                        break;
                    }
                    SseLine::Error(message) => {
                        Err(CoreError::generation(&model, message))?;
                    }
                    SseLine::Skip => {}
                }
            }
        }
    };
    stream.boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    #[test]
    fn parses_delta_lines() {
        assert_eq!(
            parse_sse_line(r#"data: {"choices":[{"delta":{"content":"Hi"}}]}"#),
            SseLine::Token("Hi".to_string())
        );
        assert_eq!(parse_sse_line("data: [DONE]"), SseLine::Done);
        assert_eq!(parse_sse_line(": OPENROUTER PROCESSING"), SseLine::Skip);
        assert_eq!(
            parse_sse_line(r#"data: {"choices":[{"delta":{"role":"assistant"}}]}"#),
            SseLine::Skip
        );
        assert_eq!(
            parse_sse_line(r#"data: {"error":{"message":"rate limited"}}"#),
            SseLine::Error("rate limited".to_string())
        );
    }

    #[tokio::test]
    async fn tokens_survive_split_lines() {
        let body = "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n\
                    data: {\"choices\":[{\"delta\":{\"content\":\"lo é\"}}]}\n\n\
                    data: [DONE]\n\n\
                    data: {\"choices\":[{\"delta\":{\"content\":\"ignored\"}}]}\n";
        let bytes = body.as_bytes();
        // split mid-line and mid-codepoint
        let split = body.find('é').unwrap() + 1;
        let chunks: Vec<Result<Vec<u8>, std::io::Error>> = vec![
            Ok(bytes[..17].to_vec()),
            Ok(bytes[17..split].to_vec()),
            Ok(bytes[split..].to_vec()),
        ];
        let tokens: Vec<String> = sse_tokens(stream::iter(chunks), "m".to_string())
            .map(|t| t.unwrap())
            .collect()
            .await;
        assert_eq!(tokens, vec!["Hel".to_string(), "lo é".to_string()]);
    }

    #[tokio::test]
    async fn error_event_ends_stream_with_error() {
        let chunks: Vec<Result<&'static [u8], std::io::Error>> = vec![
            Ok(b"data: {\"choices\":[{\"delta\":{\"content\":\"a\"}}]}\n"),
            Ok(b"data: {\"error\":{\"message\":\"overloaded\"}}\n"),
        ];
        let items: Vec<CoreResult<String>> =
            sse_tokens(stream::iter(chunks), "m".to_string()).collect().await;
        assert_eq!(items.len(), 2);
        assert!(matches!(items[1], Err(CoreError::Generation { .. })));
    }
}
