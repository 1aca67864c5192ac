//! Streaming chat completions over the OpenAI HTTP API.

use futures::{Stream, StreamExt};
use serde::Deserialize;
use serde_json::json;

use super::{ChatMessage, CompletionProvider, FragmentStream, ProviderError};
use crate::protocol::LineDecoder;

/// Connection and sampling settings.
#[derive(Debug, Clone)]
pub struct OpenAiOptions {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

/// Provider backed by `/chat/completions` with `stream: true`.
pub struct OpenAiProvider {
    client: reqwest::Client,
    options: OpenAiOptions,
}

impl OpenAiProvider {
    pub fn new(options: OpenAiOptions) -> Self {
        Self {
            client: reqwest::Client::new(),
            options,
        }
    }
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: Delta,
}

#[derive(Debug, Default, Deserialize)]
struct Delta {
    content: Option<String>,
}

/// What one line of the upstream event stream means for us.
#[derive(Debug, PartialEq, Eq)]
enum UpstreamLine {
    Fragment(String),
    Done,
    Skip,
}

/// Interpret one line of the upstream stream.
fn parse_upstream_line(line: &str) -> Result<UpstreamLine, ProviderError> {
    let line = line.trim();
    let Some(payload) = line.strip_prefix("data:") else {
        return Ok(UpstreamLine::Skip);
    };
    let payload = payload.trim();
    if payload == "[DONE]" {
        return Ok(UpstreamLine::Done);
    }

    let chunk: StreamChunk =
        serde_json::from_str(payload).map_err(|e| ProviderError::Decode(e.to_string()))?;
    let text: String = chunk
        .choices
        .into_iter()
        .filter_map(|choice| choice.delta.content)
        .collect();

    if text.is_empty() {
        Ok(UpstreamLine::Skip)
    } else {
        Ok(UpstreamLine::Fragment(text))
    }
}

impl CompletionProvider for OpenAiProvider {
    fn name(&self) -> &'static str {
        "openai"
    }

    fn stream_completion(&self, messages: Vec<ChatMessage>) -> FragmentStream {
        let client = self.client.clone();
        let url = format!("{}/chat/completions", self.options.base_url.trim_end_matches('/'));
        let api_key = self.options.api_key.clone();
        let body = json!({
            "model": self.options.model,
            "messages": messages,
            "stream": true,
            "temperature": self.options.temperature,
            "max_tokens": self.options.max_tokens,
        });

        Box::pin(fragment_stream(client, url, api_key, body))
    }
}

/// Issue the request and yield text deltas until `[DONE]` or end of body.
fn fragment_stream(
    client: reqwest::Client,
    url: String,
    api_key: String,
    body: serde_json::Value,
) -> impl Stream<Item = Result<String, ProviderError>> + Send + 'static {
    async_stream::try_stream! {
        let resp = client
            .post(&url)
            .bearer_auth(&api_key)
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        let resp = if status.is_success() {
            resp
        } else {
            let body = resp.text().await.unwrap_or_default();
            Err::<reqwest::Response, _>(ProviderError::Status { status: status.as_u16(), body })?
        };

        let mut bytes = resp.bytes_stream();
        let mut lines = LineDecoder::new();
        'read: while let Some(chunk) = bytes.next().await {
            let chunk = chunk?;
            for line in lines.push(&chunk) {
                match parse_upstream_line(&line)? {
                    UpstreamLine::Fragment(text) => yield text,
                    UpstreamLine::Done => break 'read,
                    UpstreamLine::Skip => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delta_content_becomes_fragment() {
        let line = r#"data: {"id":"x","choices":[{"index":0,"delta":{"content":"Hi"}}]}"#;
        assert_eq!(
            parse_upstream_line(line).unwrap(),
            UpstreamLine::Fragment("Hi".into())
        );
    }

    #[test]
    fn role_only_delta_is_skipped() {
        let line = r#"data: {"choices":[{"index":0,"delta":{"role":"assistant"}}]}"#;
        assert_eq!(parse_upstream_line(line).unwrap(), UpstreamLine::Skip);
    }

    #[test]
    fn done_marker_and_blank_lines() {
        assert_eq!(parse_upstream_line("data: [DONE]").unwrap(), UpstreamLine::Done);
        assert_eq!(parse_upstream_line("").unwrap(), UpstreamLine::Skip);
        assert_eq!(parse_upstream_line(": ping").unwrap(), UpstreamLine::Skip);
    }

    #[test]
    fn garbage_payload_is_a_decode_error() {
        assert!(matches!(
            parse_upstream_line("data: {not json"),
            Err(ProviderError::Decode(_))
        ));
    }
}
