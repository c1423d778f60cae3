//! Response generation over an OpenAI-compatible `chat/completions` endpoint
//! with server-sent-event streaming.

use crate::engine::{Engine, EngineStream, OutputSink};
use crate::error::EngineError;
use crate::types::GenerationParams;
use async_trait::async_trait;
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

const STREAM_CAPACITY: usize = 32;

/// Connection settings for [`HttpGeneration`].
#[derive(Debug, Clone, Deserialize)]
pub struct HttpGenerationConfig {
    /// Base URL, e.g. `http://localhost:8080/v1`.
    pub base_url: String,
    pub model: String,
    #[serde(default)]
    pub api_key: Option<String>,
    /// Whole-request timeout in seconds.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_request_timeout_secs() -> u64 {
    60
}

/// Streaming chat-completion generation.
#[derive(Debug, Clone)]
pub struct HttpGeneration {
    config: HttpGenerationConfig,
    client: reqwest::Client,
}

impl HttpGeneration {
    pub fn new(config: HttpGenerationConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .user_agent("holo-stream/0.1 (generation)")
            .build()
            .unwrap_or_default();
        Self { config, client }
    }
}

/// Chat messages for one request: persona, prior exchanges, then the prompt.
pub(crate) fn build_messages(params: &GenerationParams, prompt: &str) -> Vec<serde_json::Value> {
    let mut messages = Vec::with_capacity(params.history.len() * 2 + 2);
    if !params.persona.is_empty() {
        messages.push(json!({ "role": "system", "content": params.persona }));
    }
    for exchange in &params.history {
        messages.push(json!({
            "role": "user",
            "name": exchange.participant_id,
            "content": exchange.said,
        }));
        if !exchange.replied.is_empty() {
            messages.push(json!({ "role": "assistant", "content": exchange.replied }));
        }
    }
    messages.push(json!({ "role": "user", "name": params.speaker, "content": prompt }));
    messages
}

#[derive(Deserialize)]
struct CompletionChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
}

#[derive(Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
}

#[derive(Deserialize, Default)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
}

/// Outcome of one SSE line.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum SseLine {
    Text(String),
    Done,
    Skip,
}

pub(crate) fn parse_sse_line(line: &str) -> Result<SseLine, EngineError> {
    let Some(data) = line.trim_end().strip_prefix("data:") else {
        return Ok(SseLine::Skip);
    };
    let data = data.trim();
    if data == "[DONE]" {
        return Ok(SseLine::Done);
    }
    if data.is_empty() {
        return Ok(SseLine::Skip);
    }
    let chunk: CompletionChunk = serde_json::from_str(data)
        .map_err(|e| EngineError::Failed(format!("malformed stream chunk: {e}")))?;
    Ok(chunk
        .choices
        .into_iter()
        .find_map(|c| c.delta.content)
        .filter(|text| !text.is_empty())
        .map_or(SseLine::Skip, SseLine::Text))
}

async fn stream_completion(
    client: reqwest::Client,
    config: HttpGenerationConfig,
    params: GenerationParams,
    prompt: String,
    output: &OutputSink<String>,
) -> Result<(), EngineError> {
    let url = format!("{}/chat/completions", config.base_url.trim_end_matches('/'));
    let body = json!({
        "model": config.model,
        "messages": build_messages(&params, &prompt),
        "stream": true,
        // Rough characters-per-token ratio; the caller truncates exactly.
        "max_tokens": (params.max_chars / 3).max(16),
    });

    let mut request = client.post(&url).json(&body);
    if let Some(key) = &config.api_key {
        request = request.bearer_auth(key);
    }
    let response = request
        .send()
        .await
        .map_err(|e| EngineError::Unavailable(format!("generation request failed: {e}")))?;
    if !response.status().is_success() {
        return Err(EngineError::Failed(format!(
            "generation endpoint returned {}",
            response.status()
        )));
    }

    let mut body = response.bytes_stream();
    let mut buffer: Vec<u8> = Vec::new();
    while let Some(bytes) = body.next().await {
        let bytes = bytes.map_err(|e| EngineError::Failed(format!("stream read failed: {e}")))?;
        buffer.extend_from_slice(&bytes);
        while let Some(newline) = buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = buffer.drain(..=newline).collect();
            match parse_sse_line(&String::from_utf8_lossy(&line))? {
                SseLine::Text(text) => {
                    if output.send(Ok(text)).await.is_err() {
                        return Ok(());
                    }
                }
                SseLine::Done => return Ok(()),
                SseLine::Skip => {}
            }
        }
    }
    Ok(())
}

#[async_trait]
impl Engine for HttpGeneration {
    type Params = GenerationParams;
    type Input = String;
    type Output = String;

    fn name(&self) -> &str {
        "http-generation"
    }

    async fn open(
        &self,
        params: GenerationParams,
    ) -> Result<EngineStream<String, String>, EngineError> {
        let client = self.client.clone();
        let config = self.config.clone();
        Ok(EngineStream::<String, String>::spawn(
            STREAM_CAPACITY,
            move |mut input, output, _abort| async move {
                let mut prompt = String::new();
                while let Some(part) = input.recv().await {
                    prompt.push_str(&part);
                }
                if let Err(err) = stream_completion(client, config, params, prompt, &output).await {
                    let _ = output.send(Err(err)).await;
                }
            },
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Exchange;

    #[test]
    fn sse_lines_parse() {
        assert_eq!(
            parse_sse_line(r#"data: {"choices":[{"delta":{"content":"Hi"}}]}"#).unwrap(),
            SseLine::Text("Hi".into())
        );
        assert_eq!(parse_sse_line("data: [DONE]\r\n").unwrap(), SseLine::Done);
        assert_eq!(parse_sse_line(": keep-alive").unwrap(), SseLine::Skip);
        assert_eq!(
            parse_sse_line(r#"data: {"choices":[{"delta":{"role":"assistant"}}]}"#).unwrap(),
            SseLine::Skip
        );
        assert!(parse_sse_line("data: {not json").is_err());
    }

    #[test]
    fn messages_carry_persona_and_history() {
        let params = GenerationParams {
            companion_id: "luna".into(),
            persona: "You are Luna.".into(),
            speaker: "bob".into(),
            history: vec![Exchange {
                participant_id: "alice".into(),
                said: "hello".into(),
                replied: "Hi there!".into(),
            }],
            max_chars: 200,
        };
        let messages = build_messages(&params, "how are you");
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[0]["role"], "system");
        assert_eq!(messages[2]["content"], "Hi there!");
        assert_eq!(messages[3]["name"], "bob");
    }
}
