// crates/cadence-core/src/llm/openai_compat.rs
// OpenAI-compatible chat completions adapter (blocking and SSE streaming)

use super::provider::{CallContent, CallResponse, Prompt, ProviderAdapter, StreamEvent, Usage};
use crate::error::{CadenceError, Result};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Default connect timeout
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct StreamOptions {
    include_usage: bool,
}

/// Chat completion request (OpenAI-compatible format)
#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_options: Option<StreamOptions>,
}

impl<'a> ChatRequest<'a> {
    fn new(model: &'a str, prompt: &'a Prompt, stream: bool) -> Self {
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = prompt.system.as_deref() {
            messages.push(ChatMessage {
                role: "system",
                content: system,
            });
        }
        messages.push(ChatMessage {
            role: "user",
            content: &prompt.user,
        });
        Self {
            model,
            messages,
            stream,
            stream_options: stream.then_some(StreamOptions {
                include_usage: true,
            }),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

impl From<WireUsage> for Usage {
    fn from(u: WireUsage) -> Self {
        Usage::new(u.prompt_tokens, u.completion_tokens)
    }
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ResponseChoice>,
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct ResponseChoice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
}

#[derive(Debug, Default, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
}

/// One parsed SSE `data:` line
#[derive(Debug, PartialEq)]
enum SseLine {
    Delta(String),
    Usage(Usage),
    Done,
    Skip,
}

fn parse_sse_line(line: &str) -> Result<SseLine> {
    let line = line.trim();
    let Some(data) = line.strip_prefix("data:") else {
        return Ok(SseLine::Skip);
    };
    let data = data.trim();
    if data == "[DONE]" {
        return Ok(SseLine::Done);
    }
    let chunk: StreamChunk = serde_json::from_str(data)?;
    if let Some(usage) = chunk.usage {
        return Ok(SseLine::Usage(usage.into()));
    }
    Ok(chunk
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.delta.content)
        .filter(|s| !s.is_empty())
        .map_or(SseLine::Skip, SseLine::Delta))
}

/// Byte buffer for the SSE body. Lines are decoded only once complete, so a
/// multi-byte character split across network chunks survives intact.
#[derive(Debug, Default)]
struct LineBuffer {
    bytes: Vec<u8>,
}

impl LineBuffer {
    fn push(&mut self, chunk: &[u8]) {
        self.bytes.extend_from_slice(chunk);
    }

    fn next_line(&mut self) -> Option<String> {
        let pos = self.bytes.iter().position(|&b| b == b'\n')?;
        let line: Vec<u8> = self.bytes.drain(..=pos).collect();
        Some(String::from_utf8_lossy(&line).into_owned())
    }
}

/// Client for any endpoint speaking the chat-completions protocol
pub struct OpenAiCompatClient {
    name: String,
    base_url: String,
    api_key: Option<String>,
    client: Client,
}

impl OpenAiCompatClient {
    pub fn new(
        name: impl Into<String>,
        base_url: &str,
        api_key: Option<String>,
        request_timeout: Duration,
    ) -> Result<Self> {
        let parsed = url::Url::parse(base_url)
            .map_err(|e| CadenceError::Config(format!("invalid base_url '{}': {}", base_url, e)))?;
        let client = Client::builder()
            .timeout(request_timeout)
            .connect_timeout(CONNECT_TIMEOUT)
            .build()?;
        Ok(Self {
            name: name.into(),
            base_url: parsed.as_str().trim_end_matches('/').to_string(),
            api_key,
            client,
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    async fn send(&self, model: &str, prompt: &Prompt, stream: bool) -> Result<reqwest::Response> {
        let mut request = self
            .client
            .post(self.endpoint())
            .json(&ChatRequest::new(model, prompt, stream));
        if let Some(ref key) = self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| CadenceError::transport(&self.name, model, format!("request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let snippet: String = body.chars().take(200).collect();
            warn!(provider = %self.name, model, status = %status, "API error");
            return Err(CadenceError::transport(
                &self.name,
                model,
                format!("API error {}: {}", status, snippet),
            ));
        }
        Ok(response)
    }
}

#[async_trait]
impl ProviderAdapter for OpenAiCompatClient {
    fn name(&self) -> &str {
        &self.name
    }

    async fn call(&self, model: &str, prompt: &Prompt, stream: bool) -> Result<CallResponse> {
        let start = Instant::now();
        let response = self.send(model, prompt, stream).await?;
        let latency_ms = start.elapsed().as_millis() as u64;

        if !stream {
            let body = response
                .text()
                .await
                .map_err(|e| CadenceError::transport(&self.name, model, e.to_string()))?;
            let data: ChatResponse = serde_json::from_str(&body).map_err(|e| {
                CadenceError::transport(&self.name, model, format!("bad response body: {e}"))
            })?;
            let usage: Usage = data.usage.map(Into::into).unwrap_or_default();
            let content = data
                .choices
                .into_iter()
                .next()
                .and_then(|c| c.message.content)
                .unwrap_or_default();
            debug!(provider = %self.name, model, latency_ms, tokens = usage.total_tokens, "Chat completed");
            return Ok(CallResponse {
                usage,
                latency_ms,
                content: CallContent::Text(content),
                success: true,
            });
        }

        let provider = self.name.clone();
        let model = model.to_string();
        let mut bytes = Box::pin(response.bytes_stream());

        let events = async_stream::stream! {
            let mut buffer = LineBuffer::default();
            let mut usage = Usage::default();

            'read: while let Some(chunk) = bytes.next().await {
                let chunk = match chunk {
                    Ok(c) => c,
                    Err(e) => {
                        yield Err(CadenceError::transport(provider.clone(), model.clone(), e.to_string()));
                        return;
                    }
                };
                buffer.push(&chunk);

                while let Some(line) = buffer.next_line() {
                    match parse_sse_line(&line) {
                        Ok(SseLine::Delta(text)) => yield Ok(StreamEvent::Delta(text)),
                        Ok(SseLine::Usage(u)) => usage = u,
                        Ok(SseLine::Done) => break 'read,
                        Ok(SseLine::Skip) => {}
                        Err(e) => {
                            yield Err(CadenceError::transport(provider.clone(), model.clone(), format!("bad stream chunk: {e}")));
                            return;
                        }
                    }
                }
            }

            yield Ok(StreamEvent::Done { usage });
        };

        Ok(CallResponse {
            usage: Usage::default(),
            latency_ms,
            content: CallContent::Stream(Box::pin(events)),
            success: true,
        })
    }
}
