// crates/cadence-core/src/llm/provider.rs
// Provider adapter abstraction: one uniform call interface per model backend

use crate::error::Result;
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies one breaker/routing key
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProviderKey {
    pub provider: String,
    pub model: String,
}

impl ProviderKey {
    pub fn new(provider: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
        }
    }
}

impl fmt::Display for ProviderKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.provider, self.model)
    }
}

/// Normalized token usage
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl Usage {
    pub fn new(prompt: u32, completion: u32) -> Self {
        Self {
            prompt_tokens: prompt,
            completion_tokens: completion,
            total_tokens: prompt + completion,
        }
    }
}

/// Prompt handed to an adapter. Prompt content itself is owned by the sub-agents.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Prompt {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    pub user: String,
}

impl Prompt {
    pub fn new(user: impl Into<String>) -> Self {
        Self {
            system: None,
            user: user.into(),
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }
}

/// One item of a streaming call
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// Next text fragment
    Delta(String),
    /// Stream finished; usage as reported by the backend
    Done { usage: Usage },
}

pub type ContentStream = BoxStream<'static, Result<StreamEvent>>;

pub enum CallContent {
    Text(String),
    Stream(ContentStream),
}

impl fmt::Debug for CallContent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text(text) => f.debug_tuple("Text").field(text).finish(),
            Self::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

/// Result of one adapter call
#[derive(Debug)]
pub struct CallResponse {
    /// Usage known at return time; for streams this is updated by the `Done` event
    pub usage: Usage,
    /// Time to response (first byte for streams)
    pub latency_ms: u64,
    pub content: CallContent,
    pub success: bool,
}

impl CallResponse {
    pub fn tokens_used(&self) -> u32 {
        self.usage.total_tokens
    }

    /// View the content as a fragment stream; text becomes a single fragment
    pub fn into_stream(self) -> ContentStream {
        match self.content {
            CallContent::Stream(s) => s,
            CallContent::Text(text) => {
                let usage = self.usage;
                stream::iter(vec![
                    Ok(StreamEvent::Delta(text)),
                    Ok(StreamEvent::Done { usage }),
                ])
                .boxed()
            }
        }
    }
}

/// Uniform call interface to a single model backend
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Provider name as used in the routing table
    fn name(&self) -> &str;

    /// Call `model`; when `stream` is set the content arrives as fragments
    async fn call(&self, model: &str, prompt: &Prompt, stream: bool) -> Result<CallResponse>;
}
