// crates/cadence-core/src/llm/scripted.rs
// Deterministic local provider for offline runs and tests
//
// Replies are split on spaces into fragments. Latency, per-fragment delay and
// failures can be scripted per model.

use super::provider::{CallContent, CallResponse, Prompt, ProviderAdapter, StreamEvent, Usage};
use crate::config::ProviderConfig;
use crate::error::{CadenceError, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

/// Per-model behavior
#[derive(Debug, Clone, Default)]
pub struct ModelScript {
    /// Fixed reply text; a generated reply is used when unset
    pub reply: Option<String>,
    /// Overrides the provider latency
    pub latency: Option<Duration>,
    /// Overrides the provider per-fragment delay
    pub fragment_delay: Option<Duration>,
    /// Every call fails with a transport error
    pub fail: bool,
    /// Streams break with a transport error after this many fragments
    pub fail_after_fragments: Option<usize>,
}

pub struct ScriptedProvider {
    name: String,
    latency: Duration,
    fragment_delay: Duration,
    scripts: RwLock<HashMap<String, ModelScript>>,
    pending_failures: AtomicU32,
    calls: AtomicU64,
}

impl ScriptedProvider {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            latency: Duration::ZERO,
            fragment_delay: Duration::ZERO,
            scripts: RwLock::new(HashMap::new()),
            pending_failures: AtomicU32::new(0),
            calls: AtomicU64::new(0),
        }
    }

    pub fn from_config(name: impl Into<String>, config: &ProviderConfig) -> Self {
        Self::new(name)
            .with_latency(Duration::from_millis(config.latency_ms))
            .with_fragment_delay(Duration::from_millis(config.fragment_delay_ms))
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn with_fragment_delay(mut self, delay: Duration) -> Self {
        self.fragment_delay = delay;
        self
    }

    /// Replace the script for one model
    pub fn script(&self, model: impl Into<String>, script: ModelScript) {
        self.scripts.write().insert(model.into(), script);
    }

    /// Shorthand for a fixed reply
    pub fn set_reply(&self, model: &str, reply: impl Into<String>) {
        self.scripts.write().entry(model.to_string()).or_default().reply = Some(reply.into());
    }

    /// Toggle hard failure for one model
    pub fn set_failing(&self, model: &str, fail: bool) {
        self.scripts.write().entry(model.to_string()).or_default().fail = fail;
    }

    /// Fail the next `n` calls regardless of model
    pub fn fail_next(&self, n: u32) {
        self.pending_failures.store(n, Ordering::SeqCst);
    }

    pub fn call_count(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    fn take_pending_failure(&self) -> bool {
        self.pending_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

/// Split text into fragments, keeping the separating spaces
pub fn split_fragments(text: &str) -> Vec<String> {
    text.split_inclusive(' ').map(str::to_string).collect()
}

fn generated_reply(model: &str, prompt: &Prompt) -> String {
    let topic = prompt
        .user
        .split_whitespace()
        .take(8)
        .collect::<Vec<_>>()
        .join(" ");
    format!("[{model}] Okay, you mentioned \"{topic}\". What would that mean for my team day to day?")
}

#[async_trait]
impl ProviderAdapter for ScriptedProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn call(&self, model: &str, prompt: &Prompt, stream: bool) -> Result<CallResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let script = self.scripts.read().get(model).cloned().unwrap_or_default();

        if script.fail || self.take_pending_failure() {
            return Err(CadenceError::transport(
                &self.name,
                model,
                "scripted failure",
            ));
        }

        let latency = script.latency.unwrap_or(self.latency);
        let delay = script.fragment_delay.unwrap_or(self.fragment_delay);
        let text = script
            .reply
            .clone()
            .unwrap_or_else(|| generated_reply(model, prompt));
        let fragments = split_fragments(&text);
        let prompt_tokens = prompt.user.split_whitespace().count() as u32
            + prompt
                .system
                .as_deref()
                .map_or(0, |s| s.split_whitespace().count() as u32);
        let usage = Usage::new(prompt_tokens, fragments.len() as u32);

        tokio::time::sleep(latency).await;

        if !stream {
            tokio::time::sleep(delay * fragments.len() as u32).await;
            return Ok(CallResponse {
                usage,
                latency_ms: latency.as_millis() as u64,
                content: CallContent::Text(text),
                success: true,
            });
        }

        let fail_after = script.fail_after_fragments;
        let provider = self.name.clone();
        let model = model.to_string();

        let events = async_stream::stream! {
            for (i, fragment) in fragments.into_iter().enumerate() {
                if fail_after == Some(i) {
                    yield Err(CadenceError::transport(provider.clone(), model.clone(), "stream reset"));
                    return;
                }
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                yield Ok(StreamEvent::Delta(fragment));
            }
            yield Ok(StreamEvent::Done { usage });
        };

        Ok(CallResponse {
            usage: Usage::new(prompt_tokens, 0),
            latency_ms: latency.as_millis() as u64,
            content: CallContent::Stream(Box::pin(events)),
            success: true,
        })
    }
}
