// crates/cadence-core/src/llm/mod.rs
// Provider adapters, circuit breaker, and pricing

pub mod circuit_breaker;
pub mod factory;
pub mod openai_compat;
pub mod pricing;
pub mod provider;
pub mod scripted;

pub use circuit_breaker::{BreakerSnapshot, CircuitBreaker};
pub use factory::ProviderRegistry;
pub use openai_compat::OpenAiCompatClient;
pub use pricing::ModelPricing;
pub use provider::{
    CallContent, CallResponse, ContentStream, Prompt, ProviderAdapter, ProviderKey, StreamEvent,
    Usage,
};
pub use scripted::{ModelScript, ScriptedProvider};
