// crates/cadence-core/src/llm/pricing.rs
// Token pricing for turning measured usage into the actual cost of a call
//
// Prices come from the routing table (`input_per_million` / `output_per_million`
// per candidate). Candidates without prices are charged their estimate.

use super::provider::Usage;
use crate::config::CandidateConfig;

/// Cost per million tokens (input, output)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelPricing {
    pub input_per_million: f64,
    pub output_per_million: f64,
}

impl ModelPricing {
    pub const fn new(input: f64, output: f64) -> Self {
        Self {
            input_per_million: input,
            output_per_million: output,
        }
    }

    /// Pricing from a routing-table entry; both prices must be present
    pub fn for_candidate(candidate: &CandidateConfig) -> Option<Self> {
        match (candidate.input_per_million, candidate.output_per_million) {
            (Some(input), Some(output)) => Some(Self::new(input, output)),
            _ => None,
        }
    }

    /// Calculate cost for a given usage
    pub fn calculate_cost(&self, prompt_tokens: u32, completion_tokens: u32) -> f64 {
        let input_cost = (prompt_tokens as f64) * self.input_per_million / 1_000_000.0;
        let output_cost = (completion_tokens as f64) * self.output_per_million / 1_000_000.0;
        input_cost + output_cost
    }
}

/// Actual cost of a call: priced usage when both are known, else the estimate
pub fn actual_cost(pricing: Option<ModelPricing>, usage: &Usage, estimate_usd: f64) -> f64 {
    match pricing {
        Some(p) if usage.total_tokens > 0 => {
            p.calculate_cost(usage.prompt_tokens, usage.completion_tokens)
        }
        _ => estimate_usd,
    }
}
