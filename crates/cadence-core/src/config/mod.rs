// crates/cadence-core/src/config/mod.rs
// Configuration: file, environment, and hot reload

pub mod env;
pub mod file;
pub mod reload;

pub use env::{ApiKeys, ConfigValidation, EnvConfig};
pub use file::{
    AuditConfig, BreakerConfig, BudgetConfig, CadenceConfig, CandidateConfig, ComplianceConfig,
    ProviderConfig, ProviderKind, RoutingConfig, StreamConfig, TaskConfig, TurnConfig,
};
pub use reload::ConfigHandle;
