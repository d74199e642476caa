// crates/cadence-core/src/error.rs
// Standardized error types for Cadence

use thiserror::Error;

/// Main error type for the Cadence library
#[derive(Error, Debug)]
pub enum CadenceError {
    #[error("budget exhausted for session {session_id}: requested ${requested_usd:.6}")]
    BudgetExhausted {
        session_id: String,
        requested_usd: f64,
    },

    #[error("no provider available for role {role}")]
    NoProviderAvailable { role: String },

    #[error("compliance scanner unavailable: {0}")]
    ScanUnavailable(String),

    #[error("provider transport error ({provider}/{model}): {message}")]
    ProviderTransport {
        provider: String,
        model: String,
        message: String,
    },

    #[error("slow-path task {task_id} timed out")]
    TaskTimeout { task_id: String },

    #[error("unknown reservation: {0}")]
    UnknownReservation(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("task cancelled")]
    Cancelled,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unknown error: {0}")]
    Other(String),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Convenience type alias for Result using CadenceError
pub type Result<T> = std::result::Result<T, CadenceError>;

impl CadenceError {
    /// Build a transport error for a provider/model pair
    pub fn transport(
        provider: impl Into<String>,
        model: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::ProviderTransport {
            provider: provider.into(),
            model: model.into(),
            message: message.into(),
        }
    }

    /// Errors the turn can absorb (de-escalate, degrade, or block) without failing
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::BudgetExhausted { .. }
                | Self::NoProviderAvailable { .. }
                | Self::ScanUnavailable(_)
                | Self::ProviderTransport { .. }
                | Self::TaskTimeout { .. }
                | Self::Cancelled
        )
    }

    /// Whether this error counts as a breaker failure for the provider
    pub fn is_provider_failure(&self) -> bool {
        matches!(self, Self::ProviderTransport { .. } | Self::Http(_))
    }
}

impl From<String> for CadenceError {
    fn from(s: String) -> Self {
        CadenceError::Other(s)
    }
}

impl From<tokio::task::JoinError> for CadenceError {
    fn from(err: tokio::task::JoinError) -> Self {
        if err.is_cancelled() {
            CadenceError::Cancelled
        } else {
            CadenceError::Other(err.to_string())
        }
    }
}

impl From<CadenceError> for String {
    fn from(err: CadenceError) -> Self {
        err.to_string()
    }
}
