// crates/cadence-core/src/compliance/scanner.rs
// Window scanners: regex-based default and a digest-keyed verdict cache

use crate::error::{CadenceError, Result};
use async_trait::async_trait;
use moka::future::Cache;
use regex::{Regex, RegexSet};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::debug;

/// Outcome of scanning one window
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanVerdict {
    Pass,
    Block { span: String, reason: String },
}

impl ScanVerdict {
    pub fn is_pass(&self) -> bool {
        matches!(self, Self::Pass)
    }
}

/// Safety scan over the full text of a window
#[async_trait]
pub trait ComplianceScanner: Send + Sync {
    async fn scan(&self, text: &str) -> Result<ScanVerdict>;
}

pub type SharedScanner = Arc<dyn ComplianceScanner>;

/// Blocks any window matching one of the configured patterns
#[derive(Debug, Clone)]
pub struct RegexScanner {
    set: RegexSet,
    patterns: Vec<Regex>,
}

impl RegexScanner {
    pub fn new<I, S>(patterns: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let patterns: Vec<String> = patterns
            .into_iter()
            .map(|p| p.as_ref().to_string())
            .collect();
        let set = RegexSet::new(&patterns)
            .map_err(|e| CadenceError::Config(format!("invalid blocked pattern: {}", e)))?;
        let patterns = patterns
            .iter()
            .map(|p| Regex::new(p))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| CadenceError::Config(format!("invalid blocked pattern: {}", e)))?;
        Ok(Self { set, patterns })
    }

    pub fn pattern_count(&self) -> usize {
        self.patterns.len()
    }

    /// First matching pattern, by configured order
    fn check(&self, text: &str) -> ScanVerdict {
        let Some(index) = self.set.matches(text).into_iter().next() else {
            return ScanVerdict::Pass;
        };
        let regex = &self.patterns[index];
        let span = regex
            .find(text)
            .map(|m| m.as_str().to_string())
            .unwrap_or_default();
        ScanVerdict::Block {
            span,
            reason: format!("matched blocked pattern {}", regex.as_str()),
        }
    }
}

#[async_trait]
impl ComplianceScanner for RegexScanner {
    async fn scan(&self, text: &str) -> Result<ScanVerdict> {
        Ok(self.check(text))
    }
}

/// Memoizes verdicts by SHA-256 of the window text. Errors are never cached.
pub struct CachedScanner {
    inner: SharedScanner,
    cache: Cache<[u8; 32], ScanVerdict>,
}

impl CachedScanner {
    pub fn new(inner: SharedScanner, capacity: u64) -> Self {
        Self {
            inner,
            cache: Cache::new(capacity),
        }
    }

    fn digest(text: &str) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(text.as_bytes());
        hasher.finalize().into()
    }
}

#[async_trait]
impl ComplianceScanner for CachedScanner {
    async fn scan(&self, text: &str) -> Result<ScanVerdict> {
        let key = Self::digest(text);
        if let Some(verdict) = self.cache.get(&key).await {
            debug!("Scan cache hit");
            return Ok(verdict);
        }
        let verdict = self.inner.scan(text).await?;
        self.cache.insert(key, verdict.clone()).await;
        Ok(verdict)
    }
}
