// crates/cadence-core/src/compliance/mod.rs
// Streaming compliance gate: scan-before-emit over a trailing window of fragments
//
// Every fragment is held in the window until a scan of the whole window has
// passed and the window has grown past W. A failed or unavailable scan
// discards the window, so nothing unscanned ever reaches the output.

pub mod scanner;

pub use scanner::{CachedScanner, ComplianceScanner, RegexScanner, ScanVerdict, SharedScanner};

use crate::audit::{self, SharedSink};
use crate::config::{CadenceConfig, StreamConfig};
use crate::error::{CadenceError, Result};
use crate::llm::{ContentStream, ProviderKey, StreamEvent, Usage};
use cadence_types::AuditEvent;
use futures::StreamExt;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Terminal verdict of one gated stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateVerdict {
    Complete,
    /// `span` is the violating text, or the whole window when the scanner was unavailable
    Blocked { span: String, reason: String },
}

impl GateVerdict {
    pub fn is_blocked(&self) -> bool {
        matches!(self, Self::Blocked { .. })
    }
}

/// Text that crossed the output boundary
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Released {
    pub text: String,
    pub fragments: usize,
}

impl Released {
    pub fn is_empty(&self) -> bool {
        self.fragments == 0
    }

    fn push(&mut self, fragment: &str) {
        self.text.push_str(fragment);
        self.fragments += 1;
    }
}

#[derive(Debug)]
pub struct GateOutcome {
    pub verdict: GateVerdict,
    /// Usage reported by the `Done` event, if the stream got that far
    pub usage: Usage,
    /// Transport error that ended the stream early
    pub stream_error: Option<CadenceError>,
}

/// Who the gated call belongs to, for audit records
#[derive(Debug, Clone, Copy)]
pub struct GateContext<'a> {
    pub session_id: &'a str,
    pub turn_number: u64,
    pub key: &'a ProviderKey,
}

/// Build the configured scanner stack: regex patterns behind the verdict cache
pub fn scanner_from_config(config: &CadenceConfig) -> Result<SharedScanner> {
    let regex = RegexScanner::new(&config.compliance.blocked_patterns)?;
    info!(
        patterns = regex.pattern_count(),
        cache_capacity = config.stream.scan_cache_capacity,
        "Compliance scanner ready"
    );
    Ok(Arc::new(CachedScanner::new(
        Arc::new(regex),
        config.stream.scan_cache_capacity,
    )))
}

pub struct ComplianceGate {
    scanner: SharedScanner,
    audit: SharedSink,
    window_size: usize,
    scan_timeout: Duration,
    /// Fragments released across every stream this gate has run
    released_total: AtomicUsize,
}

impl ComplianceGate {
    pub fn new(scanner: SharedScanner, audit: SharedSink, config: &StreamConfig) -> Self {
        Self {
            scanner,
            audit,
            window_size: config.window_size.max(1),
            scan_timeout: config.scan_timeout(),
            released_total: AtomicUsize::new(0),
        }
    }

    pub fn window_size(&self) -> usize {
        self.window_size
    }

    /// Fragments released so far. Readable while a `run` is still in flight.
    pub fn released_fragments(&self) -> usize {
        self.released_total.load(Ordering::Acquire)
    }

    /// Scan with the timeout; scanner failure is reported as `ScanUnavailable`
    async fn scan_window(&self, window: &VecDeque<String>) -> Result<ScanVerdict> {
        let text: String = window.iter().map(String::as_str).collect();
        match tokio::time::timeout(self.scan_timeout, self.scanner.scan(&text)).await {
            Ok(Ok(verdict)) => Ok(verdict),
            Ok(Err(CadenceError::ScanUnavailable(msg))) => Err(CadenceError::ScanUnavailable(msg)),
            Ok(Err(e)) => Err(CadenceError::ScanUnavailable(e.to_string())),
            Err(_) => Err(CadenceError::ScanUnavailable(format!(
                "scan timed out after {}ms",
                self.scan_timeout.as_millis()
            ))),
        }
    }

    /// Turn a failed scan into a block verdict and record it. The window is dropped.
    fn block(
        &self,
        ctx: &GateContext<'_>,
        window: &mut VecDeque<String>,
        result: Result<ScanVerdict>,
    ) -> GateVerdict {
        let (span, reason) = match result {
            Ok(ScanVerdict::Block { span, reason }) => (span, reason),
            Ok(ScanVerdict::Pass) => return GateVerdict::Complete,
            Err(e) => (window.iter().map(String::as_str).collect(), e.to_string()),
        };
        window.clear();

        info!(
            session_id = ctx.session_id,
            turn = ctx.turn_number,
            key = %ctx.key,
            reason = %reason,
            "Window blocked"
        );
        self.audit.append(audit::record(
            Some(ctx.session_id),
            Some(ctx.turn_number),
            AuditEvent::Blocked {
                provider: ctx.key.provider.clone(),
                model: ctx.key.model.clone(),
                span: span.clone(),
                reason: reason.clone(),
            },
        ));
        GateVerdict::Blocked { span, reason }
    }

    async fn emit(&self, output: &mpsc::Sender<String>, released: &mut Released, fragment: String) {
        released.push(&fragment);
        self.released_total.fetch_add(1, Ordering::AcqRel);
        if output.send(fragment).await.is_err() {
            debug!("Output receiver closed, fragment dropped");
        }
    }

    /// Gate one stream. Released text is written into `released` as it crosses the
    /// output boundary, so it stays readable if this future is dropped at a deadline.
    pub async fn run(
        &self,
        ctx: GateContext<'_>,
        mut stream: ContentStream,
        output: &mpsc::Sender<String>,
        released: &mut Released,
    ) -> GateOutcome {
        let mut window: VecDeque<String> = VecDeque::with_capacity(self.window_size + 1);
        let mut usage = Usage::default();
        let mut stream_error = None;

        while let Some(event) = stream.next().await {
            match event {
                Ok(StreamEvent::Delta(fragment)) => {
                    window.push_back(fragment);
                    match self.scan_window(&window).await {
                        Ok(ScanVerdict::Pass) => {
                            if window.len() > self.window_size
                                && let Some(oldest) = window.pop_front()
                            {
                                self.emit(output, released, oldest).await;
                            }
                        }
                        result => {
                            return GateOutcome {
                                verdict: self.block(&ctx, &mut window, result),
                                usage,
                                stream_error: None,
                            };
                        }
                    }
                }
                Ok(StreamEvent::Done { usage: reported }) => {
                    usage = reported;
                    break;
                }
                Err(e) => {
                    warn!(key = %ctx.key, error = %e, "Stream ended by transport error");
                    stream_error = Some(e);
                    break;
                }
            }
        }

        if window.is_empty() {
            return GateOutcome {
                verdict: GateVerdict::Complete,
                usage,
                stream_error,
            };
        }

        let verdict = match self.scan_window(&window).await {
            Ok(ScanVerdict::Pass) => {
                for fragment in window.drain(..) {
                    self.emit(output, released, fragment).await;
                }
                GateVerdict::Complete
            }
            result => self.block(&ctx, &mut window, result),
        };

        debug!(
            key = %ctx.key,
            released_fragments = released.fragments,
            blocked = verdict.is_blocked(),
            "Stream gated"
        );
        GateOutcome {
            verdict,
            usage,
            stream_error,
        }
    }

    /// Gate a stream to completion and return what was released with the outcome
    pub async fn run_to_end(
        &self,
        ctx: GateContext<'_>,
        stream: ContentStream,
        output: &mpsc::Sender<String>,
    ) -> (GateOutcome, Released) {
        let mut released = Released::default();
        let outcome = self.run(ctx, stream, output, &mut released).await;
        (outcome, released)
    }
}

impl std::fmt::Debug for ComplianceGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComplianceGate")
            .field("window_size", &self.window_size)
            .field("scan_timeout", &self.scan_timeout)
            .finish()
    }
}
