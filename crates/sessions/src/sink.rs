//! Downstream artifact delivery.
//!
//! At-least-once: the HTTP sink retries once on failure, and the sink
//! service dedupes on `call_id`. Exactly-once *production* is the
//! finalizer's job; [`EmitGuard`] backs that invariant.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use async_trait::async_trait;

use vl_domain::call::CallArtifact;
use vl_domain::error::{Error, Result};
use vl_domain::trace::TraceEvent;

#[async_trait]
pub trait ArtifactSink: Send + Sync {
    async fn emit(&self, artifact: &CallArtifact) -> Result<()>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Exactly-once production guard
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One-shot latch: the first `claim` wins, every later one is refused.
#[derive(Default)]
pub struct EmitGuard {
    emitted: AtomicBool,
}

impl EmitGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` exactly once.
    pub fn claim(&self) -> bool {
        !self.emitted.swap(true, Ordering::SeqCst)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// HTTP sink
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct HttpArtifactSink {
    url: String,
    client: reqwest::Client,
}

impl HttpArtifactSink {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .map_err(|e| Error::Http(e.to_string()))?;
        Ok(Self {
            url: url.into(),
            client,
        })
    }

    async fn post_once(&self, artifact: &CallArtifact) -> Result<()> {
        let resp = self
            .client
            .post(&self.url)
            .json(artifact)
            .send()
            .await
            .map_err(|e| Error::Http(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(Error::Http(format!("sink returned {status}")));
        }
        Ok(())
    }
}

#[async_trait]
impl ArtifactSink for HttpArtifactSink {
    async fn emit(&self, artifact: &CallArtifact) -> Result<()> {
        let mut attempts: u32 = 1;
        let mut result = self.post_once(artifact).await;
        if let Err(e) = &result {
            tracing::warn!(call_id = %artifact.call_id, error = %e, "artifact delivery failed, retrying");
            attempts += 1;
            result = self.post_once(artifact).await;
        }
        match result {
            Ok(()) => {
                TraceEvent::ArtifactEmitted {
                    call_id: artifact.call_id.clone(),
                    attempts,
                }
                .emit();
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Non-delivering sinks
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Used when no sink URL is configured: the artifact is logged in full
/// so nothing is silently discarded.
pub struct LogSink;

#[async_trait]
impl ArtifactSink for LogSink {
    async fn emit(&self, artifact: &CallArtifact) -> Result<()> {
        let json = serde_json::to_string(artifact)?;
        tracing::info!(call_id = %artifact.call_id, artifact = %json, "artifact (no sink configured)");
        Ok(())
    }
}

/// Captures artifacts in memory for tests.
#[derive(Default)]
pub struct MemorySink {
    artifacts: parking_lot::Mutex<Vec<CallArtifact>>,
    emit_count: AtomicU32,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn artifacts(&self) -> Vec<CallArtifact> {
        self.artifacts.lock().clone()
    }

    pub fn emit_count(&self) -> u32 {
        self.emit_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ArtifactSink for MemorySink {
    async fn emit(&self, artifact: &CallArtifact) -> Result<()> {
        self.emit_count.fetch_add(1, Ordering::SeqCst);
        self.artifacts.lock().push(artifact.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emit_guard_claims_exactly_once() {
        let guard = EmitGuard::new();
        assert!(guard.claim());
        assert!(!guard.claim());
        assert!(!guard.claim());
    }

    #[tokio::test]
    async fn memory_sink_counts_emissions() {
        use vl_domain::call::{Call, TerminalCause};
        use vl_domain::call::Urgency;

        let sink = MemorySink::new();
        let call = Call::inbound("CA1", "aurora", "+1", "+2");
        let artifact = CallArtifact {
            call_id: call.call_id.clone(),
            tenant_id: call.tenant_id.clone(),
            from: call.caller_id.clone(),
            to: call.dialed_number.clone(),
            started_at: call.started_at,
            ended_at: call.started_at,
            duration_s: 0.0,
            terminal_cause: TerminalCause::Hangup,
            transcript: vec![],
            summary: None,
            action_items: vec![],
            urgency: Urgency::Low,
            scope_creep: None,
            lead: None,
            finalizer_errors: vec![],
        };
        sink.emit(&artifact).await.unwrap();
        assert_eq!(sink.emit_count(), 1);
        assert_eq!(sink.artifacts()[0].call_id, "CA1");
    }
}
