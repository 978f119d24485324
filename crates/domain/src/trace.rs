use serde::Serialize;

/// Structured trace events emitted across all VoiceLine crates.
///
/// These are the analytics-significant moments of a call; everything else
/// goes through plain `tracing` statements.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event")]
pub enum TraceEvent {
    CallStarted {
        call_id: String,
        tenant_id: String,
        from: String,
        to: String,
    },
    CallEnded {
        call_id: String,
        terminal_cause: String,
        duration_ms: u64,
    },
    /// A non-primary voice was used. Never silent: this is the required
    /// audit record for any voice downgrade.
    VoiceFallback {
        call_id: String,
        tier: String,
        provider: String,
        voice_id: String,
        reason: String,
    },
    FrameDrop {
        call_id: String,
        dropped_total: u64,
    },
    AsrReconnect {
        call_id: String,
        attempt: u32,
        replayed_frames: usize,
    },
    BargeIn {
        call_id: String,
        turn_id: String,
        at_ms: u64,
    },
    LeadCaptured {
        call_id: String,
        question_id: String,
    },
    ArtifactEmitted {
        call_id: String,
        attempts: u32,
    },
}

impl TraceEvent {
    pub fn emit(&self) {
        let json = serde_json::to_string(self).unwrap_or_default();
        tracing::info!(trace_event = %json, "vl_event");
    }
}
