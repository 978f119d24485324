//! The per-call data model: calls, utterances, turns, tool calls, and the
//! post-call artifact. All offsets are milliseconds from the carrier
//! `start` event; wall-clock instants are RFC3339.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Call
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Why the call reached `Ended`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalCause {
    Hangup,
    Transfer,
    EndCallTool,
    TransportError,
    Timeout,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Call {
    pub call_id: String,
    pub tenant_id: String,
    /// Caller number (E.164), from the carrier `start` metadata.
    pub caller_id: String,
    pub dialed_number: String,
    pub direction: Direction,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub terminal: Option<TerminalCause>,
}

impl Call {
    pub fn inbound(
        call_id: impl Into<String>,
        tenant_id: impl Into<String>,
        caller_id: impl Into<String>,
        dialed_number: impl Into<String>,
    ) -> Self {
        Self {
            call_id: call_id.into(),
            tenant_id: tenant_id.into(),
            caller_id: caller_id.into(),
            dialed_number: dialed_number.into(),
            direction: Direction::Inbound,
            started_at: Utc::now(),
            ended_at: None,
            terminal: None,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Utterances and turns
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Speaker {
    Caller,
    Agent,
}

/// A contiguous span of caller speech delimited by the VAD. The transcript
/// stays `None` until the recogniser commits a final.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Utterance {
    pub utterance_id: String,
    pub speaker: Speaker,
    pub t_start_ms: u64,
    pub t_end_ms: Option<u64>,
    pub text: Option<String>,
    pub confidence: Option<f32>,
}

/// What prompted the agent to produce a turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnTrigger {
    CallerUtterance { utterance_id: String },
    ToolResult,
    System,
}

/// A contiguous span of agent output. On barge-in `agent_text` holds what
/// was actually spoken before the cutoff, never the planned text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub turn_id: String,
    pub trigger: TurnTrigger,
    pub agent_text: String,
    pub tool_call_ids: Vec<String>,
    pub t_start_ms: u64,
    pub t_end_ms: Option<u64>,
    pub cancelled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolCallStatus {
    Pending,
    Succeeded,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
    pub status: ToolCallStatus,
    pub result: Option<serde_json::Value>,
    pub t_start_ms: u64,
    pub t_end_ms: Option<u64>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Post-call artifact
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptEntry {
    pub speaker: Speaker,
    pub text: String,
    pub t_start_ms: u64,
    pub t_end_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Urgency {
    #[default]
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScopeCreep {
    pub flagged: bool,
    pub rationale: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Lead {
    pub answers: BTreeMap<String, String>,
    pub completed: bool,
}

/// The sink event emitted once per call (§ wire shape is fixed; the sink
/// dedupes on `call_id`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallArtifact {
    pub call_id: String,
    pub tenant_id: String,
    pub from: String,
    pub to: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration_s: f64,
    pub terminal_cause: TerminalCause,
    pub transcript: Vec<TranscriptEntry>,
    pub summary: Option<String>,
    pub action_items: Vec<String>,
    pub urgency: Urgency,
    pub scope_creep: Option<ScopeCreep>,
    pub lead: Option<Lead>,
    pub finalizer_errors: Vec<String>,
}

/// Order transcript entries by start offset across speakers; on identical
/// offsets the caller sorts before the agent.
pub fn order_transcript(mut entries: Vec<TranscriptEntry>) -> Vec<TranscriptEntry> {
    entries.sort_by(|a, b| {
        a.t_start_ms
            .cmp(&b.t_start_ms)
            .then_with(|| speaker_rank(a.speaker).cmp(&speaker_rank(b.speaker)))
    });
    entries
}

fn speaker_rank(s: Speaker) -> u8 {
    match s {
        Speaker::Caller => 0,
        Speaker::Agent => 1,
    }
}
