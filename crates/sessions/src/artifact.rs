//! Assembles the post-call sink event from a finished [`CallLog`].
//!
//! Summary fields come from the LLM as a JSON object; parsing is
//! tolerant of code fences and camelCase keys, but any miss downgrades
//! to a partial artifact with `finalizer_errors` rather than blocking
//! teardown.

use serde::Deserialize;

use vl_domain::call::{order_transcript, CallArtifact, ScopeCreep, TerminalCause, Urgency};
use vl_domain::error::{Error, Result};

use crate::log::CallLog;

/// The structured object the finalizer asks the LLM for.
#[derive(Debug, Clone, Deserialize)]
pub struct SummaryFields {
    #[serde(default, alias = "callerName")]
    pub caller_name: Option<String>,
    #[serde(default)]
    pub project: Option<String>,
    pub summary: String,
    #[serde(default, alias = "actionItems")]
    pub action_items: Vec<String>,
    #[serde(default)]
    pub urgency: Urgency,
}

/// Parse the LLM's summary output, stripping markdown fences if present.
pub fn parse_summary_json(raw: &str) -> Result<SummaryFields> {
    let trimmed = raw.trim();
    let body = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .map(|rest| rest.trim_end_matches("```"))
        .unwrap_or(trimmed);
    serde_json::from_str(body.trim()).map_err(Error::Json)
}

/// Build the artifact. `summary: None` with non-empty `errors` is the
/// partial-failure shape.
pub fn build_artifact(
    log: &CallLog,
    summary: Option<SummaryFields>,
    scope_creep: Option<ScopeCreep>,
    finalizer_errors: Vec<String>,
) -> CallArtifact {
    let call = log.call();
    let ended_at = call.ended_at.unwrap_or_else(chrono::Utc::now);
    let duration_s = (ended_at - call.started_at).num_milliseconds().max(0) as f64 / 1000.0;

    let (summary_text, action_items, urgency) = match summary {
        Some(s) => (Some(s.summary), s.action_items, s.urgency),
        None => (None, Vec::new(), Urgency::Low),
    };

    CallArtifact {
        call_id: call.call_id.clone(),
        tenant_id: call.tenant_id.clone(),
        from: call.caller_id.clone(),
        to: call.dialed_number.clone(),
        started_at: call.started_at,
        ended_at,
        duration_s,
        terminal_cause: call.terminal.unwrap_or(TerminalCause::Hangup),
        transcript: order_transcript(log.transcript_entries()),
        summary: summary_text,
        action_items,
        urgency,
        scope_creep,
        lead: if log.has_lead_data() {
            Some(log.lead().clone())
        } else {
            None
        },
        finalizer_errors,
    }
}
