//! The single-writer record of one call.
//!
//! Only the orchestrator task mutates a `CallLog`; no locks are needed.
//! Ordering invariants enforced here:
//! - utterance start offsets are non-decreasing per speaker;
//! - a cancelled turn records what was actually spoken, not the plan;
//! - a tool call never outlives its turn.

use chrono::Utc;
use uuid::Uuid;

use vl_domain::call::{
    Call, Lead, Speaker, TerminalCause, ToolCallRecord, ToolCallStatus, TranscriptEntry, Turn,
    TurnTrigger, Utterance,
};
use vl_domain::msg::ToolCall;

pub struct CallLog {
    call: Call,
    utterances: Vec<Utterance>,
    turns: Vec<Turn>,
    tool_calls: Vec<ToolCallRecord>,
    lead: Lead,
}

impl CallLog {
    pub fn new(call: Call) -> Self {
        Self {
            call,
            utterances: Vec::new(),
            turns: Vec::new(),
            tool_calls: Vec::new(),
            lead: Lead::default(),
        }
    }

    pub fn call(&self) -> &Call {
        &self.call
    }

    pub fn utterances(&self) -> &[Utterance] {
        &self.utterances
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn tool_calls(&self) -> &[ToolCallRecord] {
        &self.tool_calls
    }

    pub fn lead(&self) -> &Lead {
        &self.lead
    }

    // ── Utterances ────────────────────────────────────────────────

    /// Open a caller utterance. Start offsets are clamped monotonic: a
    /// late VAD event can never move time backwards.
    pub fn begin_utterance(&mut self, t_start_ms: u64) -> String {
        let floor = self
            .utterances
            .iter()
            .rev()
            .find(|u| u.speaker == Speaker::Caller)
            .map(|u| u.t_start_ms)
            .unwrap_or(0);
        let utterance_id = Uuid::new_v4().to_string();
        self.utterances.push(Utterance {
            utterance_id: utterance_id.clone(),
            speaker: Speaker::Caller,
            t_start_ms: t_start_ms.max(floor),
            t_end_ms: None,
            text: None,
            confidence: None,
        });
        utterance_id
    }

    pub fn finalize_utterance(
        &mut self,
        utterance_id: &str,
        t_end_ms: u64,
        text: String,
        confidence: f32,
    ) {
        if let Some(u) = self
            .utterances
            .iter_mut()
            .find(|u| u.utterance_id == utterance_id)
        {
            u.t_end_ms = Some(t_end_ms.max(u.t_start_ms));
            u.text = Some(text);
            u.confidence = Some(confidence);
        } else {
            tracing::warn!(utterance_id, "finalize for unknown utterance");
        }
    }

    /// Drop an utterance that never produced a transcript.
    pub fn discard_utterance(&mut self, utterance_id: &str) {
        self.utterances
            .retain(|u| u.utterance_id != utterance_id || u.text.is_some());
    }

    // ── Turns ─────────────────────────────────────────────────────

    pub fn begin_turn(&mut self, trigger: TurnTrigger, t_start_ms: u64) -> String {
        let turn_id = Uuid::new_v4().to_string();
        self.turns.push(Turn {
            turn_id: turn_id.clone(),
            trigger,
            agent_text: String::new(),
            tool_call_ids: Vec::new(),
            t_start_ms,
            t_end_ms: None,
            cancelled: false,
        });
        turn_id
    }

    /// Append text the agent has actually finished speaking.
    pub fn append_spoken(&mut self, turn_id: &str, text: &str) {
        if text.is_empty() {
            return;
        }
        if let Some(turn) = self.turn_mut(turn_id) {
            if !turn.agent_text.is_empty() {
                turn.agent_text.push(' ');
            }
            turn.agent_text.push_str(text);
        }
    }

    pub fn complete_turn(&mut self, turn_id: &str, t_end_ms: u64) {
        if let Some(turn) = self.turn_mut(turn_id) {
            turn.t_end_ms = Some(t_end_ms.max(turn.t_start_ms));
        }
    }

    /// Barge-in: the turn keeps only what was spoken, and every pending
    /// tool call it issued is cancelled with it.
    pub fn cancel_turn(&mut self, turn_id: &str, t_end_ms: u64) {
        let tool_ids = match self.turn_mut(turn_id) {
            Some(turn) => {
                turn.cancelled = true;
                turn.t_end_ms = Some(t_end_ms.max(turn.t_start_ms));
                turn.tool_call_ids.clone()
            }
            None => return,
        };
        for record in self
            .tool_calls
            .iter_mut()
            .filter(|r| tool_ids.contains(&r.id) && r.status == ToolCallStatus::Pending)
        {
            record.status = ToolCallStatus::Cancelled;
            record.t_end_ms = Some(t_end_ms);
        }
    }

    fn turn_mut(&mut self, turn_id: &str) -> Option<&mut Turn> {
        self.turns.iter_mut().find(|t| t.turn_id == turn_id)
    }

    // ── Tool calls ────────────────────────────────────────────────

    pub fn record_tool_call(&mut self, turn_id: &str, call: &ToolCall, t_start_ms: u64) {
        self.tool_calls.push(ToolCallRecord {
            id: call.call_id.clone(),
            name: call.tool_name.clone(),
            arguments: call.arguments.clone(),
            status: ToolCallStatus::Pending,
            result: None,
            t_start_ms,
            t_end_ms: None,
        });
        if let Some(turn) = self.turn_mut(turn_id) {
            turn.tool_call_ids.push(call.call_id.clone());
        }
    }

    pub fn complete_tool_call(
        &mut self,
        call_id: &str,
        status: ToolCallStatus,
        result: serde_json::Value,
        t_end_ms: u64,
    ) {
        if let Some(record) = self.tool_calls.iter_mut().find(|r| r.id == call_id) {
            record.status = status;
            record.result = Some(result);
            record.t_end_ms = Some(t_end_ms);
        }
    }

    // ── Lead capture ──────────────────────────────────────────────

    pub fn lead_answer(&mut self, question_id: &str, answer: &str) {
        self.lead
            .answers
            .insert(question_id.to_owned(), answer.to_owned());
    }

    pub fn lead_completed(&mut self) {
        self.lead.completed = true;
    }

    pub fn has_lead_data(&self) -> bool {
        !self.lead.answers.is_empty()
    }

    // ── Terminal ──────────────────────────────────────────────────

    pub fn set_terminal(&mut self, cause: TerminalCause) {
        // First cause wins; a hangup racing an end_call keeps the original.
        if self.call.terminal.is_none() {
            self.call.terminal = Some(cause);
            self.call.ended_at = Some(Utc::now());
        }
    }

    pub fn terminal(&self) -> Option<TerminalCause> {
        self.call.terminal
    }

    // ── Transcript assembly ───────────────────────────────────────

    /// Finalized caller utterances and non-empty agent turns as sink
    /// transcript entries (unordered; the artifact builder sorts).
    pub fn transcript_entries(&self) -> Vec<TranscriptEntry> {
        let mut entries = Vec::new();
        for u in &self.utterances {
            if let Some(text) = &u.text {
                entries.push(TranscriptEntry {
                    speaker: Speaker::Caller,
                    text: text.clone(),
                    t_start_ms: u.t_start_ms,
                    t_end_ms: u.t_end_ms.unwrap_or(u.t_start_ms),
                });
            }
        }
        for t in &self.turns {
            if !t.agent_text.is_empty() {
                entries.push(TranscriptEntry {
                    speaker: Speaker::Agent,
                    text: t.agent_text.clone(),
                    t_start_ms: t.t_start_ms,
                    t_end_ms: t.t_end_ms.unwrap_or(t.t_start_ms),
                });
            }
        }
        entries
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Spoken-prefix truncation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Word-proportional prefix of a sentence interrupted mid-playout:
/// `words * frames_played / frames_total`, rounded down. Deterministic,
/// so the cancelled turn's record is reproducible.
pub fn spoken_prefix(text: &str, frames_played: usize, frames_total: usize) -> String {
    if frames_total == 0 || frames_played == 0 {
        return String::new();
    }
    if frames_played >= frames_total {
        return text.to_owned();
    }
    let words: Vec<&str> = text.split_whitespace().collect();
    let keep = words.len() * frames_played / frames_total;
    words[..keep].join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn log() -> CallLog {
        CallLog::new(Call::inbound("CA1", "aurora", "+15135550123", "+15135550100"))
    }

    #[test]
    fn utterance_lifecycle_records_text_and_bounds() {
        let mut log = log();
        let id = log.begin_utterance(1200);
        log.finalize_utterance(&id, 2600, "any update on Straus?".into(), 0.93);

        let u = &log.utterances()[0];
        assert_eq!(u.t_start_ms, 1200);
        assert_eq!(u.t_end_ms, Some(2600));
        assert_eq!(u.text.as_deref(), Some("any update on Straus?"));
    }

    #[test]
    fn caller_start_offsets_never_regress() {
        let mut log = log();
        log.begin_utterance(5000);
        let id = log.begin_utterance(4000); // late event
        let u = log
            .utterances()
            .iter()
            .find(|u| u.utterance_id == id)
            .unwrap();
        assert_eq!(u.t_start_ms, 5000);
    }

    #[test]
    fn cancelled_turn_keeps_spoken_text_and_cancels_pending_tools() {
        let mut log = log();
        let turn_id = log.begin_turn(TurnTrigger::System, 100);
        log.append_spoken(&turn_id, "Hi, this is Aurora");

        let tc = ToolCall {
            call_id: "c1".into(),
            tool_name: "lookup_project_status".into(),
            arguments: json!({}),
        };
        log.record_tool_call(&turn_id, &tc, 150);

        log.cancel_turn(&turn_id, 400);

        let turn = &log.turns()[0];
        assert!(turn.cancelled);
        assert_eq!(turn.agent_text, "Hi, this is Aurora");
        assert_eq!(log.tool_calls()[0].status, ToolCallStatus::Cancelled);
    }

    #[test]
    fn completed_tool_calls_are_not_cancelled_by_barge_in() {
        let mut log = log();
        let turn_id = log.begin_turn(TurnTrigger::System, 100);
        let tc = ToolCall {
            call_id: "c1".into(),
            tool_name: "capture_lead_answer".into(),
            arguments: json!({}),
        };
        log.record_tool_call(&turn_id, &tc, 150);
        log.complete_tool_call("c1", ToolCallStatus::Succeeded, json!({"accepted": true}), 300);
        log.cancel_turn(&turn_id, 400);
        assert_eq!(log.tool_calls()[0].status, ToolCallStatus::Succeeded);
    }

    #[test]
    fn first_terminal_cause_wins() {
        let mut log = log();
        log.set_terminal(TerminalCause::Transfer);
        log.set_terminal(TerminalCause::Hangup);
        assert_eq!(log.terminal(), Some(TerminalCause::Transfer));
    }

    #[test]
    fn transcript_includes_only_voiced_content() {
        let mut log = log();
        let u1 = log.begin_utterance(1000);
        log.finalize_utterance(&u1, 2000, "hello".into(), 0.9);
        let _u2 = log.begin_utterance(9000); // never finalized

        let t1 = log.begin_turn(TurnTrigger::System, 100);
        log.append_spoken(&t1, "Hi there");
        let t2 = log.begin_turn(TurnTrigger::System, 5000); // cancelled before audio
        log.cancel_turn(&t2, 5010);

        let entries = log.transcript_entries();
        assert_eq!(entries.len(), 2);
    }

    #[test]
    fn spoken_prefix_is_word_proportional() {
        let text = "I can check on that project for you right away";
        assert_eq!(spoken_prefix(text, 0, 100), "");
        assert_eq!(spoken_prefix(text, 100, 100), text);
        // 10 words, half played → 5 words.
        assert_eq!(
            spoken_prefix(text, 50, 100),
            "I can check on that"
        );
        assert_eq!(spoken_prefix(text, 7, 0), "");
    }
}
