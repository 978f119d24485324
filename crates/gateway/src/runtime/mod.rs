//! The per-call runtime: cancellation, the turn runner, the speaker
//! (playout) task, tool dispatch, and the session orchestrator that
//! owns them all.

pub mod cancel;
pub mod finalizer;
pub mod history;
pub mod lead;
pub mod resolver;
pub mod sentence;
pub mod session;
pub mod speaker;
pub mod tools;
pub mod turn;

/// Events delivered to the orchestrator task by its siblings. Each kind
/// flows through a bounded queue; only the orchestrator consumes them.
#[derive(Debug)]
pub enum SessionEvent {
    Turn(turn::TurnEvent),
    Speaker(speaker::SpeakerEvent),
    Asr(vl_providers::AsrEvent),
}

/// Depth of every session-internal queue.
pub const SESSION_QUEUE: usize = 64;

pub(crate) fn truncate_str(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_owned()
    } else {
        let mut cut = max;
        while !s.is_char_boundary(cut) {
            cut -= 1;
        }
        format!("{}…", &s[..cut])
    }
}
