//! The per-call session orchestrator.
//!
//! One logical task owns the call: it drives the state machine, feeds
//! the VAD from media frames, routes audio to the recogniser, launches
//! LLM turns, paces speech through the speaker task, executes tools,
//! and runs the finalizer exactly once after the call ends.
//!
//! Sibling tasks (media reader/writer, ASR socket, turn runner, speaker)
//! communicate with it through bounded queues; nothing else mutates
//! session state.

use std::sync::Arc;
use std::time::Duration;

use std::collections::HashMap;

use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::Instrument;

use vl_domain::call::{Call, TerminalCause, ToolCallStatus, TurnTrigger};
use vl_domain::config::Config;
use vl_domain::error::Error;
use vl_domain::msg::ToolCall;
use vl_domain::tenant::{TenantContext, VoiceSpec};
use vl_domain::trace::TraceEvent;
use vl_media::session::{CallMeta, MediaEvent, MediaOut};
use vl_media::vad::{VadEvent, VoiceActivityDetector};
use vl_media::{mulaw, FRAME_MS};
use vl_providers::{AsrEvent, AsrInput, ChatRequest};
use vl_sessions::log::CallLog;

use crate::state::AppState;

use super::cancel::CancelToken;
use super::finalizer;
use super::history::ConversationHistory;
use super::lead::LeadFlow;
use super::speaker::{spawn_speaker, SpeakerEvent, SpeakerHandle};
use super::tools::{self, SessionAction, ToolRuntime, VerifyState};
use super::turn::{spawn_turn, TurnEvent};
use super::{SessionEvent, SESSION_QUEUE};

/// Tool round-trips per turn before the loop is force-stopped.
const MAX_TOOL_LOOPS: u8 = 4;

/// Digits expected from the degraded DTMF callback capture.
const CALLBACK_DIGITS: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CallState {
    Greeting,
    Listening,
    Nudging,
    Thinking,
    ToolRunning,
    Speaking,
    Transferring,
    Ended,
}

/// What happens once the current turn's audio is fully flushed.
#[derive(Debug, Clone)]
enum AfterFlush {
    Listen { reset_idle: bool },
    Transfer { to: String },
    End { cause: TerminalCause },
}

struct PendingUtterance {
    utterance_id: String,
    ended_at_ms: Option<u64>,
    commit_deadline: Option<Instant>,
    best_partial: Option<(String, f32)>,
}

struct ActiveTurn {
    turn_id: String,
    cancel: CancelToken,
    /// Set once the turn's final text reached the history.
    text_in_history: bool,
    tool_loops: u8,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Entry point
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Run one call to completion. The media session is already accepted;
/// the tenant is resolved here.
pub async fn run_call(
    state: AppState,
    meta: CallMeta,
    media_rx: mpsc::Receiver<MediaEvent>,
    media: Arc<dyn MediaOut>,
) {
    let span = tracing::info_span!("call", call_id = %meta.call_sid, to = %meta.to);
    run_call_inner(state, meta, media_rx, media)
        .instrument(span)
        .await
}

async fn run_call_inner(
    state: AppState,
    meta: CallMeta,
    media_rx: mpsc::Receiver<MediaEvent>,
    media: Arc<dyn MediaOut>,
) {
    let call_id = meta.call_sid.clone();

    let tenant = match state.tenants.resolve(&meta.to).await {
        Ok(ctx) => Arc::new(ctx),
        Err(Error::UnknownNumber(number)) => {
            tracing::warn!(dialed = %number, "no tenant for dialed number");
            play_unroutable_announcement(&state, &call_id, &media).await;
            let _ = media.close("unknown_number").await;
            return;
        }
        Err(e) => {
            tracing::error!(error = %e, "tenant resolution failed");
            let _ = media.close("resolver_error").await;
            return;
        }
    };

    TraceEvent::CallStarted {
        call_id: call_id.clone(),
        tenant_id: tenant.tenant_id.clone(),
        from: meta.from.clone(),
        to: meta.to.clone(),
    }
    .emit();

    let session = CallSession::new(state.clone(), meta, tenant.clone(), media_rx, media.clone());
    let log = session.run().await;

    let dropped = media.dropped_frames();
    if dropped > 0 {
        TraceEvent::FrameDrop {
            call_id: call_id.clone(),
            dropped_total: dropped,
        }
        .emit();
    }
    let _ = media.close("call_ended").await;

    let duration_ms = log
        .call()
        .ended_at
        .map(|end| (end - log.call().started_at).num_milliseconds().max(0) as u64)
        .unwrap_or(0);
    TraceEvent::CallEnded {
        call_id: call_id.clone(),
        terminal_cause: log
            .terminal()
            .map(|c| format!("{c:?}").to_lowercase())
            .unwrap_or_else(|| "unknown".into()),
        duration_ms,
    }
    .emit();

    // Exactly-once production: every path out of the session loop funnels
    // through this single claim.
    let emit_guard = vl_sessions::sink::EmitGuard::new();
    if emit_guard.claim() {
        let projects = state.projects.get(tenant.project_provider_id.as_deref());
        finalizer::finalize(&state, &tenant, &log, projects).await;
    }
}

/// Paced playback of the generic "number not in service" line, spoken
/// with the last-resort voice since there is no tenant to choose one.
async fn play_unroutable_announcement(state: &AppState, call_id: &str, media: &Arc<dyn MediaOut>) {
    let stub = TenantContext {
        tenant_id: "unrouted".into(),
        display_name: "VoiceLine".into(),
        agent_name: "VoiceLine".into(),
        greeting: String::new(),
        persona_prompt: String::new(),
        voice: VoiceSpec::new("plainpcm", "neutral"),
        secondary_voice: None,
        escalation_phone: None,
        lead_questions: vec![],
        idle_prompts: vec![],
        asr_fallback_line: String::new(),
        closing_line: String::new(),
        clients: vec![],
        project_provider_id: None,
        features: Default::default(),
        vad_hangover_ms: None,
    };
    let line = "This number is not in service. Please check the number and try again. Goodbye.";
    if let Ok((mut stream, _)) = state.tts.synthesize(call_id, line, &stub).await {
        while let Some(Ok(frame)) = stream.next().await {
            if media.send_frame(frame).await.is_err() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(FRAME_MS)).await;
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Session
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct CallSession {
    state: CallState,
    cfg: Arc<Config>,
    app: AppState,
    tenant: Arc<TenantContext>,
    media: Arc<dyn MediaOut>,
    media_rx: mpsc::Receiver<MediaEvent>,
    events_tx: mpsc::Sender<SessionEvent>,
    events_rx: mpsc::Receiver<SessionEvent>,

    log: CallLog,
    call_id: String,
    started: Instant,

    vad: VoiceActivityDetector,
    asr_tx: Option<mpsc::Sender<AsrInput>>,
    history: ConversationHistory,
    tools_rt: ToolRuntime,
    verify: VerifyState,
    lead: LeadFlow,
    root_cancel: CancelToken,

    speaker: Option<SpeakerHandle>,
    turn: Option<ActiveTurn>,
    after_flush: AfterFlush,

    utterance: Option<PendingUtterance>,
    /// Finals that arrived while a turn was still in flight.
    queued_input: Vec<(String, String)>,
    /// Turns whose speaker was cancelled and whose terminal speaker
    /// event is still in flight: turn_id → text_in_history at cancel.
    cancelled_turns: HashMap<String, bool>,

    idle_base: Option<Instant>,
    nudges_sent: u8,

    degraded: bool,
    dtmf_digits: String,
    callback_captured: bool,
    turn_failures: u8,
}

impl CallSession {
    fn new(
        app: AppState,
        meta: CallMeta,
        tenant: Arc<TenantContext>,
        media_rx: mpsc::Receiver<MediaEvent>,
        media: Arc<dyn MediaOut>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::channel::<SessionEvent>(SESSION_QUEUE);
        let cfg = app.config.clone();

        let call = Call::inbound(
            meta.call_sid.clone(),
            tenant.tenant_id.clone(),
            meta.from.clone(),
            meta.to.clone(),
        );
        let call_id = call.call_id.clone();

        let k_off = cfg.vad_k_off_for(tenant.vad_hangover_ms);
        let vad = VoiceActivityDetector::new(&cfg.vad, k_off);

        let history = ConversationHistory::new(
            build_system_prompt(&tenant),
            cfg.llm.history_window,
        );

        let projects = app.projects.get(tenant.project_provider_id.as_deref());
        let tools_rt = ToolRuntime {
            tenant: tenant.clone(),
            caller_id: meta.from.clone(),
            projects,
            timeout: Duration::from_millis(cfg.limits.tool_timeout_ms),
        };
        let verify = VerifyState::from_caller_id(&tenant, &meta.from);
        let lead = LeadFlow::new(tenant.lead_questions.clone());

        Self {
            state: CallState::Greeting,
            cfg,
            app,
            tenant,
            media,
            media_rx,
            events_tx,
            events_rx,
            log: CallLog::new(call),
            call_id,
            started: Instant::now(),
            vad,
            asr_tx: None,
            history,
            tools_rt,
            verify,
            lead,
            root_cancel: CancelToken::new(),
            speaker: None,
            turn: None,
            after_flush: AfterFlush::Listen { reset_idle: true },
            utterance: None,
            queued_input: Vec::new(),
            cancelled_turns: HashMap::new(),
            idle_base: None,
            nudges_sent: 0,
            degraded: false,
            dtmf_digits: String::new(),
            callback_captured: false,
            turn_failures: 0,
        }
    }

    fn now_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    async fn run(mut self) -> CallLog {
        self.open_asr().await;
        self.start_greeting().await;

        while self.state != CallState::Ended {
            let deadline = self.next_deadline();
            tokio::select! {
                media_event = self.media_rx.recv() => match media_event {
                    Some(event) => self.on_media(event).await,
                    None => self.end(TerminalCause::TransportError),
                },
                session_event = self.events_rx.recv() => {
                    if let Some(event) = session_event {
                        self.on_event(event).await;
                    }
                }
                _ = sleep_until_opt(deadline), if deadline.is_some() => {
                    self.on_deadline().await;
                }
            }
        }

        // Hangup must propagate to every in-flight activity promptly.
        self.root_cancel.cancel();
        self.log
    }

    // ── Setup ─────────────────────────────────────────────────────

    async fn open_asr(&mut self) {
        match self.app.asr.open(&self.call_id).await {
            Ok(stream) => {
                self.asr_tx = Some(stream.input);
                let events_tx = self.events_tx.clone();
                let mut asr_events = stream.events;
                tokio::spawn(async move {
                    while let Some(event) = asr_events.recv().await {
                        if events_tx.send(SessionEvent::Asr(event)).await.is_err() {
                            break;
                        }
                    }
                });
            }
            Err(e) => {
                tracing::warn!(error = %e, "recognition unavailable from call start");
                self.degraded = true;
            }
        }
    }

    async fn start_greeting(&mut self) {
        let greeting = self.tenant.greeting.clone();
        self.state = CallState::Greeting;
        self.speak_line(&greeting, AfterFlush::Listen { reset_idle: true })
            .await;
    }

    // ── Deadlines ─────────────────────────────────────────────────

    fn next_deadline(&self) -> Option<Instant> {
        let commit = self.utterance.as_ref().and_then(|u| u.commit_deadline);
        let idle = self.idle_deadline();
        match (commit, idle) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn idle_deadline(&self) -> Option<Instant> {
        if !matches!(self.state, CallState::Listening) {
            return None;
        }
        let base = self.idle_base?;
        let offset = match self.nudges_sent {
            0 => self.cfg.idle.nudge_ms,
            1 => self.cfg.idle.nudge_ms * 2,
            _ => self.cfg.idle.end_ms,
        };
        Some(base + Duration::from_millis(offset))
    }

    async fn on_deadline(&mut self) {
        let now = Instant::now();

        if let Some(pending) = &self.utterance {
            if pending.commit_deadline.is_some_and(|d| d <= now) {
                self.resolve_commit_timeout().await;
                return;
            }
        }

        if self.idle_deadline().is_some_and(|d| d <= now) {
            self.on_idle_expired().await;
        }
    }

    /// The recogniser did not commit a final in time; fall back to the
    /// best partial, or drop the utterance as noise.
    async fn resolve_commit_timeout(&mut self) {
        let Some(pending) = self.utterance.take() else {
            return;
        };
        match pending.best_partial {
            Some((text, confidence)) => {
                tracing::debug!(utterance_id = %pending.utterance_id, "using partial after commit timeout");
                self.accept_final(
                    pending.utterance_id,
                    pending.ended_at_ms.unwrap_or_else(|| self.now_ms()),
                    text,
                    confidence,
                )
                .await;
            }
            None => {
                self.log.discard_utterance(&pending.utterance_id);
                self.idle_base.get_or_insert_with(Instant::now);
            }
        }
    }

    async fn on_idle_expired(&mut self) {
        if self.nudges_sent < 2 {
            let prompt = self
                .tenant
                .idle_prompts
                .get(self.nudges_sent as usize)
                .cloned()
                .unwrap_or_else(|| "Are you still there?".to_owned());
            self.nudges_sent += 1;
            self.state = CallState::Nudging;
            // The idle clock keeps running: the second nudge and the
            // final close are measured from the same silence start.
            self.speak_line(&prompt, AfterFlush::Listen { reset_idle: false })
                .await;
        } else {
            let closing = self.tenant.closing_line.clone();
            self.state = CallState::Speaking;
            self.speak_line(
                &closing,
                AfterFlush::End {
                    cause: TerminalCause::Timeout,
                },
            )
            .await;
        }
    }

    // ── Media events ──────────────────────────────────────────────

    async fn on_media(&mut self, event: MediaEvent) {
        match event {
            MediaEvent::Frame(frame) => {
                if !self.degraded {
                    if let Some(asr_tx) = self.asr_tx.clone() {
                        if asr_tx
                            .send(AsrInput::Audio(frame.payload.clone()))
                            .await
                            .is_err()
                        {
                            self.asr_tx = None;
                        }
                    }
                }
                let energy = mulaw::frame_energy(&frame.payload);
                for vad_event in self.vad.push_frame(frame.t_ms, energy) {
                    match vad_event {
                        VadEvent::UtteranceBegin { t_ms } => self.on_utterance_begin(t_ms).await,
                        VadEvent::UtteranceEnd { t_ms, .. } => self.on_utterance_end(t_ms).await,
                        VadEvent::SpeechFrame { .. } => {}
                    }
                }
            }
            MediaEvent::Gap { expected, got } => {
                tracing::debug!(expected, got, "inbound media gap");
            }
            MediaEvent::Dtmf { digit } => self.on_dtmf(digit).await,
            MediaEvent::MarkAck { .. } => {}
            MediaEvent::Stopped => self.end(TerminalCause::Hangup),
            MediaEvent::TransportError(message) => {
                tracing::warn!(%message, "fatal transport error");
                self.end(TerminalCause::TransportError);
            }
        }
    }

    async fn on_utterance_begin(&mut self, t_ms: u64) {
        match self.state {
            CallState::Greeting | CallState::Speaking | CallState::Nudging => {
                self.barge_in(t_ms).await;
            }
            CallState::Transferring | CallState::Ended => return,
            CallState::Listening | CallState::Thinking | CallState::ToolRunning => {}
        }

        // A still-uncommitted previous utterance is resolved before the
        // next one opens, preserving per-utterance ordering.
        if self
            .utterance
            .as_ref()
            .is_some_and(|u| u.ended_at_ms.is_some())
        {
            self.resolve_commit_timeout().await;
        }

        if self.utterance.is_none() {
            let utterance_id = self.log.begin_utterance(t_ms);
            if let Some(asr_tx) = &self.asr_tx {
                let _ = asr_tx
                    .send(AsrInput::Begin {
                        utterance_id: utterance_id.clone(),
                    })
                    .await;
            }
            self.utterance = Some(PendingUtterance {
                utterance_id,
                ended_at_ms: None,
                commit_deadline: None,
                best_partial: None,
            });
        }
        self.idle_base = None;
    }

    async fn on_utterance_end(&mut self, t_ms: u64) {
        let commit_ms = self.cfg.asr.commit_timeout_ms;
        let Some(pending) = self.utterance.as_mut() else {
            return;
        };
        if pending.ended_at_ms.is_some() {
            return;
        }
        pending.ended_at_ms = Some(t_ms);
        pending.commit_deadline = Some(Instant::now() + Duration::from_millis(commit_ms));
        let utterance_id = pending.utterance_id.clone();
        if let Some(asr_tx) = &self.asr_tx {
            let _ = asr_tx.send(AsrInput::Commit { utterance_id }).await;
        }
    }

    async fn barge_in(&mut self, t_ms: u64) {
        if let Some(turn) = &self.turn {
            TraceEvent::BargeIn {
                call_id: self.call_id.clone(),
                turn_id: turn.turn_id.clone(),
                at_ms: t_ms,
            }
            .emit();
        }
        self.cancel_current_output();
        // Flush both our ring and the far-side jitter buffer.
        let _ = self.media.clear().await;

        self.after_flush = AfterFlush::Listen { reset_idle: true };
        self.state = CallState::Listening;
        // The speaker's Cancelled event finishes the turn record.
    }

    /// Cancel the in-flight turn and playout, freeing the slots so a new
    /// speaker can start immediately. The log and history catch-up
    /// happens when the cancelled speaker's terminal event drains.
    fn cancel_current_output(&mut self) {
        if let Some(turn) = self.turn.take() {
            turn.cancel.cancel();
            self.cancelled_turns
                .insert(turn.turn_id, turn.text_in_history);
        }
        if let Some(speaker) = self.speaker.take() {
            speaker.cancel.cancel();
        }
    }

    async fn on_dtmf(&mut self, digit: char) {
        tracing::debug!(%digit, "dtmf received");
        if !self.degraded || self.callback_captured {
            return;
        }
        if digit.is_ascii_digit() {
            self.dtmf_digits.push(digit);
        }
        if self.dtmf_digits.len() >= CALLBACK_DIGITS {
            let number = std::mem::take(&mut self.dtmf_digits);
            self.log.lead_answer("phone", &number);
            self.callback_captured = true;
            TraceEvent::LeadCaptured {
                call_id: self.call_id.clone(),
                question_id: "phone".into(),
            }
            .emit();
            // The fallback prompt may still be playing.
            self.cancel_current_output();
            self.state = CallState::Speaking;
            self.speak_line(
                "Thank you. Someone from the team will call you back at that number shortly.",
                AfterFlush::Listen { reset_idle: true },
            )
            .await;
        }
    }

    // ── Session events ────────────────────────────────────────────

    async fn on_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Asr(asr_event) => self.on_asr(asr_event).await,
            SessionEvent::Turn(turn_event) => self.on_turn(turn_event).await,
            SessionEvent::Speaker(speaker_event) => self.on_speaker(speaker_event).await,
        }
    }

    async fn on_asr(&mut self, event: AsrEvent) {
        match event {
            AsrEvent::Transcript(t) => {
                let matches_current = self
                    .utterance
                    .as_ref()
                    .is_some_and(|u| u.utterance_id == t.utterance_id);
                if !matches_current {
                    return;
                }
                if t.is_final {
                    if let Some(pending) = self.utterance.take() {
                        let end_ms = pending.ended_at_ms.unwrap_or_else(|| self.now_ms());
                        self.accept_final(pending.utterance_id, end_ms, t.text, t.confidence)
                            .await;
                    }
                } else if let Some(pending) = self.utterance.as_mut() {
                    pending.best_partial = Some((t.text, t.confidence));
                }
            }
            AsrEvent::Reconnected { attempt } => {
                tracing::debug!(attempt, "recognition stream reconnected");
            }
            AsrEvent::Unavailable => self.enter_degraded().await,
        }
    }

    async fn accept_final(&mut self, utterance_id: String, end_ms: u64, text: String, confidence: f32) {
        self.log
            .finalize_utterance(&utterance_id, end_ms, text.clone(), confidence);
        tracing::info!(
            utterance_id = %utterance_id,
            transcript = %super::truncate_str(&text, 160),
            "caller utterance"
        );

        match self.state {
            CallState::Listening | CallState::Nudging | CallState::Greeting => {
                self.start_reply_turn(utterance_id, text).await;
            }
            CallState::Thinking | CallState::ToolRunning | CallState::Speaking => {
                // The current turn settles first; exactly one speaker at
                // a time.
                self.queued_input.push((utterance_id, text));
            }
            CallState::Transferring | CallState::Ended => {}
        }
    }

    async fn enter_degraded(&mut self) {
        if self.degraded {
            return;
        }
        self.degraded = true;
        self.asr_tx = None;
        tracing::warn!("switching to degraded dtmf capture");

        self.cancel_current_output();
        let fallback = self.tenant.asr_fallback_line.clone();
        self.state = CallState::Speaking;
        self.speak_line(&fallback, AfterFlush::Listen { reset_idle: true })
            .await;
    }

    // ── Turn lifecycle ────────────────────────────────────────────

    async fn start_reply_turn(&mut self, utterance_id: String, text: String) {
        self.history.push_user(&text);
        self.history.compact_if_needed(&self.app.llm).await;

        let turn_id = self.log.begin_turn(
            TurnTrigger::CallerUtterance {
                utterance_id,
            },
            self.now_ms(),
        );
        self.state = CallState::Thinking;
        self.after_flush = AfterFlush::Listen { reset_idle: true };
        self.spawn_llm_stream(turn_id).await;
    }

    async fn spawn_llm_stream(&mut self, turn_id: String) {
        let cancel = self.root_cancel.child();
        let req = ChatRequest {
            messages: self.history.messages(),
            tools: tools::build_tool_definitions(&self.tenant),
            temperature: Some(self.cfg.llm.temperature),
            max_tokens: None,
            json_mode: false,
            model: None,
        };
        let tool_loops = self.turn.as_ref().map(|t| t.tool_loops).unwrap_or(0);
        self.turn = Some(ActiveTurn {
            turn_id: turn_id.clone(),
            cancel: cancel.clone(),
            text_in_history: false,
            tool_loops,
        });
        spawn_turn(
            self.app.llm.clone(),
            req,
            turn_id,
            Duration::from_millis(self.cfg.llm.first_token_timeout_ms),
            cancel,
            self.events_tx.clone(),
        );
    }

    async fn on_turn(&mut self, event: TurnEvent) {
        match event {
            TurnEvent::Sentence { turn_id, text } => {
                if !self.is_current_turn(&turn_id) {
                    return;
                }
                self.state = CallState::Speaking;
                self.ensure_speaker(&turn_id);
                if let Some(speaker) = &self.speaker {
                    speaker.say(text).await;
                }
            }
            TurnEvent::Completed { turn_id, full_text } => {
                if !self.is_current_turn(&turn_id) {
                    return;
                }
                self.turn_failures = 0;
                self.history.push_assistant(&full_text);
                if let Some(turn) = self.turn.as_mut() {
                    turn.text_in_history = true;
                }
                match &self.speaker {
                    Some(speaker) => speaker.finish().await,
                    // A silent completion (empty response) flushes
                    // immediately.
                    None => self.apply_flush(turn_id).await,
                }
            }
            TurnEvent::ToolCalls {
                turn_id,
                preamble,
                calls,
            } => {
                if !self.is_current_turn(&turn_id) {
                    return;
                }
                self.run_tool_calls(turn_id, preamble, calls).await;
            }
            TurnEvent::Failed { turn_id, message } => {
                if !self.is_current_turn(&turn_id) {
                    return;
                }
                tracing::warn!(%message, "turn failed");
                self.turn_failures += 1;
                let line = if self.turn_failures >= 2 {
                    // Repeated failures read as an outage; offer a human.
                    "I'm having trouble on my end. Would you like me to transfer you to a member of the team, or take a message?"
                } else {
                    "Sorry, I'm having a little trouble right now. Could you say that again?"
                };
                self.state = CallState::Speaking;
                self.after_flush = AfterFlush::Listen { reset_idle: true };
                self.ensure_speaker(&turn_id);
                if let Some(speaker) = &self.speaker {
                    speaker.say(line.to_owned()).await;
                    speaker.finish().await;
                }
            }
        }
    }

    async fn run_tool_calls(&mut self, turn_id: String, preamble: String, calls: Vec<ToolCall>) {
        self.state = CallState::ToolRunning;
        self.history.push_assistant_tool_calls(&preamble, &calls);

        let mut action_after_flush: Option<AfterFlush> = None;
        let mut spoke_handoff = false;

        // Tools run one at a time: results stay ordered and the per-call
        // provider RPC cap is honored.
        for call in &calls {
            let t_start = self.now_ms();
            self.log.record_tool_call(&turn_id, call, t_start);

            let dispatch =
                tools::dispatch_tool(&self.tools_rt, &mut self.verify, &mut self.lead, call).await;

            let status = if dispatch.is_error {
                ToolCallStatus::Failed
            } else {
                ToolCallStatus::Succeeded
            };
            self.log
                .complete_tool_call(&call.call_id, status, dispatch.result.clone(), self.now_ms());
            self.history
                .push_tool_result(&call.call_id, &dispatch.result.to_string());

            match dispatch.action {
                Some(SessionAction::Transfer { to }) => {
                    action_after_flush = Some(AfterFlush::Transfer { to });
                    if !spoke_handoff {
                        spoke_handoff = true;
                        self.ensure_speaker(&turn_id);
                        if let Some(speaker) = &self.speaker {
                            speaker
                                .say("One moment while I connect you with a member of the team."
                                    .to_owned())
                                .await;
                        }
                    }
                }
                Some(SessionAction::EndCall { .. }) => {
                    action_after_flush = Some(AfterFlush::End {
                        cause: TerminalCause::EndCallTool,
                    });
                }
                Some(SessionAction::LeadCaptured {
                    question_id,
                    answer,
                    completed,
                }) => {
                    self.log.lead_answer(&question_id, &answer);
                    TraceEvent::LeadCaptured {
                        call_id: self.call_id.clone(),
                        question_id,
                    }
                    .emit();
                    if completed {
                        self.log.lead_completed();
                    }
                }
                None => {}
            }
        }

        if let Some(after) = action_after_flush {
            // Transfer and hangup happen when the audio flushes; no
            // further model round-trip.
            self.after_flush = after;
            if matches!(self.after_flush, AfterFlush::End { .. })
                && self.speaker.is_none()
                && preamble.is_empty()
            {
                // Nothing was spoken this turn; say the closing line.
                let closing = self.tenant.closing_line.clone();
                self.ensure_speaker(&turn_id);
                if let Some(speaker) = &self.speaker {
                    speaker.say(closing).await;
                }
            }
            if let Some(turn) = self.turn.as_mut() {
                turn.text_in_history = true;
            }
            match &self.speaker {
                Some(speaker) => speaker.finish().await,
                None => self.apply_flush(turn_id).await,
            }
            return;
        }

        let loops = self.turn.as_mut().map(|t| {
            t.tool_loops += 1;
            t.tool_loops
        });
        if loops.unwrap_or(0) >= MAX_TOOL_LOOPS {
            tracing::warn!("tool loop limit reached");
            self.history
                .push_assistant("[tool loop limit reached, answering with what is known]");
        }

        // Feed results back and keep streaming the same logical turn.
        self.state = CallState::Thinking;
        self.spawn_llm_stream(turn_id).await;
    }

    async fn on_speaker(&mut self, event: SpeakerEvent) {
        match event {
            SpeakerEvent::FirstFrame { .. } => {}
            SpeakerEvent::SentenceSpoken { turn_id, text } => {
                self.log.append_spoken(&turn_id, &text);
            }
            SpeakerEvent::Cancelled {
                turn_id,
                partial_text,
            } => {
                if !partial_text.is_empty() {
                    self.log.append_spoken(&turn_id, &partial_text);
                }
                self.log.cancel_turn(&turn_id, self.now_ms());

                // History only tracks LLM turns; canned lines never
                // entered it.
                let text_in_history = match self.cancelled_turns.remove(&turn_id) {
                    Some(flag) => flag,
                    None if self.owns_turn(&turn_id) => {
                        let flag = self
                            .turn
                            .as_ref()
                            .map(|t| t.text_in_history)
                            .unwrap_or(false);
                        self.speaker = None;
                        self.turn = None;
                        flag
                    }
                    None => return,
                };
                let spoken = self
                    .log
                    .turns()
                    .iter()
                    .find(|t| t.turn_id == turn_id)
                    .map(|t| t.agent_text.clone())
                    .unwrap_or_default();
                if text_in_history {
                    self.history.truncate_last_assistant(&spoken);
                } else if !spoken.is_empty() {
                    self.history
                        .push_assistant(&format!("{spoken} [cut off by the caller here]"));
                }
            }
            SpeakerEvent::Flushed { turn_id } => {
                if self.cancelled_turns.remove(&turn_id).is_some() || !self.owns_turn(&turn_id) {
                    return;
                }
                self.apply_flush(turn_id).await;
            }
            SpeakerEvent::Failed { turn_id, message } => {
                tracing::error!(%message, "speech synthesis unavailable");
                self.log.cancel_turn(&turn_id, self.now_ms());
                if self.cancelled_turns.remove(&turn_id).is_some() || !self.owns_turn(&turn_id) {
                    return;
                }
                self.speaker = None;
                self.turn = None;
                self.end(TerminalCause::TransportError);
            }
        }
    }

    async fn apply_flush(&mut self, turn_id: String) {
        self.log.complete_turn(&turn_id, self.now_ms());
        self.speaker = None;
        self.turn = None;

        match self.after_flush.clone() {
            AfterFlush::Listen { reset_idle } => {
                self.state = CallState::Listening;
                if reset_idle || self.idle_base.is_none() {
                    if reset_idle {
                        self.nudges_sent = 0;
                    }
                    self.idle_base = Some(Instant::now());
                }
                if let Some((utterance_id, text)) = pop_front(&mut self.queued_input) {
                    self.start_reply_turn(utterance_id, text).await;
                }
            }
            AfterFlush::Transfer { to } => {
                self.state = CallState::Transferring;
                let _ = self.media.transfer(&to, Some("warm transfer")).await;
                self.end(TerminalCause::Transfer);
            }
            AfterFlush::End { cause } => self.end(cause),
        }
    }

    // ── Helpers ───────────────────────────────────────────────────

    fn is_current_turn(&self, turn_id: &str) -> bool {
        self.turn
            .as_ref()
            .is_some_and(|t| t.turn_id == turn_id && !t.cancel.is_cancelled())
    }

    fn owns_turn(&self, turn_id: &str) -> bool {
        self.turn.as_ref().is_some_and(|t| t.turn_id == turn_id)
    }

    fn ensure_speaker(&mut self, turn_id: &str) {
        if self.speaker.is_some() {
            return;
        }
        let cancel = self.root_cancel.child();
        self.speaker = Some(spawn_speaker(
            self.call_id.clone(),
            turn_id.to_owned(),
            self.app.tts.clone(),
            self.tenant.clone(),
            self.media.clone(),
            Duration::from_millis(self.cfg.tts.first_frame_timeout_ms),
            cancel,
            self.events_tx.clone(),
        ));
    }

    /// Speak a canned line as its own system-triggered turn.
    async fn speak_line(&mut self, line: &str, after: AfterFlush) {
        let turn_id = self.log.begin_turn(TurnTrigger::System, self.now_ms());
        self.after_flush = after;
        self.turn = Some(ActiveTurn {
            turn_id: turn_id.clone(),
            cancel: self.root_cancel.child(),
            text_in_history: false,
            tool_loops: 0,
        });
        self.ensure_speaker(&turn_id);
        if let Some(speaker) = &self.speaker {
            speaker.say(line.to_owned()).await;
            speaker.finish().await;
        }
    }

    fn end(&mut self, cause: TerminalCause) {
        self.log.set_terminal(cause);
        self.state = CallState::Ended;
    }
}

fn pop_front<T>(v: &mut Vec<T>) -> Option<T> {
    if v.is_empty() {
        None
    } else {
        Some(v.remove(0))
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn build_system_prompt(tenant: &TenantContext) -> String {
    let mut prompt = format!(
        "You are {agent}, the AI phone receptionist for {business}, a creative agency. \
         You are speaking with a caller on a live phone call.\n\
         Keep replies short and conversational, one to three sentences, \
         as they will be spoken aloud. Never use markdown, bullet points, \
         or formatting. Spell out numbers naturally.\n",
        agent = tenant.agent_name,
        business = tenant.display_name,
    );
    if !tenant.persona_prompt.is_empty() {
        prompt.push('\n');
        prompt.push_str(&tenant.persona_prompt);
        prompt.push('\n');
    }
    prompt.push_str(
        "\nUse lookup_project_status when a caller asks about their project. \
         Project details may only be shared with verified callers; if the \
         lookup reports the caller is unverified, ask for their name and the \
         project name, then try again.\n",
    );
    if !tenant.lead_questions.is_empty() {
        prompt.push_str(
            "\nIf the caller is a new prospect, collect the following, one \
             question at a time, recording each answer with \
             capture_lead_answer:\n",
        );
        for q in &tenant.lead_questions {
            prompt.push_str(&format!("- {} (id: {})\n", q.prompt, q.id));
        }
    }
    if tenant.escalation_phone.is_some() {
        prompt.push_str(
            "\nIf the caller asks for a person, or you cannot help, use \
             transfer_to_human.\n",
        );
    }
    prompt.push_str("\nWhen the conversation is finished, use end_call.\n");
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_prompt_names_tenant_and_tools() {
        let tenant = TenantContext {
            tenant_id: "aurora".into(),
            display_name: "Aurora".into(),
            agent_name: "Jessica".into(),
            greeting: "Hi".into(),
            persona_prompt: "Warm, upbeat, professional.".into(),
            voice: VoiceSpec::new("elevenlabs", "jessica"),
            secondary_voice: None,
            escalation_phone: Some("+15135550900".into()),
            lead_questions: vec![],
            idle_prompts: vec![],
            asr_fallback_line: "f".into(),
            closing_line: "bye".into(),
            clients: vec![],
            project_provider_id: None,
            features: Default::default(),
            vad_hangover_ms: None,
        };
        let prompt = build_system_prompt(&tenant);
        assert!(prompt.contains("Jessica"));
        assert!(prompt.contains("Aurora"));
        assert!(prompt.contains("lookup_project_status"));
        assert!(prompt.contains("transfer_to_human"));
        assert!(prompt.contains("Warm, upbeat, professional."));
    }

    #[test]
    fn pop_front_preserves_order() {
        let mut v = vec![1, 2, 3];
        assert_eq!(pop_front(&mut v), Some(1));
        assert_eq!(pop_front(&mut v), Some(2));
        assert_eq!(pop_front(&mut v), Some(3));
        assert_eq!(pop_front(&mut v), None);
    }
}
