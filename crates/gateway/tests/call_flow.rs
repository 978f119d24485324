//! End-to-end call scenarios driven through the orchestrator with mock
//! providers and a captured media transport.
//!
//! Time is paused: media frames are fed at the 20 ms wire cadence and
//! every timer (idle nudges, commit deadlines, playout pacing) runs on
//! the virtual clock, so the scenarios are deterministic.

use std::collections::VecDeque;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;

use vl_domain::call::{CallArtifact, Speaker, TerminalCause};
use vl_domain::config::Config;
use vl_domain::error::Result;
use vl_domain::stream::{BoxStream, StreamEvent};
use vl_domain::tenant::{
    ClientRecord, FeatureFlags, TenantContext, TenantStore, VoiceSpec,
};
use vl_gateway::runtime::resolver::ProjectRegistry;
use vl_gateway::runtime::session::run_call;
use vl_gateway::state::AppState;
use vl_media::mulaw;
use vl_media::session::{CallMeta, InboundFrame, MediaEvent, MediaOut};
use vl_media::{FRAME_BYTES, FRAME_MS};
use vl_providers::tts::TtsEngine;
use vl_providers::{
    AsrEvent, AsrInput, AsrStream, ChatRequest, ChatResponse, LlmProvider, SpeechToText,
    TextToSpeech, Transcript,
};
use vl_sessions::sink::MemorySink;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Mock media transport
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone)]
enum MediaCmd {
    Frame(Instant),
    Clear(Instant),
    Mark(String),
    Transfer(String),
    Close(String),
}

#[derive(Default)]
struct CapturedMedia {
    cmds: Mutex<Vec<MediaCmd>>,
}

impl CapturedMedia {
    fn frames(&self) -> Vec<Instant> {
        self.cmds
            .lock()
            .iter()
            .filter_map(|c| match c {
                MediaCmd::Frame(at) => Some(*at),
                _ => None,
            })
            .collect()
    }

    fn clears(&self) -> Vec<Instant> {
        self.cmds
            .lock()
            .iter()
            .filter_map(|c| match c {
                MediaCmd::Clear(at) => Some(*at),
                _ => None,
            })
            .collect()
    }

    fn transfers(&self) -> Vec<String> {
        self.cmds
            .lock()
            .iter()
            .filter_map(|c| match c {
                MediaCmd::Transfer(to) => Some(to.clone()),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl MediaOut for CapturedMedia {
    async fn send_frame(&self, _frame: Vec<u8>) -> Result<()> {
        self.cmds.lock().push(MediaCmd::Frame(Instant::now()));
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        self.cmds.lock().push(MediaCmd::Clear(Instant::now()));
        Ok(())
    }

    async fn mark(&self, name: &str) -> Result<()> {
        self.cmds.lock().push(MediaCmd::Mark(name.to_owned()));
        Ok(())
    }

    async fn transfer(&self, to_number: &str, _reason: Option<&str>) -> Result<()> {
        self.cmds
            .lock()
            .push(MediaCmd::Transfer(to_number.to_owned()));
        Ok(())
    }

    async fn close(&self, cause: &str) -> Result<()> {
        self.cmds.lock().push(MediaCmd::Close(cause.to_owned()));
        Ok(())
    }

    fn dropped_frames(&self) -> u64 {
        0
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Mock recogniser
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Emits one scripted final per committed utterance, echoing the
/// utterance id the orchestrator assigned.
struct ScriptedAsr {
    finals: Arc<Mutex<VecDeque<String>>>,
    /// When set, the stream reports `Unavailable` immediately.
    down: bool,
}

impl ScriptedAsr {
    fn with_finals(finals: &[&str]) -> Self {
        Self {
            finals: Arc::new(Mutex::new(
                finals.iter().map(|s| s.to_string()).collect(),
            )),
            down: false,
        }
    }

    fn unavailable() -> Self {
        Self {
            finals: Arc::new(Mutex::new(VecDeque::new())),
            down: true,
        }
    }
}

#[async_trait]
impl SpeechToText for ScriptedAsr {
    async fn open(&self, _call_id: &str) -> Result<AsrStream> {
        let (input_tx, mut input_rx) = mpsc::channel::<AsrInput>(64);
        let (event_tx, event_rx) = mpsc::channel::<AsrEvent>(64);

        let finals = self.finals.clone();
        let down = self.down;
        tokio::spawn(async move {
            if down {
                let _ = event_tx.send(AsrEvent::Unavailable).await;
                return;
            }
            let mut current: Option<String> = None;
            while let Some(input) = input_rx.recv().await {
                match input {
                    AsrInput::Begin { utterance_id } => current = Some(utterance_id),
                    AsrInput::Audio(_) => {}
                    AsrInput::Commit { utterance_id } => {
                        let text = finals.lock().pop_front();
                        if let Some(text) = text {
                            let _ = event_tx
                                .send(AsrEvent::Transcript(Transcript {
                                    utterance_id: current
                                        .take()
                                        .unwrap_or(utterance_id),
                                    text,
                                    is_final: true,
                                    confidence: 0.95,
                                }))
                                .await;
                        }
                    }
                }
            }
        });

        Ok(AsrStream {
            input: input_tx,
            events: event_rx,
        })
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Mock LLM
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

enum Reply {
    Say(&'static str),
    Tool {
        name: &'static str,
        args: serde_json::Value,
    },
}

/// Pops one reply per `chat_stream` call; `chat` always returns the
/// canned finalizer summary.
struct ScriptedLlm {
    replies: Mutex<VecDeque<Reply>>,
}

impl ScriptedLlm {
    fn new(replies: Vec<Reply>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
        }
    }
}

#[async_trait]
impl LlmProvider for ScriptedLlm {
    async fn chat(&self, _req: ChatRequest) -> Result<ChatResponse> {
        Ok(ChatResponse {
            content: r#"{"callerName":"Sam","project":"Straus","summary":"Sam asked about Straus.","actionItems":["Send the review notes"],"urgency":"low"}"#.into(),
            tool_calls: vec![],
            usage: None,
            model: "scripted".into(),
            finish_reason: Some("stop".into()),
        })
    }

    async fn chat_stream(
        &self,
        _req: ChatRequest,
    ) -> Result<BoxStream<'static, Result<StreamEvent>>> {
        let reply = self.replies.lock().pop_front();
        let events: Vec<Result<StreamEvent>> = match reply {
            Some(Reply::Say(text)) => vec![
                Ok(StreamEvent::Token { text: text.into() }),
                Ok(StreamEvent::Done {
                    usage: None,
                    finish_reason: Some("stop".into()),
                }),
            ],
            Some(Reply::Tool { name, args }) => vec![
                Ok(StreamEvent::ToolCallFinished {
                    call_id: "call_1".into(),
                    tool_name: name.into(),
                    arguments: args,
                }),
                Ok(StreamEvent::Done {
                    usage: None,
                    finish_reason: Some("tool_calls".into()),
                }),
            ],
            None => vec![Ok(StreamEvent::Done {
                usage: None,
                finish_reason: Some("stop".into()),
            })],
        };
        Ok(Box::pin(futures_util::stream::iter(events)))
    }

    fn provider_id(&self) -> &str {
        "scripted"
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Mock TTS
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Synthesises five 20 ms frames per word, instantly.
struct WordClockTts;

#[async_trait]
impl TextToSpeech for WordClockTts {
    async fn synthesize(
        &self,
        text: &str,
        _voice: &VoiceSpec,
    ) -> Result<BoxStream<'static, Result<Vec<u8>>>> {
        let frames = text.split_whitespace().count().max(1) * 5;
        let items: Vec<Result<Vec<u8>>> =
            (0..frames).map(|_| Ok(vec![0xFFu8; FRAME_BYTES])).collect();
        Ok(Box::pin(futures_util::stream::iter(items)))
    }

    fn supports(&self, _voice_id: &str) -> bool {
        true
    }

    fn name(&self) -> &str {
        "wordclock"
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Fixture
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

// Long enough (17 words → 1.7 s of mock audio) to still be playing once
// the VAD's one-second calibration window has passed.
const GREETING: &str =
    "Hi, thanks for calling Aurora Creative, this is Jessica speaking — how can I help you today?";

struct StaticTenants(TenantContext);

#[async_trait]
impl TenantStore for StaticTenants {
    async fn resolve(&self, dialed_number: &str) -> Result<TenantContext> {
        if dialed_number == "+15135550100" {
            Ok(self.0.clone())
        } else {
            Err(vl_domain::error::Error::UnknownNumber(dialed_number.into()))
        }
    }
}

fn tenant() -> TenantContext {
    TenantContext {
        tenant_id: "aurora".into(),
        display_name: "Aurora".into(),
        agent_name: "Jessica".into(),
        greeting: GREETING.into(),
        persona_prompt: String::new(),
        voice: VoiceSpec::new("elevenlabs", "jessica"),
        secondary_voice: None,
        escalation_phone: Some("+15135550900".into()),
        lead_questions: vec![],
        idle_prompts: vec![],
        asr_fallback_line:
            "I'm having trouble hearing you — may I take your number and have someone call you back?"
                .into(),
        closing_line: "Thanks for calling Aurora. Goodbye!".into(),
        clients: vec![ClientRecord {
            name: "Sam Carter".into(),
            phone: Some("+15135550123".into()),
            project: "Straus".into(),
        }],
        project_provider_id: None,
        features: FeatureFlags::default(),
        vad_hangover_ms: None,
    }
}

struct Harness {
    sink: Arc<MemorySink>,
    media: Arc<CapturedMedia>,
    media_tx: mpsc::Sender<MediaEvent>,
    call: tokio::task::JoinHandle<()>,
}

fn start_call(llm: ScriptedLlm, asr: ScriptedAsr) -> Harness {
    let sink = Arc::new(MemorySink::new());
    let media = Arc::new(CapturedMedia::default());
    let (media_tx, media_rx) = mpsc::channel::<MediaEvent>(64);

    let tts_rung: Arc<dyn TextToSpeech> = Arc::new(WordClockTts);
    let state = AppState {
        config: Arc::new(Config::default()),
        llm: Arc::new(llm),
        asr: Arc::new(asr),
        tts: Arc::new(TtsEngine::new(tts_rung.clone(), None, tts_rung)),
        tenants: Arc::new(StaticTenants(tenant())),
        projects: Arc::new(ProjectRegistry::new()),
        sink: sink.clone(),
        active_calls: Arc::new(AtomicUsize::new(0)),
    };

    let meta = CallMeta {
        stream_sid: "MZ1".into(),
        call_sid: "CA1".into(),
        account_sid: "AC1".into(),
        from: "+15135550123".into(),
        to: "+15135550100".into(),
    };

    let call = tokio::spawn(run_call(
        state.clone(),
        meta,
        media_rx,
        media.clone() as Arc<dyn MediaOut>,
    ));

    Harness {
        sink,
        media,
        media_tx,
        call,
    }
}

fn ulaw_frame(amplitude: i16) -> Vec<u8> {
    vec![mulaw::encode_sample(amplitude); FRAME_BYTES]
}

impl Harness {
    /// Feed `n` frames of constant amplitude at the wire cadence,
    /// starting at media timestamp `start_ms`. Returns the timestamp
    /// after the last frame.
    async fn feed_audio(&self, start_ms: u64, n: u64, amplitude: i16) -> u64 {
        for i in 0..n {
            let t_ms = start_ms + i * FRAME_MS;
            let _ = self
                .media_tx
                .send(MediaEvent::Frame(InboundFrame {
                    seq: t_ms / FRAME_MS + 1,
                    t_ms,
                    payload: ulaw_frame(amplitude),
                }))
                .await;
            tokio::time::sleep(Duration::from_millis(FRAME_MS)).await;
        }
        start_ms + n * FRAME_MS
    }

    async fn hang_up(&self) {
        let _ = self.media_tx.send(MediaEvent::Stopped).await;
    }

    async fn finish(self) -> CallArtifact {
        self.hang_up().await;
        let _ = self.call.await;
        assert_eq!(self.sink.emit_count(), 1, "exactly one artifact per call");
        self.sink.artifacts().remove(0)
    }
}

fn agent_lines(artifact: &CallArtifact) -> Vec<String> {
    artifact
        .transcript
        .iter()
        .filter(|e| e.speaker == Speaker::Agent)
        .map(|e| e.text.clone())
        .collect()
}

fn caller_lines(artifact: &CallArtifact) -> Vec<String> {
    artifact
        .transcript
        .iter()
        .filter(|e| e.speaker == Speaker::Caller)
        .map(|e| e.text.clone())
        .collect()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scenarios
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test(start_paused = true)]
async fn happy_path_status_question() {
    let llm = ScriptedLlm::new(vec![Reply::Say(
        "Straus is in review. The team posted an update on January fifteenth.",
    )]);
    let asr = ScriptedAsr::with_finals(&["Hi, this is Sam. Any update on Project Straus?"]);
    let harness = start_call(llm, asr);

    // Greeting plays out over two seconds of caller silence.
    let t = harness.feed_audio(0, 100, 30).await;
    // Caller asks the question, then goes quiet long enough for the VAD
    // hangover plus the reply to play.
    let t = harness.feed_audio(t, 40, 8000).await;
    harness.feed_audio(t, 300, 30).await;

    let artifact = harness.finish().await;

    assert_eq!(artifact.terminal_cause, TerminalCause::Hangup);
    let agent = agent_lines(&artifact);
    assert!(agent.iter().any(|l| l.contains("how can I help")));
    assert!(
        agent.iter().any(|l| l.contains("in review")),
        "agent lines: {agent:?}"
    );
    let caller = caller_lines(&artifact);
    assert_eq!(caller.len(), 1);
    assert!(caller[0].contains("Straus"));

    // Transcript ordering: greeting, caller question, reply.
    assert!(artifact.transcript.len() >= 3);
    assert_eq!(artifact.transcript[0].speaker, Speaker::Agent);
    assert_eq!(artifact.transcript[1].speaker, Speaker::Caller);

    assert_eq!(artifact.summary.as_deref(), Some("Sam asked about Straus."));
    assert!(artifact.scope_creep.is_none());
}

#[tokio::test(start_paused = true)]
async fn barge_in_cuts_greeting_within_budget() {
    let llm = ScriptedLlm::new(vec![Reply::Say("Sure, go ahead.")]);
    let asr = ScriptedAsr::with_finals(&["Sorry to interrupt, quick question."]);
    let harness = start_call(llm, asr);
    let media = harness.media.clone();

    // Silence through VAD calibration, then the caller talks over the
    // still-playing greeting.
    let t = harness.feed_audio(0, 52, 30).await;
    let t = harness.feed_audio(t, 30, 8000).await;
    harness.feed_audio(t, 200, 30).await;

    let artifact = harness.finish().await;

    // The far-side jitter buffer was flushed.
    let clears = media.clears();
    assert!(!clears.is_empty(), "expected a clear on barge-in");

    // Greeting audio stopped within the cutover budget: the window just
    // after the cut (and before the reply turn can exist, since the
    // caller is still mid-utterance) carries no frames.
    let cut = clears[0];
    let greeting_leak = media
        .frames()
        .into_iter()
        .filter(|&at| {
            at > cut + Duration::from_millis(100) && at < cut + Duration::from_millis(400)
        })
        .count();
    assert_eq!(greeting_leak, 0, "greeting frames after cutover");

    // The greeting turn recorded only a prefix of the configured text.
    let agent = agent_lines(&artifact);
    let greeting_spoken = agent.first().expect("partial greeting recorded");
    assert!(greeting_spoken.len() < GREETING.len());
    assert!(GREETING.starts_with(greeting_spoken.as_str()));
}

#[tokio::test(start_paused = true)]
async fn silence_nudges_twice_then_ends() {
    let llm = ScriptedLlm::new(vec![]);
    let asr = ScriptedAsr::with_finals(&[]);
    let harness = start_call(llm, asr);

    // Nothing but line noise for half a minute.
    harness.feed_audio(0, 1500, 30).await;

    let _ = harness.media_tx.send(MediaEvent::Stopped).await;
    let _ = harness.call.await;

    let artifact = harness.sink.artifacts().remove(0);
    assert_eq!(artifact.terminal_cause, TerminalCause::Timeout);
    assert_eq!(harness.sink.emit_count(), 1);

    let agent = agent_lines(&artifact);
    let nudges = agent
        .iter()
        .filter(|l| l.contains("Are you still there?"))
        .count();
    assert_eq!(nudges, 2, "agent lines: {agent:?}");
    assert!(agent.iter().any(|l| l.contains("Goodbye")));
    assert!(caller_lines(&artifact).is_empty());
}

#[tokio::test(start_paused = true)]
async fn transfer_request_redirects_to_escalation_number() {
    let llm = ScriptedLlm::new(vec![Reply::Tool {
        name: "transfer_to_human",
        args: serde_json::json!({ "reason": "caller requested" }),
    }]);
    let asr = ScriptedAsr::with_finals(&["Please let me speak to a person."]);
    let harness = start_call(llm, asr);

    let t = harness.feed_audio(0, 100, 30).await;
    let t = harness.feed_audio(t, 40, 8000).await;
    harness.feed_audio(t, 300, 30).await;

    let _ = harness.call.await;

    assert_eq!(harness.media.transfers(), vec!["+15135550900".to_string()]);
    let artifact = harness.sink.artifacts().remove(0);
    assert_eq!(artifact.terminal_cause, TerminalCause::Transfer);
    let agent = agent_lines(&artifact);
    assert!(
        agent.iter().any(|l| l.contains("connect you")),
        "warm handoff line missing: {agent:?}"
    );
}

#[tokio::test(start_paused = true)]
async fn asr_outage_captures_callback_number_over_dtmf() {
    let llm = ScriptedLlm::new(vec![]);
    let asr = ScriptedAsr::unavailable();
    let harness = start_call(llm, asr);

    // Let the fallback line play out.
    harness.feed_audio(0, 100, 30).await;

    for digit in "5135551234".chars() {
        let _ = harness.media_tx.send(MediaEvent::Dtmf { digit }).await;
    }
    // Confirmation line plays, then the caller hangs up.
    harness.feed_audio(2000, 200, 30).await;

    let artifact = harness.finish().await;

    assert_eq!(artifact.terminal_cause, TerminalCause::Hangup);
    let agent = agent_lines(&artifact);
    let lead = artifact.lead.expect("lead captured over dtmf");
    assert_eq!(
        lead.answers.get("phone").map(String::as_str),
        Some("5135551234")
    );
    assert!(
        agent.iter().any(|l| l.contains("trouble hearing you")),
        "fallback line missing: {agent:?}"
    );
}
