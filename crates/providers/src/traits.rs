use tokio::sync::mpsc;

use vl_domain::error::Result;
use vl_domain::msg::{Message, ToolCall, ToolDefinition};
use vl_domain::stream::{BoxStream, StreamEvent, Usage};
use vl_domain::tenant::VoiceSpec;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// LLM
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A provider-agnostic chat completion request.
#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    pub messages: Vec<Message>,
    /// Tool definitions the model may invoke.
    pub tools: Vec<ToolDefinition>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    /// When `true`, request valid JSON output (used by the finalizer).
    pub json_mode: bool,
    /// Model override. When `None`, the provider uses its default.
    pub model: Option<String>,
}

/// A provider-agnostic chat completion response.
#[derive(Debug, Clone)]
pub struct ChatResponse {
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
    pub usage: Option<Usage>,
    pub model: String,
    pub finish_reason: Option<String>,
}

/// Trait every LLM adapter implements. Token streaming is required so
/// TTS can begin mid-sentence.
#[async_trait::async_trait]
pub trait LlmProvider: Send + Sync {
    /// Send a chat completion request and wait for the full response.
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse>;

    /// Send a chat completion request and return a stream of events.
    async fn chat_stream(&self, req: ChatRequest)
        -> Result<BoxStream<'static, Result<StreamEvent>>>;

    fn provider_id(&self) -> &str;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Speech-to-text
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One recognition result. Partials are advisory; only finals are
/// authoritative.
#[derive(Debug, Clone)]
pub struct Transcript {
    pub utterance_id: String,
    pub text: String,
    pub is_final: bool,
    pub confidence: f32,
}

#[derive(Debug, Clone)]
pub enum AsrEvent {
    Transcript(Transcript),
    /// The provider connection was reopened; the utterance id in flight
    /// is preserved.
    Reconnected { attempt: u32 },
    /// Too many reconnects in the window; switch to the degraded policy.
    Unavailable,
}

/// Commands the orchestrator sends down the audio side of the stream.
#[derive(Debug, Clone)]
pub enum AsrInput {
    /// A new utterance is starting; subsequent transcripts carry this id.
    Begin { utterance_id: String },
    /// One 20 ms µ-law frame.
    Audio(Vec<u8>),
    /// The utterance ended; ask the provider to flush its final.
    Commit { utterance_id: String },
}

/// A live recognition stream: frames go in, transcripts come out.
pub struct AsrStream {
    pub input: mpsc::Sender<AsrInput>,
    pub events: mpsc::Receiver<AsrEvent>,
}

#[async_trait::async_trait]
pub trait SpeechToText: Send + Sync {
    /// Open a recognition stream for one call.
    async fn open(&self, call_id: &str) -> Result<AsrStream>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Text-to-speech
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Trait every TTS vendor adapter implements. The returned stream yields
/// 160-byte µ-law frames faster than real time; the caller paces playout
/// and stops synthesis by dropping the stream.
#[async_trait::async_trait]
pub trait TextToSpeech: Send + Sync {
    async fn synthesize(
        &self,
        text: &str,
        voice: &VoiceSpec,
    ) -> Result<BoxStream<'static, Result<Vec<u8>>>>;

    /// Whether this vendor can render the given voice id. An empty
    /// capability map accepts anything.
    fn supports(&self, voice_id: &str) -> bool;

    fn name(&self) -> &str;
}
