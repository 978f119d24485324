use serde::{Deserialize, Serialize};

use crate::tenant::TenantEntry;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Process configuration, loaded from TOML with environment overrides
/// applied on top (see [`Config::apply_env`]).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub media: MediaConfig,
    #[serde(default)]
    pub vad: VadConfig,
    #[serde(default)]
    pub idle: IdleConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub asr: AsrConfig,
    #[serde(default)]
    pub tts: TtsConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub sink: SinkConfig,
    /// Tenants served by the built-in store (integration deployments swap
    /// in an external `TenantStore`).
    #[serde(default)]
    pub tenants: Vec<TenantEntry>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Media transport
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaConfig {
    /// Bind address for the carrier media WebSocket.
    #[serde(default = "d_listen_addr")]
    pub listen_addr: String,
    /// Outbound ring buffer capacity in milliseconds of audio.
    #[serde(default = "d_2000")]
    pub outbound_buffer_ms: u64,
    /// Handshake must complete within this window.
    #[serde(default = "d_10000")]
    pub handshake_timeout_ms: u64,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            listen_addr: d_listen_addr(),
            outbound_buffer_ms: 2000,
            handshake_timeout_ms: 10_000,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Voice activity detection
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VadConfig {
    /// Speech iff energy > noise_floor * threshold_ratio.
    #[serde(default = "d_threshold_ratio")]
    pub threshold_ratio: f32,
    /// Consecutive speech frames required to enter "speaking".
    #[serde(default = "d_3u")]
    pub k_on: u32,
    /// Consecutive silence frames required to exit "speaking".
    #[serde(default = "d_25u")]
    pub k_off: u32,
    /// Frames used to establish the initial noise floor.
    #[serde(default = "d_50u")]
    pub calibration_frames: u32,
    /// Utterances shorter than this are dropped as noise.
    #[serde(default = "d_100")]
    pub min_utterance_ms: u64,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            threshold_ratio: 2.5,
            k_on: 3,
            k_off: 25,
            calibration_frames: 50,
            min_utterance_ms: 100,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Silence policy
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdleConfig {
    /// Silence before the first nudge; the second nudge fires after the
    /// same interval again.
    #[serde(default = "d_8000")]
    pub nudge_ms: u64,
    /// Continued silence after which the call is closed gracefully.
    #[serde(default = "d_24000")]
    pub end_ms: u64,
}

impl Default for IdleConfig {
    fn default() -> Self {
        Self {
            nudge_ms: 8000,
            end_ms: 24_000,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// LLM
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "d_openai")]
    pub provider: String,
    #[serde(default = "d_model")]
    pub model: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "d_openai_url")]
    pub base_url: String,
    /// No token within this window cancels the turn.
    #[serde(default = "d_6000")]
    pub first_token_timeout_ms: u64,
    /// Rolling history window, in turns; older turns are summarised.
    #[serde(default = "d_20")]
    pub history_window: usize,
    #[serde(default = "d_temp")]
    pub temperature: f32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: d_openai(),
            model: d_model(),
            api_key: None,
            base_url: d_openai_url(),
            first_token_timeout_ms: 6000,
            history_window: 20,
            temperature: 0.4,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// ASR
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AsrConfig {
    #[serde(default = "d_deepgram")]
    pub provider: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "d_deepgram_url")]
    pub base_url: String,
    /// A final transcript must arrive within this window of utterance end.
    #[serde(default = "d_2000")]
    pub commit_timeout_ms: u64,
    /// Audio replayed to the provider after a reconnect.
    #[serde(default = "d_2000")]
    pub replay_ms: u64,
    /// Reconnects within the window before the stream is declared down.
    #[serde(default = "d_3u")]
    pub max_reconnects: u32,
    #[serde(default = "d_10000")]
    pub reconnect_window_ms: u64,
}

impl Default for AsrConfig {
    fn default() -> Self {
        Self {
            provider: d_deepgram(),
            api_key: None,
            base_url: d_deepgram_url(),
            commit_timeout_ms: 2000,
            replay_ms: 2000,
            max_reconnects: 3,
            reconnect_window_ms: 10_000,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// TTS
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One TTS vendor endpoint. An empty `voices` list means the vendor
/// accepts any voice id.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TtsEndpoint {
    #[serde(default)]
    pub provider: String,
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub voices: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TtsConfig {
    #[serde(default = "d_tts_primary")]
    pub primary: TtsEndpoint,
    #[serde(default)]
    pub secondary: Option<TtsEndpoint>,
    #[serde(default = "d_tts_lastresort")]
    pub lastresort: TtsEndpoint,
    /// First audio frame must arrive within this window.
    #[serde(default = "d_1500")]
    pub first_frame_timeout_ms: u64,
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            primary: d_tts_primary(),
            secondary: None,
            lastresort: d_tts_lastresort(),
            first_frame_timeout_ms: 1500,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Limits
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Admission cap; calls past this are refused at accept time.
    #[serde(default = "d_64")]
    pub max_concurrent_calls: usize,
    /// Concurrent provider RPCs per call.
    #[serde(default = "d_2u")]
    pub provider_rpcs_per_call: usize,
    #[serde(default = "d_4000")]
    pub tool_timeout_ms: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_concurrent_calls: 64,
            provider_rpcs_per_call: 2,
            tool_timeout_ms: 4000,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Artifact sink
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SinkConfig {
    /// Downstream endpoint for post-call artifacts. `None` logs the
    /// artifact instead of delivering it.
    #[serde(default)]
    pub artifact_sink_url: Option<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Environment overrides
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

impl Config {
    /// Apply the documented environment overrides on top of file values.
    pub fn apply_env(&mut self) {
        env_str("MEDIA_LISTEN_ADDR", &mut self.media.listen_addr);
        env_str("ASR_PROVIDER", &mut self.asr.provider);
        env_opt("ASR_API_KEY", &mut self.asr.api_key);
        env_str("TTS_PRIMARY", &mut self.tts.primary.provider);
        if let Ok(v) = std::env::var("TTS_SECONDARY") {
            let secondary = self.tts.secondary.get_or_insert_with(TtsEndpoint::default);
            secondary.provider = v;
        }
        env_str("TTS_LASTRESORT", &mut self.tts.lastresort.provider);
        env_str("LLM_PROVIDER", &mut self.llm.provider);
        env_str("LLM_MODEL", &mut self.llm.model);
        env_opt("LLM_API_KEY", &mut self.llm.api_key);
        env_num("IDLE_NUDGE_MS", &mut self.idle.nudge_ms);
        env_num("IDLE_END_MS", &mut self.idle.end_ms);
        env_num("VAD_THRESHOLD_RATIO", &mut self.vad.threshold_ratio);
        env_num("VAD_K_ON", &mut self.vad.k_on);
        env_num("VAD_K_OFF", &mut self.vad.k_off);
        env_num("MAX_CONCURRENT_CALLS", &mut self.limits.max_concurrent_calls);
        env_opt("ARTIFACT_SINK_URL", &mut self.sink.artifact_sink_url);
    }

    /// Per-tenant VAD hangover override, clamped to the documented range.
    pub fn vad_k_off_for(&self, hangover_ms: Option<u64>) -> u32 {
        match hangover_ms {
            Some(ms) => (ms.clamp(300, 1500) / 20) as u32,
            None => self.vad.k_off,
        }
    }
}

fn env_str(name: &str, slot: &mut String) {
    if let Ok(v) = std::env::var(name) {
        *slot = v;
    }
}

fn env_opt(name: &str, slot: &mut Option<String>) {
    if let Ok(v) = std::env::var(name) {
        *slot = Some(v);
    }
}

fn env_num<T: std::str::FromStr>(name: &str, slot: &mut T) {
    if let Ok(v) = std::env::var(name) {
        if let Ok(parsed) = v.parse::<T>() {
            *slot = parsed;
        }
    }
}

// ── Serde default helpers ──────────────────────────────────────────

fn d_listen_addr() -> String {
    "0.0.0.0:8090".into()
}
fn d_openai() -> String {
    "openai".into()
}
fn d_model() -> String {
    "gpt-4o-mini".into()
}
fn d_openai_url() -> String {
    "https://api.openai.com/v1".into()
}
fn d_deepgram() -> String {
    "deepgram".into()
}
fn d_deepgram_url() -> String {
    "wss://api.deepgram.com/v1/listen".into()
}
fn d_tts_primary() -> TtsEndpoint {
    TtsEndpoint {
        provider: "elevenlabs".into(),
        base_url: "https://api.elevenlabs.io".into(),
        api_key: None,
        voices: Vec::new(),
    }
}
fn d_tts_lastresort() -> TtsEndpoint {
    TtsEndpoint {
        provider: "plainpcm".into(),
        base_url: "https://tts.fallback.invalid".into(),
        api_key: None,
        voices: Vec::new(),
    }
}
fn d_temp() -> f32 {
    0.4
}
fn d_threshold_ratio() -> f32 {
    2.5
}
fn d_2u() -> usize {
    2
}
fn d_3u() -> u32 {
    3
}
fn d_20() -> usize {
    20
}
fn d_25u() -> u32 {
    25
}
fn d_50u() -> u32 {
    50
}
fn d_64() -> usize {
    64
}
fn d_100() -> u64 {
    100
}
fn d_1500() -> u64 {
    1500
}
fn d_2000() -> u64 {
    2000
}
fn d_4000() -> u64 {
    4000
}
fn d_6000() -> u64 {
    6000
}
fn d_8000() -> u64 {
    8000
}
fn d_10000() -> u64 {
    10_000
}
fn d_24000() -> u64 {
    24_000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = Config::default();
        assert_eq!(cfg.vad.threshold_ratio, 2.5);
        assert_eq!(cfg.vad.k_on, 3);
        assert_eq!(cfg.vad.k_off, 25);
        assert_eq!(cfg.idle.nudge_ms, 8000);
        assert_eq!(cfg.idle.end_ms, 24_000);
        assert_eq!(cfg.limits.tool_timeout_ms, 4000);
        assert_eq!(cfg.llm.first_token_timeout_ms, 6000);
        assert_eq!(cfg.tts.first_frame_timeout_ms, 1500);
        assert_eq!(cfg.asr.commit_timeout_ms, 2000);
    }

    #[test]
    fn empty_toml_parses_to_defaults() {
        let cfg: Config = toml::from_str("").expect("empty config");
        assert_eq!(cfg.media.listen_addr, "0.0.0.0:8090");
        assert!(cfg.tenants.is_empty());
    }

    #[test]
    fn partial_toml_keeps_other_defaults() {
        let cfg: Config = toml::from_str(
            r#"
            [idle]
            nudge_ms = 5000

            [tts.primary]
            provider = "elevenlabs"
            base_url = "https://api.elevenlabs.io"
            voices = ["jessica"]
            "#,
        )
        .expect("partial config");
        assert_eq!(cfg.idle.nudge_ms, 5000);
        assert_eq!(cfg.idle.end_ms, 24_000);
        assert_eq!(cfg.tts.primary.voices, vec!["jessica".to_string()]);
    }

    #[test]
    fn k_off_override_clamps_to_range() {
        let cfg = Config::default();
        assert_eq!(cfg.vad_k_off_for(None), 25);
        assert_eq!(cfg.vad_k_off_for(Some(500)), 25);
        assert_eq!(cfg.vad_k_off_for(Some(100)), 15); // clamped up to 300 ms
        assert_eq!(cfg.vad_k_off_for(Some(9000)), 75); // clamped down to 1500 ms
    }
}
