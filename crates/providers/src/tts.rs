//! Streaming text-to-speech with an ordered provider ladder.
//!
//! The engine holds three rungs — primary, optional secondary, and a
//! plain-PCM last resort — and picks the first vendor/voice pair that
//! works. Any non-primary selection emits a `voice_fallback` trace
//! event; a silent downgrade is never allowed.
//!
//! Vendors stream audio faster than real time; the playout task paces
//! frames onto the wire and cancels synthesis by dropping the stream.

use std::collections::HashSet;
use std::sync::Arc;

use vl_domain::config::TtsEndpoint;
use vl_domain::error::{Error, Result};
use vl_domain::stream::BoxStream;
use vl_domain::tenant::{TenantContext, TtsTier, VoiceSpec};
use vl_domain::trace::TraceEvent;
use vl_media::{mulaw, FRAME_BYTES};

use crate::traits::TextToSpeech;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Frame chunking
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// µ-law byte value for digital silence.
const ULAW_SILENCE: u8 = 0xFF;

/// Re-chunks an arbitrary µ-law byte stream into 160-byte frames.
pub struct FrameChunker {
    pending: Vec<u8>,
}

impl Default for FrameChunker {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameChunker {
    pub fn new() -> Self {
        Self {
            pending: Vec::with_capacity(FRAME_BYTES),
        }
    }

    pub fn push(&mut self, bytes: &[u8]) -> Vec<Vec<u8>> {
        self.pending.extend_from_slice(bytes);
        let mut frames = Vec::new();
        while self.pending.len() >= FRAME_BYTES {
            let rest = self.pending.split_off(FRAME_BYTES);
            frames.push(std::mem::replace(&mut self.pending, rest));
        }
        frames
    }

    /// Pad and flush the trailing partial frame, if any.
    pub fn finish(&mut self) -> Option<Vec<u8>> {
        if self.pending.is_empty() {
            return None;
        }
        let mut frame = std::mem::take(&mut self.pending);
        frame.resize(FRAME_BYTES, ULAW_SILENCE);
        Some(frame)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// HTTP vendor adapter
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Wire dialect of a TTS endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TtsFlavor {
    /// Streams µ-law 8 kHz directly (ElevenLabs-style stream endpoint).
    MulawStream,
    /// Streams 16-bit little-endian PCM at 8 kHz; transcoded here.
    /// Used by the plain last-resort vendor.
    PcmStream,
}

pub struct HttpTts {
    name: String,
    base_url: String,
    api_key: Option<String>,
    voices: HashSet<String>,
    flavor: TtsFlavor,
    client: reqwest::Client,
}

impl HttpTts {
    pub fn from_endpoint(endpoint: &TtsEndpoint, flavor: TtsFlavor) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(60))
            .build()
            .map_err(|e| Error::Http(e.to_string()))?;
        Ok(Self {
            name: endpoint.provider.clone(),
            base_url: endpoint.base_url.trim_end_matches('/').to_owned(),
            api_key: endpoint.api_key.clone(),
            voices: endpoint.voices.iter().cloned().collect(),
            flavor,
            client,
        })
    }

    fn request(&self, text: &str, voice: &VoiceSpec) -> reqwest::RequestBuilder {
        match self.flavor {
            TtsFlavor::MulawStream => {
                let url = format!(
                    "{}/v1/text-to-speech/{}/stream?output_format=ulaw_8000",
                    self.base_url, voice.voice_id
                );
                let mut builder = self.client.post(url).json(&serde_json::json!({
                    "text": text,
                    "voice_settings": {
                        "stability": voice.stability,
                        "similarity_boost": voice.similarity,
                        "style": voice.style,
                    },
                }));
                if let Some(key) = &self.api_key {
                    builder = builder.header("xi-api-key", key.clone());
                }
                builder
            }
            TtsFlavor::PcmStream => {
                let url = format!("{}/synthesize", self.base_url);
                let mut builder = self.client.post(url).json(&serde_json::json!({
                    "text": text,
                    "voice": voice.voice_id,
                    "sample_rate": 8000,
                    "format": "pcm_s16le",
                }));
                if let Some(key) = &self.api_key {
                    builder = builder.bearer_auth(key.clone());
                }
                builder
            }
        }
    }
}

#[async_trait::async_trait]
impl TextToSpeech for HttpTts {
    async fn synthesize(
        &self,
        text: &str,
        voice: &VoiceSpec,
    ) -> Result<BoxStream<'static, Result<Vec<u8>>>> {
        let resp = self
            .request(text, voice)
            .send()
            .await
            .map_err(|e| Error::Http(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let detail = resp.text().await.unwrap_or_default();
            return Err(Error::Provider {
                provider: self.name.clone(),
                message: format!("{status}: {detail}"),
            });
        }

        let flavor = self.flavor;
        let stream = async_stream::stream! {
            let mut resp = resp;
            let mut chunker = FrameChunker::new();
            // Carries an odd trailing byte across PCM chunks.
            let mut pcm_carry: Option<u8> = None;

            loop {
                match resp.chunk().await {
                    Ok(Some(bytes)) => {
                        let ulaw = match flavor {
                            TtsFlavor::MulawStream => bytes.to_vec(),
                            TtsFlavor::PcmStream => transcode_pcm(&bytes, &mut pcm_carry),
                        };
                        for frame in chunker.push(&ulaw) {
                            yield Ok(frame);
                        }
                    }
                    Ok(None) => {
                        if let Some(frame) = chunker.finish() {
                            yield Ok(frame);
                        }
                        break;
                    }
                    Err(e) => {
                        yield Err(Error::Http(e.to_string()));
                        break;
                    }
                }
            }
        };
        Ok(Box::pin(stream))
    }

    fn supports(&self, voice_id: &str) -> bool {
        self.voices.is_empty() || self.voices.contains(voice_id)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

fn transcode_pcm(bytes: &[u8], carry: &mut Option<u8>) -> Vec<u8> {
    let mut buf = Vec::with_capacity(bytes.len() + 1);
    if let Some(b) = carry.take() {
        buf.push(b);
    }
    buf.extend_from_slice(bytes);
    if buf.len() % 2 == 1 {
        *carry = buf.pop();
    }
    buf.chunks_exact(2)
        .map(|pair| mulaw::encode_sample(i16::from_le_bytes([pair[0], pair[1]])))
        .collect()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Provider ladder
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Which vendor/voice actually produced a turn's audio.
#[derive(Debug, Clone)]
pub struct VoiceChoice {
    pub tier: TtsTier,
    pub provider: String,
    pub voice: VoiceSpec,
}

pub struct TtsEngine {
    primary: Arc<dyn TextToSpeech>,
    secondary: Option<Arc<dyn TextToSpeech>>,
    lastresort: Arc<dyn TextToSpeech>,
}

impl TtsEngine {
    pub fn new(
        primary: Arc<dyn TextToSpeech>,
        secondary: Option<Arc<dyn TextToSpeech>>,
        lastresort: Arc<dyn TextToSpeech>,
    ) -> Self {
        Self {
            primary,
            secondary,
            lastresort,
        }
    }

    /// Resolve the vendor/voice pair for a tenant. Preference order:
    /// primary vendor with the tenant voice, then any configured vendor
    /// with the tenant's secondary voice, then the last resort.
    pub fn choose(&self, tenant: &TenantContext) -> (Arc<dyn TextToSpeech>, VoiceChoice) {
        if self.primary.supports(&tenant.voice.voice_id) {
            return (
                self.primary.clone(),
                VoiceChoice {
                    tier: TtsTier::Primary,
                    provider: self.primary.name().to_owned(),
                    voice: tenant.voice.clone(),
                },
            );
        }

        if let Some(secondary_voice) = &tenant.secondary_voice {
            for vendor in [Some(&self.primary), self.secondary.as_ref()]
                .into_iter()
                .flatten()
            {
                if vendor.supports(&secondary_voice.voice_id) {
                    return (
                        vendor.clone(),
                        VoiceChoice {
                            tier: TtsTier::Secondary,
                            provider: vendor.name().to_owned(),
                            voice: secondary_voice.clone(),
                        },
                    );
                }
            }
        }

        (
            self.lastresort.clone(),
            VoiceChoice {
                tier: TtsTier::LastResort,
                provider: self.lastresort.name().to_owned(),
                voice: tenant.voice.clone(),
            },
        )
    }

    /// Synthesize with the ladder. A failing rung escalates to the last
    /// resort; if that also fails the turn surfaces `TtsUnavailable`.
    pub async fn synthesize(
        &self,
        call_id: &str,
        text: &str,
        tenant: &TenantContext,
    ) -> Result<(BoxStream<'static, Result<Vec<u8>>>, VoiceChoice)> {
        let (vendor, choice) = self.choose(tenant);

        if choice.tier != TtsTier::Primary {
            self.log_fallback(call_id, &choice, "voice not supported by primary");
        }

        match vendor.synthesize(text, &choice.voice).await {
            Ok(stream) => Ok((stream, choice)),
            Err(e) if choice.tier != TtsTier::LastResort => {
                tracing::warn!(call_id, error = %e, provider = %choice.provider, "synthesis failed, using last resort");
                let fallback = VoiceChoice {
                    tier: TtsTier::LastResort,
                    provider: self.lastresort.name().to_owned(),
                    voice: tenant.voice.clone(),
                };
                self.log_fallback(call_id, &fallback, "selected vendor failed");
                match self.lastresort.synthesize(text, &fallback.voice).await {
                    Ok(stream) => Ok((stream, fallback)),
                    Err(_) => Err(Error::TtsUnavailable),
                }
            }
            Err(_) => Err(Error::TtsUnavailable),
        }
    }

    fn log_fallback(&self, call_id: &str, choice: &VoiceChoice, reason: &str) {
        TraceEvent::VoiceFallback {
            call_id: call_id.to_owned(),
            tier: format!("{:?}", choice.tier).to_lowercase(),
            provider: choice.provider.clone(),
            voice_id: choice.voice.voice_id.clone(),
            reason: reason.to_owned(),
        }
        .emit();
    }
}
