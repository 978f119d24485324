//! Builds provider instances from the process configuration.
//!
//! Connections are pooled per process (one client per vendor), never per
//! call; sessions share these through `Arc`.

use std::sync::Arc;

use vl_domain::config::Config;
use vl_domain::error::Result;

use crate::asr::WsAsr;
use crate::openai::OpenAiChat;
use crate::traits::{LlmProvider, SpeechToText};
use crate::tts::{HttpTts, TtsEngine, TtsFlavor};

pub struct Providers {
    pub llm: Arc<dyn LlmProvider>,
    pub asr: Arc<dyn SpeechToText>,
    pub tts: Arc<TtsEngine>,
}

pub fn build(cfg: &Config) -> Result<Providers> {
    Ok(Providers {
        llm: build_llm(cfg)?,
        asr: Arc::new(WsAsr::new(cfg.asr.clone())),
        tts: Arc::new(build_tts(cfg)?),
    })
}

fn build_llm(cfg: &Config) -> Result<Arc<dyn LlmProvider>> {
    // Every supported completion vendor speaks the OpenAI-compatible
    // contract; the provider name selects credentials and telemetry tags.
    let provider = OpenAiChat::new(
        cfg.llm.provider.clone(),
        cfg.llm.base_url.clone(),
        cfg.llm.api_key.clone(),
        cfg.llm.model.clone(),
    )?;
    Ok(Arc::new(provider))
}

fn build_tts(cfg: &Config) -> Result<TtsEngine> {
    let primary = Arc::new(HttpTts::from_endpoint(&cfg.tts.primary, TtsFlavor::MulawStream)?);
    let secondary = match &cfg.tts.secondary {
        Some(endpoint) => Some(Arc::new(HttpTts::from_endpoint(
            endpoint,
            TtsFlavor::MulawStream,
        )?) as Arc<dyn crate::traits::TextToSpeech>),
        None => None,
    };
    let lastresort = Arc::new(HttpTts::from_endpoint(
        &cfg.tts.lastresort,
        TtsFlavor::PcmStream,
    )?);
    Ok(TtsEngine::new(primary, secondary, lastresort))
}
