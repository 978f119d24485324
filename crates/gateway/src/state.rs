//! Shared application state.
//!
//! Every dependency is an `Arc` handed to the orchestrator constructor,
//! so tests substitute any of them per call. Provider connections are
//! pooled here per process, never per call.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use vl_domain::config::Config;
use vl_domain::tenant::TenantStore;
use vl_providers::tts::TtsEngine;
use vl_providers::{LlmProvider, SpeechToText};
use vl_sessions::ArtifactSink;

use crate::runtime::resolver::ProjectRegistry;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub llm: Arc<dyn LlmProvider>,
    pub asr: Arc<dyn SpeechToText>,
    pub tts: Arc<TtsEngine>,
    pub tenants: Arc<dyn TenantStore>,
    pub projects: Arc<ProjectRegistry>,
    pub sink: Arc<dyn ArtifactSink>,
    pub active_calls: Arc<AtomicUsize>,
}

impl AppState {
    /// Claim one slot of call capacity. Over-capacity callers are
    /// refused before the media handshake even starts.
    pub fn try_admit(&self) -> Option<CallPermit> {
        let cap = self.config.limits.max_concurrent_calls;
        let mut current = self.active_calls.load(Ordering::SeqCst);
        loop {
            if current >= cap {
                return None;
            }
            match self.active_calls.compare_exchange(
                current,
                current + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => {
                    return Some(CallPermit {
                        counter: self.active_calls.clone(),
                    });
                }
                Err(actual) => current = actual,
            }
        }
    }

    pub fn active_call_count(&self) -> usize {
        self.active_calls.load(Ordering::SeqCst)
    }
}

/// RAII capacity slot; dropping it releases the admission.
pub struct CallPermit {
    counter: Arc<AtomicUsize>,
}

impl Drop for CallPermit {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vl_domain::config::Config;

    fn state_with_cap(cap: usize) -> AppState {
        use vl_providers::tts::TtsEngine;

        struct NoTenants;
        #[async_trait::async_trait]
        impl TenantStore for NoTenants {
            async fn resolve(
                &self,
                n: &str,
            ) -> vl_domain::error::Result<vl_domain::tenant::TenantContext> {
                Err(vl_domain::error::Error::UnknownNumber(n.into()))
            }
        }

        struct NoTts;
        #[async_trait::async_trait]
        impl vl_providers::TextToSpeech for NoTts {
            async fn synthesize(
                &self,
                _text: &str,
                _voice: &vl_domain::tenant::VoiceSpec,
            ) -> vl_domain::error::Result<
                vl_domain::stream::BoxStream<'static, vl_domain::error::Result<Vec<u8>>>,
            > {
                Err(vl_domain::error::Error::TtsUnavailable)
            }
            fn supports(&self, _voice_id: &str) -> bool {
                true
            }
            fn name(&self) -> &str {
                "null"
            }
        }

        struct NoAsr;
        #[async_trait::async_trait]
        impl SpeechToText for NoAsr {
            async fn open(
                &self,
                _call_id: &str,
            ) -> vl_domain::error::Result<vl_providers::AsrStream> {
                Err(vl_domain::error::Error::AsrUnavailable)
            }
        }

        struct NoLlm;
        #[async_trait::async_trait]
        impl LlmProvider for NoLlm {
            async fn chat(
                &self,
                _req: vl_providers::ChatRequest,
            ) -> vl_domain::error::Result<vl_providers::ChatResponse> {
                Err(vl_domain::error::Error::Other("unconfigured".into()))
            }
            async fn chat_stream(
                &self,
                _req: vl_providers::ChatRequest,
            ) -> vl_domain::error::Result<
                vl_domain::stream::BoxStream<
                    'static,
                    vl_domain::error::Result<vl_domain::stream::StreamEvent>,
                >,
            > {
                Err(vl_domain::error::Error::Other("unconfigured".into()))
            }
            fn provider_id(&self) -> &str {
                "null"
            }
        }

        let mut config = Config::default();
        config.limits.max_concurrent_calls = cap;

        AppState {
            config: Arc::new(config),
            llm: Arc::new(NoLlm),
            asr: Arc::new(NoAsr),
            tts: Arc::new(TtsEngine::new(Arc::new(NoTts), None, Arc::new(NoTts))),
            tenants: Arc::new(NoTenants),
            projects: Arc::new(ProjectRegistry::new()),
            sink: Arc::new(vl_sessions::sink::LogSink),
            active_calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    #[test]
    fn admission_caps_and_releases() {
        let state = state_with_cap(2);
        let a = state.try_admit().expect("first");
        let _b = state.try_admit().expect("second");
        assert!(state.try_admit().is_none());

        drop(a);
        assert!(state.try_admit().is_some());
    }
}
