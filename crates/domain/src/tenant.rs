//! Tenant context and the two consumed integration seams: the tenant
//! store (dialed number → tenant) and the project provider (PM-tool
//! lookups). The context is resolved once at call start and is immutable
//! for the lifetime of the call.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Voice selection
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Which rung of the provider ladder produced the audio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TtsTier {
    Primary,
    Secondary,
    LastResort,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoiceSpec {
    pub provider: String,
    pub voice_id: String,
    #[serde(default = "d_half")]
    pub stability: f32,
    #[serde(default = "d_half")]
    pub similarity: f32,
    #[serde(default)]
    pub style: f32,
}

impl VoiceSpec {
    pub fn new(provider: impl Into<String>, voice_id: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            voice_id: voice_id.into(),
            stability: 0.5,
            similarity: 0.5,
            style: 0.0,
        }
    }
}

fn d_half() -> f32 {
    0.5
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Lead questions
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LeadAnswerKind {
    Text,
    Email,
    Phone,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeadQuestion {
    pub id: String,
    pub prompt: String,
    pub kind: LeadAnswerKind,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Client directory (caller verification)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A known client of the tenant, used to verify callers before any
/// project data is released.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientRecord {
    pub name: String,
    #[serde(default)]
    pub phone: Option<String>,
    /// Project identifier the client is associated with.
    pub project: String,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Feature flags
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureFlags {
    #[serde(default = "d_true")]
    pub project_lookup: bool,
    #[serde(default = "d_true")]
    pub lead_capture: bool,
    #[serde(default = "d_true")]
    pub transfer: bool,
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self {
            project_lookup: true,
            lead_capture: true,
            transfer: true,
        }
    }
}

fn d_true() -> bool {
    true
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// TenantContext
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Everything the orchestrator needs to run one call for one tenant.
/// Built by the resolver at call start; read-only afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantContext {
    pub tenant_id: String,
    pub display_name: String,
    pub agent_name: String,
    /// Greeting with `{businessName}` / `{agentName}` already substituted.
    pub greeting: String,
    pub persona_prompt: String,
    pub voice: VoiceSpec,
    #[serde(default)]
    pub secondary_voice: Option<VoiceSpec>,
    #[serde(default)]
    pub escalation_phone: Option<String>,
    #[serde(default)]
    pub lead_questions: Vec<LeadQuestion>,
    #[serde(default)]
    pub idle_prompts: Vec<String>,
    /// Spoken when speech recognition degrades.
    pub asr_fallback_line: String,
    pub closing_line: String,
    #[serde(default)]
    pub clients: Vec<ClientRecord>,
    /// Handle into the PM integration; `None` when the tenant has no
    /// integration connected.
    #[serde(default)]
    pub project_provider_id: Option<String>,
    #[serde(default)]
    pub features: FeatureFlags,
    /// VAD hangover override in ms (clamped to 300–1500).
    #[serde(default)]
    pub vad_hangover_ms: Option<u64>,
}

/// Replace the greeting placeholders. Substitution is exact; no
/// placeholder may survive into spoken output.
pub fn render_greeting(template: &str, business_name: &str, agent_name: &str) -> String {
    template
        .replace("{businessName}", business_name)
        .replace("{agentName}", agent_name)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Config seed
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A tenant as written in the configuration file. The resolver turns this
/// into a [`TenantContext`] (rendering the greeting template).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantEntry {
    pub tenant_id: String,
    pub dialed_number: String,
    pub display_name: String,
    #[serde(default = "d_agent_name")]
    pub agent_name: String,
    pub greeting: String,
    #[serde(default)]
    pub persona_prompt: String,
    pub voice: VoiceSpec,
    #[serde(default)]
    pub secondary_voice: Option<VoiceSpec>,
    #[serde(default)]
    pub escalation_phone: Option<String>,
    #[serde(default)]
    pub lead_questions: Vec<LeadQuestion>,
    #[serde(default)]
    pub idle_prompts: Vec<String>,
    #[serde(default = "d_asr_fallback")]
    pub asr_fallback_line: String,
    #[serde(default = "d_closing")]
    pub closing_line: String,
    #[serde(default)]
    pub clients: Vec<ClientRecord>,
    #[serde(default)]
    pub project_provider_id: Option<String>,
    #[serde(default)]
    pub features: FeatureFlags,
    #[serde(default)]
    pub vad_hangover_ms: Option<u64>,
}

fn d_agent_name() -> String {
    "Ava".into()
}
fn d_asr_fallback() -> String {
    "I'm having trouble hearing you — may I take your number and have someone call you back?".into()
}
fn d_closing() -> String {
    "Thanks for calling. Goodbye!".into()
}

impl TenantEntry {
    pub fn into_context(self) -> TenantContext {
        let greeting = render_greeting(&self.greeting, &self.display_name, &self.agent_name);
        TenantContext {
            tenant_id: self.tenant_id,
            display_name: self.display_name,
            agent_name: self.agent_name,
            greeting,
            persona_prompt: self.persona_prompt,
            voice: self.voice,
            secondary_voice: self.secondary_voice,
            escalation_phone: self.escalation_phone,
            lead_questions: self.lead_questions,
            idle_prompts: self.idle_prompts,
            asr_fallback_line: self.asr_fallback_line,
            closing_line: self.closing_line,
            clients: self.clients,
            project_provider_id: self.project_provider_id,
            features: self.features,
            vad_hangover_ms: self.vad_hangover_ms,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Consumed interfaces
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The tenant store. `resolve` is the only operation the runtime uses;
/// it must be stable for a given number within a call's lifetime.
#[async_trait]
pub trait TenantStore: Send + Sync {
    async fn resolve(&self, dialed_number: &str) -> Result<TenantContext>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectRef {
    pub id: String,
    pub name: String,
    pub status: String,
    pub last_update_at: Option<String>,
    #[serde(default)]
    pub summary: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Activity {
    pub at: String,
    pub description: String,
}

/// Uniform surface over the tenant's PM tool. Implementations must honor
/// a 3 s deadline per operation.
#[async_trait]
pub trait ProjectProvider: Send + Sync {
    async fn find_project(&self, hint: &str, caller_id: &str) -> Result<Option<ProjectRef>>;
    async fn recent_activity(&self, project: &ProjectRef, limit: usize) -> Result<Vec<Activity>>;
    async fn scope_of(&self, project: &ProjectRef) -> Result<Option<String>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn greeting_placeholders_replaced_exactly() {
        let out = render_greeting(
            "Hi, this is {businessName} — {agentName} speaking. How can I help?",
            "Aurora",
            "Jessica",
        );
        assert_eq!(out, "Hi, this is Aurora — Jessica speaking. How can I help?");
        assert!(!out.contains('{'));
    }

    #[test]
    fn greeting_without_placeholders_untouched() {
        let out = render_greeting("Hello!", "Aurora", "Jessica");
        assert_eq!(out, "Hello!");
    }

    #[test]
    fn entry_renders_greeting_on_context_build() {
        let entry = TenantEntry {
            tenant_id: "aurora".into(),
            dialed_number: "+15135550100".into(),
            display_name: "Aurora".into(),
            agent_name: "Jessica".into(),
            greeting: "Hi, this is {businessName} — how can I help?".into(),
            persona_prompt: String::new(),
            voice: VoiceSpec::new("elevenlabs", "jessica"),
            secondary_voice: None,
            escalation_phone: Some("+15135550900".into()),
            lead_questions: vec![],
            idle_prompts: vec![],
            asr_fallback_line: d_asr_fallback(),
            closing_line: d_closing(),
            clients: vec![],
            project_provider_id: None,
            features: FeatureFlags::default(),
            vad_hangover_ms: None,
        };
        let ctx = entry.into_context();
        assert_eq!(ctx.greeting, "Hi, this is Aurora — how can I help?");
    }
}
