//! Post-call finalisation: summary, scope-creep flag, artifact emission.
//!
//! Runs once per call after `Ended`. LLM failures degrade to a partial
//! artifact with `finalizer_errors`; emission is still attempted, and
//! never blocks call teardown (the caller is already gone).

use std::sync::Arc;

use vl_domain::call::{ScopeCreep, Speaker};
use vl_domain::msg::Message;
use vl_domain::tenant::{ProjectProvider, TenantContext};
use vl_providers::ChatRequest;
use vl_sessions::artifact::{build_artifact, parse_summary_json, SummaryFields};
use vl_sessions::CallLog;

use crate::state::AppState;

pub async fn finalize(
    state: &AppState,
    tenant: &Arc<TenantContext>,
    log: &CallLog,
    projects: Option<Arc<dyn ProjectProvider>>,
) {
    let mut errors: Vec<String> = Vec::new();

    let summary = match generate_summary(state, tenant, log).await {
        Ok(fields) => Some(fields),
        Err(message) => {
            tracing::warn!(%message, "summary generation failed");
            errors.push(format!("summary: {message}"));
            None
        }
    };

    let scope_creep = match (&summary, projects) {
        (Some(fields), Some(projects)) => {
            match check_scope_creep(state, log, fields, &projects).await {
                Ok(flag) => flag,
                Err(message) => {
                    tracing::warn!(%message, "scope creep check failed");
                    errors.push(format!("scope_creep: {message}"));
                    None
                }
            }
        }
        _ => None,
    };

    let artifact = build_artifact(log, summary, scope_creep, errors);
    if let Err(e) = state.sink.emit(&artifact).await {
        // At-least-once was attempted; the failure is recorded, teardown
        // proceeds.
        tracing::error!(call_id = %artifact.call_id, error = %e, "artifact delivery failed");
    }
}

fn transcript_text(log: &CallLog) -> String {
    let entries = vl_domain::call::order_transcript(log.transcript_entries());
    entries
        .iter()
        .map(|e| {
            let who = match e.speaker {
                Speaker::Caller => "Caller",
                Speaker::Agent => "Agent",
            };
            format!("{who}: {}\n", e.text)
        })
        .collect()
}

async fn generate_summary(
    state: &AppState,
    tenant: &Arc<TenantContext>,
    log: &CallLog,
) -> Result<SummaryFields, String> {
    let transcript = transcript_text(log);
    if transcript.trim().is_empty() {
        // Nothing was said; synthesise the trivial summary locally.
        return parse_summary_json(
            r#"{"summary":"No conversation took place.","actionItems":[],"urgency":"low"}"#,
        )
        .map_err(|e| e.to_string());
    }

    let prompt = format!(
        "You are an assistant producing a structured record of a phone call \
         answered on behalf of {business}. Given the transcript, respond with \
         a single JSON object with exactly these fields:\n\
         callerName (string or null), project (string or null), \
         summary (string, two sentences max), actionItems (array of strings), \
         urgency (one of \"low\", \"medium\", \"high\", \"critical\").\n\
         Respond with JSON only.\n\nTRANSCRIPT:\n{transcript}",
        business = tenant.display_name,
    );

    let req = ChatRequest {
        messages: vec![Message::user(&prompt)],
        tools: vec![],
        // Deterministic output: the same transcript yields the same record.
        temperature: Some(0.0),
        max_tokens: Some(800),
        json_mode: true,
        model: None,
    };

    let resp = state.llm.chat(req).await.map_err(|e| e.to_string())?;
    parse_summary_json(&resp.content).map_err(|e| e.to_string())
}

async fn check_scope_creep(
    state: &AppState,
    log: &CallLog,
    summary: &SummaryFields,
    projects: &Arc<dyn ProjectProvider>,
) -> Result<Option<ScopeCreep>, String> {
    let Some(project_hint) = summary.project.as_deref() else {
        return Ok(None);
    };

    let caller_id = log.call().caller_id.clone();
    let project = match projects.find_project(project_hint, &caller_id).await {
        Ok(Some(project)) => project,
        Ok(None) => return Ok(None),
        Err(e) => return Err(e.to_string()),
    };
    let Some(scope) = projects.scope_of(&project).await.map_err(|e| e.to_string())? else {
        return Ok(None);
    };

    let transcript = transcript_text(log);
    let prompt = format!(
        "A client project has this agreed scope:\n{scope}\n\n\
         Below is a call transcript with the client. Decide whether the \
         caller asked for work outside that scope. Respond with a single \
         JSON object: {{\"flagged\": boolean, \"rationale\": string}}. \
         Respond with JSON only.\n\nTRANSCRIPT:\n{transcript}"
    );

    let req = ChatRequest {
        messages: vec![Message::user(&prompt)],
        tools: vec![],
        temperature: Some(0.0),
        max_tokens: Some(300),
        json_mode: true,
        model: None,
    };

    let resp = state.llm.chat(req).await.map_err(|e| e.to_string())?;
    let parsed: ScopeCreep = serde_json::from_str(resp.content.trim())
        .map_err(|e| format!("unparseable scope verdict: {e}"))?;
    Ok(Some(parsed))
}
