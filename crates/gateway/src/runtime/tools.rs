//! The typed tool registry: definitions exposed to the LLM and the
//! dispatcher that runs them.
//!
//! Tools never propagate errors into the orchestrator: every outcome is
//! a JSON result for the model, plus an optional side effect
//! ([`SessionAction`]) the orchestrator applies. Project data is only
//! released to verified callers.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use vl_domain::msg::{ToolCall, ToolDefinition};
use vl_domain::tenant::{ProjectProvider, TenantContext};

use super::lead::{normalize_phone, AcceptOutcome, LeadFlow};

/// Minimum cosine similarity for name/project verification.
const VERIFY_SIMILARITY: f32 = 0.8;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Definitions
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Build the tool surface for one tenant. Tools without a backing
/// capability (no escalation number, no lead questions) are not offered
/// to the model at all.
pub fn build_tool_definitions(tenant: &TenantContext) -> Vec<ToolDefinition> {
    let mut defs = Vec::new();

    if tenant.features.project_lookup {
        defs.push(ToolDefinition {
            name: "lookup_project_status".into(),
            description: "Look up the current status and recent activity of a client project. Requires the caller to be verified; pass the caller's stated name once they give it, and what they are asking for so it can be checked against the project's agreed scope.".into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "project_hint": { "type": "string", "description": "Project name or fragment the caller mentioned" },
                    "caller_name": { "type": "string", "description": "The caller's stated name, if given" },
                    "request": { "type": "string", "description": "What the caller is asking for, in their words" }
                },
                "required": ["project_hint"]
            }),
        });
    }

    if tenant.features.transfer && tenant.escalation_phone.is_some() {
        defs.push(ToolDefinition {
            name: "transfer_to_human".into(),
            description: "Warm-transfer the caller to a team member. Use when the caller asks for a person or the conversation needs a human.".into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "reason": { "type": "string", "description": "Why the caller is being transferred" }
                },
                "required": ["reason"]
            }),
        });
    }

    if tenant.features.lead_capture && !tenant.lead_questions.is_empty() {
        defs.push(ToolDefinition {
            name: "capture_lead_answer".into(),
            description: "Record the caller's answer to the current lead question. Ask the questions one at a time, in order.".into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "question_id": { "type": "string", "description": "Id of the question being answered" },
                    "answer": { "type": "string", "description": "The caller's answer, verbatim" }
                },
                "required": ["question_id", "answer"]
            }),
        });
    }

    defs.push(ToolDefinition {
        name: "end_call".into(),
        description: "End the call politely once the caller is done.".into(),
        parameters: json!({
            "type": "object",
            "properties": {
                "reason": { "type": "string", "description": "Why the call is ending" }
            },
            "required": ["reason"]
        }),
    });

    defs
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Caller verification
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct VerifyState {
    verified: bool,
}

impl VerifyState {
    /// Path (a): the caller-id matches a stored client phone.
    pub fn from_caller_id(tenant: &TenantContext, caller_id: &str) -> Self {
        let caller_digits = normalize_phone(caller_id);
        let verified = !caller_digits.is_empty()
            && tenant.clients.iter().any(|c| {
                c.phone
                    .as_deref()
                    .map(|p| normalize_phone(p) == caller_digits)
                    .unwrap_or(false)
            });
        Self { verified }
    }

    pub fn is_verified(&self) -> bool {
        self.verified
    }

    /// Path (b): stated name + project hint match a client record at
    /// ≥ 0.8 cosine similarity on normalised strings.
    pub fn try_verify(&mut self, tenant: &TenantContext, caller_name: &str, project_hint: &str) {
        if self.verified || caller_name.is_empty() || project_hint.is_empty() {
            return;
        }
        self.verified = tenant.clients.iter().any(|c| {
            similarity(&c.name, caller_name) >= VERIFY_SIMILARITY
                && similarity(&c.project, project_hint) >= VERIFY_SIMILARITY
        });
    }
}

fn normalize(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut last_space = true;
    for c in s.chars() {
        if c.is_alphanumeric() {
            out.extend(c.to_lowercase());
            last_space = false;
        } else if !last_space {
            out.push(' ');
            last_space = true;
        }
    }
    out.trim_end().to_owned()
}

/// Cosine similarity of character-bigram vectors over normalised text.
pub fn similarity(a: &str, b: &str) -> f32 {
    let a = normalize(a);
    let b = normalize(b);
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    if a == b {
        return 1.0;
    }
    let grams_a = bigrams(&a);
    let grams_b = bigrams(&b);
    let dot: f32 = grams_a
        .iter()
        .filter_map(|(gram, &count_a)| grams_b.get(gram).map(|&count_b| count_a * count_b))
        .sum();
    let norm_a: f32 = grams_a.values().map(|v| v * v).sum::<f32>().sqrt();
    let norm_b: f32 = grams_b.values().map(|v| v * v).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

fn bigrams(s: &str) -> std::collections::HashMap<(char, char), f32> {
    let chars: Vec<char> = s.chars().collect();
    let mut grams = std::collections::HashMap::new();
    for pair in chars.windows(2) {
        *grams.entry((pair[0], pair[1])).or_insert(0.0) += 1.0;
    }
    // A single-character string still gets a vector.
    if chars.len() == 1 {
        grams.insert((chars[0], '\0'), 1.0);
    }
    grams
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Dispatch
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Per-call dependencies of the dispatcher.
pub struct ToolRuntime {
    pub tenant: Arc<TenantContext>,
    pub caller_id: String,
    pub projects: Option<Arc<dyn ProjectProvider>>,
    pub timeout: Duration,
}

/// A side effect the orchestrator must apply after feeding the result
/// back to the model.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionAction {
    Transfer {
        to: String,
    },
    EndCall {
        reason: String,
    },
    LeadCaptured {
        question_id: String,
        answer: String,
        completed: bool,
    },
}

pub struct ToolDispatch {
    pub result: Value,
    pub is_error: bool,
    pub action: Option<SessionAction>,
}

impl ToolDispatch {
    fn ok(result: Value) -> Self {
        Self {
            result,
            is_error: false,
            action: None,
        }
    }

    fn err(result: Value) -> Self {
        Self {
            result,
            is_error: true,
            action: None,
        }
    }

    fn with_action(mut self, action: SessionAction) -> Self {
        self.action = Some(action);
        self
    }
}

fn arg_str<'a>(args: &'a Value, key: &str) -> &'a str {
    args.get(key).and_then(|v| v.as_str()).unwrap_or("")
}

/// Run one tool call. Never returns an error to the caller; failures are
/// encoded in the result JSON for the model to react to.
pub async fn dispatch_tool(
    rt: &ToolRuntime,
    verify: &mut VerifyState,
    lead: &mut LeadFlow,
    call: &ToolCall,
) -> ToolDispatch {
    match call.tool_name.as_str() {
        "lookup_project_status" => dispatch_lookup(rt, verify, &call.arguments).await,
        "transfer_to_human" => dispatch_transfer(rt, &call.arguments),
        "capture_lead_answer" => dispatch_lead(lead, &call.arguments),
        "end_call" => ToolDispatch::ok(json!({ "ok": true })).with_action(SessionAction::EndCall {
            reason: arg_str(&call.arguments, "reason").to_owned(),
        }),
        unknown => ToolDispatch::err(json!({
            "ok": false,
            "reason": format!("unknown tool '{unknown}'"),
        })),
    }
}

/// Activity entries folded into a successful lookup.
const RECENT_ACTIVITY_LIMIT: usize = 3;

async fn dispatch_lookup(rt: &ToolRuntime, verify: &mut VerifyState, args: &Value) -> ToolDispatch {
    let hint = arg_str(args, "project_hint");
    let caller_name = arg_str(args, "caller_name");
    let request = arg_str(args, "request");

    verify.try_verify(&rt.tenant, caller_name, hint);
    if !verify.is_verified() {
        return ToolDispatch::ok(json!({ "found": false, "reason": "unverified" }));
    }

    let Some(projects) = &rt.projects else {
        return ToolDispatch::ok(json!({ "found": false, "reason": "no_integration" }));
    };

    // One deadline covers the whole lookup, however many provider
    // round-trips it takes.
    match tokio::time::timeout(
        rt.timeout,
        lookup_project(projects, hint, &rt.caller_id, request),
    )
    .await
    {
        Ok(dispatch) => dispatch,
        Err(_) => ToolDispatch::err(json!({ "ok": false, "reason": "timeout" })),
    }
}

async fn lookup_project(
    projects: &Arc<dyn ProjectProvider>,
    hint: &str,
    caller_id: &str,
    request: &str,
) -> ToolDispatch {
    let project = match projects.find_project(hint, caller_id).await {
        Err(e) => {
            tracing::warn!(error = %e, "project lookup failed");
            return ToolDispatch::err(json!({ "ok": false, "reason": e.to_string() }));
        }
        Ok(None) => return ToolDispatch::ok(json!({ "found": false })),
        Ok(Some(project)) => project,
    };

    // Activity and scope are enrichments; losing either never fails the
    // lookup itself.
    let recent = match projects
        .recent_activity(&project, RECENT_ACTIVITY_LIMIT)
        .await
    {
        Ok(items) => items,
        Err(e) => {
            tracing::debug!(error = %e, "recent activity unavailable");
            Vec::new()
        }
    };
    let deviates = match projects.scope_of(&project).await {
        Ok(Some(scope)) => request_deviates_from_scope(&scope, request),
        Ok(None) => None,
        Err(e) => {
            tracing::debug!(error = %e, "project scope unavailable");
            None
        }
    };

    let mut result = json!({
        "found": true,
        "name": project.name,
        "status": project.status,
        "last_update_at": project.last_update_at,
        "summary": project.summary,
        "recent_activity": recent,
    });
    if let Some(flagged) = deviates {
        result["deviates_from_scope"] = json!(flagged);
    }
    ToolDispatch::ok(result)
}

/// Lexical screen for mid-call scope checks: the request is flagged when
/// most of its content words miss the stored scope. Inconclusive inputs
/// (no scope, too few words) omit the flag. The finalizer's
/// transcript-level check is what lands on the artifact; this one only
/// lets the agent warn the caller in the moment.
fn request_deviates_from_scope(scope: &str, request: &str) -> Option<bool> {
    let scope_words: std::collections::HashSet<String> =
        content_words(scope).into_iter().collect();
    if scope_words.is_empty() {
        return None;
    }
    let request_words = content_words(request);
    if request_words.len() < 2 {
        return None;
    }
    let hits = request_words
        .iter()
        .filter(|w| scope_words.contains(*w))
        .count();
    Some(hits * 2 < request_words.len())
}

fn content_words(text: &str) -> Vec<String> {
    normalize(text)
        .split_whitespace()
        .filter(|w| w.len() >= 4)
        .map(str::to_owned)
        .collect()
}

fn dispatch_transfer(rt: &ToolRuntime, args: &Value) -> ToolDispatch {
    if !rt.tenant.features.transfer {
        return ToolDispatch::err(json!({ "transferred": false, "reason": "transfer disabled" }));
    }
    let Some(to_number) = rt.tenant.escalation_phone.clone() else {
        return ToolDispatch::err(json!({
            "transferred": false,
            "reason": "no escalation number configured",
        }));
    };
    tracing::info!(reason = arg_str(args, "reason"), to = %to_number, "transfer requested");
    ToolDispatch::ok(json!({ "transferred": true, "to_number": to_number }))
        .with_action(SessionAction::Transfer { to: to_number })
}

fn dispatch_lead(lead: &mut LeadFlow, args: &Value) -> ToolDispatch {
    let question_id = arg_str(args, "question_id");
    let raw_answer = arg_str(args, "answer");

    let stored_answer = match lead.kind_of(question_id) {
        Some(vl_domain::tenant::LeadAnswerKind::Phone) => normalize_phone(raw_answer),
        _ => raw_answer.trim().to_owned(),
    };

    match lead.accept(question_id, raw_answer) {
        AcceptOutcome::Accepted { next } => {
            let completed = lead.completed();
            ToolDispatch::ok(json!({
                "accepted": true,
                "next_question": next.map(|q| json!({ "id": q.id, "prompt": q.prompt })),
            }))
            .with_action(SessionAction::LeadCaptured {
                question_id: question_id.to_owned(),
                answer: stored_answer,
                completed,
            })
        }
        AcceptOutcome::Invalid { kind } => ToolDispatch::ok(json!({
            "accepted": false,
            "reason": format!("answer is not a valid {kind:?}").to_lowercase(),
        })),
        AcceptOutcome::OutOfOrder { expected } => ToolDispatch::ok(json!({
            "accepted": false,
            "reason": "out_of_order",
            "expected_question_id": expected,
        })),
        AcceptOutcome::UnknownQuestion => ToolDispatch::ok(json!({
            "accepted": false,
            "reason": "unknown_question",
        })),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use vl_domain::error::Result;
    use vl_domain::tenant::{
        Activity, ClientRecord, FeatureFlags, LeadAnswerKind, LeadQuestion, ProjectRef, VoiceSpec,
    };

    fn tenant() -> TenantContext {
        TenantContext {
            tenant_id: "aurora".into(),
            display_name: "Aurora".into(),
            agent_name: "Jessica".into(),
            greeting: "Hi".into(),
            persona_prompt: String::new(),
            voice: VoiceSpec::new("elevenlabs", "jessica"),
            secondary_voice: None,
            escalation_phone: Some("+15135550900".into()),
            lead_questions: vec![LeadQuestion {
                id: "phone".into(),
                prompt: "Best number?".into(),
                kind: LeadAnswerKind::Phone,
            }],
            idle_prompts: vec![],
            asr_fallback_line: "fallback".into(),
            closing_line: "bye".into(),
            clients: vec![ClientRecord {
                name: "Sam Carter".into(),
                phone: Some("+15135550123".into()),
                project: "Nova".into(),
            }],
            project_provider_id: Some("linear".into()),
            features: FeatureFlags::default(),
            vad_hangover_ms: None,
        }
    }

    struct StubProjects {
        delay: Option<Duration>,
    }

    #[async_trait]
    impl ProjectProvider for StubProjects {
        async fn find_project(&self, hint: &str, _caller_id: &str) -> Result<Option<ProjectRef>> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if similarity(hint, "Nova") >= 0.8 {
                Ok(Some(ProjectRef {
                    id: "p1".into(),
                    name: "Nova".into(),
                    status: "In review".into(),
                    last_update_at: Some("2024-01-15".into()),
                    summary: Some("Design pass under review".into()),
                }))
            } else {
                Ok(None)
            }
        }

        async fn recent_activity(
            &self,
            project: &ProjectRef,
            limit: usize,
        ) -> Result<Vec<Activity>> {
            // The ref handed back by find_project must round-trip intact.
            assert_eq!(project.id, "p1");
            let items = vec![
                Activity {
                    at: "2024-01-15".into(),
                    description: "Moved design pass to review".into(),
                },
                Activity {
                    at: "2024-01-12".into(),
                    description: "Uploaded homepage comps".into(),
                },
            ];
            Ok(items.into_iter().take(limit).collect())
        }

        async fn scope_of(&self, _project: &ProjectRef) -> Result<Option<String>> {
            Ok(Some("Marketing site redesign".into()))
        }
    }

    fn runtime(caller_id: &str, delay: Option<Duration>) -> ToolRuntime {
        ToolRuntime {
            tenant: Arc::new(tenant()),
            caller_id: caller_id.into(),
            projects: Some(Arc::new(StubProjects { delay })),
            timeout: Duration::from_secs(4),
        }
    }

    fn lookup_call(hint: &str, name: Option<&str>) -> ToolCall {
        let mut args = json!({ "project_hint": hint });
        if let Some(name) = name {
            args["caller_name"] = json!(name);
        }
        ToolCall {
            call_id: "c1".into(),
            tool_name: "lookup_project_status".into(),
            arguments: args,
        }
    }

    #[test]
    fn similarity_matches_spoken_variants() {
        assert!(similarity("Nova", "nova") >= 0.8);
        assert!(similarity("Sam Carter", "sam carter") >= 0.8);
        assert!(similarity("Project Straus", "straus") < 0.8); // hint alone differs
        assert!(similarity("Nova", "Orion") < 0.8);
        assert_eq!(similarity("", "Nova"), 0.0);
    }

    #[test]
    fn caller_id_match_verifies_up_front() {
        let t = tenant();
        assert!(VerifyState::from_caller_id(&t, "+15135550123").is_verified());
        assert!(!VerifyState::from_caller_id(&t, "+19995550000").is_verified());
    }

    #[tokio::test]
    async fn unverified_lookup_refuses_data() {
        let rt = runtime("+19995550000", None);
        let mut verify = VerifyState::from_caller_id(&rt.tenant, &rt.caller_id);
        let mut lead = LeadFlow::new(vec![]);

        let out = dispatch_tool(&rt, &mut verify, &mut lead, &lookup_call("Nova", None)).await;
        assert_eq!(out.result["found"], false);
        assert_eq!(out.result["reason"], "unverified");
        assert!(!out.is_error);
    }

    #[tokio::test]
    async fn name_and_project_match_verifies_and_returns_data() {
        let rt = runtime("+19995550000", None);
        let mut verify = VerifyState::from_caller_id(&rt.tenant, &rt.caller_id);
        let mut lead = LeadFlow::new(vec![]);

        let out = dispatch_tool(
            &rt,
            &mut verify,
            &mut lead,
            &lookup_call("Nova", Some("Sam Carter")),
        )
        .await;
        assert_eq!(out.result["found"], true);
        assert_eq!(out.result["status"], "In review");
        assert_eq!(
            out.result["recent_activity"][0]["description"],
            "Moved design pass to review"
        );
        assert_eq!(out.result["recent_activity"][1]["at"], "2024-01-12");
        // No stated request, so the scope screen stays quiet.
        assert!(out.result.get("deviates_from_scope").is_none());
        assert!(verify.is_verified());
    }

    fn lookup_call_with_request(hint: &str, request: &str) -> ToolCall {
        ToolCall {
            call_id: "c1".into(),
            tool_name: "lookup_project_status".into(),
            arguments: json!({ "project_hint": hint, "request": request }),
        }
    }

    #[tokio::test]
    async fn in_scope_request_is_not_flagged() {
        let rt = runtime("+15135550123", None);
        let mut verify = VerifyState::from_caller_id(&rt.tenant, &rt.caller_id);
        let mut lead = LeadFlow::new(vec![]);

        let call = lookup_call_with_request("Nova", "any update on the marketing site redesign");
        let out = dispatch_tool(&rt, &mut verify, &mut lead, &call).await;
        assert_eq!(out.result["found"], true);
        assert_eq!(out.result["deviates_from_scope"], false);
    }

    #[tokio::test]
    async fn out_of_scope_request_raises_the_flag() {
        let rt = runtime("+15135550123", None);
        let mut verify = VerifyState::from_caller_id(&rt.tenant, &rt.caller_id);
        let mut lead = LeadFlow::new(vec![]);

        let call =
            lookup_call_with_request("Nova", "could you also build us a mobile app and a fresh logo");
        let out = dispatch_tool(&rt, &mut verify, &mut lead, &call).await;
        assert_eq!(out.result["found"], true);
        assert_eq!(out.result["deviates_from_scope"], true);
    }

    #[test]
    fn scope_screen_is_inconclusive_without_signal() {
        assert_eq!(request_deviates_from_scope("", "a new logo design"), None);
        assert_eq!(
            request_deviates_from_scope("Marketing site redesign", ""),
            None
        );
        // A single content word is not enough to judge.
        assert_eq!(
            request_deviates_from_scope("Marketing site redesign", "ok then"),
            None
        );
    }

    #[test]
    fn scope_screen_splits_on_content_word_overlap() {
        let scope = "Marketing site redesign";
        assert_eq!(
            request_deviates_from_scope(scope, "progress on the site redesign"),
            Some(false)
        );
        assert_eq!(
            request_deviates_from_scope(scope, "build a mobile app with push notifications"),
            Some(true)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn slow_provider_times_out_as_tool_error() {
        let rt = runtime("+15135550123", Some(Duration::from_secs(10)));
        let mut verify = VerifyState::from_caller_id(&rt.tenant, &rt.caller_id);
        let mut lead = LeadFlow::new(vec![]);

        let out = dispatch_tool(&rt, &mut verify, &mut lead, &lookup_call("Nova", None)).await;
        assert!(out.is_error);
        assert_eq!(out.result["reason"], "timeout");
    }

    #[tokio::test]
    async fn transfer_returns_escalation_number_and_action() {
        let rt = runtime("+15135550123", None);
        let mut verify = VerifyState::from_caller_id(&rt.tenant, &rt.caller_id);
        let mut lead = LeadFlow::new(vec![]);
        let call = ToolCall {
            call_id: "c2".into(),
            tool_name: "transfer_to_human".into(),
            arguments: json!({ "reason": "caller requested" }),
        };

        let out = dispatch_tool(&rt, &mut verify, &mut lead, &call).await;
        assert_eq!(out.result["transferred"], true);
        assert_eq!(out.result["to_number"], "+15135550900");
        assert_eq!(
            out.action,
            Some(SessionAction::Transfer {
                to: "+15135550900".into()
            })
        );
    }

    #[tokio::test]
    async fn lead_answer_normalises_phone_and_reports_completion() {
        let rt = runtime("+15135550123", None);
        let mut verify = VerifyState::from_caller_id(&rt.tenant, &rt.caller_id);
        let mut lead = LeadFlow::new(rt.tenant.lead_questions.clone());
        let call = ToolCall {
            call_id: "c3".into(),
            tool_name: "capture_lead_answer".into(),
            arguments: json!({ "question_id": "phone", "answer": "(513) 555-0142" }),
        };

        let out = dispatch_tool(&rt, &mut verify, &mut lead, &call).await;
        assert_eq!(out.result["accepted"], true);
        match out.action {
            Some(SessionAction::LeadCaptured {
                answer, completed, ..
            }) => {
                assert_eq!(answer, "5135550142");
                assert!(completed);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_tool_surfaces_as_model_error() {
        let rt = runtime("+15135550123", None);
        let mut verify = VerifyState::from_caller_id(&rt.tenant, &rt.caller_id);
        let mut lead = LeadFlow::new(vec![]);
        let call = ToolCall {
            call_id: "c4".into(),
            tool_name: "open_pod_bay_doors".into(),
            arguments: json!({}),
        };
        let out = dispatch_tool(&rt, &mut verify, &mut lead, &call).await;
        assert!(out.is_error);
        assert_eq!(out.result["ok"], false);
    }
}
