//! OpenAI-compatible chat adapter.
//!
//! Works with OpenAI and any endpoint following the chat completions
//! contract. Tool calls arrive as indexed deltas on the stream; a small
//! assembly state turns them into started/delta/finished events.

use std::collections::HashMap;

use serde_json::Value;

use vl_domain::error::{Error, Result};
use vl_domain::msg::{ContentPart, Message, MessageContent, Role, ToolCall, ToolDefinition};
use vl_domain::stream::{BoxStream, StreamEvent, Usage};

use crate::sse::sse_stream;
use crate::traits::{ChatRequest, ChatResponse, LlmProvider};

pub struct OpenAiChat {
    id: String,
    base_url: String,
    api_key: Option<String>,
    default_model: String,
    client: reqwest::Client,
}

impl OpenAiChat {
    pub fn new(
        id: impl Into<String>,
        base_url: impl Into<String>,
        api_key: Option<String>,
        default_model: impl Into<String>,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(120))
            .build()
            .map_err(|e| Error::Http(e.to_string()))?;
        let base_url: String = base_url.into();
        Ok(Self {
            id: id.into(),
            base_url: base_url.trim_end_matches('/').to_owned(),
            api_key,
            default_model: default_model.into(),
            client,
        })
    }

    fn chat_url(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    fn post(&self, url: &str) -> reqwest::RequestBuilder {
        let mut builder = self
            .client
            .post(url)
            .header("Content-Type", "application/json");
        if let Some(key) = &self.api_key {
            builder = builder.header("Authorization", format!("Bearer {key}"));
        }
        builder
    }

    fn build_body(&self, req: &ChatRequest, stream: bool) -> Value {
        let messages: Vec<Value> = req.messages.iter().map(msg_to_wire).collect();
        let model = req
            .model
            .clone()
            .unwrap_or_else(|| self.default_model.clone());

        let mut body = serde_json::json!({
            "model": model,
            "messages": messages,
            "stream": stream,
        });
        if !req.tools.is_empty() {
            let tools: Vec<Value> = req.tools.iter().map(tool_to_wire).collect();
            body["tools"] = Value::Array(tools);
        }
        if let Some(temp) = req.temperature {
            body["temperature"] = serde_json::json!(temp);
        }
        if let Some(max) = req.max_tokens {
            body["max_tokens"] = serde_json::json!(max);
        }
        if req.json_mode {
            body["response_format"] = serde_json::json!({"type": "json_object"});
        }
        if stream {
            body["stream_options"] = serde_json::json!({"include_usage": true});
        }
        body
    }
}

#[async_trait::async_trait]
impl LlmProvider for OpenAiChat {
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse> {
        let body = self.build_body(&req, false);
        let resp = self
            .post(&self.chat_url())
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Http(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let detail = resp.text().await.unwrap_or_default();
            return Err(Error::Provider {
                provider: self.id.clone(),
                message: format!("{status}: {detail}"),
            });
        }

        let body: Value = resp.json().await.map_err(|e| Error::Http(e.to_string()))?;
        parse_chat_response(&self.id, &body)
    }

    async fn chat_stream(
        &self,
        req: ChatRequest,
    ) -> Result<BoxStream<'static, Result<StreamEvent>>> {
        let body = self.build_body(&req, true);
        let resp = self
            .post(&self.chat_url())
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Http(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let detail = resp.text().await.unwrap_or_default();
            return Err(Error::Provider {
                provider: self.id.clone(),
                message: format!("{status}: {detail}"),
            });
        }

        let mut state = StreamState::default();
        Ok(sse_stream(resp, move |data| state.parse(data)))
    }

    fn provider_id(&self) -> &str {
        &self.id
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Wire serialization
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn role_str(role: Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    }
}

fn msg_to_wire(msg: &Message) -> Value {
    match msg.role {
        Role::Tool => tool_result_to_wire(msg),
        Role::Assistant => assistant_to_wire(msg),
        _ => serde_json::json!({
            "role": role_str(msg.role),
            "content": msg.content.extract_all_text(),
        }),
    }
}

fn assistant_to_wire(msg: &Message) -> Value {
    let mut obj = serde_json::json!({"role": "assistant"});
    let mut text_parts: Vec<String> = Vec::new();
    let mut tool_calls: Vec<Value> = Vec::new();

    match &msg.content {
        MessageContent::Text(t) => text_parts.push(t.clone()),
        MessageContent::Parts(parts) => {
            for part in parts {
                match part {
                    ContentPart::Text { text } => text_parts.push(text.clone()),
                    ContentPart::ToolUse { id, name, input } => {
                        tool_calls.push(serde_json::json!({
                            "id": id,
                            "type": "function",
                            "function": { "name": name, "arguments": input.to_string() },
                        }));
                    }
                    ContentPart::ToolResult { .. } => {}
                }
            }
        }
    }

    obj["content"] = if text_parts.is_empty() {
        Value::Null
    } else {
        Value::String(text_parts.join("\n"))
    };
    if !tool_calls.is_empty() {
        obj["tool_calls"] = Value::Array(tool_calls);
    }
    obj
}

fn tool_result_to_wire(msg: &Message) -> Value {
    if let MessageContent::Parts(parts) = &msg.content {
        for part in parts {
            if let ContentPart::ToolResult {
                tool_use_id,
                content,
                ..
            } = part
            {
                return serde_json::json!({
                    "role": "tool",
                    "tool_call_id": tool_use_id,
                    "content": content,
                });
            }
        }
    }
    serde_json::json!({
        "role": "tool",
        "tool_call_id": "",
        "content": msg.content.extract_all_text(),
    })
}

fn tool_to_wire(tool: &ToolDefinition) -> Value {
    serde_json::json!({
        "type": "function",
        "function": {
            "name": tool.name,
            "description": tool.description,
            "parameters": tool.parameters,
        }
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Response parsing
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn parse_chat_response(provider: &str, body: &Value) -> Result<ChatResponse> {
    let choice = body
        .get("choices")
        .and_then(|c| c.as_array())
        .and_then(|a| a.first())
        .ok_or_else(|| Error::Provider {
            provider: provider.into(),
            message: "no choices in response".into(),
        })?;

    let message = choice.get("message").ok_or_else(|| Error::Provider {
        provider: provider.into(),
        message: "no message in choice".into(),
    })?;

    Ok(ChatResponse {
        content: message
            .get("content")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_owned(),
        tool_calls: parse_tool_calls(message),
        usage: body.get("usage").and_then(parse_usage),
        model: body
            .get("model")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown")
            .to_owned(),
        finish_reason: choice
            .get("finish_reason")
            .and_then(|v| v.as_str())
            .map(String::from),
    })
}

fn parse_tool_calls(message: &Value) -> Vec<ToolCall> {
    let arr = match message.get("tool_calls").and_then(|v| v.as_array()) {
        Some(a) => a,
        None => return Vec::new(),
    };
    arr.iter()
        .filter_map(|tc| {
            let call_id = tc.get("id")?.as_str()?.to_owned();
            let func = tc.get("function")?;
            let tool_name = func.get("name")?.as_str()?.to_owned();
            let args_str = func.get("arguments")?.as_str().unwrap_or("{}");
            let arguments: Value =
                serde_json::from_str(args_str).unwrap_or(Value::Object(Default::default()));
            Some(ToolCall {
                call_id,
                tool_name,
                arguments,
            })
        })
        .collect()
}

fn parse_usage(v: &Value) -> Option<Usage> {
    Some(Usage {
        prompt_tokens: v.get("prompt_tokens")?.as_u64()? as u32,
        completion_tokens: v.get("completion_tokens")?.as_u64()? as u32,
        total_tokens: v.get("total_tokens")?.as_u64()? as u32,
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Stream parsing
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Default)]
struct ToolBuf {
    call_id: String,
    name: String,
    args: String,
}

/// Assembles indexed tool-call deltas across stream chunks.
#[derive(Default)]
struct StreamState {
    by_index: HashMap<u64, ToolBuf>,
    order: Vec<u64>,
}

impl StreamState {
    fn parse(&mut self, data: &str) -> Vec<Result<StreamEvent>> {
        if data.trim() == "[DONE]" {
            return Vec::new();
        }
        let v: Value = match serde_json::from_str(data) {
            Ok(v) => v,
            Err(e) => return vec![Err(Error::Json(e))],
        };

        let choice = v
            .get("choices")
            .and_then(|c| c.as_array())
            .and_then(|a| a.first());

        // Usage-only chunk (stream_options.include_usage).
        let Some(choice) = choice else {
            if let Some(usage) = v.get("usage").and_then(parse_usage) {
                return vec![Ok(StreamEvent::Done {
                    usage: Some(usage),
                    finish_reason: None,
                })];
            }
            return Vec::new();
        };

        let mut events = Vec::new();
        let delta = choice.get("delta").unwrap_or(&Value::Null);

        if let Some(text) = delta.get("content").and_then(|c| c.as_str()) {
            if !text.is_empty() {
                events.push(Ok(StreamEvent::Token { text: text.into() }));
            }
        }

        if let Some(tc_arr) = delta.get("tool_calls").and_then(|t| t.as_array()) {
            for tc in tc_arr {
                let index = tc.get("index").and_then(|i| i.as_u64()).unwrap_or(0);
                if let std::collections::hash_map::Entry::Vacant(slot) =
                    self.by_index.entry(index)
                {
                    slot.insert(ToolBuf::default());
                    self.order.push(index);
                }
                let Some(buf) = self.by_index.get_mut(&index) else {
                    continue;
                };
                if let Some(id) = tc.get("id").and_then(|i| i.as_str()) {
                    buf.call_id = id.to_owned();
                }
                if let Some(name) = tc
                    .get("function")
                    .and_then(|f| f.get("name"))
                    .and_then(|n| n.as_str())
                {
                    if buf.name.is_empty() {
                        buf.name = name.to_owned();
                        events.push(Ok(StreamEvent::ToolCallStarted {
                            call_id: buf.call_id.clone(),
                            tool_name: buf.name.clone(),
                        }));
                    }
                }
                if let Some(args) = tc
                    .get("function")
                    .and_then(|f| f.get("arguments"))
                    .and_then(|a| a.as_str())
                {
                    buf.args.push_str(args);
                    events.push(Ok(StreamEvent::ToolCallDelta {
                        call_id: buf.call_id.clone(),
                        delta: args.to_owned(),
                    }));
                }
            }
        }

        if let Some(reason) = choice.get("finish_reason").and_then(|f| f.as_str()) {
            events.extend(self.flush_tool_calls());
            events.push(Ok(StreamEvent::Done {
                usage: v.get("usage").and_then(parse_usage),
                finish_reason: Some(reason.to_owned()),
            }));
        }

        events
    }

    fn flush_tool_calls(&mut self) -> Vec<Result<StreamEvent>> {
        let mut events = Vec::new();
        for index in std::mem::take(&mut self.order) {
            if let Some(buf) = self.by_index.remove(&index) {
                let arguments: Value = if buf.args.trim().is_empty() {
                    Value::Object(Default::default())
                } else {
                    serde_json::from_str(&buf.args).unwrap_or_else(|e| {
                        tracing::warn!(
                            call_id = %buf.call_id,
                            tool = %buf.name,
                            error = %e,
                            "tool call arguments are not valid JSON; defaulting to empty object"
                        );
                        Value::Object(Default::default())
                    })
                };
                events.push(Ok(StreamEvent::ToolCallFinished {
                    call_id: buf.call_id,
                    tool_name: buf.name,
                    arguments,
                }));
            }
        }
        events
    }
}
