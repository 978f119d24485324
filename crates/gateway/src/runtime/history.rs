//! Rolling dialog history: a pinned system prompt plus a bounded window
//! of recent turns. When the window overflows, older turns are collapsed
//! into a single "context" pseudo-turn summarised by the LLM, so the
//! prompt stays small on long calls.

use std::sync::Arc;

use vl_domain::msg::{Message, Role, ToolCall};
use vl_providers::{ChatRequest, LlmProvider};

pub struct ConversationHistory {
    system_prompt: String,
    /// Summary of turns that aged out of the window, if any.
    context_summary: Option<String>,
    entries: Vec<Message>,
    window_turns: usize,
}

impl ConversationHistory {
    pub fn new(system_prompt: impl Into<String>, window_turns: usize) -> Self {
        Self {
            system_prompt: system_prompt.into(),
            context_summary: None,
            entries: Vec::new(),
            window_turns: window_turns.max(2),
        }
    }

    pub fn push_user(&mut self, text: &str) {
        self.entries.push(Message::user(text));
    }

    pub fn push_assistant(&mut self, text: &str) {
        if !text.is_empty() {
            self.entries.push(Message::assistant(text));
        }
    }

    pub fn push_assistant_tool_calls(&mut self, text: &str, calls: &[ToolCall]) {
        self.entries.push(Message::assistant_tool_calls(text, calls));
    }

    pub fn push_tool_result(&mut self, call_id: &str, content: &str) {
        self.entries.push(Message::tool_result(call_id, content));
    }

    /// Replace the last assistant text with what was actually spoken
    /// (barge-in truncation), so the model never believes the caller
    /// heard the unspoken remainder.
    pub fn truncate_last_assistant(&mut self, spoken: &str) {
        if let Some(last) = self
            .entries
            .iter_mut()
            .rev()
            .find(|m| m.role == Role::Assistant)
        {
            *last = if spoken.is_empty() {
                Message::assistant("[cut off by the caller before speaking]")
            } else {
                Message::assistant(format!("{spoken} [cut off by the caller here]"))
            };
        }
    }

    /// Full prompt: system, optional context pseudo-turn, recent turns.
    pub fn messages(&self) -> Vec<Message> {
        let mut messages = Vec::with_capacity(self.entries.len() + 2);
        messages.push(Message::system(&self.system_prompt));
        if let Some(summary) = &self.context_summary {
            messages.push(Message::system(format!(
                "Context from earlier in this call:\n{summary}"
            )));
        }
        messages.extend(self.entries.iter().cloned());
        messages
    }

    fn user_turn_count(&self) -> usize {
        self.entries.iter().filter(|m| m.role == Role::User).count()
    }

    /// Collapse old turns into the context pseudo-turn once the window
    /// overflows. A summarisation failure keeps the full history; the
    /// call goes on.
    pub async fn compact_if_needed(&mut self, llm: &Arc<dyn LlmProvider>) {
        if self.user_turn_count() <= self.window_turns {
            return;
        }

        let keep_turns = self.window_turns / 2;
        let split = self.split_index(keep_turns);
        let old = &self.entries[..split];

        let conversation: String = old
            .iter()
            .map(|m| {
                let role = match m.role {
                    Role::User => "Caller",
                    Role::Assistant => "Agent",
                    Role::Tool => "Tool",
                    Role::System => "System",
                };
                format!("{role}: {}\n", m.content.extract_all_text())
            })
            .collect();

        let prompt = format!(
            "Summarize this phone conversation so far in a few sentences. \
             Preserve the caller's name, any project discussed, answers given, \
             and open requests. Present tense, no pleasantries.\n\n{conversation}"
        );

        let req = ChatRequest {
            messages: vec![Message::user(&prompt)],
            tools: vec![],
            temperature: Some(0.1),
            max_tokens: Some(500),
            json_mode: false,
            model: None,
        };

        match llm.chat(req).await {
            Ok(resp) if !resp.content.is_empty() => {
                let merged = match &self.context_summary {
                    Some(prev) => format!("{prev}\n{}", resp.content),
                    None => resp.content,
                };
                self.context_summary = Some(merged);
                self.entries.drain(..split);
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(error = %e, "history compaction failed, keeping full window");
            }
        }
    }

    /// Index of the first entry of the last `keep_turns` user turns.
    fn split_index(&self, keep_turns: usize) -> usize {
        let mut seen = 0;
        for (i, m) in self.entries.iter().enumerate().rev() {
            if m.role == Role::User {
                seen += 1;
                if seen >= keep_turns {
                    return i;
                }
            }
        }
        0
    }
}
