//! Conversation transcript: the append-only message list a turn operates on.
//!
//! Distinct from the wire types in `llm`: a `TurnMessage` additionally carries
//! the tool name for tool results, the structured payload for finalized
//! assistant replies, and a timestamp. `to_wire` projects onto the
//! completions format; `cleaned_for_storage` is what checkpoints persist.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::llm::{ChatMessage, LlmToolCall};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnMessage {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<LlmToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// Name of the tool that produced this result, for tool-role messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    /// Structured `FinalResponse` payload, present only on finalized
    /// assistant messages. Its presence marks the message as storage-worthy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub structured: Option<serde_json::Value>,
    pub timestamp: DateTime<Utc>,
}

impl TurnMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn assistant_with_calls(content: Option<String>, calls: Vec<LlmToolCall>) -> Self {
        Self {
            tool_calls: Some(calls),
            ..Self::new(Role::Assistant, content.unwrap_or_default())
        }
    }

    pub fn tool_result(
        call_id: impl Into<String>,
        tool_name: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            tool_call_id: Some(call_id.into()),
            tool_name: Some(tool_name.into()),
            ..Self::new(Role::Tool, content)
        }
    }

    fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_calls: None,
            tool_call_id: None,
            tool_name: None,
            structured: None,
            timestamp: Utc::now(),
        }
    }

    pub fn has_tool_calls(&self) -> bool {
        self.tool_calls
            .as_ref()
            .map(|calls| !calls.is_empty())
            .unwrap_or(false)
    }

    fn to_wire(&self) -> ChatMessage {
        ChatMessage {
            role: self.role.as_str().to_string(),
            content: if self.content.is_empty() && self.has_tool_calls() {
                None
            } else {
                Some(self.content.clone())
            },
            tool_calls: self.tool_calls.clone(),
            tool_call_id: self.tool_call_id.clone(),
        }
    }
}

/// Append-only message history for one session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Transcript {
    messages: Vec<TurnMessage>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, message: TurnMessage) {
        self.messages.push(message);
    }

    pub fn messages(&self) -> &[TurnMessage] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Project onto the completions wire format, prefixed with a system prompt.
    pub fn to_wire(&self, system_prompt: &str) -> Vec<ChatMessage> {
        let mut wire = Vec::with_capacity(self.messages.len() + 1);
        wire.push(ChatMessage::system(system_prompt));
        wire.extend(self.messages.iter().map(TurnMessage::to_wire));
        wire
    }

    /// Render the last `max_exchanges` user/assistant exchanges as plain text
    /// for embedding in analysis and synthesis prompts.
    pub fn recent_excerpt(&self, max_exchanges: usize) -> String {
        let relevant: Vec<&TurnMessage> = self
            .messages
            .iter()
            .filter(|m| matches!(m.role, Role::User | Role::Assistant) && !m.content.is_empty())
            .collect();

        let take = max_exchanges * 2;
        let start = relevant.len().saturating_sub(take);

        relevant[start..]
            .iter()
            .map(|m| format!("{}: {}", m.role.as_str(), m.content))
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// What checkpoints retain: user messages and finalized assistant
    /// messages. Drafts, tool requests and tool results are turn-transient.
    pub fn cleaned_for_storage(&self) -> Transcript {
        Transcript {
            messages: self
                .messages
                .iter()
                .filter(|m| match m.role {
                    Role::User => true,
                    Role::Assistant => m.structured.is_some(),
                    Role::System | Role::Tool => false,
                })
                .cloned()
                .collect(),
        }
    }
}
