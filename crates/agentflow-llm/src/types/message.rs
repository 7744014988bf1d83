use serde::{Deserialize, Serialize};
use super::content::Content;
use super::tool::ToolCall;

/// Conversation turn passed between steps and backends.
///
/// Serialized with a `type` discriminator (`human`, `assistant`, `system`,
/// `tool_result`); tool results carry the `call_id` of the assistant tool call
/// they answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    /// User/Human message
    Human {
        content: Content,

        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },

    /// Assistant message, possibly carrying tool calls
    Assistant {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        content: Option<Content>,

        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        tool_calls: Vec<ToolCall>,

        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },

    /// System prompt (instructions)
    System {
        content: Content,

        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },

    /// Result of a tool invocation
    ToolResult {
        call_id: String,
        content: Content,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Human,
    Assistant,
    System,
    ToolResult,
}

impl Message {
    /// Create system message
    pub fn system(content: impl Into<Content>) -> Self {
        Self::System {
            content: content.into(),
            name: None,
        }
    }

    /// Create human message
    pub fn human(content: impl Into<Content>) -> Self {
        Self::Human {
            content: content.into(),
            name: None,
        }
    }

    /// Create assistant message with text
    pub fn assistant(content: impl Into<Content>) -> Self {
        Self::Assistant {
            content: Some(content.into()),
            tool_calls: Vec::new(),
            name: None,
        }
    }

    /// Create assistant message that only carries tool calls
    pub fn assistant_with_tools(tool_calls: Vec<ToolCall>) -> Self {
        Self::Assistant {
            content: None,
            tool_calls,
            name: None,
        }
    }

    /// Create tool result message
    pub fn tool_result(call_id: impl Into<String>, content: impl Into<Content>) -> Self {
        Self::ToolResult {
            call_id: call_id.into(),
            content: content.into(),
        }
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Human { .. } => MessageKind::Human,
            Self::Assistant { .. } => MessageKind::Assistant,
            Self::System { .. } => MessageKind::System,
            Self::ToolResult { .. } => MessageKind::ToolResult,
        }
    }

    /// Wire role used by OpenAI-compatible backends
    pub fn role(&self) -> &str {
        match self {
            Self::System { .. } => "system",
            Self::Human { .. } => "user",
            Self::Assistant { .. } => "assistant",
            Self::ToolResult { .. } => "tool",
        }
    }

    pub fn content(&self) -> Option<&Content> {
        match self {
            Self::Human { content, .. }
            | Self::System { content, .. }
            | Self::ToolResult { content, .. } => Some(content),
            Self::Assistant { content, .. } => content.as_ref(),
        }
    }

    /// Text content, if the message has any plain text
    pub fn text(&self) -> Option<&str> {
        self.content().and_then(Content::as_text)
    }

    pub fn tool_calls(&self) -> &[ToolCall] {
        match self {
            Self::Assistant { tool_calls, .. } => tool_calls,
            _ => &[],
        }
    }

    pub fn is_system(&self) -> bool {
        matches!(self, Self::System { .. })
    }
}
