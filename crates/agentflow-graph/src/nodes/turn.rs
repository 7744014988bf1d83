use agentflow_llm::{Content, Message, MessageKind};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;
use crate::node::{EventSender, Node, StepOutput};
use crate::step::Step;

/// Fixed conversation turn.
///
/// Emits its message unchanged; parent outputs only order it within the
/// graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Turn {
    message: Message,
}

impl Turn {
    pub const HUMAN: &'static str = "human";
    pub const SYSTEM: &'static str = "system";
    pub const ASSISTANT: &'static str = "assistant";
    pub const TOOL_RESULT: &'static str = "tool_result";

    pub fn new(message: Message) -> Self {
        Self { message }
    }

    pub fn human(content: impl Into<Content>) -> Self {
        Self::new(Message::human(content))
    }

    pub fn system(content: impl Into<Content>) -> Self {
        Self::new(Message::system(content))
    }

    pub fn assistant(content: impl Into<Content>) -> Self {
        Self::new(Message::assistant(content))
    }

    pub fn tool_result(call_id: impl Into<String>, content: impl Into<Content>) -> Self {
        Self::new(Message::tool_result(call_id, content))
    }

    pub fn message(&self) -> &Message {
        &self.message
    }
}

#[async_trait]
impl Node for Turn {
    fn kind(&self) -> &'static str {
        match self.message.kind() {
            MessageKind::Human => Self::HUMAN,
            MessageKind::System => Self::SYSTEM,
            MessageKind::Assistant => Self::ASSISTANT,
            MessageKind::ToolResult => Self::TOOL_RESULT,
        }
    }

    async fn execute(&self, _step: &Step, _input: Vec<Message>, _events: Option<EventSender>) -> Result<StepOutput> {
        Ok(StepOutput::Message(self.message.clone()))
    }

    fn to_record(&self) -> Result<Value> {
        Ok(serde_json::to_value(&self.message)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_follows_message() {
        assert_eq!(Turn::human("hi").kind(), "human");
        assert_eq!(Turn::system("s").kind(), "system");
        assert_eq!(Turn::assistant("a").kind(), "assistant");
        assert_eq!(Turn::tool_result("c", "r").kind(), "tool_result");
    }

    #[test]
    fn test_record_is_the_message() {
        let record = Turn::tool_result("call_1", "42").to_record().unwrap();
        assert_eq!(record["type"], "tool_result");
        assert_eq!(record["call_id"], "call_1");

        let restored: Turn = serde_json::from_value(record).unwrap();
        assert_eq!(restored.message(), &Message::tool_result("call_1", "42"));
    }
}
