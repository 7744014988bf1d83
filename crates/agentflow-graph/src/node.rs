use agentflow_llm::{Message, StreamEvent};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::{GraphError, Result};
use crate::step::Step;

/// Delta sink handed to a node while its step is being streamed
pub type EventSender = mpsc::UnboundedSender<StreamEvent>;

/// Core abstraction for a unit of computation in the graph
#[async_trait]
pub trait Node: Send + Sync {
    /// Discriminator used for output selection and serialization
    fn kind(&self) -> &'static str;

    /// Produce the step's output from its merged input.
    ///
    /// `events` is set when the step is being streamed; nodes that talk to a
    /// backend forward its deltas there as they arrive.
    async fn execute(&self, step: &Step, input: Vec<Message>, events: Option<EventSender>) -> Result<StepOutput>;

    /// Node-specific record data; the default refuses
    fn to_record(&self) -> Result<Value> {
        Err(GraphError::NotSerializable(self.kind().to_string()))
    }
}

/// Cached result of a step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum StepOutput {
    Message(Message),
    Messages(Vec<Message>),
}

impl StepOutput {
    pub fn messages(&self) -> &[Message] {
        match self {
            Self::Message(message) => std::slice::from_ref(message),
            Self::Messages(messages) => messages,
        }
    }

    pub fn into_messages(self) -> Vec<Message> {
        match self {
            Self::Message(message) => vec![message],
            Self::Messages(messages) => messages,
        }
    }

    /// Last message of the output
    pub fn message(&self) -> Option<&Message> {
        self.messages().last()
    }

    pub fn text(&self) -> Option<&str> {
        self.message().and_then(Message::text)
    }
}

impl From<Message> for StepOutput {
    fn from(message: Message) -> Self {
        Self::Message(message)
    }
}

impl From<Vec<Message>> for StepOutput {
    fn from(messages: Vec<Message>) -> Self {
        Self::Messages(messages)
    }
}
