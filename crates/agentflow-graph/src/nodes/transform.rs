use agentflow_llm::Message;
use async_trait::async_trait;

use crate::error::Result;
use crate::node::{EventSender, Node, StepOutput};
use crate::step::Step;

type TransformFn = dyn Fn(Vec<Message>) -> anyhow::Result<StepOutput> + Send + Sync;

/// Pure function over the merged parent output. Not serializable.
pub struct Transform {
    func: Box<TransformFn>,
}

impl Transform {
    pub const KIND: &'static str = "transform";

    pub fn new<F>(func: F) -> Self
    where
        F: Fn(Vec<Message>) -> anyhow::Result<StepOutput> + Send + Sync + 'static,
    {
        Self { func: Box::new(func) }
    }

    /// Infallible message-list rewrite
    pub fn map<F>(func: F) -> Self
    where
        F: Fn(Vec<Message>) -> Vec<Message> + Send + Sync + 'static,
    {
        Self::new(move |input| Ok(StepOutput::Messages(func(input))))
    }
}

#[async_trait]
impl Node for Transform {
    fn kind(&self) -> &'static str {
        Self::KIND
    }

    async fn execute(&self, _step: &Step, input: Vec<Message>, _events: Option<EventSender>) -> Result<StepOutput> {
        Ok((self.func)(input)?)
    }
}
