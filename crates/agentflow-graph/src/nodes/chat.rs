use std::sync::Arc;

use agentflow_llm::{
    ChatClient, ChatOptions, ChatRequest, ChatResponse, Content, Message, ModelCapabilities, StreamAccumulator, Tool,
    ToolChoice,
};
use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::channel::{parse_channel_metadata, ChannelTags};
use crate::error::{GraphError, Result};
use crate::modifiers::retrieval::RETRIEVED_CONTEXT_KEY;
use crate::node::{EventSender, Node, StepOutput};
use crate::policy::{combine_inputs_with, reorder_and_filter_tool_messages, sanitize_for_model};
use crate::step::Step;
use crate::types::ChatSettings;

/// Step metadata key holding parsed side channels
pub const CHANNEL_KEY: &str = "channel";
/// Step metadata key holding streamed reasoning text
pub const REASONING_KEY: &str = "reasoning";
pub const USAGE_KEY: &str = "usage";

/// Assistant turn produced by a chat backend.
///
/// The backend is either set explicitly or resolved from the graph's model
/// registry by the step's model name (registry default when unset).
pub struct ChatTurn {
    client: Option<Arc<dyn ChatClient>>,
    settings: ChatSettings,
    tools: Vec<Tool>,
    tags: ChannelTags,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ChatTurnRecord {
    #[serde(default)]
    settings: ChatSettings,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    tools: Vec<Tool>,
    #[serde(default)]
    tags: ChannelTags,
}

impl ChatTurn {
    pub const KIND: &'static str = "chat";

    pub fn new() -> Self {
        Self {
            client: None,
            settings: ChatSettings::default(),
            tools: Vec::new(),
            tags: ChannelTags::default(),
        }
    }

    pub fn with_client(mut self, client: Arc<dyn ChatClient>) -> Self {
        self.client = Some(client);
        self
    }

    pub fn with_settings(mut self, settings: ChatSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_tools(mut self, tools: Vec<Tool>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_tags(mut self, tags: ChannelTags) -> Self {
        self.tags = tags;
        self
    }

    pub(crate) fn from_record(data: Value) -> Result<Self> {
        let record: ChatTurnRecord = if data.is_null() {
            ChatTurnRecord::default()
        } else {
            serde_json::from_value(data)?
        };
        Ok(Self::new()
            .with_settings(record.settings)
            .with_tools(record.tools)
            .with_tags(record.tags))
    }

    fn resolve_client(&self, step: &Step) -> Result<Arc<dyn ChatClient>> {
        if let Some(client) = &self.client {
            return Ok(Arc::clone(client));
        }
        let registry = step
            .graph()?
            .registry()
            .ok_or_else(|| GraphError::NoBackend(step.id().to_string()))?;
        Ok(registry.get_model(step.model().as_deref())?)
    }

    /// Retrieval prefix, merge, orphan filtering, capability sanitization
    fn prepare_messages(&self, step: &Step, input: Vec<Message>, caps: ModelCapabilities) -> Result<Vec<Message>> {
        let separator = step.graph()?.config().join_separator.clone();

        let mut messages = Vec::with_capacity(input.len() + 1);
        if let Some(context) = step.find_metadata(RETRIEVED_CONTEXT_KEY).and_then(context_text) {
            messages.push(Message::system(context));
        }
        messages.extend(input);

        let messages = combine_inputs_with(messages, &separator);
        let messages = reorder_and_filter_tool_messages(messages);
        Ok(sanitize_for_model(messages, caps.tool_calling))
    }

    fn options(&self, caps: ModelCapabilities) -> ChatOptions {
        let mut options = ChatOptions::new();
        if let Some(temp) = self.settings.temperature {
            options = options.temperature(temp);
        }
        if let Some(max_tokens) = self.settings.max_tokens {
            options = options.max_tokens(max_tokens);
        }
        if caps.tool_calling && !self.tools.is_empty() {
            options = options.tools(self.tools.clone()).tool_choice(ToolChoice::Auto);
        }
        options
    }

    async fn stream_response(
        &self,
        client: &dyn ChatClient,
        request: ChatRequest,
        events: EventSender,
        step: &Step,
    ) -> Result<ChatResponse> {
        let mut stream = client.chat_stream(request).await?;
        let mut acc = StreamAccumulator::new();

        while let Some(event) = stream.next().await {
            let event = event?;
            acc.push(&event);
            // a gone receiver only means nobody is watching
            let _ = events.send(event);
        }

        if !acc.reasoning().is_empty() {
            step.set_metadata(REASONING_KEY, acc.reasoning());
        }
        Ok(acc.finish())
    }

    /// Split side channels out of the reply and record them on the step
    fn save_response(&self, step: &Step, response: ChatResponse) -> Result<Message> {
        if let Some(usage) = &response.usage {
            step.set_metadata(USAGE_KEY, serde_json::to_value(usage)?);
        }

        let content = response.content.map(|text| {
            let parsed = parse_channel_metadata(&text, &self.tags);
            if parsed.is_tagged() {
                step.set_metadata(CHANNEL_KEY, serde_json::json!(parsed.channels));
                parsed.content
            } else {
                text
            }
        });

        Ok(Message::Assistant {
            content: content.map(Content::Text),
            tool_calls: response.tool_calls,
            name: None,
        })
    }
}

impl Default for ChatTurn {
    fn default() -> Self {
        Self::new()
    }
}

fn context_text(value: Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(text) if text.is_empty() => None,
        Value::String(text) => Some(text),
        Value::Array(items) => {
            let docs: Vec<String> = items
                .into_iter()
                .filter_map(|item| match item {
                    Value::String(text) => Some(text),
                    Value::Null => None,
                    other => Some(other.to_string()),
                })
                .collect();
            (!docs.is_empty()).then(|| docs.join("\n\n"))
        }
        other => Some(other.to_string()),
    }
}

#[async_trait]
impl Node for ChatTurn {
    fn kind(&self) -> &'static str {
        Self::KIND
    }

    async fn execute(&self, step: &Step, input: Vec<Message>, events: Option<EventSender>) -> Result<StepOutput> {
        // Step 1: Resolve backend
        let client = self.resolve_client(step)?;
        let caps = client.capabilities();

        // Step 2: Shape the conversation for this backend
        let messages = self.prepare_messages(step, input, caps)?;
        let request = ChatRequest::new(messages).with_options(self.options(caps));

        tracing::debug!(
            step_id = %step.id(),
            model = ?step.model(),
            messages = request.messages.len(),
            streaming = events.is_some(),
            "calling chat backend"
        );

        // Step 3: Call it, forwarding deltas when streamed
        let response = match events {
            Some(events) => self.stream_response(client.as_ref(), request, events, step).await?,
            None => client.chat(request).await?,
        };

        // Step 4: Save channels and return the assistant turn
        Ok(StepOutput::Message(self.save_response(step, response)?))
    }

    fn to_record(&self) -> Result<Value> {
        let record = ChatTurnRecord {
            settings: self.settings.clone(),
            tools: self.tools.clone(),
            tags: self.tags.clone(),
        };
        Ok(serde_json::to_value(record)?)
    }
}
