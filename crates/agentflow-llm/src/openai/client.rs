// OpenAI-compatible Chat Completions client

use crate::config::OpenAIConfig;
use crate::streaming::{parse_chat_sse, ChatStream};
use crate::traits::{ChatClient, ChatOptions, ChatRequest, ChatResponse, ModelCapabilities, TokenUsage};
use crate::types::{Content, ContentPart, Message, ToolCall};
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::Deserialize;
use serde_json::{json, Map, Value};

/// OpenAI client (HTTP direct, no SDK)
pub struct OpenAIClient {
    http_client: reqwest::Client,
    config: OpenAIConfig,
}

impl OpenAIClient {
    pub fn new(config: OpenAIConfig) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", config.api_key))
                .context("Invalid API key format")?,
        );

        let http_client = reqwest::Client::builder()
            .default_headers(headers)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self { http_client, config })
    }

    fn build_payload(&self, request: ChatRequest, stream: bool) -> Result<Value> {
        let model = request.model.unwrap_or_else(|| self.config.model.clone());
        let messages: Vec<Value> = request.messages.iter().map(convert_message).collect();

        let mut payload = Map::new();
        payload.insert("model".to_string(), json!(model));
        payload.insert("messages".to_string(), json!(messages));
        payload.insert("stream".to_string(), json!(stream));
        apply_options(&mut payload, &request.options, self.config.tool_calling)?;

        Ok(Value::Object(payload))
    }

    async fn post(&self, payload: &Value) -> Result<reqwest::Response> {
        let response = self
            .http_client
            .post(format!("{}/chat/completions", self.config.base_url()))
            .json(payload)
            .send()
            .await
            .context("Failed to send request")?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            anyhow::bail!("OpenAI API error ({}): {}", status, error_text);
        }

        Ok(response)
    }
}

fn apply_options(payload: &mut Map<String, Value>, options: &ChatOptions, tool_calling: bool) -> Result<()> {
    if let Some(temp) = options.temperature {
        payload.insert("temperature".to_string(), json!(temp));
    }
    if let Some(max_tokens) = options.max_tokens {
        payload.insert("max_tokens".to_string(), json!(max_tokens));
    }
    if tool_calling {
        if let Some(tools) = &options.tools {
            payload.insert("tools".to_string(), serde_json::to_value(tools)?);
        }
        if let Some(choice) = &options.tool_choice {
            payload.insert("tool_choice".to_string(), serde_json::to_value(choice)?);
        }
    }
    Ok(())
}

/// Convert a message to the Chat Completions wire shape
fn convert_message(message: &Message) -> Value {
    let mut obj = Map::new();
    obj.insert("role".to_string(), json!(message.role()));

    match message {
        Message::System { content, name } | Message::Human { content, name } => {
            obj.insert("content".to_string(), convert_content(content));
            if let Some(name) = name {
                obj.insert("name".to_string(), json!(name));
            }
        }
        Message::Assistant { content, tool_calls, name } => {
            obj.insert(
                "content".to_string(),
                content.as_ref().map(convert_content).unwrap_or(Value::Null),
            );
            if !tool_calls.is_empty() {
                obj.insert("tool_calls".to_string(), json!(tool_calls));
            }
            if let Some(name) = name {
                obj.insert("name".to_string(), json!(name));
            }
        }
        Message::ToolResult { call_id, content } => {
            obj.insert("tool_call_id".to_string(), json!(call_id));
            obj.insert("content".to_string(), convert_content(content));
        }
    }

    Value::Object(obj)
}

fn convert_content(content: &Content) -> Value {
    match content {
        Content::Text(s) => json!(s),
        Content::Parts(parts) => Value::Array(
            parts
                .iter()
                .map(|part| match part {
                    ContentPart::Text { text } => json!({ "type": "text", "text": text }),
                    ContentPart::ImageUrl { image_url } => {
                        json!({ "type": "image_url", "image_url": { "url": image_url.url } })
                    }
                })
                .collect(),
        ),
    }
}

#[async_trait]
impl ChatClient for OpenAIClient {
    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse> {
        let payload = self.build_payload(request, false)?;
        tracing::debug!(model = %self.config.model, "sending chat completion");

        let raw: OpenAIChatResponse = self
            .post(&payload)
            .await?
            .json()
            .await
            .context("Failed to parse response")?;

        let choice = raw.choices.into_iter().next();
        let (content, tool_calls, finish_reason) = match choice {
            Some(c) => (c.message.content, c.message.tool_calls.unwrap_or_default(), c.finish_reason),
            None => (None, Vec::new(), None),
        };

        Ok(ChatResponse {
            content,
            tool_calls,
            usage: raw.usage.map(|u| TokenUsage {
                input_tokens: u.prompt_tokens,
                output_tokens: u.completion_tokens,
                total_tokens: u.total_tokens,
            }),
            finish_reason,
        })
    }

    async fn chat_stream(&self, request: ChatRequest) -> Result<ChatStream> {
        let payload = self.build_payload(request, true)?;
        tracing::debug!(model = %self.config.model, "opening chat completion stream");

        let response = self.post(&payload).await?;
        Ok(parse_chat_sse(response.bytes_stream()))
    }

    fn capabilities(&self) -> ModelCapabilities {
        ModelCapabilities::default()
            .with_streaming(true)
            .with_tool_calling(self.config.tool_calling)
    }
}

#[derive(Debug, Deserialize)]
struct OpenAIChatResponse {
    choices: Vec<Choice>,
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
    tool_calls: Option<Vec<ToolCall>>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    prompt_tokens: u32,
    completion_tokens: u32,
    total_tokens: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ToolChoice;

    fn client(tool_calling: bool) -> OpenAIClient {
        OpenAIClient::new(OpenAIConfig::new("sk-test", "gpt-4o-mini").with_tool_calling(tool_calling))
            .unwrap()
    }

    #[test]
    fn test_tool_result_uses_wire_field_names() {
        let value = convert_message(&Message::tool_result("call_9", "done"));
        assert_eq!(value["role"], "tool");
        assert_eq!(value["tool_call_id"], "call_9");
        assert_eq!(value["content"], "done");
    }

    #[test]
    fn test_payload_defaults_to_configured_model() {
        let payload = client(true)
            .build_payload(ChatRequest::new(vec![Message::human("hi")]), true)
            .unwrap();
        assert_eq!(payload["model"], "gpt-4o-mini");
        assert_eq!(payload["stream"], true);
        assert_eq!(payload["messages"][0]["role"], "user");
    }

    #[test]
    fn test_tools_are_withheld_without_tool_calling() {
        let options = ChatOptions::new()
            .tools(vec![crate::types::Tool::new("f", "d", json!({"type": "object"}))])
            .tool_choice(ToolChoice::Auto);
        let request = ChatRequest::new(vec![Message::human("hi")]).with_options(options);

        let payload = client(false).build_payload(request.clone(), false).unwrap();
        assert!(payload.get("tools").is_none());

        let payload = client(true).build_payload(request, false).unwrap();
        assert_eq!(payload["tool_choice"], "auto");
    }
}
