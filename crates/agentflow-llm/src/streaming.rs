use std::collections::{BTreeMap, VecDeque};
use std::fmt::Display;
use std::pin::Pin;

use anyhow::Result;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};

use crate::traits::ChatResponse;
use crate::types::ToolCall;

pub type ChatStream = Pin<Box<dyn Stream<Item = Result<StreamEvent>> + Send>>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    Reasoning {
        content: String,
    },

    Message {
        content: String,
    },

    ToolCall {
        index: u32,
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        arguments: Option<String>,
    },

    Done {
        #[serde(skip_serializing_if = "Option::is_none")]
        finish_reason: Option<String>,
    },
}

/// Folds streamed deltas back into a complete response.
///
/// Tool call fragments are keyed by their stream index; fragments that never
/// received both an id and a name are discarded.
#[derive(Debug, Default)]
pub struct StreamAccumulator {
    reasoning: String,
    message: String,
    tool_calls: BTreeMap<u32, (Option<String>, Option<String>, String)>,
    finish_reason: Option<String>,
}

impl StreamAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, event: &StreamEvent) {
        match event {
            StreamEvent::Reasoning { content } => self.reasoning.push_str(content),
            StreamEvent::Message { content } => self.message.push_str(content),
            StreamEvent::ToolCall { index, id, name, arguments } => {
                let entry = self
                    .tool_calls
                    .entry(*index)
                    .or_insert((None, None, String::new()));
                if let Some(id) = id {
                    entry.0 = Some(id.clone());
                }
                if let Some(name) = name {
                    entry.1 = Some(name.clone());
                }
                if let Some(args) = arguments {
                    entry.2.push_str(args);
                }
            }
            StreamEvent::Done { finish_reason } => {
                self.finish_reason = finish_reason.clone();
            }
        }
    }

    pub fn reasoning(&self) -> &str {
        &self.reasoning
    }

    pub fn finish(self) -> ChatResponse {
        let tool_calls = self
            .tool_calls
            .into_values()
            .filter_map(|(id, name, arguments)| Some(ToolCall::new(id?, name?, arguments)))
            .collect();

        ChatResponse {
            content: (!self.message.is_empty()).then_some(self.message),
            tool_calls,
            usage: None,
            finish_reason: self.finish_reason,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatStreamChunk {
    pub choices: Vec<StreamChoice>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamChoice {
    pub index: u32,
    pub delta: Delta,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Delta {
    pub content: Option<String>,
    #[serde(default)]
    pub reasoning_content: Option<String>,
    pub tool_calls: Option<Vec<ToolCallDelta>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallDelta {
    pub index: u32,
    pub id: Option<String>,
    pub function: Option<FunctionDelta>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionDelta {
    pub name: Option<String>,
    pub arguments: Option<String>,
}

impl ChatStreamChunk {
    fn to_stream_events(&self) -> Vec<StreamEvent> {
        let mut events = Vec::new();

        if let Some(choice) = self.choices.first() {
            if let Some(reasoning) = &choice.delta.reasoning_content {
                if !reasoning.is_empty() {
                    events.push(StreamEvent::Reasoning {
                        content: reasoning.clone(),
                    });
                }
            }

            if let Some(content) = &choice.delta.content {
                if !content.is_empty() {
                    events.push(StreamEvent::Message {
                        content: content.clone(),
                    });
                }
            }

            if let Some(tool_calls) = &choice.delta.tool_calls {
                for tc in tool_calls {
                    events.push(StreamEvent::ToolCall {
                        index: tc.index,
                        id: tc.id.clone(),
                        name: tc.function.as_ref().and_then(|f| f.name.clone()),
                        arguments: tc.function.as_ref().and_then(|f| f.arguments.clone()),
                    });
                }
            }

            if let Some(finish_reason) = &choice.finish_reason {
                events.push(StreamEvent::Done {
                    finish_reason: Some(finish_reason.clone()),
                });
            }
        }

        events
    }
}

/// Parse an OpenAI-style server-sent-event byte stream into [`StreamEvent`]s.
///
/// Lines are buffered across chunk boundaries; `data: [DONE]` terminates the
/// stream. Undecodable lines and payloads are reported as errors in place.
pub fn parse_chat_sse<S, B, E>(bytes: S) -> ChatStream
where
    S: Stream<Item = std::result::Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Display + Send + 'static,
{
    Box::pin(async_stream::stream! {
        let mut byte_chunks = Box::pin(bytes);
        let mut buffer: VecDeque<u8> = VecDeque::with_capacity(8192);

        'chunks: while let Some(chunk_result) = byte_chunks.next().await {
            match chunk_result {
                Ok(chunk) => {
                    buffer.extend(chunk.as_ref().iter().copied());

                    while let Some(newline_pos) = buffer.iter().position(|&b| b == b'\n') {
                        let line_bytes: Vec<u8> = buffer.drain(..=newline_pos).collect();

                        let line_str = match std::str::from_utf8(&line_bytes) {
                            Ok(line_str) => line_str,
                            Err(e) => {
                                yield Err(anyhow::anyhow!("Invalid UTF-8 in chat stream: {}", e));
                                continue;
                            }
                        };
                        let line = line_str.trim();
                        if line.is_empty() {
                            continue;
                        }

                        if let Some(data) = line.strip_prefix("data:").map(str::trim_start) {
                            if data == "[DONE]" {
                                yield Ok(StreamEvent::Done { finish_reason: None });
                                break 'chunks;
                            }

                            match serde_json::from_str::<ChatStreamChunk>(data) {
                                Ok(parsed) => {
                                    for event in parsed.to_stream_events() {
                                        yield Ok(event);
                                    }
                                }
                                Err(e) => yield Err(anyhow::anyhow!("Failed to parse chat chunk: {}", e)),
                            }
                        }
                    }
                }
                Err(e) => yield Err(anyhow::anyhow!("Stream error: {}", e)),
            }
        }
    })
}
