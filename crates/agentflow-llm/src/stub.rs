//! Scripted chat backend.
//!
//! Used by tests and by pipelines that need a deterministic stand-in for a
//! real provider. Replies are served in order; the last one repeats.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;

use crate::streaming::{ChatStream, StreamEvent};
use crate::traits::{ChatClient, ChatRequest, ChatResponse, ModelCapabilities};
use crate::types::Message;

pub struct StubClient {
    replies: Vec<ChatResponse>,
    calls: AtomicUsize,
    failures: AtomicUsize,
    delay: Option<Duration>,
    capabilities: ModelCapabilities,
    requests: Mutex<Vec<Vec<Message>>>,
}

impl StubClient {
    pub fn new(reply: impl Into<String>) -> Self {
        Self::with_responses(vec![ChatResponse::text(reply)])
    }

    pub fn with_responses(replies: Vec<ChatResponse>) -> Self {
        Self {
            replies,
            calls: AtomicUsize::new(0),
            failures: AtomicUsize::new(0),
            delay: None,
            capabilities: ModelCapabilities::default(),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Sleep before answering (and between streamed chunks)
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Fail the first `n` calls with a backend error
    pub fn failing(self, n: usize) -> Self {
        self.failures.store(n, Ordering::SeqCst);
        self
    }

    pub fn with_capabilities(mut self, capabilities: ModelCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Number of backend calls received, failed ones included
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Conversations sent to the backend, in call order
    pub fn requests(&self) -> Vec<Vec<Message>> {
        self.requests.lock().clone()
    }

    async fn respond(&self, request: ChatRequest) -> Result<ChatResponse> {
        let index = self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().push(request.messages);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let failed = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            anyhow::bail!("stub backend failure on call {}", index + 1);
        }

        let reply = self
            .replies
            .get(index)
            .or_else(|| self.replies.last())
            .cloned()
            .unwrap_or_default();
        Ok(reply)
    }
}

#[async_trait]
impl ChatClient for StubClient {
    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse> {
        self.respond(request).await
    }

    async fn chat_stream(&self, request: ChatRequest) -> Result<ChatStream> {
        let response = self.respond(request).await?;
        let delay = self.delay;

        Ok(Box::pin(async_stream::stream! {
            if let Some(content) = response.content {
                for piece in content.split_inclusive(' ') {
                    if let Some(delay) = delay {
                        tokio::time::sleep(delay).await;
                    }
                    yield Ok::<_, anyhow::Error>(StreamEvent::Message { content: piece.to_string() });
                }
            }
            for (index, call) in response.tool_calls.into_iter().enumerate() {
                yield Ok(StreamEvent::ToolCall {
                    index: index as u32,
                    id: Some(call.id),
                    name: Some(call.function.name),
                    arguments: Some(call.function.arguments),
                });
            }
            yield Ok(StreamEvent::Done { finish_reason: response.finish_reason });
        }))
    }

    fn capabilities(&self) -> ModelCapabilities {
        self.capabilities
    }
}
