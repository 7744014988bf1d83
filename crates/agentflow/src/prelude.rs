//! Prelude module for convenient imports
//!
//! Import everything you need with:
//! ```rust
//! use agentflow::prelude::*;
//! ```

pub use crate::{
    ChatClient, ChatTurn, Content, Graph, GraphBuilder, GraphConfig, GraphError, Message, Modifier, ModelRegistry,
    ModelSource, Node, OpenAIClient, RegisterOptions, Step, StepChunk, StepOutput, StreamEvent, StubClient, Transform,
    Turn, Upstream,
};

pub use async_trait::async_trait;
pub use futures::StreamExt;
