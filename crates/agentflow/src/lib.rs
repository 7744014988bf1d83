//! # Agentflow
//!
//! Composable step graphs for LLM pipelines.
//!
//! ## Overview
//!
//! - **Graphs** are entered as task-scoped regions; steps built inside attach
//!   to the innermost active graph
//! - **Steps** run at most once, after their parents, and cache their output
//! - **Modifiers** hook graph lifecycle to add context, graft steps or pick
//!   the output
//! - **Registry** maps model names to chat backends, shared by reference count
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use agentflow::prelude::*;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let registry = Arc::new(ModelRegistry::new());
//!     registry.register(
//!         "stub",
//!         ModelSource::instance(StubClient::new("OK")),
//!         RegisterOptions::new(),
//!     );
//!
//!     let graph = Graph::builder().registry(registry).build();
//!     graph.sync_scope(|| -> agentflow::graph::Result<()> {
//!         let system = Step::build(Turn::system("be terse"))?;
//!         let human = Step::build(Turn::human("hi"))?;
//!         [system, human].then(&Step::build(ChatTurn::new())?)?;
//!         Ok(())
//!     })?;
//!
//!     let output = graph.invoke().await?;
//!     println!("{:?}", output.and_then(|o| o.text().map(str::to_string)));
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - **`agentflow-llm`**: message model, chat clients, model registry
//! - **`agentflow-graph`**: context stack, steps, graphs, modifiers
//!
//! ## License
//!
//! MIT

pub mod prelude;

pub use agentflow_graph as graph;
pub use agentflow_llm as llm;

pub use agentflow_graph::{
    ChannelTags, ChatSettings, ChatTurn, CodeExtractor, Followup, Graph, GraphBuilder, GraphConfig, GraphError,
    GraphEvent, GraphGuard, GraphStatus, KeywordRetriever, LeafOutput, Modifier, Node, RetrievalInjector, Retriever,
    Step, StepChunk, StepKindRegistry, StepOutput, StepRecord, Transform, Turn, Upstream,
};

pub use agentflow_llm::{
    ChatClient, ChatOptions, ChatRequest, ChatResponse, Content, Message, ModelCapabilities, ModelRegistry,
    ModelSource, OpenAIClient, OpenAIConfig, RegisterOptions, RegistryError, StreamEvent, StubClient, Tool, ToolCall,
    ToolChoice,
};
