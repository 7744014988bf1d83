//! Task-scoped step graphs.
//!
//! A [`Graph`] is entered as a scope; steps built inside it attach to the
//! innermost active graph of the current task. Steps are memoized: each runs
//! at most once, after its parents, and later invocations return the cached
//! output.

pub mod builder;
pub mod channel;
pub mod context;
pub mod error;
pub mod graph;
pub mod kinds;
pub mod modifier;
pub mod modifiers;
pub mod node;
pub mod nodes;
pub mod policy;
pub mod step;
pub mod types;

pub use builder::GraphBuilder;
pub use channel::{parse_channel_metadata, parse_content_channels, ChannelParse, ChannelTags, THINK_CHANNEL};
pub use context::{ContextStack, ScopedStream};
pub use error::{EdgeRejection, GraphError, Result};
pub use graph::{Graph, GraphGuard};
pub use kinds::{NodeConstructor, StepKindRegistry};
pub use modifier::Modifier;
pub use modifiers::code_extractor::{CODE_BLOCKS_KEY, CODE_KEY};
pub use modifiers::retrieval::{QUERY_KEY, RETRIEVED_CONTEXT_KEY};
pub use modifiers::{
    extract_code_blocks, CodeBlock, CodeExtractor, Followup, KeywordRetriever, LeafOutput, RetrievalInjector,
    Retriever,
};
pub use node::{EventSender, Node, StepOutput};
pub use nodes::chat::{CHANNEL_KEY, REASONING_KEY, USAGE_KEY};
pub use nodes::{ChatTurn, Transform, Turn};
pub use policy::{combine_inputs, combine_inputs_with, reorder_and_filter_tool_messages, sanitize_for_model};
pub use step::{Step, StepChunk, StepRecord, Upstream};
pub use types::{ChatSettings, GraphConfig, GraphEvent, GraphStatus, DEFAULT_OUTPUT_KIND};
