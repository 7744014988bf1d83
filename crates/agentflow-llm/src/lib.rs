pub mod types;
pub mod traits;
pub mod streaming;
pub mod config;
pub mod openai;
pub mod registry;
pub mod tokenizer;
pub mod stub;

pub use traits::{
    ChatClient,
    ChatRequest, ChatResponse, ChatOptions,
    ModelCapabilities,
    TokenUsage,
};

pub use streaming::{ChatStream, StreamAccumulator, StreamEvent};
pub use config::OpenAIConfig;
pub use openai::OpenAIClient;
pub use registry::{ModelFactory, ModelRegistry, ModelSource, RegisterOptions, RegistryError};
pub use tokenizer::{count_message_tokens, TiktokenTokenizer, Tokenizer};
pub use stub::StubClient;
pub use types::{Message, MessageKind, Content, ContentPart, Tool, ToolCall, ToolChoice};
