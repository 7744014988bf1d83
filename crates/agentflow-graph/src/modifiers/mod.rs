pub mod code_extractor;
pub mod followup;
pub mod leaf_output;
pub mod retrieval;

pub use code_extractor::{extract_code_blocks, CodeBlock, CodeExtractor};
pub use followup::Followup;
pub use leaf_output::LeafOutput;
pub use retrieval::{KeywordRetriever, RetrievalInjector, Retriever};
