use agentflow_llm::Message;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::graph::Graph;
use crate::modifier::Modifier;
use crate::step::Step;

pub const CODE_BLOCKS_KEY: &str = "code_blocks";
pub const CODE_KEY: &str = "code";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeBlock {
    pub language: Option<String>,
    pub content: String,
}

/// Fenced code blocks in order of appearance.
///
/// An unterminated trailing fence still yields its content.
pub fn extract_code_blocks(text: &str) -> Vec<CodeBlock> {
    let mut blocks = Vec::new();
    let mut in_block = false;
    let mut current = String::new();
    let mut current_lang: Option<String> = None;

    for raw_line in text.lines() {
        let line = raw_line.trim_end_matches('\r');
        if line.trim_start().starts_with("```") {
            if in_block {
                if current.ends_with('\n') {
                    current.pop();
                }
                if !current.is_empty() {
                    blocks.push(CodeBlock {
                        language: current_lang.take(),
                        content: std::mem::take(&mut current),
                    });
                }
                current_lang = None;
                in_block = false;
            } else {
                in_block = true;
                let lang = line.trim_start().trim_start_matches("```").trim();
                current_lang = (!lang.is_empty()).then(|| lang.to_string());
            }
            continue;
        }

        if in_block {
            current.push_str(line);
            current.push('\n');
        }
    }

    if in_block && !current.is_empty() {
        if current.ends_with('\n') {
            current.pop();
        }
        blocks.push(CodeBlock {
            language: current_lang,
            content: current,
        });
    }

    blocks
}

/// Copies code blocks out of assistant replies.
///
/// Each matching step gets its blocks under `code_blocks`; the graph keeps the
/// latest block under `code`.
#[derive(Debug, Clone, Default)]
pub struct CodeExtractor {
    language: Option<String>,
}

impl CodeExtractor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep only blocks fenced with this language tag
    pub fn language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }
}

#[async_trait]
impl Modifier for CodeExtractor {
    fn name(&self) -> &str {
        "code_extractor"
    }

    async fn on_after_step(&self, graph: &Graph, step: &Step) -> Result<()> {
        let Some(output) = step.output() else {
            return Ok(());
        };
        let text = match output.message() {
            Some(Message::Assistant { .. }) => output.text(),
            _ => None,
        };
        let Some(text) = text else {
            return Ok(());
        };

        let blocks: Vec<CodeBlock> = extract_code_blocks(text)
            .into_iter()
            .filter(|b| match &self.language {
                Some(lang) => b.language.as_deref() == Some(lang.as_str()),
                None => true,
            })
            .collect();

        let Some(last) = blocks.last() else {
            return Ok(());
        };

        tracing::debug!(step_id = %step.id(), blocks = blocks.len(), "code blocks extracted");
        graph.set_metadata(CODE_KEY, last.content.clone());
        step.set_metadata(CODE_BLOCKS_KEY, serde_json::to_value(&blocks)?);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extracts_fenced_blocks_with_languages() {
        let text = "Here:\n```python\nprint('hi')\n```\nand\n```\nplain\n```";
        let blocks = extract_code_blocks(text);
        assert_eq!(
            blocks,
            vec![
                CodeBlock {
                    language: Some("python".to_string()),
                    content: "print('hi')".to_string(),
                },
                CodeBlock {
                    language: None,
                    content: "plain".to_string(),
                },
            ]
        );
    }

    #[test]
    fn test_unterminated_fence_is_kept() {
        let blocks = extract_code_blocks("```rust\nfn main() {}\n");
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].content, "fn main() {}");
    }

    #[test]
    fn test_no_fences_no_blocks() {
        assert!(extract_code_blocks("just prose").is_empty());
    }
}
