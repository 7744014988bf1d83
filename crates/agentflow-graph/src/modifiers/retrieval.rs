use std::collections::HashSet;
use std::sync::Arc;

use agentflow_llm::Message;
use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;
use crate::graph::Graph;
use crate::modifier::Modifier;
use crate::nodes::Turn;
use crate::step::Step;

/// Graph metadata key chat steps read their retrieval context from
pub const RETRIEVED_CONTEXT_KEY: &str = "retrieved_context";
/// Graph metadata key that overrides the retrieval query
pub const QUERY_KEY: &str = "query";

/// Source of documents relevant to a query
#[async_trait]
pub trait Retriever: Send + Sync {
    async fn retrieve(&self, query: &str, limit: usize) -> anyhow::Result<Vec<String>>;
}

/// Looks up context before the graph runs and publishes it as graph metadata.
///
/// The query is the graph's `query` metadata when set, else the text of its
/// human turns in creation order.
pub struct RetrievalInjector {
    retriever: Arc<dyn Retriever>,
    limit: usize,
}

impl RetrievalInjector {
    pub fn new(retriever: Arc<dyn Retriever>) -> Self {
        Self { retriever, limit: 3 }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    fn query(&self, graph: &Graph) -> String {
        if let Some(Value::String(query)) = graph.find_metadata(QUERY_KEY) {
            return query;
        }

        graph
            .steps()
            .iter()
            .filter(|s| s.kind() == Turn::HUMAN)
            .filter_map(fixed_text)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Text of a fixed turn, read from its record so nothing gets invoked
fn fixed_text(step: &Step) -> Option<String> {
    let record = step.node().to_record().ok()?;
    let message: Message = serde_json::from_value(record).ok()?;
    message.text().map(str::to_string)
}

#[async_trait]
impl Modifier for RetrievalInjector {
    fn name(&self) -> &str {
        "retrieval_injector"
    }

    async fn on_begin(&self, graph: &Graph) -> Result<()> {
        let query = self.query(graph);
        if query.trim().is_empty() {
            tracing::debug!(graph_id = %graph.id(), "no retrieval query, skipping");
            return Ok(());
        }

        let documents = self.retriever.retrieve(&query, self.limit).await?;
        tracing::debug!(graph_id = %graph.id(), documents = documents.len(), "context retrieved");
        if !documents.is_empty() {
            graph.set_metadata(RETRIEVED_CONTEXT_KEY, documents.join("\n\n"));
        }
        Ok(())
    }
}

/// In-memory retriever ranking documents by shared words with the query
#[derive(Debug, Clone, Default)]
pub struct KeywordRetriever {
    documents: Vec<String>,
}

impl KeywordRetriever {
    pub fn new(documents: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            documents: documents.into_iter().map(Into::into).collect(),
        }
    }
}

fn words(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() > 2)
        .map(str::to_lowercase)
        .collect()
}

#[async_trait]
impl Retriever for KeywordRetriever {
    async fn retrieve(&self, query: &str, limit: usize) -> anyhow::Result<Vec<String>> {
        let query = words(query);
        let mut scored: Vec<(usize, &String)> = self
            .documents
            .iter()
            .map(|doc| (words(doc).intersection(&query).count(), doc))
            .filter(|(score, _)| *score > 0)
            .collect();
        scored.sort_by(|a, b| b.0.cmp(&a.0));

        Ok(scored.into_iter().take(limit).map(|(_, doc)| doc.clone()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_keyword_retriever_ranks_by_overlap() {
        let retriever = KeywordRetriever::new([
            "Rust ownership rules",
            "Python list comprehensions",
            "Rust borrow checker and ownership",
        ]);
        let docs = retriever.retrieve("explain rust ownership", 2).await.unwrap();
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[0], "Rust ownership rules");
        assert!(docs.iter().all(|d| d.contains("Rust")));
    }
}
