use async_trait::async_trait;

use crate::error::Result;
use crate::graph::Graph;
use crate::modifier::Modifier;

/// Pins the graph output to its leaf step once the graph settles.
///
/// With a kind filter the last leaf of that kind is used, otherwise only a
/// single leaf qualifies.
#[derive(Debug, Clone, Default)]
pub struct LeafOutput {
    kind: Option<String>,
}

impl LeafOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn of_kind(kind: impl Into<String>) -> Self {
        Self {
            kind: Some(kind.into()),
        }
    }
}

#[async_trait]
impl Modifier for LeafOutput {
    fn name(&self) -> &str {
        "leaf_output"
    }

    async fn on_end(&self, graph: &Graph) -> Result<()> {
        let leaves = graph.leaf_steps();
        let leaf = match &self.kind {
            Some(kind) => leaves.iter().rev().find(|s| s.kind() == kind.as_str()),
            None if leaves.len() == 1 => leaves.first(),
            None => None,
        };

        if let Some(output) = leaf.and_then(|s| s.output()) {
            graph.set_output(output);
        }
        Ok(())
    }
}
