use async_trait::async_trait;

use crate::error::Result;
use crate::graph::Graph;
use crate::step::Step;

/// Lifecycle hooks attached to a graph.
///
/// Modifiers run in registration order. They may write step and graph
/// metadata, graft new steps and set the graph output; invoking an already
/// settled step from a hook only reads its cache.
#[async_trait]
pub trait Modifier: Send + Sync {
    fn name(&self) -> &str;

    /// Once, before any step runs
    async fn on_begin(&self, _graph: &Graph) -> Result<()> {
        Ok(())
    }

    /// After each step settles
    async fn on_after_step(&self, _graph: &Graph, _step: &Step) -> Result<()> {
        Ok(())
    }

    /// Once, after the graph settles
    async fn on_end(&self, _graph: &Graph) -> Result<()> {
        Ok(())
    }
}
