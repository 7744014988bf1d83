use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Instant;

use agentflow_llm::ModelRegistry;
use futures::future::try_join_all;
use futures::stream::BoxStream;
use futures::StreamExt;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::mpsc::{self, error::TrySendError};

use crate::builder::GraphBuilder;
use crate::context::{self, ContextToken, ScopedStream};
use crate::error::{GraphError, Result};
use crate::modifier::Modifier;
use crate::node::StepOutput;
use crate::step::{Step, StepChunk};
use crate::types::events::{now_millis, GraphEvent, GraphStatus};
use crate::types::GraphConfig;

/// Scoped container of steps.
///
/// Entering a graph's scope makes it the innermost active graph for the
/// current task, so steps built there attach to it.
#[derive(Clone)]
pub struct Graph {
    inner: Arc<GraphInner>,
}

pub(crate) struct GraphInner {
    id: String,
    steps: RwLock<Vec<Step>>,
    metadata: RwLock<HashMap<String, Value>>,
    modifiers: RwLock<Vec<Arc<dyn Modifier>>>,
    output: Mutex<Option<StepOutput>>,
    parent: Option<Graph>,
    registry: Option<Arc<ModelRegistry>>,
    events: Option<mpsc::Sender<GraphEvent>>,
    config: GraphConfig,
}

pub(crate) struct GraphParts {
    pub parent: Option<Graph>,
    pub registry: Option<Arc<ModelRegistry>>,
    pub events: Option<mpsc::Sender<GraphEvent>>,
    pub config: GraphConfig,
    pub modifiers: Vec<Arc<dyn Modifier>>,
    pub metadata: HashMap<String, Value>,
}

impl Graph {
    /// Graph nested under the innermost active graph, if any
    pub fn new() -> Self {
        GraphBuilder::new().build()
    }

    pub fn builder() -> GraphBuilder {
        GraphBuilder::new()
    }

    pub(crate) fn from_parts(parts: GraphParts) -> Self {
        Self {
            inner: Arc::new(GraphInner {
                id: uuid::Uuid::new_v4().to_string(),
                steps: RwLock::new(Vec::new()),
                metadata: RwLock::new(parts.metadata),
                modifiers: RwLock::new(parts.modifiers),
                output: Mutex::new(None),
                parent: parts.parent,
                registry: parts.registry,
                events: parts.events,
                config: parts.config,
            }),
        }
    }

    pub(crate) fn downgrade(&self) -> Weak<GraphInner> {
        Arc::downgrade(&self.inner)
    }

    pub(crate) fn upgrade(weak: &Weak<GraphInner>) -> Option<Graph> {
        weak.upgrade().map(|inner| Graph { inner })
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn ptr_eq(&self, other: &Graph) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn config(&self) -> &GraphConfig {
        &self.inner.config
    }

    /// Graph that was innermost when this one was created
    pub fn parent(&self) -> Option<&Graph> {
        self.inner.parent.as_ref()
    }

    /// Own model registry, else the nearest enclosing graph's
    pub fn registry(&self) -> Option<Arc<ModelRegistry>> {
        match &self.inner.registry {
            Some(registry) => Some(Arc::clone(registry)),
            None => self.parent().and_then(Graph::registry),
        }
    }

    // Scoped entry

    /// Run `fut` with this graph as the innermost active graph.
    pub fn scope<F: Future>(&self, fut: F) -> impl Future<Output = F::Output> {
        context::with_stack(context::current().with(self), fut)
    }

    /// Blocking counterpart of [`Graph::scope`]
    pub fn sync_scope<F, R>(&self, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        context::with_stack_sync(context::current().with(self), f)
    }

    /// Push onto the current context scope until the guard drops.
    pub fn enter(&self) -> Result<GraphGuard> {
        Ok(GraphGuard {
            token: Some(context::push(self)?),
        })
    }

    pub fn is_active(&self) -> bool {
        context::all().iter().any(|g| g.ptr_eq(self))
    }

    // Structure

    pub(crate) fn register_step(&self, step: Step) {
        self.inner.steps.write().push(step);
    }

    /// Drop a step nothing depends on and that never ran
    pub(crate) fn discard_step(&self, step: &Step) -> bool {
        if step.is_invoked() {
            return false;
        }
        let mut steps = self.inner.steps.write();
        if steps.iter().any(|s| s.parents().iter().any(|p| p.ptr_eq(step))) {
            return false;
        }
        let before = steps.len();
        steps.retain(|s| !s.ptr_eq(step));
        before != steps.len()
    }

    /// Steps in creation order
    pub fn steps(&self) -> Vec<Step> {
        self.inner.steps.read().clone()
    }

    pub fn len(&self) -> usize {
        self.inner.steps.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.steps.read().is_empty()
    }

    pub fn step(&self, id: &str) -> Option<Step> {
        self.inner.steps.read().iter().find(|s| s.id() == id).cloned()
    }

    pub fn parents(&self, step: &Step) -> Vec<Step> {
        step.parents()
    }

    pub fn children(&self, step: &Step) -> Vec<Step> {
        self.steps()
            .into_iter()
            .filter(|s| s.parents().iter().any(|p| p.ptr_eq(step)))
            .collect()
    }

    /// Steps nothing depends on, in creation order
    pub fn leaf_steps(&self) -> Vec<Step> {
        let steps = self.steps();
        let parent_ids: HashSet<String> = steps
            .iter()
            .flat_map(|s| s.parents())
            .map(|p| p.id().to_string())
            .collect();
        steps
            .into_iter()
            .filter(|s| !parent_ids.contains(s.id()))
            .collect()
    }

    fn pending_leaves(&self) -> Vec<Step> {
        self.leaf_steps()
            .into_iter()
            .filter(|s| !s.is_invoked())
            .collect()
    }

    // Metadata

    pub fn metadata(&self, key: &str) -> Option<Value> {
        self.inner.metadata.read().get(key).cloned()
    }

    pub fn set_metadata(&self, key: impl Into<String>, value: impl Into<Value>) {
        self.inner.metadata.write().insert(key.into(), value.into());
    }

    pub fn metadata_snapshot(&self) -> HashMap<String, Value> {
        self.inner.metadata.read().clone()
    }

    /// Own metadata, then the enclosing graphs'
    pub fn find_metadata(&self, key: &str) -> Option<Value> {
        self.metadata(key)
            .or_else(|| self.parent().and_then(|parent| parent.find_metadata(key)))
    }

    // Modifiers

    pub fn add_modifier(&self, modifier: impl Modifier + 'static) {
        self.add_modifier_arc(Arc::new(modifier));
    }

    pub fn add_modifier_arc(&self, modifier: Arc<dyn Modifier>) {
        tracing::debug!(graph_id = %self.id(), modifier = modifier.name(), "modifier attached");
        self.inner.modifiers.write().push(modifier);
    }

    pub fn modifiers(&self) -> Vec<Arc<dyn Modifier>> {
        self.inner.modifiers.read().clone()
    }

    // Output

    /// Override wins; otherwise the single leaf's output, or with several
    /// leaves the last one of the default kind.
    pub fn output(&self) -> Option<StepOutput> {
        if let Some(output) = self.inner.output.lock().clone() {
            return Some(output);
        }

        let leaves = self.leaf_steps();
        match leaves.as_slice() {
            [leaf] => leaf.output(),
            _ => leaves
                .iter()
                .rev()
                .find(|s| s.kind() == self.config().default_kind)
                .and_then(Step::output),
        }
    }

    pub fn set_output(&self, output: StepOutput) {
        *self.inner.output.lock() = Some(output);
    }

    // Execution

    /// Settle every step, then return [`Graph::output`].
    ///
    /// Runs inside this graph's scope. Each round invokes the pending leaves
    /// in creation order; rounds repeat while modifiers graft new steps.
    pub async fn invoke(&self) -> Result<Option<StepOutput>> {
        self.scope(self.settle()).await
    }

    async fn settle(&self) -> Result<Option<StepOutput>> {
        let started = self.begin();
        let result = self.drive().await;
        self.finish(started, &result);
        result.map(|()| self.output())
    }

    async fn drive(&self) -> Result<()> {
        self.run_begin_hooks().await?;

        let mut rounds = 0;
        loop {
            let pending = self.pending_leaves();
            if pending.is_empty() {
                break;
            }
            if rounds >= self.config().max_rounds {
                return Err(GraphError::MaxRounds(rounds));
            }
            rounds += 1;

            for leaf in pending {
                leaf.invoke().await?;
            }
        }

        self.run_end_hooks().await
    }

    /// Single-task streaming counterpart of [`Graph::invoke`].
    ///
    /// Ancestors of each pending leaf are invoked, then the leaf itself is
    /// streamed and its chunks forwarded. A failure ends the stream with the
    /// error as its last item.
    pub fn stream(&self) -> BoxStream<'static, Result<StepChunk>> {
        let graph = self.clone();
        let stack = context::current().with(self);

        let chunks = async_stream::stream! {
            let started = graph.begin();
            let mut failure = graph.run_begin_hooks().await.err();
            let mut rounds = 0;

            'rounds: while failure.is_none() {
                let pending = graph.pending_leaves();
                if pending.is_empty() {
                    break;
                }
                if rounds >= graph.config().max_rounds {
                    failure = Some(GraphError::MaxRounds(rounds));
                    break;
                }
                rounds += 1;

                for leaf in pending {
                    let parents = leaf.parents();
                    if let Err(err) = try_join_all(parents.iter().map(Step::invoke)).await {
                        failure = Some(err);
                        break 'rounds;
                    }

                    let mut leaf_chunks = leaf.stream();
                    while let Some(chunk) = leaf_chunks.next().await {
                        match chunk {
                            Ok(chunk) => {
                                yield Ok(chunk);
                            }
                            Err(err) => {
                                failure = Some(err);
                                break 'rounds;
                            }
                        }
                    }
                }
            }

            if failure.is_none() {
                failure = graph.run_end_hooks().await.err();
            }

            let result = match failure {
                Some(err) => Err(err),
                None => Ok(()),
            };
            graph.finish(started, &result);
            if let Err(err) = result {
                yield Err(err);
            }
        };

        Box::pin(ScopedStream::new(stack, chunks))
    }

    fn begin(&self) -> Instant {
        tracing::info!(graph_id = %self.id(), steps = self.len(), "graph started");
        self.emit(GraphEvent::GraphStarted {
            graph_id: self.id().to_string(),
            timestamp: now_millis(),
        });
        Instant::now()
    }

    fn finish(&self, started: Instant, result: &Result<()>) {
        let total_duration_ms = started.elapsed().as_millis() as u64;
        let status = match result {
            Ok(()) => {
                tracing::info!(graph_id = %self.id(), total_duration_ms, "graph finished");
                GraphStatus::Success
            }
            Err(err) => {
                tracing::warn!(graph_id = %self.id(), total_duration_ms, error = %err, "graph failed");
                GraphStatus::Error
            }
        };
        self.emit(GraphEvent::GraphFinished {
            graph_id: self.id().to_string(),
            status,
            total_duration_ms,
            timestamp: now_millis(),
        });
    }

    async fn run_begin_hooks(&self) -> Result<()> {
        for modifier in self.modifiers() {
            modifier
                .on_begin(self)
                .await
                .map_err(|e| GraphError::modifier(modifier.name(), e))?;
        }
        Ok(())
    }

    async fn run_end_hooks(&self) -> Result<()> {
        for modifier in self.modifiers() {
            modifier
                .on_end(self)
                .await
                .map_err(|e| GraphError::modifier(modifier.name(), e))?;
        }
        Ok(())
    }

    pub(crate) async fn after_step(&self, step: &Step) -> Result<()> {
        for modifier in self.modifiers() {
            modifier
                .on_after_step(self, step)
                .await
                .map_err(|e| GraphError::modifier(modifier.name(), e))?;
        }
        Ok(())
    }

    /// Non-blocking; a full or closed sink never fails execution
    pub(crate) fn emit(&self, event: GraphEvent) {
        let Some(sink) = &self.inner.events else {
            return;
        };
        match sink.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                tracing::warn!(graph_id = %self.id(), "graph event sink full, event dropped");
            }
            Err(TrySendError::Closed(_)) => {
                tracing::trace!(graph_id = %self.id(), "graph event receiver gone");
            }
        }
    }
}

impl Default for Graph {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Graph")
            .field("id", &self.inner.id)
            .field("steps", &self.len())
            .field("parent", &self.parent().map(Graph::id))
            .finish()
    }
}

/// Keeps a graph active until dropped
#[must_use = "the graph is only active while the guard lives"]
pub struct GraphGuard {
    token: Option<ContextToken>,
}

impl Drop for GraphGuard {
    fn drop(&mut self) {
        if let Some(token) = self.token.take() {
            context::pop(token);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nodes::{Transform, Turn};
    use crate::step::Upstream;
    use agentflow_llm::Message;

    #[test]
    fn test_sync_scope_attaches_steps() {
        let graph = Graph::new();
        let step = graph.sync_scope(|| Step::build(Turn::human("hi"))).unwrap();
        assert!(step.belongs_to(&graph));
        assert_eq!(graph.len(), 1);
        assert!(context::peek().is_none());
    }

    #[test]
    fn test_guard_pops_on_drop() {
        let graph = Graph::new();
        context::sync_scope(|| {
            {
                let _guard = graph.enter().unwrap();
                assert!(graph.is_active());
            }
            assert!(!graph.is_active());
        });
        assert!(matches!(graph.enter(), Err(GraphError::NoContextScope)));
    }

    #[test]
    fn test_nested_graph_inherits_metadata() {
        let outer = Graph::new();
        outer.set_metadata("tone", "formal");
        let inner = outer.sync_scope(Graph::new);

        assert!(inner.parent().unwrap().ptr_eq(&outer));
        assert_eq!(inner.find_metadata("tone"), Some(Value::from("formal")));
        inner.set_metadata("tone", "casual");
        assert_eq!(inner.find_metadata("tone"), Some(Value::from("casual")));
        assert_eq!(outer.find_metadata("tone"), Some(Value::from("formal")));
    }

    #[test]
    fn test_queries_follow_edges() {
        let graph = Graph::new();
        let a = Step::new_in(&graph, Turn::human("a"));
        let b = Step::new_in(&graph, Turn::system("b"));
        let c = Step::new_in(&graph, Transform::map(|m| m));
        [a.clone(), b.clone()].then(&c).unwrap();

        assert_eq!(graph.children(&a).len(), 1);
        assert_eq!(graph.parents(&c).len(), 2);
        let leaves = graph.leaf_steps();
        assert_eq!(leaves.len(), 1);
        assert!(leaves[0].ptr_eq(&c));
        assert!(graph.step(b.id()).is_some());
    }

    #[tokio::test]
    async fn test_output_prefers_last_leaf_of_default_kind() {
        let graph = Graph::builder().default_kind(Turn::ASSISTANT).build();
        Step::new_in(&graph, Turn::assistant("first"));
        Step::new_in(&graph, Turn::assistant("second"));
        Step::new_in(&graph, Turn::human("trailing"));

        let output = graph.invoke().await.unwrap().unwrap();
        assert_eq!(output.text(), Some("second"));

        graph.set_output(StepOutput::Message(Message::assistant("override")));
        assert_eq!(graph.output().unwrap().text(), Some("override"));
    }

    #[tokio::test]
    async fn test_max_rounds_bounds_execution() {
        let graph = Graph::builder().max_rounds(0).build();
        Step::new_in(&graph, Turn::human("hi"));
        assert!(matches!(graph.invoke().await, Err(GraphError::MaxRounds(0))));
    }
}
