//! Steps: memoized nodes wired into a graph.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use agentflow_llm::StreamEvent;
use futures::future::{try_join_all, BoxFuture};
use futures::stream::BoxStream;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, OnceCell};

use crate::context;
use crate::error::{EdgeRejection, GraphError, Result};
use crate::graph::{Graph, GraphInner};
use crate::kinds::StepKindRegistry;
use crate::node::{EventSender, Node, StepOutput};
use crate::policy::combine_inputs_with;
use crate::types::events::{now_millis, GraphEvent};

/// Handle to a node owned by a graph.
///
/// Clones share state. A step holds its graph weakly, so it is only usable
/// while the graph is alive.
#[derive(Clone)]
pub struct Step {
    inner: Arc<StepInner>,
}

struct StepInner {
    id: String,
    node: Box<dyn Node>,
    graph: Weak<GraphInner>,
    parents: Mutex<Vec<Step>>,
    output: OnceCell<StepOutput>,
    run_lock: tokio::sync::Mutex<()>,
    started: AtomicBool,
    metadata: RwLock<HashMap<String, Value>>,
    model: RwLock<Option<String>>,
}

/// Piece of a step's streamed output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepChunk {
    Delta { step_id: String, event: StreamEvent },
    Final { step_id: String, output: StepOutput },
}

impl StepChunk {
    pub fn step_id(&self) -> &str {
        match self {
            Self::Delta { step_id, .. } | Self::Final { step_id, .. } => step_id,
        }
    }
}

/// Persistence record of a step; parent edges are not part of it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub step_kind: String,
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
    #[serde(default)]
    pub invoked: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<StepOutput>,
    #[serde(default)]
    pub data: Value,
}

/// Reopens a step's parent list when its run ends without caching an output,
/// whether by error or by cancellation.
struct Unfreeze<'a>(&'a StepInner);

impl Drop for Unfreeze<'_> {
    fn drop(&mut self) {
        if self.0.output.get().is_none() {
            self.0.started.store(false, Ordering::SeqCst);
        }
    }
}

enum Progress {
    Delta(StreamEvent),
    Done(Result<StepOutput>),
}

impl Step {
    /// Create a step in the innermost active graph.
    pub fn build(node: impl Node + 'static) -> Result<Step> {
        let graph = context::peek().ok_or(GraphError::NoActiveGraph)?;
        Ok(Self::new_in(&graph, node))
    }

    pub fn new_in(graph: &Graph, node: impl Node + 'static) -> Step {
        Self::attach(graph, Box::new(node), uuid::Uuid::new_v4().to_string())
    }

    fn attach(graph: &Graph, node: Box<dyn Node>, id: String) -> Step {
        let step = Step {
            inner: Arc::new(StepInner {
                id,
                node,
                graph: graph.downgrade(),
                parents: Mutex::new(Vec::new()),
                output: OnceCell::new(),
                run_lock: tokio::sync::Mutex::new(()),
                started: AtomicBool::new(false),
                metadata: RwLock::new(HashMap::new()),
                model: RwLock::new(None),
            }),
        };
        graph.register_step(step.clone());
        tracing::trace!(graph_id = %graph.id(), step_id = %step.id(), kind = step.kind(), "step created");
        step
    }

    /// Name of the registry backend this step talks to
    pub fn with_model(self, name: impl Into<String>) -> Self {
        *self.inner.model.write() = Some(name.into());
        self
    }

    pub fn model(&self) -> Option<String> {
        self.inner.model.read().clone()
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn kind(&self) -> &'static str {
        self.inner.node.kind()
    }

    pub fn node(&self) -> &dyn Node {
        self.inner.node.as_ref()
    }

    pub fn ptr_eq(&self, other: &Step) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn graph(&self) -> Result<Graph> {
        Graph::upgrade(&self.inner.graph).ok_or(GraphError::GraphDropped)
    }

    pub fn belongs_to(&self, graph: &Graph) -> bool {
        Weak::ptr_eq(&self.inner.graph, &graph.downgrade())
    }

    pub fn parents(&self) -> Vec<Step> {
        self.inner.parents.lock().clone()
    }

    pub fn is_invoked(&self) -> bool {
        self.inner.output.initialized()
    }

    /// Cached output, once invoked
    pub fn output(&self) -> Option<StepOutput> {
        self.inner.output.get().cloned()
    }

    /// Add `parent` to this step's inputs.
    ///
    /// Adding an existing parent is a no-op. With an index the parent is
    /// inserted there (clamped to the list length) instead of appended.
    pub fn add_parent(&self, parent: &Step, index: Option<usize>) -> Result<()> {
        if self.has_parent(parent) {
            return Ok(());
        }
        self.check_parent(parent)?;
        self.insert_parent(parent, index);
        Ok(())
    }

    /// Append several parents; nothing is recorded unless all are valid.
    pub fn add_parents(&self, parents: &[Step]) -> Result<()> {
        for parent in parents {
            if !self.has_parent(parent) {
                self.check_parent(parent)?;
            }
        }
        for parent in parents {
            self.insert_parent(parent, None);
        }
        Ok(())
    }

    /// `a.then(&b)`: `a` becomes a parent of `b`; returns `b`
    pub fn then(&self, child: &Step) -> Result<Step> {
        child.add_parent(self, None)?;
        Ok(child.clone())
    }

    /// `b.after(&a)`: `a` becomes a parent of `b`; returns `b`
    pub fn after(&self, parent: &Step) -> Result<Step> {
        self.add_parent(parent, None)?;
        Ok(self.clone())
    }

    fn has_parent(&self, parent: &Step) -> bool {
        self.inner.parents.lock().iter().any(|p| p.ptr_eq(parent))
    }

    fn check_parent(&self, parent: &Step) -> Result<()> {
        let reject = |reason: EdgeRejection| GraphError::InvalidEdge {
            parent: parent.id().to_string(),
            child: self.id().to_string(),
            reason,
        };

        if self.ptr_eq(parent) {
            return Err(reject(EdgeRejection::SelfLoop));
        }
        if !Weak::ptr_eq(&self.inner.graph, &parent.inner.graph) {
            return Err(reject(EdgeRejection::ForeignGraph));
        }
        if self.inner.started.load(Ordering::SeqCst) {
            return Err(GraphError::StructureFrozen(self.id().to_string()));
        }
        if parent.has_ancestor(self) {
            return Err(reject(EdgeRejection::Cycle));
        }
        Ok(())
    }

    fn has_ancestor(&self, target: &Step) -> bool {
        let mut pending = self.parents();
        let mut seen = HashSet::new();
        while let Some(step) = pending.pop() {
            if step.ptr_eq(target) {
                return true;
            }
            if seen.insert(step.id().to_string()) {
                pending.extend(step.parents());
            }
        }
        false
    }

    fn insert_parent(&self, parent: &Step, index: Option<usize>) {
        let mut parents = self.inner.parents.lock();
        if parents.iter().any(|p| p.ptr_eq(parent)) {
            return;
        }
        match index {
            Some(index) => {
                let index = index.min(parents.len());
                parents.insert(index, parent.clone());
            }
            None => parents.push(parent.clone()),
        }
    }

    /// Run the step once and cache the result.
    ///
    /// Later calls return the cache. Concurrent callers wait for the first
    /// run instead of starting their own. On failure nothing is cached.
    pub fn invoke(&self) -> BoxFuture<'_, Result<StepOutput>> {
        self.run(None).boxed()
    }

    async fn run(&self, events: Option<EventSender>) -> Result<StepOutput> {
        if let Some(output) = self.inner.output.get() {
            return Ok(output.clone());
        }

        let running = self.inner.run_lock.lock().await;
        if let Some(output) = self.inner.output.get() {
            return Ok(output.clone());
        }
        self.inner.started.store(true, Ordering::SeqCst);
        let _unfreeze = Unfreeze(&self.inner);

        let graph = self.graph()?;
        let parents = self.parents();
        let outputs = try_join_all(parents.iter().map(Step::invoke)).await?;
        let input = combine_inputs_with(
            outputs.into_iter().flat_map(StepOutput::into_messages),
            &graph.config().join_separator,
        );

        graph.emit(GraphEvent::StepStarted {
            graph_id: graph.id().to_string(),
            step_id: self.id().to_string(),
            kind: self.kind().to_string(),
            timestamp: now_millis(),
        });
        tracing::debug!(step_id = %self.id(), kind = self.kind(), inputs = input.len(), "step started");

        let started = Instant::now();
        let output = match self.inner.node.execute(self, input, events).await {
            Ok(output) => output,
            Err(err) => {
                tracing::warn!(step_id = %self.id(), kind = self.kind(), error = %err, "step failed");
                graph.emit(GraphEvent::StepFailed {
                    graph_id: graph.id().to_string(),
                    step_id: self.id().to_string(),
                    kind: self.kind().to_string(),
                    message: err.to_string(),
                    timestamp: now_millis(),
                });
                return Err(err);
            }
        };

        // the run lock is held, nobody else can have filled the cell
        let _ = self.inner.output.set(output.clone());
        drop(running);

        let duration_ms = started.elapsed().as_millis() as u64;
        tracing::debug!(step_id = %self.id(), kind = self.kind(), duration_ms, "step invoked");
        graph.emit(GraphEvent::StepInvoked {
            graph_id: graph.id().to_string(),
            step_id: self.id().to_string(),
            kind: self.kind().to_string(),
            duration_ms,
            timestamp: now_millis(),
        });

        graph.after_step(self).await?;
        Ok(output)
    }

    /// Stream this step's output.
    ///
    /// A pending step forwards backend deltas as they arrive and ends with a
    /// `Final` chunk; an invoked step yields a single `Final` chunk.
    pub fn stream(&self) -> BoxStream<'static, Result<StepChunk>> {
        let step = self.clone();

        Box::pin(async_stream::stream! {
            let step_id = step.id().to_string();

            match step.output() {
                Some(output) => {
                    yield Ok(StepChunk::Final { step_id, output });
                }
                None => {
                    let (tx, mut rx) = mpsc::unbounded_channel();
                    let run = step.run(Some(tx));
                    tokio::pin!(run);

                    let result = loop {
                        let progress = tokio::select! {
                            biased;
                            Some(event) = rx.recv() => Progress::Delta(event),
                            result = &mut run => Progress::Done(result),
                        };
                        match progress {
                            Progress::Delta(event) => {
                                yield Ok(StepChunk::Delta { step_id: step_id.clone(), event });
                            }
                            Progress::Done(result) => break result,
                        }
                    };

                    while let Ok(event) = rx.try_recv() {
                        yield Ok(StepChunk::Delta { step_id: step_id.clone(), event });
                    }
                    yield result.map(|output| StepChunk::Final { step_id, output });
                }
            }
        })
    }

    pub fn metadata(&self, key: &str) -> Option<Value> {
        self.inner.metadata.read().get(key).cloned()
    }

    pub fn set_metadata(&self, key: impl Into<String>, value: impl Into<Value>) {
        self.inner.metadata.write().insert(key.into(), value.into());
    }

    pub fn metadata_snapshot(&self) -> HashMap<String, Value> {
        self.inner.metadata.read().clone()
    }

    /// Own metadata first, then the innermost active graph's chain (or the
    /// owning graph's when none is active).
    pub fn find_metadata(&self, key: &str) -> Option<Value> {
        if let Some(value) = self.metadata(key) {
            return Some(value);
        }
        let graph = context::peek().or_else(|| self.graph().ok())?;
        graph.find_metadata(key)
    }

    pub fn serialize(&self) -> Result<StepRecord> {
        Ok(StepRecord {
            step_kind: self.kind().to_string(),
            id: self.id().to_string(),
            model: self.model(),
            metadata: self.metadata_snapshot(),
            invoked: self.is_invoked(),
            output: self.output(),
            data: self.inner.node.to_record()?,
        })
    }

    /// Rebuild a step inside the innermost active graph.
    pub fn deserialize(record: StepRecord, kinds: &StepKindRegistry) -> Result<Step> {
        let graph = context::peek().ok_or(GraphError::NoActiveGraph)?;
        Self::deserialize_in(&graph, record, kinds)
    }

    pub fn deserialize_in(graph: &Graph, record: StepRecord, kinds: &StepKindRegistry) -> Result<Step> {
        let node = kinds.construct(&record.step_kind, record.data)?;
        let step = Self::attach(graph, node, record.id);

        *step.inner.metadata.write() = record.metadata;
        *step.inner.model.write() = record.model;
        if let (true, Some(output)) = (record.invoked, record.output) {
            step.inner.started.store(true, Ordering::SeqCst);
            let _ = step.inner.output.set(output);
        }
        Ok(step)
    }
}

impl fmt::Debug for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Step")
            .field("id", &self.inner.id)
            .field("kind", &self.kind())
            .field("invoked", &self.is_invoked())
            .finish()
    }
}

/// Left-hand side of a fan-in: `[a, c].then(&b)`
pub trait Upstream {
    fn upstream(&self) -> Vec<Step>;

    fn then(&self, child: &Step) -> Result<Step> {
        child.add_parents(&self.upstream())?;
        Ok(child.clone())
    }
}

impl Upstream for [Step] {
    fn upstream(&self) -> Vec<Step> {
        self.to_vec()
    }
}

impl<const N: usize> Upstream for [Step; N] {
    fn upstream(&self) -> Vec<Step> {
        self.to_vec()
    }
}

impl Upstream for Vec<Step> {
    fn upstream(&self) -> Vec<Step> {
        self.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nodes::{Transform, Turn};
    use agentflow_llm::Message;

    #[test]
    fn test_build_requires_active_graph() {
        assert!(matches!(Step::build(Turn::human("hi")), Err(GraphError::NoActiveGraph)));
    }

    #[test]
    fn test_add_parent_is_idempotent_and_indexable() {
        let graph = Graph::new();
        let a = Step::new_in(&graph, Turn::human("a"));
        let b = Step::new_in(&graph, Turn::human("b"));
        let c = Step::new_in(&graph, Turn::human("c"));
        let child = Step::new_in(&graph, Turn::assistant("x"));

        child.add_parent(&a, None).unwrap();
        child.add_parent(&b, None).unwrap();
        child.add_parent(&a, None).unwrap();
        child.add_parent(&c, Some(0)).unwrap();

        let ids: Vec<_> = child.parents().iter().map(|p| p.id().to_string()).collect();
        assert_eq!(ids, vec![c.id(), a.id(), b.id()]);
    }

    #[test]
    fn test_invalid_edges_are_rejected() {
        let graph = Graph::new();
        let other = Graph::new();
        let a = Step::new_in(&graph, Turn::human("a"));
        let b = Step::new_in(&graph, Turn::human("b"));
        let stranger = Step::new_in(&other, Turn::human("s"));

        assert!(matches!(
            a.add_parent(&a, None),
            Err(GraphError::InvalidEdge { reason: EdgeRejection::SelfLoop, .. })
        ));
        assert!(matches!(
            a.add_parent(&stranger, None),
            Err(GraphError::InvalidEdge { reason: EdgeRejection::ForeignGraph, .. })
        ));

        a.then(&b).unwrap();
        assert!(matches!(
            b.then(&a),
            Err(GraphError::InvalidEdge { reason: EdgeRejection::Cycle, .. })
        ));
        assert!(a.parents().is_empty());
    }

    #[test]
    fn test_fan_in_records_nothing_on_failure() {
        let graph = Graph::new();
        let other = Graph::new();
        let a = Step::new_in(&graph, Turn::human("a"));
        let stranger = Step::new_in(&other, Turn::human("s"));
        let child = Step::new_in(&graph, Turn::assistant("x"));

        assert!([a.clone(), stranger].then(&child).is_err());
        assert!(child.parents().is_empty());

        let c = Step::new_in(&graph, Turn::system("c"));
        [a.clone(), c.clone()].then(&child).unwrap();
        assert_eq!(child.parents().len(), 2);
    }

    #[tokio::test]
    async fn test_parents_frozen_once_started() {
        let graph = Graph::new();
        let a = Step::new_in(&graph, Turn::human("a"));
        let b = Step::new_in(&graph, Turn::human("b"));
        a.invoke().await.unwrap();

        assert!(matches!(a.add_parent(&b, None), Err(GraphError::StructureFrozen(_))));
        // grafting a child onto a settled step is fine
        b.add_parent(&a, None).unwrap();
    }

    #[tokio::test]
    async fn test_transform_sees_merged_parent_output() {
        let graph = Graph::new();
        let h = Step::new_in(&graph, Turn::human("hi"));
        let s = Step::new_in(&graph, Turn::system("rules"));
        let count = Step::new_in(
            &graph,
            Transform::new(|input: Vec<Message>| Ok(Message::assistant(format!("{} messages", input.len())).into())),
        );
        [h, s].then(&count).unwrap();

        let output = count.invoke().await.unwrap();
        assert_eq!(output.text(), Some("2 messages"));
        assert!(count.is_invoked());
    }

    #[tokio::test]
    async fn test_invoked_step_streams_one_final_chunk() {
        use futures::StreamExt;

        let graph = Graph::new();
        let h = Step::new_in(&graph, Turn::human("hi"));
        h.invoke().await.unwrap();

        let chunks: Vec<_> = h.stream().collect().await;
        assert_eq!(chunks.len(), 1);
        assert!(matches!(&chunks[0], Ok(StepChunk::Final { step_id, .. }) if step_id == h.id()));
    }

    #[test]
    fn test_step_dies_with_its_graph() {
        let graph = Graph::new();
        let step = Step::new_in(&graph, Turn::human("hi"));
        drop(graph);
        assert!(matches!(step.graph(), Err(GraphError::GraphDropped)));
    }
}
