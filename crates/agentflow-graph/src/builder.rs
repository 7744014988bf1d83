use std::collections::HashMap;
use std::sync::Arc;

use agentflow_llm::ModelRegistry;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::context;
use crate::graph::{Graph, GraphParts};
use crate::modifier::Modifier;
use crate::types::{GraphConfig, GraphEvent};

/// Builder for constructing a Graph with optional components
pub struct GraphBuilder {
    registry: Option<Arc<ModelRegistry>>,
    config: GraphConfig,
    events: Option<mpsc::Sender<GraphEvent>>,
    modifiers: Vec<Arc<dyn Modifier>>,
    metadata: HashMap<String, Value>,
    parent: Option<Graph>,
    detached: bool,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self {
            registry: None,
            config: GraphConfig::default(),
            events: None,
            modifiers: Vec::new(),
            metadata: HashMap::new(),
            parent: None,
            detached: false,
        }
    }

    /// Model registry chat steps resolve their backends from
    pub fn registry(mut self, registry: Arc<ModelRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Set the graph configuration
    pub fn config(mut self, config: GraphConfig) -> Self {
        self.config = config;
        self
    }

    pub fn default_kind(mut self, kind: impl Into<String>) -> Self {
        self.config.default_kind = kind.into();
        self
    }

    pub fn max_rounds(mut self, max: usize) -> Self {
        self.config.max_rounds = max;
        self
    }

    /// Send lifecycle events to `sender`
    pub fn events(mut self, sender: mpsc::Sender<GraphEvent>) -> Self {
        self.events = Some(sender);
        self
    }

    pub fn modifier(mut self, modifier: impl Modifier + 'static) -> Self {
        self.modifiers.push(Arc::new(modifier));
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Explicit parent for metadata and registry lookups
    pub fn parent(mut self, parent: &Graph) -> Self {
        self.parent = Some(parent.clone());
        self
    }

    /// Do not nest under the innermost active graph
    pub fn detached(mut self) -> Self {
        self.detached = true;
        self
    }

    /// Build the Graph
    pub fn build(self) -> Graph {
        let parent = match (self.parent, self.detached) {
            (Some(parent), _) => Some(parent),
            (None, false) => context::peek(),
            (None, true) => None,
        };

        Graph::from_parts(GraphParts {
            parent,
            registry: self.registry,
            events: self.events,
            config: self.config,
            modifiers: self.modifiers,
            metadata: self.metadata,
        })
    }

    /// Build with a fresh event channel sized by `GraphConfig::event_buffer`
    pub fn build_with_events(mut self) -> (Graph, mpsc::Receiver<GraphEvent>) {
        let (tx, rx) = mpsc::channel(self.config.event_buffer.max(1));
        self.events = Some(tx);
        (self.build(), rx)
    }
}

impl Default for GraphBuilder {
    fn default() -> Self {
        Self::new()
    }
}
