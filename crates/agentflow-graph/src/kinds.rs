//! Name-keyed constructors used to restore serialized steps.

use std::collections::HashMap;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::{GraphError, Result};
use crate::node::Node;
use crate::nodes::{ChatTurn, Turn};

pub type NodeConstructor = Arc<dyn Fn(Value) -> Result<Box<dyn Node>> + Send + Sync>;

#[derive(Clone, Default)]
pub struct StepKindRegistry {
    constructors: HashMap<String, NodeConstructor>,
}

impl StepKindRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the fixed turns and `chat`
    pub fn with_builtin() -> Self {
        let mut kinds = Self::new();
        for kind in [Turn::HUMAN, Turn::SYSTEM, Turn::ASSISTANT, Turn::TOOL_RESULT] {
            kinds.register_serde::<Turn>(kind);
        }
        kinds.register(ChatTurn::KIND, |data| Ok(Box::new(ChatTurn::from_record(data)?) as Box<dyn Node>));
        kinds
    }

    pub fn register<F>(&mut self, kind: impl Into<String>, constructor: F) -> &mut Self
    where
        F: Fn(Value) -> Result<Box<dyn Node>> + Send + Sync + 'static,
    {
        self.constructors.insert(kind.into(), Arc::new(constructor));
        self
    }

    /// Register a node whose record data is its own serde form
    pub fn register_serde<N>(&mut self, kind: impl Into<String>) -> &mut Self
    where
        N: Node + DeserializeOwned + 'static,
    {
        self.register(kind, |data| {
            let node: N = serde_json::from_value(data)?;
            Ok(Box::new(node) as Box<dyn Node>)
        })
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.constructors.contains_key(kind)
    }

    pub fn construct(&self, kind: &str, data: Value) -> Result<Box<dyn Node>> {
        let constructor = self
            .constructors
            .get(kind)
            .ok_or_else(|| GraphError::UnknownStepKind(kind.to_string()))?;
        constructor(data)
    }
}
