use agentflow_llm::RegistryError;
use thiserror::Error;

pub type Result<T, E = GraphError> = std::result::Result<T, E>;

/// Why a parent edge was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum EdgeRejection {
    #[error("a step cannot be its own parent")]
    SelfLoop,

    #[error("parent belongs to a different graph")]
    ForeignGraph,

    #[error("edge would close a cycle")]
    Cycle,
}

#[derive(Error, Debug)]
pub enum GraphError {
    #[error("No active graph in the current task")]
    NoActiveGraph,

    #[error("Graph context used outside of a context scope")]
    NoContextScope,

    #[error("Invalid edge {parent} -> {child}: {reason}")]
    InvalidEdge {
        parent: String,
        child: String,
        reason: EdgeRejection,
    },

    #[error("Step {0} has started executing; its parents can no longer change")]
    StructureFrozen(String),

    #[error(transparent)]
    Backend(#[from] anyhow::Error),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("No chat backend available for step {0}")]
    NoBackend(String),

    #[error("Graph did not settle within {0} rounds")]
    MaxRounds(usize),

    #[error("Unknown step kind: {0}")]
    UnknownStepKind(String),

    #[error("Step kind '{0}' cannot be serialized")]
    NotSerializable(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid graph config: {0}")]
    Config(#[from] toml::de::Error),

    #[error("Owning graph has been dropped")]
    GraphDropped,

    #[error("Modifier '{name}' failed")]
    Modifier {
        name: String,
        #[source]
        source: Box<GraphError>,
    },
}

impl GraphError {
    pub(crate) fn modifier(name: &str, source: GraphError) -> Self {
        Self::Modifier {
            name: name.to_string(),
            source: Box::new(source),
        }
    }
}
