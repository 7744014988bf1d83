use serde::{Deserialize, Serialize};

/// Lifecycle notifications a graph sends to its event sink
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GraphEvent {
    GraphStarted {
        graph_id: String,
        timestamp: i64,
    },

    StepStarted {
        graph_id: String,
        step_id: String,
        kind: String,
        timestamp: i64,
    },

    StepInvoked {
        graph_id: String,
        step_id: String,
        kind: String,
        duration_ms: u64,
        timestamp: i64,
    },

    StepFailed {
        graph_id: String,
        step_id: String,
        kind: String,
        message: String,
        timestamp: i64,
    },

    GraphFinished {
        graph_id: String,
        status: GraphStatus,
        total_duration_ms: u64,
        timestamp: i64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GraphStatus {
    Success,
    Error,
}

impl GraphEvent {
    pub fn graph_id(&self) -> &str {
        match self {
            Self::GraphStarted { graph_id, .. }
            | Self::StepStarted { graph_id, .. }
            | Self::StepInvoked { graph_id, .. }
            | Self::StepFailed { graph_id, .. }
            | Self::GraphFinished { graph_id, .. } => graph_id,
        }
    }

    pub fn step_id(&self) -> Option<&str> {
        match self {
            Self::StepStarted { step_id, .. }
            | Self::StepInvoked { step_id, .. }
            | Self::StepFailed { step_id, .. } => Some(step_id),
            _ => None,
        }
    }
}

pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
