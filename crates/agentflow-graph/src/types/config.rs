use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::policy::DEFAULT_JOIN_SEPARATOR;

/// Step kind whose leaves count as the graph's output by default
pub const DEFAULT_OUTPUT_KIND: &str = "chat";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphConfig {
    /// Upper bound on settle rounds; each round invokes every pending leaf
    pub max_rounds: usize,
    /// Capacity of the event channel created by `GraphBuilder::build_with_events`
    pub event_buffer: usize,
    pub default_kind: String,
    /// Separator used when System messages are merged
    pub join_separator: String,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            max_rounds: 50,
            event_buffer: 1000,
            default_kind: DEFAULT_OUTPUT_KIND.to_string(),
            join_separator: DEFAULT_JOIN_SEPARATOR.to_string(),
        }
    }
}

impl GraphConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a TOML document; missing keys keep their defaults.
    pub fn from_toml_str(source: &str) -> Result<Self> {
        Ok(toml::from_str(source)?)
    }

    pub fn with_max_rounds(mut self, max: usize) -> Self {
        self.max_rounds = max;
        self
    }

    pub fn with_event_buffer(mut self, capacity: usize) -> Self {
        self.event_buffer = capacity;
        self
    }

    pub fn with_default_kind(mut self, kind: impl Into<String>) -> Self {
        self.default_kind = kind.into();
        self
    }

    pub fn with_join_separator(mut self, separator: impl Into<String>) -> Self {
        self.join_separator = separator.into();
        self
    }
}

/// Sampling settings a chat step sends with every request
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatSettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

impl ChatSettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_temperature(mut self, temp: f32) -> Self {
        self.temperature = Some(temp);
        self
    }

    pub fn with_max_tokens(mut self, tokens: u32) -> Self {
        self.max_tokens = Some(tokens);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_toml_overrides_selected_keys() {
        let config = GraphConfig::from_toml_str(
            r#"
            max_rounds = 3
            default_kind = "transform"
            "#,
        )
        .unwrap();

        assert_eq!(config.max_rounds, 3);
        assert_eq!(config.default_kind, "transform");
        assert_eq!(config.event_buffer, 1000);
        assert_eq!(config.join_separator, "\n");
    }

    #[test]
    fn test_malformed_toml_is_a_config_error() {
        let err = GraphConfig::from_toml_str("max_rounds = \"many\"").unwrap_err();
        assert!(matches!(err, crate::error::GraphError::Config(_)));
    }
}
