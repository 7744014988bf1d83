pub mod config;
pub mod events;

pub use config::{ChatSettings, GraphConfig, DEFAULT_OUTPUT_KIND};
pub use events::{GraphEvent, GraphStatus};
