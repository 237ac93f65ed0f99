pub mod annotator;
pub mod app;
pub mod collector;
pub mod config;
pub mod correlation;
pub mod db;
pub mod dedup;
pub mod error;
pub mod http;
pub mod metrics;
pub mod model;
pub mod normalizer;
pub mod pipeline;
pub mod rules;
pub mod sink;
pub mod source;
pub mod state;
pub mod stress;

// Re-export commonly used types for tests
pub use pipeline::{CycleSummary, Pipeline, PipelineHandle, PipelineParts};
pub use state::SharedState;
