// Public modules
pub mod artifacts;
pub mod backend;
pub mod computation;
pub mod config;
pub mod context;
pub mod dispatch;
pub mod error;
pub mod graph;
pub mod job;
pub mod orchestrator;
pub mod partition;
pub mod policy;
pub mod stage;

// Re-export common types for convenience
pub use error::{Error, ErrorCode, Result};
