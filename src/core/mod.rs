// Infrastructure shared by graph assembly, execution and training

pub mod config;
pub mod errors;
pub mod logging;

// Re-export commonly used types
pub use config::{ExecutionConfig, MachineLearningConfig, PipelineConfig, ThickRegionMode};
pub use errors::{LogisError, Result};
