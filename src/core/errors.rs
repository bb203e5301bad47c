use std::path::PathBuf;
use thiserror::Error;

/// Unified error type for graph assembly, stage execution and training
#[derive(Debug, Error)]
pub enum LogisError {
    /// Required or mutually exclusive configuration keys missing or contradictory
    #[error("Configuration error: {message}")]
    Configuration {
        message: String,
        field: Option<String>,
    },

    /// Duplicate binding, undeclared port, unresolvable address or cycle
    #[error("Graph construction failed: {message}")]
    GraphConstruction {
        message: String,
        connection: Option<String>,
    },

    /// External tool or in-process stage failed
    #[error("Stage {node} failed: {message}")]
    StageExecution {
        node: String,
        message: String,
        exit_code: Option<i32>,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Feature, target and region columns disagree on rows
    #[error("Data alignment error: {message} (expected {expected} rows, found {actual})")]
    DataAlignment {
        message: String,
        expected: usize,
        actual: usize,
    },

    /// Classifier asked to learn from fewer than two classes
    #[error("Degenerate training data for {artifact:?}: {classes} distinct target class(es)")]
    TrainingDegenerate { artifact: PathBuf, classes: usize },

    #[error("IO operation failed: {operation}")]
    Io {
        operation: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Serialization failed: {format}")]
    Serialization {
        format: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Volume could not be read, written or interpreted
    #[error("Image error for {path:?}: {message}")]
    Image { path: PathBuf, message: String },

    #[error("Operation timed out: {operation} (timeout: {timeout_ms}ms)")]
    Timeout { operation: String, timeout_ms: u64 },
}

impl LogisError {
    /// Create a configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
            field: None,
        }
    }

    /// Create a configuration error naming the offending key
    pub fn configuration_field<S: Into<String>, F: Into<String>>(message: S, field: F) -> Self {
        Self::Configuration {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Create a graph construction error
    pub fn construction<S: Into<String>>(message: S) -> Self {
        Self::GraphConstruction {
            message: message.into(),
            connection: None,
        }
    }

    /// Create a graph construction error for a specific connection tuple
    pub fn construction_at<S: Into<String>, C: ToString>(message: S, connection: &C) -> Self {
        Self::GraphConstruction {
            message: message.into(),
            connection: Some(connection.to_string()),
        }
    }

    /// Create a stage execution error
    pub fn stage<N: Into<String>, M: Into<String>>(node: N, message: M) -> Self {
        Self::StageExecution {
            node: node.into(),
            message: message.into(),
            exit_code: None,
            source: None,
        }
    }

    /// Create a stage execution error carrying the tool's exit status
    pub fn stage_exit<N: Into<String>, M: Into<String>>(
        node: N,
        message: M,
        exit_code: Option<i32>,
    ) -> Self {
        Self::StageExecution {
            node: node.into(),
            message: message.into(),
            exit_code,
            source: None,
        }
    }

    /// Create a data alignment error
    pub fn alignment<S: Into<String>>(message: S, expected: usize, actual: usize) -> Self {
        Self::DataAlignment {
            message: message.into(),
            expected,
            actual,
        }
    }

    /// Create a degenerate training error
    pub fn degenerate<P: Into<PathBuf>>(artifact: P, classes: usize) -> Self {
        Self::TrainingDegenerate {
            artifact: artifact.into(),
            classes,
        }
    }

    /// Create an IO error
    pub fn io<S: Into<String>>(operation: S, source: std::io::Error) -> Self {
        Self::Io {
            operation: operation.into(),
            source,
        }
    }

    /// Create a serialization error
    pub fn serialization<S: Into<String>, E: std::error::Error + Send + Sync + 'static>(
        format: S,
        source: E,
    ) -> Self {
        Self::Serialization {
            format: format.into(),
            source: Box::new(source),
        }
    }

    /// Create an image error
    pub fn image<P: Into<PathBuf>, M: Into<String>>(path: P, message: M) -> Self {
        Self::Image {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout<S: Into<String>>(operation: S, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    /// Errors raised while the graph is being assembled. These abort the run.
    pub fn is_assembly_error(&self) -> bool {
        matches!(
            self,
            Self::Configuration { .. } | Self::GraphConstruction { .. }
        )
    }

    /// Get error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            Self::Configuration { .. } => "configuration",
            Self::GraphConstruction { .. } => "graph_construction",
            Self::StageExecution { .. } => "stage_execution",
            Self::DataAlignment { .. } => "data_alignment",
            Self::TrainingDegenerate { .. } => "training_degenerate",
            Self::Io { .. } => "io",
            Self::Serialization { .. } => "serialization",
            Self::Image { .. } => "image",
            Self::Timeout { .. } => "timeout",
        }
    }
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, LogisError>;

impl From<std::io::Error> for LogisError {
    fn from(err: std::io::Error) -> Self {
        Self::io("io_operation", err)
    }
}

impl From<serde_json::Error> for LogisError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization("json", err)
    }
}

impl From<serde_yaml::Error> for LogisError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::serialization("yaml", err)
    }
}

impl From<bincode::Error> for LogisError {
    fn from(err: bincode::Error) -> Self {
        Self::serialization("bincode", err)
    }
}

impl From<csv::Error> for LogisError {
    fn from(err: csv::Error) -> Self {
        Self::serialization("csv", err)
    }
}
