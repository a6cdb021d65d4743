//! Error handling for sigtap
//!
//! This module defines the crate error type and a Result alias used
//! throughout the acquisition worker and its collaborators.

use thiserror::Error;

/// Main error type for sigtap operations
#[derive(Error, Debug)]
pub enum AcqError {
    /// An acquisition mode string that is not one of the known modes
    #[error("Invalid acquisition mode '{0}'")]
    InvalidAcquisitionMode(String),

    /// A subscription filter field that could not be interpreted
    #[error("Invalid filter field '{field}': '{value}'")]
    InvalidFilter { field: String, value: String },

    /// A tag or setting key present with an unexpected stored type
    #[error("Unexpected type for '{key}' (expected {expected})")]
    TypeMismatch { key: String, expected: &'static str },

    /// A graph description that could not be turned into a graph
    #[error("Could not parse flow graph: {0}")]
    GraphDescription(String),

    /// Errors raised while instantiating or talking to a scheduler
    #[error("Scheduler error: {0}")]
    Scheduler(String),

    /// Errors related to configuration loading/saving
    #[error("Configuration error: {0}")]
    Config(String),

    /// Errors related to channel communication
    #[error("Channel error: {0}")]
    Channel(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Generic errors with context
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<AcqError>,
    },
}

impl AcqError {
    /// Add context to an error
    pub fn with_context(self, context: impl Into<String>) -> Self {
        AcqError::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Shorthand for a filter validation error
    pub fn invalid_filter(field: impl Into<String>, value: impl Into<String>) -> Self {
        AcqError::InvalidFilter {
            field: field.into(),
            value: value.into(),
        }
    }

    /// Whether this error (or the error it wraps) is a graph description error
    pub fn is_graph_description(&self) -> bool {
        match self {
            AcqError::GraphDescription(_) => true,
            AcqError::WithContext { source, .. } => source.is_graph_description(),
            _ => false,
        }
    }
}

/// Result type alias for sigtap operations
pub type Result<T> = std::result::Result<T, AcqError>;

/// Extension trait for adding context to Results
pub trait ResultExt<T> {
    /// Add context to an error result
    fn context(self, context: impl Into<String>) -> Result<T>;

    /// Add context lazily to an error result
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.with_context(context))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| e.with_context(f()))
    }
}

impl<T> ResultExt<T> for std::result::Result<T, toml::de::Error> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| AcqError::Serialization(e.to_string()).with_context(context))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| AcqError::Serialization(e.to_string()).with_context(f()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = AcqError::InvalidAcquisitionMode("burst".to_string());
        assert_eq!(err.to_string(), "Invalid acquisition mode 'burst'");
    }

    #[test]
    fn test_error_with_context() {
        let err = AcqError::Config("bad period".to_string());
        let with_ctx = err.with_context("Failed to load config");
        assert!(with_ctx.to_string().contains("Failed to load config"));
        assert!(with_ctx.to_string().contains("bad period"));
    }

    #[test]
    fn test_type_mismatch_error() {
        let err = AcqError::TypeMismatch {
            key: "signal_min".to_string(),
            expected: "float",
        };
        assert!(err.to_string().contains("signal_min"));
        assert!(err.to_string().contains("float"));
    }

    #[test]
    fn test_graph_description_detection() {
        let err = AcqError::GraphDescription("missing type".into()).with_context("set graph");
        assert!(err.is_graph_description());
        assert!(!AcqError::Channel("closed".into()).is_graph_description());
    }
}
