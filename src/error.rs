//! Error types for qtcov.
//!
//! Every stage of a cycle reports failures through [`QtcovError`], so the
//! orchestrator can decide per variant whether to stop, degrade to a
//! partial result, or attempt the single launch remediation.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for qtcov operations
#[derive(Error, Debug)]
pub enum QtcovError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Missing or invalid configuration
    #[error("Configuration error: {message}")]
    Config {
        message: String,
        path: Option<PathBuf>,
    },

    /// Invalid configuration value
    #[error("Invalid configuration: {field} - {reason}")]
    InvalidConfig { field: String, reason: String },

    // =========================================================================
    // Prompt Document Errors
    // =========================================================================
    /// Required file does not exist
    #[error("File not found: {path}")]
    NotFound { path: PathBuf },

    /// Document exists but could not be parsed
    #[error("Failed to parse {path}: {message}")]
    Parse { path: PathBuf, message: String },

    /// Task is not present in the prompt document
    #[error("Unknown task '{task}' (available: {})", .available.join(", "))]
    UnknownTask {
        task: String,
        available: Vec<String>,
    },

    // =========================================================================
    // LLM Errors
    // =========================================================================
    /// No credential configured for the provider
    #[error("No credential configured for {provider}")]
    Auth { provider: String },

    /// Provider answered with a non-2xx status or an unusable body
    #[error("{provider} request failed{}: {message}", .status.map(|s| format!(" (HTTP {})", s)).unwrap_or_default())]
    Provider {
        provider: String,
        status: Option<u16>,
        message: String,
    },

    /// LLM response did not contain a usable test source
    #[error("Could not extract test source: {message}")]
    Extraction { message: String },

    // =========================================================================
    // Process Errors
    // =========================================================================
    /// Operation exceeded its deadline
    #[error("{operation} timed out after {secs}s")]
    Timeout { operation: String, secs: u64 },

    /// External tool binary could not be located
    #[error("Tool not found: {tool}")]
    ToolNotFound { tool: String },

    /// Process could not be started or terminated abnormally
    #[error("Failed to execute {program}: {message}")]
    Execution { program: String, message: String },

    /// Process launch failed because a runtime dependency is missing
    #[error("Runtime environment error for {program}: {message}{}", .library.as_ref().map(|l| format!(" (missing {})", l)).unwrap_or_default())]
    Environment {
        program: String,
        message: String,
        library: Option<String>,
    },

    // =========================================================================
    // Wrapped Errors
    // =========================================================================
    /// IO error wrapper
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// JSON error wrapper
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// Generic error wrapper
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl QtcovError {
    // =========================================================================
    // Constructor helpers
    // =========================================================================

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            path: None,
        }
    }

    /// Create a configuration error with path
    pub fn config_with_path(message: impl Into<String>, path: PathBuf) -> Self {
        Self::Config {
            message: message.into(),
            path: Some(path),
        }
    }

    /// Create a parse error for a document
    pub fn parse(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Parse {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Create a provider error
    pub fn provider(
        provider: impl Into<String>,
        status: Option<u16>,
        message: impl Into<String>,
    ) -> Self {
        Self::Provider {
            provider: provider.into(),
            status,
            message: message.into(),
        }
    }

    /// Create an extraction error
    pub fn extraction(message: impl Into<String>) -> Self {
        Self::Extraction {
            message: message.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(operation: impl Into<String>, secs: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            secs,
        }
    }

    /// Create an execution error
    pub fn execution(program: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Execution {
            program: program.into(),
            message: message.into(),
        }
    }

    /// Create an environment error
    pub fn environment(
        program: impl Into<String>,
        message: impl Into<String>,
        library: Option<String>,
    ) -> Self {
        Self::Environment {
            program: program.into(),
            message: message.into(),
            library,
        }
    }

    // =========================================================================
    // Classification helpers
    // =========================================================================

    /// Check if this error qualifies for the one-shot runtime remediation
    pub fn is_remediable(&self) -> bool {
        matches!(self, Self::Environment { .. })
    }

    /// Check if this error is caused by configuration the user must fix
    pub fn requires_configuration(&self) -> bool {
        matches!(
            self,
            Self::Config { .. }
                | Self::InvalidConfig { .. }
                | Self::Auth { .. }
                | Self::ToolNotFound { .. }
        )
    }

    /// Name of the missing runtime library, if the loader reported one
    pub fn missing_library(&self) -> Option<&str> {
        match self {
            Self::Environment { library, .. } => library.as_deref(),
            _ => None,
        }
    }

    /// Get error code for exit status
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config { .. } | Self::InvalidConfig { .. } | Self::Auth { .. } => 3,
            Self::NotFound { .. } | Self::UnknownTask { .. } => 4,
            Self::Parse { .. } => 5,
            Self::ToolNotFound { .. } => 6,
            Self::Timeout { .. } => 7,
            Self::Environment { .. } => 8,
            _ => 1,
        }
    }
}

/// Type alias for qtcov results
pub type Result<T> = std::result::Result<T, QtcovError>;
