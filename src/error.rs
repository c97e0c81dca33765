//! Error taxonomy for the benchmark harness.

use std::path::PathBuf;

use thiserror::Error;

/// Failure classes a harness run can surface. Callers match on the variant
/// to decide whether a failure is fatal to the test, the run, or neither.
#[derive(Error, Debug)]
pub enum HarnessError {
    /// A test definition or configuration violates a structural constraint.
    #[error("validation error: {0}")]
    Validation(String),

    /// The OS process query could not be executed or produced unusable output.
    #[error("process query failed: {0}")]
    ProcessQuery(String),

    /// A counter was never registered or its sampler failed.
    #[error("counter error: {0}")]
    Counter(String),

    /// The trace controller was given incomplete configuration.
    #[error("trace configuration error: {0}")]
    Config(String),

    /// The tracing tool binary is not present on disk.
    #[error("trace tool not found at {}", path.display())]
    ToolNotFound { path: PathBuf },

    /// A trace session with this name is already running.
    #[error("trace session {session} is already active")]
    TraceActive { session: String },

    /// An external tool ran but reported failure. Carries the invoked
    /// command and its raw output for diagnosis.
    #[error("tool invocation failed: `{command}`: {detail}")]
    ToolInvocation { command: String, detail: String },

    /// The browser process could not be started or exited abnormally.
    #[error("browser launch failed: {0}")]
    Launch(String),

    /// Browser identity metadata could not be resolved.
    #[error("browser metadata unavailable: {0}")]
    Metadata(String),
}

impl HarnessError {
    /// Create a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Create a process query error.
    pub fn process_query(message: impl Into<String>) -> Self {
        Self::ProcessQuery(message.into())
    }

    /// Create a counter error.
    pub fn counter(message: impl Into<String>) -> Self {
        Self::Counter(message.into())
    }

    /// Create a trace configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Create a launch error.
    pub fn launch(message: impl Into<String>) -> Self {
        Self::Launch(message.into())
    }

    /// Create a metadata resolution error.
    pub fn metadata(message: impl Into<String>) -> Self {
        Self::Metadata(message.into())
    }
}
