use thiserror::Error;

#[derive(Debug, Error)]
pub enum StepwiseError {
    // Configuration errors
    #[error("Step {step} has ambiguous invocation: {detail}")]
    InvocationAmbiguity { step: String, detail: String },

    #[error("Step not found: {0}")]
    UnknownStep(String),

    #[error("Function not found: {step}.{function}")]
    UnknownFunction { step: String, function: String },

    #[error("Parameter not found: {step}.{function}({parameter})")]
    UnknownParameter {
        step: String,
        function: String,
        parameter: String,
    },

    #[error("Thread '{thread}' is not declared for step {step}")]
    MissingThread { step: String, thread: String },

    #[error("Service not configured: {0}")]
    MissingService(String),

    #[error("Unsupported edge target: {0}")]
    UnsupportedEdgeTarget(String),

    #[error("Persisted process '{found}' does not match declared process '{expected}'")]
    ProcessIdentityMismatch { expected: String, found: String },

    #[error("Edge group already closed: {0}")]
    EdgeGroupClosed(String),

    #[error("Edge condition failed: {0}")]
    Condition(String),

    #[error("State update failed: {0}")]
    StateUpdate(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // Invocation failures
    #[error("Invocation failed: {step}.{function}: {message}")]
    Invocation {
        step: String,
        function: String,
        message: String,
    },

    #[error("Error event was not routed: {event}")]
    UnroutedError { event: String },

    // Termination
    #[error("Process cancelled")]
    Cancelled,

    #[error("Process run timed out after {0}s")]
    Timeout(u64),

    #[error("Process task failed: {0}")]
    TaskFailed(String),

    // Storage errors
    #[error("Storage error: {0}")]
    Storage(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl StepwiseError {
    /// Build an invocation failure for a callable.
    pub fn invocation(
        step: impl Into<String>,
        function: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Invocation {
            step: step.into(),
            function: function.into(),
            message: message.into(),
        }
    }

    /// Whether the run loop may treat this error as an expected termination.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

pub type Result<T> = std::result::Result<T, StepwiseError>;
