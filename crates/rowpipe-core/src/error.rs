//! Error types for pipeline operations.
//!
//! Every component boundary in rowpipe returns `Result<T, PipeError>`. The
//! variants are coarse error kinds rather than per-module types, so callers
//! can classify an error (configuration vs. runtime vs. cancellation) without
//! knowing which component raised it.

/// Result alias used across the workspace.
pub type Result<T, E = PipeError> = std::result::Result<T, E>;

/// Error kinds raised by readers, writers, transformers and the engine.
#[derive(Debug, thiserror::Error)]
pub enum PipeError {
    /// A caller-supplied value is unusable (empty query, bad batch size, ...).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The pipeline configuration itself is contradictory or incomplete.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// The operation is not available on this component.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// A referenced resource (file, table, provider) does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Raised by `Writer::initialize` when the source schema cannot be
    /// written to the target under the selected strategy.
    #[error("schema incompatible: {0}")]
    SchemaIncompatible(String),

    /// A value could not be represented in the requested logical type.
    #[error("type mismatch: {0}")]
    TypeMismatch(String),

    /// The sink rejected one or more rows (unique/null/foreign constraints).
    #[error("constraint violation: {0}")]
    ConstraintViolation(String),

    /// A user script failed while evaluating a row.
    #[error("script '{id}' failed at row {row}: {message}")]
    Script {
        id: String,
        row: usize,
        message: String,
    },

    /// A user script exceeded the per-invocation time limit.
    #[error("script '{id}' exceeded the evaluation time limit")]
    ScriptTimeout { id: String },

    /// A failure that is expected to succeed on retry (I/O hiccup, lock
    /// contention, connection drop).
    #[error("transient failure: {0}")]
    Transient(String),

    #[error("cancelled")]
    Cancelled,

    /// The source or target content cannot be parsed at all.
    #[error("corrupt data: {0}")]
    Corrupt(String),

    /// A failure with a per-row diagnostic attached. The original cause is
    /// preserved as the source.
    #[error("{diagnostic}")]
    Diagnosed {
        diagnostic: String,
        #[source]
        source: Box<PipeError>,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl PipeError {
    /// Attach a row-level diagnostic without losing the original cause.
    pub fn with_diagnostic(self, diagnostic: impl Into<String>) -> Self {
        PipeError::Diagnosed {
            diagnostic: diagnostic.into(),
            source: Box::new(self),
        }
    }

    /// The innermost non-`Diagnosed` error.
    pub fn root(&self) -> &PipeError {
        match self {
            PipeError::Diagnosed { source, .. } => source.root(),
            other => other,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.root(), PipeError::Cancelled)
    }

    /// Configuration-class errors: the run would fail identically if retried.
    pub fn is_config(&self) -> bool {
        matches!(
            self.root(),
            PipeError::InvalidArgument(_)
                | PipeError::InvalidConfiguration(_)
                | PipeError::Unsupported(_)
                | PipeError::SchemaIncompatible(_)
        )
    }

    /// Whether the write retry policy may re-attempt after this error.
    /// Anything that is neither cancellation nor configuration qualifies.
    pub fn is_retryable(&self) -> bool {
        !self.is_cancelled() && !self.is_config()
    }

    /// Process exit code mandated for this error kind.
    pub fn exit_code(&self) -> i32 {
        match self.root() {
            PipeError::Cancelled => 130,
            PipeError::InvalidArgument(_)
            | PipeError::InvalidConfiguration(_)
            | PipeError::Unsupported(_)
            | PipeError::NotFound(_)
            | PipeError::SchemaIncompatible(_) => 1,
            _ => 2,
        }
    }
}

/// Redact a connection string for display in error messages and logs.
///
/// Keyring references carry no secret material and are shown verbatim;
/// everything else is truncated to its first ten characters.
pub fn redact_connection_string(s: &str) -> String {
    if s.starts_with("keyring://") {
        s.to_string()
    } else if s.chars().count() > 10 {
        let prefix: String = s.chars().take(10).collect();
        format!("{prefix}...")
    } else {
        s.to_string()
    }
}
