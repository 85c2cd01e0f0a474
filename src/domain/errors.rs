//! Domain errors for the evalsmith harness.

use thiserror::Error;

/// Domain-level errors that can occur while scheduling, executing and
/// recording evaluation tests.
#[derive(Debug, Error)]
pub enum DomainError {
    #[error("Test not found: {0}")]
    TestNotFound(String),

    #[error("Duplicate test id: {0}")]
    DuplicateTest(String),

    #[error("Invalid state transition for {id} from {from} to {to}")]
    InvalidStateTransition { id: String, from: String, to: String },

    #[error("Parent test {0} status is derived from its runs and cannot be set directly")]
    ParentStatusImmutable(String),

    #[error("Entity not found: {0}")]
    EntityNotFound(String),

    #[error("Dimension not found: {0}")]
    DimensionNotFound(String),

    #[error("Invalid dimension definition '{name}': {reason}")]
    InvalidDimension { name: String, reason: String },

    #[error("No test specifications found: {0}")]
    NoTestsFound(String),

    #[error("Agent invocation timed out after {timeout_ms}ms")]
    InvocationTimeout { timeout_ms: u64 },

    #[error("Agent invocation failed: {message}")]
    InvocationFailed { message: String, transient: bool },

    #[error("LLM request failed: {message}")]
    LlmRequestFailed { message: String, transient: bool },

    #[error("Missing credentials: {0}")]
    MissingCredentials(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Malformed specification document: {0}")]
    MalformedSpec(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Task queue is closed")]
    QueueClosed,

    #[error("Task {0} panicked")]
    TaskPanicked(String),
}

pub type DomainResult<T> = Result<T, DomainError>;

impl DomainError {
    /// Whether retrying the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::InvocationTimeout { .. } => true,
            Self::InvocationFailed { transient, .. } | Self::LlmRequestFailed { transient, .. } => {
                *transient
            }
            _ => false,
        }
    }

    /// Errors that indicate the runner and tracker (or store) disagree.
    pub fn is_desync(&self) -> bool {
        matches!(
            self,
            Self::TestNotFound(_)
                | Self::DuplicateTest(_)
                | Self::InvalidStateTransition { .. }
                | Self::ParentStatusImmutable(_)
                | Self::MalformedSpec(_)
        )
    }

    /// Stable snake_case name of the variant, recorded next to a failure.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::TestNotFound(_) => "test_not_found",
            Self::DuplicateTest(_) => "duplicate_test",
            Self::InvalidStateTransition { .. } => "invalid_state_transition",
            Self::ParentStatusImmutable(_) => "parent_status_immutable",
            Self::EntityNotFound(_) => "entity_not_found",
            Self::DimensionNotFound(_) => "dimension_not_found",
            Self::InvalidDimension { .. } => "invalid_dimension",
            Self::NoTestsFound(_) => "no_tests_found",
            Self::InvocationTimeout { .. } => "invocation_timeout",
            Self::InvocationFailed { .. } => "invocation_failed",
            Self::LlmRequestFailed { .. } => "llm_request_failed",
            Self::MissingCredentials(_) => "missing_credentials",
            Self::InvalidConfiguration(_) => "invalid_configuration",
            Self::MalformedSpec(_) => "malformed_spec",
            Self::Persistence(_) => "persistence",
            Self::SerializationError(_) => "serialization",
            Self::QueueClosed => "queue_closed",
            Self::TaskPanicked(_) => "task_panicked",
        }
    }

    /// The underlying message without the variant's display prefix.
    ///
    /// Adapter errors keep whatever the agent or provider reported; the
    /// remaining variants fall back to their display text.
    pub fn detail(&self) -> String {
        match self {
            Self::InvocationFailed { message, .. } | Self::LlmRequestFailed { message, .. } => {
                message.clone()
            }
            Self::MissingCredentials(message)
            | Self::InvalidConfiguration(message)
            | Self::Persistence(message) => message.clone(),
            other => other.to_string(),
        }
    }

    pub fn invocation(message: impl Into<String>, transient: bool) -> Self {
        Self::InvocationFailed {
            message: message.into(),
            transient,
        }
    }

    pub fn llm(message: impl Into<String>, transient: bool) -> Self {
        Self::LlmRequestFailed {
            message: message.into(),
            transient,
        }
    }
}

impl From<serde_json::Error> for DomainError {
    fn from(err: serde_json::Error) -> Self {
        DomainError::SerializationError(err.to_string())
    }
}

impl From<std::io::Error> for DomainError {
    fn from(err: std::io::Error) -> Self {
        DomainError::Persistence(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(DomainError::InvocationTimeout { timeout_ms: 10 }.is_transient());
        assert!(DomainError::invocation("connection reset", true).is_transient());
        assert!(!DomainError::invocation("bad input", false).is_transient());
        assert!(DomainError::llm("429", true).is_transient());
        assert!(!DomainError::DimensionNotFound("safety".into()).is_transient());
        assert!(!DomainError::TestNotFound("x".into()).is_transient());
    }

    #[test]
    fn test_detail_drops_display_prefix() {
        let err = DomainError::invocation("exit status 3: model overloaded", true);
        assert_eq!(err.detail(), "exit status 3: model overloaded");
        assert_eq!(err.kind(), "invocation_failed");

        let timeout = DomainError::InvocationTimeout { timeout_ms: 50 };
        assert_eq!(timeout.detail(), timeout.to_string());
        assert_eq!(timeout.kind(), "invocation_timeout");
    }

    #[test]
    fn test_desync_classification() {
        assert!(DomainError::TestNotFound("x".into()).is_desync());
        assert!(DomainError::MalformedSpec("bad".into()).is_desync());
        assert!(!DomainError::Persistence("disk full".into()).is_desync());
    }

    #[test]
    fn test_timeout_message_is_descriptive() {
        let err = DomainError::InvocationTimeout { timeout_ms: 60_000 };
        assert_eq!(err.to_string(), "Agent invocation timed out after 60000ms");
    }
}
