/// Provider-specific error with retry classification
///
/// Dispatchers use `is_retryable()` to decide whether to abandon the work item
/// and try again later, or to give up on it.
///
/// **Retryable**: lock contention, transient I/O failures.
///
/// **Non-retryable**: unknown instance or lock token, duplicate instance,
/// history cap exceeded, unreadable persisted data.
///
/// ```rust
/// use durable_fanout::providers::ProviderError;
///
/// let err = ProviderError::permanent("ack_orchestration_item", "history cap exceeded");
/// assert!(!err.is_retryable());
/// assert_eq!(err.to_string(), "ack_orchestration_item: history cap exceeded");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderError {
    /// Operation that failed (e.g., "ack_orchestration_item")
    pub operation: String,
    pub message: String,
    pub retryable: bool,
}

impl ProviderError {
    /// Create a retryable (transient) error
    pub fn retryable(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            message: message.into(),
            retryable: true,
        }
    }

    /// Create a non-retryable (permanent) error
    pub fn permanent(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            message: message.into(),
            retryable: false,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.retryable
    }

    /// Convert to `ErrorDetails::Infrastructure` for instance failure reporting
    pub fn to_infrastructure_error(&self) -> crate::ErrorDetails {
        crate::ErrorDetails::Infrastructure {
            operation: self.operation.clone(),
            message: self.message.clone(),
            retryable: self.retryable,
        }
    }
}

impl std::fmt::Display for ProviderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.operation, self.message)
    }
}

impl std::error::Error for ProviderError {}

impl From<std::io::Error> for ProviderError {
    /// I/O errors are treated as transient.
    fn from(e: std::io::Error) -> Self {
        ProviderError::retryable("io", e.to_string())
    }
}
