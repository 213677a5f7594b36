use thiserror::Error;

/// Main error type for the metric-loss crate
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MetricError {
    /// Shape-related errors with detailed suggestions
    #[error("Shape error: {0}")]
    ShapeError(String),

    /// Invalid input errors (bad margins, unknown loss names)
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Invalid state errors
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// IO errors
    #[error("IO error: {0}")]
    IoError(String),
}

impl MetricError {
    /// Create a shape error with helpful suggestions
    pub fn shape_error(expected: &str, got: &str, suggestion: Option<&str>) -> Self {
        let message = if let Some(sugg) = suggestion {
            format!("Expected {}, got {}. Suggestion: {}", expected, got, sugg)
        } else {
            format!("Expected {}, got {}", expected, got)
        };
        MetricError::ShapeError(message)
    }

    /// Create an invalid-input error for a margin that is negative or not finite
    pub fn invalid_margin(name: &str, value: f64) -> Self {
        MetricError::InvalidInput(format!(
            "Margin '{}' must be finite and non-negative, got {}",
            name, value
        ))
    }

    /// Error raised when `backward` runs without the values `forward` saves
    pub fn missing_saved(function: &str, what: &str) -> Self {
        MetricError::InvalidState(format!(
            "{}: no saved '{}' in context, call forward before backward",
            function, what
        ))
    }
}

impl From<std::io::Error> for MetricError {
    fn from(err: std::io::Error) -> Self {
        MetricError::IoError(err.to_string())
    }
}

impl From<serde_json::Error> for MetricError {
    fn from(err: serde_json::Error) -> Self {
        MetricError::SerializationError(err.to_string())
    }
}

/// Result type for metric-loss operations
pub type MetricResult<T> = Result<T, MetricError>;

/// Error context for providing additional debugging information
#[derive(Debug, Clone)]
pub struct ErrorContext {
    pub operation: String,
    pub tensor_shapes: Vec<String>,
    pub suggestions: Vec<String>,
}

impl ErrorContext {
    pub fn new(operation: &str) -> Self {
        Self {
            operation: operation.to_string(),
            tensor_shapes: Vec::new(),
            suggestions: Vec::new(),
        }
    }

    pub fn with_shape(mut self, name: &str, shape: impl std::fmt::Display) -> Self {
        self.tensor_shapes.push(format!("{}={}", name, shape));
        self
    }

    pub fn with_suggestion(mut self, suggestion: &str) -> Self {
        self.suggestions.push(suggestion.to_string());
        self
    }

    pub fn to_error_message(&self) -> String {
        let mut message = format!("Operation: {}", self.operation);

        if !self.tensor_shapes.is_empty() {
            message.push_str(&format!("\nTensor shapes: {}", self.tensor_shapes.join(", ")));
        }

        if !self.suggestions.is_empty() {
            message.push_str("\nSuggestions:");
            for suggestion in &self.suggestions {
                message.push_str(&format!("\n  - {}", suggestion));
            }
        }

        message
    }
}

/// Helper trait for adding context to errors
pub trait WithContext<T> {
    fn with_context<F>(self, f: F) -> MetricResult<T>
    where
        F: FnOnce() -> ErrorContext;
}

impl<T> WithContext<T> for MetricResult<T> {
    fn with_context<F>(self, f: F) -> MetricResult<T>
    where
        F: FnOnce() -> ErrorContext,
    {
        self.map_err(|e| {
            let context = f();
            match e {
                MetricError::ShapeError(msg) => {
                    MetricError::ShapeError(format!("{}\nContext: {}", msg, context.to_error_message()))
                }
                MetricError::InvalidInput(msg) => {
                    MetricError::InvalidInput(format!("{}\nContext: {}", msg, context.to_error_message()))
                }
                _ => e,
            }
        })
    }
}

/// Error codes for programmatic error handling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    ShapeMismatch,
    InvalidOperation,
    ConfigInvalid,
    SerializationFailed,
    IoFailed,
}

impl MetricError {
    /// Get the error code for this error
    pub fn code(&self) -> ErrorCode {
        match self {
            MetricError::ShapeError(_) => ErrorCode::ShapeMismatch,
            MetricError::InvalidInput(_) => ErrorCode::InvalidOperation,
            MetricError::InvalidState(_) => ErrorCode::InvalidOperation,
            MetricError::ConfigurationError(_) => ErrorCode::ConfigInvalid,
            MetricError::SerializationError(_) => ErrorCode::SerializationFailed,
            MetricError::IoError(_) => ErrorCode::IoFailed,
        }
    }

    /// Check if this is a recoverable error.
    ///
    /// A shape mismatch means the training step is malformed and must abort;
    /// only configuration and IO problems can be fixed and retried by the caller.
    pub fn is_recoverable(&self) -> bool {
        matches!(self.code(), ErrorCode::ConfigInvalid | ErrorCode::IoFailed)
    }

    /// Get a user-friendly error message
    pub fn user_message(&self) -> String {
        match self {
            MetricError::ShapeError(msg) => {
                format!("Shape Error: {}\n\nEmbeddings must be laid out as query (batch, 1, dim), positives (batch, num_pos, dim) and negatives (batch, num_neg, dim) with matching batch and dim.", msg)
            }
            MetricError::InvalidInput(msg) => {
                format!("Invalid Input: {}\n\nThe input provided is not valid for this operation. Please check your arguments and data.", msg)
            }
            MetricError::InvalidState(msg) => {
                format!("Invalid State: {}\n\nThe operation could not be performed because the system is in an invalid state. Please check your workflow.", msg)
            }
            _ => self.to_string(),
        }
    }
}
