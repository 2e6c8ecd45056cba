use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ExecError>;

#[derive(Error, Debug)]
pub enum ExecError {
    #[error("Python not installed or not found in PATH")]
    PythonNotFound,

    #[error("Submission is empty after normalization")]
    EmptySubmission,

    #[error("Syntax error in Python code: {message}")]
    SyntaxError { message: String, trace: String },

    #[error("Code execution failed: {message}")]
    RuntimeError { message: String, trace: String },

    #[error("Code executed successfully but produced no image. Make sure the code draws a matplotlib figure.")]
    NoImageProduced,

    #[error("Rendered output is not a PNG image")]
    InvalidImage,

    #[error("Execution timeout exceeded ({}s)", .0.as_secs())]
    Timeout(Duration),

    #[error("Memory limit exceeded")]
    MemoryLimitExceeded,

    #[error("Process killed by signal")]
    ProcessKilled,

    #[error("Log file not found: {0}")]
    LogFileNotFound(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    InternalError(String),
}

impl ExecError {
    /// Formatted trace text attached to the error, if the interpreter produced one
    pub fn trace(&self) -> Option<&str> {
        match self {
            ExecError::SyntaxError { trace, .. } | ExecError::RuntimeError { trace, .. } => {
                Some(trace.as_str())
            }
            _ => None,
        }
    }

    /// Whether the failure was caused by the submission rather than the service
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            ExecError::EmptySubmission
                | ExecError::SyntaxError { .. }
                | ExecError::RuntimeError { .. }
                | ExecError::NoImageProduced
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trace_only_on_interpreter_errors() {
        let err = ExecError::RuntimeError {
            message: "NameError: name 'foo' is not defined".to_string(),
            trace: "Traceback (most recent call last):\n...".to_string(),
        };
        assert!(err.trace().unwrap().starts_with("Traceback"));
        assert!(err.to_string().contains("NameError"));
        assert!(ExecError::NoImageProduced.trace().is_none());
    }

    #[test]
    fn test_user_error_classification() {
        assert!(ExecError::NoImageProduced.is_user_error());
        assert!(ExecError::EmptySubmission.is_user_error());
        assert!(!ExecError::Timeout(Duration::from_secs(3)).is_user_error());
        assert!(!ExecError::PythonNotFound.is_user_error());
    }

    #[test]
    fn test_timeout_message_mentions_seconds() {
        let err = ExecError::Timeout(Duration::from_secs(12));
        assert_eq!(err.to_string(), "Execution timeout exceeded (12s)");
    }
}
