//! Step execution error types
//!
//! Error type for the step-operation seam, letting a provider indicate
//! whether a failure is recoverable (retried under the step's retry policy)
//! or unrecoverable (fails the step immediately).

use std::fmt;

/// Step operation error that can be either recoverable or unrecoverable
#[derive(Debug)]
pub struct StepError {
    inner: anyhow::Error,
    recoverable: bool,
}

impl StepError {
    /// Create a new unrecoverable step error
    ///
    /// Unrecoverable errors fail the step immediately without retrying.
    /// Use this for errors like:
    /// - Missing or invalid provider configuration (API keys, unknown model)
    /// - Invalid step input that won't change on retry
    pub fn unrecoverable(err: impl Into<anyhow::Error>) -> Self {
        Self {
            inner: err.into(),
            recoverable: false,
        }
    }

    /// Create a new recoverable step error
    ///
    /// Recoverable errors are retried according to the step's retry policy.
    /// Use this for transient provider failures and rate limiting.
    pub fn recoverable(err: impl Into<anyhow::Error>) -> Self {
        Self {
            inner: err.into(),
            recoverable: true,
        }
    }

    /// Check if this error is recoverable (should be retried)
    pub fn is_recoverable(&self) -> bool {
        self.recoverable
    }

    /// Get the inner error
    pub fn inner(&self) -> &anyhow::Error {
        &self.inner
    }

    /// Consume self and return the inner error
    pub fn into_inner(self) -> anyhow::Error {
        self.inner
    }
}

impl fmt::Display for StepError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.inner)
    }
}

impl std::error::Error for StepError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.inner.source()
    }
}

impl From<anyhow::Error> for StepError {
    /// Default conversion from anyhow::Error creates a recoverable error
    fn from(err: anyhow::Error) -> Self {
        Self::recoverable(err)
    }
}

/// Extension trait for Result to easily create unrecoverable step errors
pub trait StepResultExt<T> {
    /// Mark this result as unrecoverable on error
    fn unrecoverable(self) -> Result<T, StepError>;
}

impl<T, E: Into<anyhow::Error>> StepResultExt<T> for Result<T, E> {
    fn unrecoverable(self) -> Result<T, StepError> {
        self.map_err(|e| StepError::unrecoverable(e.into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unrecoverable_error() {
        let err = StepError::unrecoverable(anyhow::anyhow!("unknown model: gpt-imaginary"));
        assert!(!err.is_recoverable());
        assert!(err.to_string().contains("unknown model"));
    }

    #[test]
    fn recoverable_error() {
        let err = StepError::recoverable(anyhow::anyhow!("provider timeout"));
        assert!(err.is_recoverable());
    }

    #[test]
    fn from_anyhow_defaults_to_recoverable() {
        let err: StepError = anyhow::anyhow!("some error").into();
        assert!(err.is_recoverable());
    }

    #[test]
    fn result_ext() {
        let result: Result<(), anyhow::Error> = Err(anyhow::anyhow!("bad config"));
        let step_result = result.unrecoverable();
        assert!(!step_result.unwrap_err().is_recoverable());
    }
}
