//! Error types for the evaluation harness

use thiserror::Error;
use tower::BoxError;

use crate::cache::CacheError;

/// Result type alias for the harness
pub type Result<T> = std::result::Result<T, HalpertError>;

/// Main error type for the harness
#[derive(Debug, Error)]
pub enum HalpertError {
    /// The completion service failed or could not be reached
    #[error("upstream completion failed: {0}")]
    Upstream(#[source] BoxError),

    /// The completion service answered with something we cannot interpret
    #[error("malformed completion response: {message}")]
    MalformedResponse { message: String },

    /// A function call failed with a domain error
    #[error("function {function} failed: {source}")]
    FunctionFailed {
        function: String,
        #[source]
        source: BoxError,
    },

    /// `evaluate` ran before every sample reported invocations and a quiz
    #[error("incomplete run: samples {missing:?} have not been run and submitted")]
    IncompleteRun { missing: Vec<usize> },

    /// A quiz outcome was submitted twice for one sample
    #[error("sample {index} was already submitted")]
    DuplicateSubmission { index: usize },

    /// A sample index outside the harness' sample list
    #[error("no sample at index {index}")]
    SampleOutOfRange { index: usize },

    /// Sample construction violated an invariant
    #[error("invalid sample {sample}: {message}")]
    InvalidSample { sample: String, message: String },

    /// Resetting the sample's backend failed
    #[error("preparing sample {sample} failed: {source}")]
    Preparation {
        sample: String,
        #[source]
        source: BoxError,
    },

    /// An agent run exceeded the caller-imposed deadline
    #[error("agent run timed out")]
    Timeout,

    /// Response cache failure
    #[error("cache error: {0}")]
    Cache(#[from] CacheError),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl HalpertError {
    pub fn malformed(message: impl Into<String>) -> Self {
        HalpertError::MalformedResponse {
            message: message.into(),
        }
    }

    /// Recover a `HalpertError` from a boxed tower error, wrapping foreign
    /// errors as upstream failures.
    pub fn from_boxed(err: BoxError) -> Self {
        match err.downcast::<HalpertError>() {
            Ok(e) => *e,
            Err(other) => HalpertError::Upstream(other),
        }
    }
}

impl From<async_openai::error::OpenAIError> for HalpertError {
    fn from(err: async_openai::error::OpenAIError) -> Self {
        HalpertError::Upstream(Box::new(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = HalpertError::IncompleteRun {
            missing: vec![1, 3],
        };
        assert_eq!(
            err.to_string(),
            "incomplete run: samples [1, 3] have not been run and submitted"
        );

        let err = HalpertError::FunctionFailed {
            function: "add".to_string(),
            source: "overflow".into(),
        };
        assert_eq!(err.to_string(), "function add failed: overflow");
    }

    #[test]
    fn test_error_from_openai() {
        let openai_err = async_openai::error::OpenAIError::InvalidArgument("test".to_string());
        let err: HalpertError = openai_err.into();
        assert!(matches!(err, HalpertError::Upstream(_)));
    }

    #[test]
    fn test_from_boxed_roundtrip() {
        let boxed: BoxError = Box::new(HalpertError::DuplicateSubmission { index: 4 });
        let err = HalpertError::from_boxed(boxed);
        assert!(matches!(err, HalpertError::DuplicateSubmission { index: 4 }));

        let foreign: BoxError = "connection reset".into();
        let err = HalpertError::from_boxed(foreign);
        assert!(matches!(err, HalpertError::Upstream(_)));
    }
}
