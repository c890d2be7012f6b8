//! Engine error types
//!
//! Re-exports lmprog-error and provides engine-specific conveniences.

pub use lmprog_error::{Error, ErrorKind, ErrorStatus, Result};

use crate::provider::ProviderError;

// =============================================================================
// Engine-specific error constructors
// =============================================================================

/// Convert a provider failure into an engine error, once, at the backend boundary.
pub fn provider_error(err: ProviderError) -> Error {
    let kind = match &err {
        ProviderError::Network(_) => ErrorKind::NetworkFailed,
        ProviderError::RateLimited { .. } => ErrorKind::RateLimited,
        ProviderError::AuthenticationFailed => ErrorKind::AuthenticationFailed,
        ProviderError::ModelNotFound(_) => ErrorKind::ProviderUnavailable,
        ProviderError::InvalidRequest(_) => ErrorKind::InvalidArgument,
        ProviderError::Parse(_) => ErrorKind::SerializationFailed,
        ProviderError::Api { .. } | ProviderError::Other(_) => ErrorKind::InferenceFailed,
    };
    let mut error = Error::new(kind, err.to_string());
    if let ProviderError::Api { status, .. } = &err {
        error = error.with_context("status", status.to_string());
    }
    error.set_source(err)
}

/// Create a ScriptFailed error from a Rhai evaluation error
pub fn script_failed(err: Box<rhai::EvalAltResult>) -> Error {
    let position = err.position();
    let mut error = Error::script_failed(err.to_string());
    if !position.is_none() {
        error = error.with_context("position", position.to_string());
    }
    error
}

/// Create a ParseFailed error from a Rhai parse error
pub fn parse_failed(err: rhai::ParseError) -> Error {
    Error::parse_failed(err.to_string()).with_context("position", err.1.to_string())
}

/// Create an IoFailed error with the offending path
pub fn io_error(path: &std::path::Path, err: std::io::Error) -> Error {
    Error::from(err).with_context("path", path.display().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_error_kinds() {
        assert_eq!(provider_error(ProviderError::Network("reset".into())).kind(), ErrorKind::NetworkFailed);
        assert_eq!(
            provider_error(ProviderError::RateLimited { retry_after: None }).kind(),
            ErrorKind::RateLimited
        );
        let err = provider_error(ProviderError::Api { status: 500, message: "boom".into() });
        assert_eq!(err.kind(), ErrorKind::InferenceFailed);
        assert!(!err.is_retryable());
        assert!(err.source_ref().is_some());
    }

    #[test]
    fn test_transient_provider_errors_are_retryable() {
        assert!(provider_error(ProviderError::Network("eof".into())).is_retryable());
        assert!(provider_error(ProviderError::RateLimited { retry_after: Some(1) }).is_retryable());
        assert!(!provider_error(ProviderError::AuthenticationFailed).is_retryable());
    }
}
