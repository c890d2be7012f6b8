use crate::{ErrorKind, ErrorStatus};
use std::fmt;

/// Failure of an lmprog operation.
///
/// ```rust
/// use lmprog_error::{Error, ErrorKind, ErrorStatus};
///
/// let err = Error::new(ErrorKind::RateLimited, "429 from provider")
///     .with_operation("backend::generate")
///     .with_context("backend", "hosted-chat-v1");
///
/// assert_eq!(err.status(), ErrorStatus::Temporary);
/// assert_eq!(
///     err.to_string(),
///     "RateLimited (temporary) at backend::generate, context { backend: hosted-chat-v1 } => 429 from provider"
/// );
/// ```
pub struct Error {
    kind: ErrorKind,
    status: ErrorStatus,
    message: String,
    operation: &'static str,
    context: Vec<(&'static str, String)>,
    source: Option<anyhow::Error>,
}

impl Error {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            status: ErrorStatus::of(kind),
            message: message.into(),
            operation: "",
            context: Vec::new(),
            source: None,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn status(&self) -> ErrorStatus {
        self.status
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn operation(&self) -> &'static str {
        self.operation
    }

    pub fn context(&self) -> &[(&'static str, String)] {
        &self.context
    }

    pub fn source_ref(&self) -> Option<&anyhow::Error> {
        self.source.as_ref()
    }

    pub fn is_retryable(&self) -> bool {
        self.status.is_retryable()
    }

    /// Record where the error surfaced. An earlier operation is kept in the
    /// context under `called`, so the chain reads innermost first.
    pub fn with_operation(mut self, operation: &'static str) -> Self {
        if !self.operation.is_empty() {
            let inner = std::mem::replace(&mut self.operation, operation);
            self.context.push(("called", inner.to_string()));
        } else {
            self.operation = operation;
        }
        self
    }

    pub fn with_context(mut self, key: &'static str, value: impl Into<String>) -> Self {
        self.context.push((key, value.into()));
        self
    }

    /// Attach the underlying failure. Only one source is kept.
    pub fn set_source(mut self, source: impl Into<anyhow::Error>) -> Self {
        debug_assert!(self.source.is_none(), "error source set twice");
        self.source = Some(source.into());
        self
    }

    /// Force the error to be retried.
    pub fn temporary(mut self) -> Self {
        self.status = ErrorStatus::Temporary;
        self
    }

    /// Stop the error from being retried.
    pub fn permanent(mut self) -> Self {
        self.status = ErrorStatus::Permanent;
        self
    }
}

// ============================================================================
// Constructors
// ============================================================================

impl Error {
    pub fn unexpected(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unexpected, message)
    }

    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unsupported, message)
    }

    pub fn config_invalid(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ConfigInvalid, message)
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidArgument, message)
    }

    /// The offending reply is kept as context.
    pub fn extraction_failed(reply: impl Into<String>) -> Self {
        Self::new(ErrorKind::ExtractionFailed, "extract failed").with_context("reply", reply)
    }

    pub fn synthesis_binding(function: impl Into<String>) -> Self {
        let function = function.into();
        Self::new(
            ErrorKind::SynthesisBinding,
            format!("synthesized source does not define '{}'", function),
        )
        .with_context("function", function)
    }

    pub fn missing_return_binding(name: impl Into<String>) -> Self {
        let name = name.into();
        Self::new(ErrorKind::MissingReturnBinding, format!("execution did not bind '{}'", name))
            .with_context("return_val_name", name)
    }

    pub fn forbidden_identifier() -> Self {
        Self::new(ErrorKind::ForbiddenIdentifier, "double-underscore identifiers are not allowed")
    }

    pub fn reentrant(unit: impl Into<String>) -> Self {
        let unit = unit.into();
        Self::new(ErrorKind::ReentrantInvocation, format!("unit '{}' is already running", unit))
            .with_context("unit", unit)
    }

    pub fn parse_failed(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ParseFailed, message)
    }

    pub fn script_failed(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ScriptFailed, message)
    }

    pub fn inference_failed(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InferenceFailed, message)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        let kind = match err.kind() {
            std::io::ErrorKind::NotFound => ErrorKind::FileNotFound,
            std::io::ErrorKind::PermissionDenied => ErrorKind::PermissionDenied,
            _ => ErrorKind::IoFailed,
        };
        Error::new(kind, err.to_string()).set_source(err)
    }
}

// ============================================================================
// Formatting
// ============================================================================

/// One line: `Kind (status) at op, context { k: v, .. } => message`
impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}) at {}", self.kind, self.status, self.operation)?;
        if !self.context.is_empty() {
            let pairs: Vec<String> = self.context.iter().map(|(k, v)| format!("{}: {}", k, v)).collect();
            write!(f, ", context {{ {} }}", pairs.join(", "))?;
        }
        if !self.message.is_empty() {
            write!(f, " => {}", self.message)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} ({}) at {}", self.kind, self.status, self.operation)?;
        if !self.message.is_empty() {
            writeln!(f, "  message: {}", self.message)?;
        }
        for (key, value) in &self.context {
            writeln!(f, "  {}: {}", key, value)?;
        }
        if let Some(source) = &self.source {
            writeln!(f, "  source: {:?}", source)?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_ref().map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_takes_status_from_kind() {
        let err = Error::new(ErrorKind::ExtractionFailed, "extract failed");
        assert_eq!(err.message(), "extract failed");
        assert_eq!(err.status(), ErrorStatus::Permanent);
        assert!(Error::new(ErrorKind::NetworkFailed, "reset").is_retryable());
        assert!(!Error::forbidden_identifier().is_retryable());
    }

    #[test]
    fn test_operations_chain_innermost_first() {
        let err = Error::new(ErrorKind::IoFailed, "write failed")
            .with_operation("transcript::flush")
            .with_context("path", "out.txt")
            .with_operation("planner::run_episode");

        assert_eq!(err.operation(), "planner::run_episode");
        assert_eq!(
            err.context(),
            &[("path", "out.txt".to_string()), ("called", "transcript::flush".to_string())]
        );
    }

    #[test]
    fn test_status_overrides() {
        let err = Error::inference_failed("overloaded").temporary();
        assert!(err.is_retryable());
        assert!(!err.permanent().is_retryable());
    }

    #[test]
    fn test_display_without_context() {
        let err = Error::unsupported("no images").with_operation("backend::generate");
        assert_eq!(err.to_string(), "Unsupported (permanent) at backend::generate => no images");
    }

    #[test]
    fn test_named_constructors_keep_context() {
        let err = Error::missing_return_binding("ret_val");
        assert_eq!(err.kind(), ErrorKind::MissingReturnBinding);
        assert_eq!(err.context()[0], ("return_val_name", "ret_val".to_string()));

        let err = Error::reentrant("parse_position");
        assert!(err.message().contains("parse_position"));
        assert_eq!(Error::extraction_failed("```").context()[0].0, "reply");
    }

    #[test]
    fn test_io_conversion() {
        let err: Error = std::io::Error::new(std::io::ErrorKind::NotFound, "missing").into();
        assert_eq!(err.kind(), ErrorKind::FileNotFound);
        assert!(err.source_ref().is_some());
        assert!(std::error::Error::source(&err).is_some());
    }
}
