use std::fmt;

macro_rules! error_kinds {
    ($($(#[$meta:meta])* $name:ident,)*) => {
        /// What went wrong. Callers branch on this, never on messages.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[non_exhaustive]
        pub enum ErrorKind {
            $($(#[$meta])* $name,)*
        }

        impl ErrorKind {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(ErrorKind::$name => stringify!($name),)*
                }
            }
        }
    };
}

error_kinds! {
    Unexpected,
    Unsupported,
    ConfigInvalid,
    InvalidArgument,
    SerializationFailed,

    // ---- synthesis -------------------------------------------------------
    /// The reply opened a code fence but nothing usable was inside
    ExtractionFailed,
    /// Synthesized source ran but never defined the requested function
    SynthesisBinding,
    /// Executed code did not bind the unit's return name
    MissingReturnBinding,
    /// A unit was called again while still running
    ReentrantInvocation,

    // ---- execution -------------------------------------------------------
    /// Source mentions a `__` identifier
    ForbiddenIdentifier,
    ParseFailed,
    ScriptFailed,

    // ---- inference -------------------------------------------------------
    InferenceFailed,
    ProviderUnavailable,
    RateLimited,
    AuthenticationFailed,

    // ---- io --------------------------------------------------------------
    FileNotFound,
    PermissionDenied,
    IoFailed,
    NetworkFailed,
}

impl ErrorKind {
    pub fn is_retryable(&self) -> bool {
        crate::ErrorStatus::of(*self).is_retryable()
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_match_variants() {
        assert_eq!(ErrorKind::ExtractionFailed.to_string(), "ExtractionFailed");
        assert_eq!(ErrorKind::MissingReturnBinding.as_str(), "MissingReturnBinding");
    }

    #[test]
    fn test_only_transient_kinds_retry() {
        assert!(ErrorKind::NetworkFailed.is_retryable());
        assert!(ErrorKind::RateLimited.is_retryable());
        assert!(!ErrorKind::InferenceFailed.is_retryable());
        assert!(!ErrorKind::ForbiddenIdentifier.is_retryable());
    }
}
