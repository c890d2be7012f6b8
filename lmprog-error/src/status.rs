use crate::ErrorKind;
use std::fmt;

/// Whether repeating the failed call can succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorStatus {
    Permanent,
    /// Throttling or a dropped connection; the call may go through later.
    Temporary,
}

impl ErrorStatus {
    /// Status a fresh error of `kind` starts with.
    pub fn of(kind: ErrorKind) -> Self {
        match kind {
            ErrorKind::NetworkFailed | ErrorKind::RateLimited => ErrorStatus::Temporary,
            _ => ErrorStatus::Permanent,
        }
    }

    pub fn is_retryable(self) -> bool {
        self == ErrorStatus::Temporary
    }
}

impl fmt::Display for ErrorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ErrorStatus::Permanent => "permanent",
            ErrorStatus::Temporary => "temporary",
        })
    }
}
