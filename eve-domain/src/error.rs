use thiserror::Error;

/// Error taxonomy of the trading pipeline. Every surfaced failure maps to
/// exactly one of these variants; the embedding layer translates `kind()`
/// identifiers to its own protocol.
///
/// Variants are `Clone` because populate results are fanned out to all
/// single-flight waiters of a region.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("authorization failed: {0}")]
    Auth(String),

    #[error("character is not docked")]
    NotDocked,

    #[error("rate limited by upstream: {0}")]
    RateLimited(String),

    #[error("transient upstream failure: {0}")]
    Transient(String),

    #[error("unexpected upstream response: {0}")]
    Protocol(String),

    #[error("dependency unavailable: {0}")]
    Unavailable(String),

    #[error("internal invariant violated: {0}")]
    Internal(String),
}

/// Stable machine identifiers, one per variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotFound,
    Validation,
    Auth,
    NotDocked,
    RateLimited,
    Transient,
    Protocol,
    Unavailable,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::Validation => "validation_error",
            ErrorKind::Auth => "auth_error",
            ErrorKind::NotDocked => "not_docked",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::Transient => "transient",
            ErrorKind::Protocol => "protocol_error",
            ErrorKind::Unavailable => "unavailable",
            ErrorKind::Internal => "internal",
        }
    }
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::Validation(_) => ErrorKind::Validation,
            Error::Auth(_) => ErrorKind::Auth,
            Error::NotDocked => ErrorKind::NotDocked,
            Error::RateLimited(_) => ErrorKind::RateLimited,
            Error::Transient(_) => ErrorKind::Transient,
            Error::Protocol(_) => ErrorKind::Protocol,
            Error::Unavailable(_) => ErrorKind::Unavailable,
            Error::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Failures the character context resolver may paper over with
    /// conservative defaults. Auth errors are never degradable.
    pub fn is_degradable(&self) -> bool {
        matches!(self, Error::Transient(_) | Error::RateLimited(_) | Error::Unavailable(_))
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Error::NotFound(what.into())
    }

    pub fn validation(what: impl Into<String>) -> Self {
        Error::Validation(what.into())
    }

    pub fn transient(what: impl Into<String>) -> Self {
        Error::Transient(what.into())
    }

    pub fn protocol(what: impl Into<String>) -> Self {
        Error::Protocol(what.into())
    }

    pub fn unavailable(what: impl Into<String>) -> Self {
        Error::Unavailable(what.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_identifiers_are_stable() {
        assert_eq!(Error::NotDocked.kind().as_str(), "not_docked");
        assert_eq!(Error::Auth("no token".into()).kind().as_str(), "auth_error");
        assert_eq!(Error::transient("boom").kind().as_str(), "transient");
    }

    #[test]
    fn auth_errors_are_never_degradable() {
        assert!(!Error::Auth("expired".into()).is_degradable());
        assert!(Error::transient("502").is_degradable());
        assert!(Error::RateLimited("420".into()).is_degradable());
    }
}
