//! Error taxonomy for the relay core.
//!
//! Nothing in here is fatal to the process. The relay maps each variant to
//! either a `bncWarn` (lookup failures, bad identifiers) or a `bncErr`
//! (store and upstream trouble) for the session that caused it.

/// Errors surfaced by relay operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BncError {
    /// A raw channel reference could not be split into `network:channel`.
    #[error("malformed channel identifier: {0:?}")]
    MalformedIdentifier(String),

    /// An operation named a network that is not configured.
    #[error("network not found: {0}")]
    NetworkNotFound(String),

    /// The channel is not configured, or has no tracked roster.
    #[error("channel not found: {0}")]
    ChannelNotFound(String),

    /// A read or write against the durable store (or config file) failed.
    #[error("persistence failure: {0}")]
    PersistenceFailure(String),

    /// The upstream connection reported a protocol-level error.
    #[error("upstream protocol error: {0}")]
    UpstreamProtocolError(String),
}

impl BncError {
    /// Lookup-style failures are reported as warnings and turn the
    /// requested operation into a no-op.
    pub fn is_warning(&self) -> bool {
        matches!(
            self,
            BncError::MalformedIdentifier(_)
                | BncError::NetworkNotFound(_)
                | BncError::ChannelNotFound(_)
        )
    }
}

impl From<rusqlite::Error> for BncError {
    fn from(e: rusqlite::Error) -> Self {
        BncError::PersistenceFailure(e.to_string())
    }
}

impl From<std::io::Error> for BncError {
    fn from(e: std::io::Error) -> Self {
        BncError::PersistenceFailure(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, BncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_errors_are_warnings() {
        assert!(BncError::NetworkNotFound("oftc".into()).is_warning());
        assert!(BncError::ChannelNotFound("oftc:#x".into()).is_warning());
        assert!(BncError::MalformedIdentifier("nope".into()).is_warning());
        assert!(!BncError::PersistenceFailure("disk full".into()).is_warning());
        assert!(!BncError::UpstreamProtocolError("433".into()).is_warning());
    }

    #[test]
    fn io_errors_become_persistence_failures() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only");
        let err: BncError = io.into();
        assert!(matches!(err, BncError::PersistenceFailure(ref m) if m.contains("read-only")));
    }
}
