use std::time::Duration;

/// Shared error type used across all graph-node crates.
///
/// Per-connection failures (`HandshakeMismatch`, `ProtocolViolation`, `Io`)
/// are logged and terminate only the affected connection; they reach a caller
/// only when the caller itself owns that connection (e.g. a service call).
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("registry unavailable at {uri}: {reason}")]
    RegistryUnavailable { uri: String, reason: String },

    #[error("slave server not bound within {0:?}")]
    RegistrationTimeout(Duration),

    #[error("handshake mismatch: {0}")]
    HandshakeMismatch(String),

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("service call failed: {0}")]
    ServiceCallFailed(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("duplicate node name: {0}")]
    DuplicateNodeName(String),

    #[error("invalid name {name:?}: {reason}")]
    InvalidName { name: String, reason: String },

    #[error("parameter not set: {0}")]
    ParamNotSet(String),

    #[error("registry returned code {code}: {message}")]
    Registry { code: i32, message: String },

    #[error("RPC: {0}")]
    Rpc(String),

    #[error("decode: {0}")]
    Decode(String),

    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("config: {0}")]
    Config(String),

    #[error("node is shut down")]
    Shutdown,
}

impl Error {
    /// Whether this error came from a refused TCP connection.
    ///
    /// Service clients use this to invalidate a cached service address.
    pub fn is_connection_refused(&self) -> bool {
        matches!(self, Error::Io(e) if e.kind() == std::io::ErrorKind::ConnectionRefused)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_refused_is_detected() {
        let err = Error::Io(std::io::Error::from(std::io::ErrorKind::ConnectionRefused));
        assert!(err.is_connection_refused());
        let other = Error::Io(std::io::Error::from(std::io::ErrorKind::BrokenPipe));
        assert!(!other.is_connection_refused());
        assert!(!Error::Shutdown.is_connection_refused());
    }

    #[test]
    fn registry_error_display_carries_code() {
        let err = Error::Registry {
            code: -1,
            message: "no provider".into(),
        };
        assert_eq!(err.to_string(), "registry returned code -1: no provider");
    }
}
