//! Transport-level client errors.

use std::io;

use outward_common::{EnhancedCode, Status};
use thiserror::Error;

/// Errors that poison an SMTP session.
///
/// Server replies with 4xx/5xx codes are not represented here; they come
/// back as ordinary [`Response`](crate::Response) values. Any variant of
/// this type means the session state is unknown and the connection must not
/// be reused.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("malformed server response: {0}")]
    Parse(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("connection closed unexpectedly")]
    ConnectionClosed,

    #[error("response is not valid UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),
}

/// The delivery status a transport failure maps to: always temporary (the
/// remote host may recover), with the enhanced code distinguishing
/// network, TLS and protocol-syntax causes.
impl From<ClientError> for Status {
    fn from(err: ClientError) -> Self {
        match err {
            ClientError::Io(cause) => Self::new(
                451,
                EnhancedCode(4, 4, 2),
                format!("I/O error: {cause}"),
            ),
            ClientError::ConnectionClosed => Self::new(
                451,
                EnhancedCode(4, 4, 2),
                "Connection closed unexpectedly",
            ),
            ClientError::Tls(cause) => Self::new(
                454,
                EnhancedCode(4, 7, 0),
                format!("TLS negotiation failed: {cause}"),
            ),
            ClientError::Parse(cause) => Self::new(
                451,
                EnhancedCode(4, 5, 2),
                format!("Malformed server response: {cause}"),
            ),
            ClientError::Utf8(cause) => Self::new(
                451,
                EnhancedCode(4, 5, 2),
                format!("Malformed server response: {cause}"),
            ),
        }
    }
}

/// Specialized `Result` type for SMTP client operations.
pub type Result<T> = std::result::Result<T, ClientError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_failures_map_to_temporary_statuses() {
        let status = Status::from(ClientError::ConnectionClosed);
        assert_eq!(status.code, 451);
        assert_eq!(status.enhanced, EnhancedCode(4, 4, 2));
        assert!(status.is_temporary());

        let status = Status::from(ClientError::Tls("handshake refused".into()));
        assert_eq!(status.code, 454);
        assert_eq!(status.enhanced, EnhancedCode(4, 7, 0));
        assert!(status.is_temporary());
    }

    #[test]
    fn io_error_keeps_its_cause_in_the_message() {
        let err = ClientError::Io(io::Error::new(io::ErrorKind::ConnectionReset, "reset"));
        let status = Status::from(err);
        assert!(status.message.contains("reset"));
    }
}
