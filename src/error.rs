use thiserror::Error;

use crate::protocol;

/// Errors surfaced by the post-master runtime
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// Name resolution failed
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// Transport-level socket failure
    #[error("socket error: {0}")]
    SocketError(String),

    /// Socket-level timeout (queued item expired before hitting the wire)
    #[error("socket timeout")]
    SocketTimeout,

    /// Peer closed the connection
    #[error("socket disconnected")]
    SocketDisconnected,

    /// Connection retries exhausted or attempted within the error window
    #[error("connection error")]
    ConnectionError,

    /// The transport rejected the connection during negotiation
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// Protocol-level error response from the server
    #[error("server error [{errno}]: {message}")]
    ErrorResponse { errno: u32, message: String },

    /// The response does not match what the request asked for
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// A frame that cannot be decoded
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// The server redirected us to a location we cannot parse
    #[error("invalid redirect url: {0}")]
    InvalidRedirectUrl(String),

    /// Stateful request issued against a restarted session
    #[error("invalid session")]
    InvalidSession,

    /// Redirect counter exhausted
    #[error("redirect limit reached")]
    RedirectLimit,

    /// The caller-supplied deadline has passed
    #[error("operation expired")]
    OperationExpired,

    /// The per-endpoint stream-id space is exhausted
    #[error("no free stream ids")]
    NoFreeSids,

    /// The runtime has not been started yet
    #[error("post master not initialized")]
    Uninitialized,

    /// Reserved for interactive front-ends built on top of the runtime
    #[error("unknown command: {0}")]
    UnknownCommand(String),
}

impl Error {
    /// Whether the error must not be retried at the current endpoint.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::InvalidAddress(_)
                | Error::ConnectionError
                | Error::Handshake(_)
                | Error::InvalidResponse(_)
                | Error::InvalidMessage(_)
                | Error::InvalidRedirectUrl(_)
                | Error::InvalidSession
                | Error::RedirectLimit
                | Error::OperationExpired
                | Error::NoFreeSids
                | Error::Uninitialized
        )
    }

    /// Whether a server error response may be retried once at the
    /// load balancer.
    pub fn is_recoverable_at_balancer(&self) -> bool {
        match self {
            Error::ErrorResponse { errno, .. } => matches!(
                *errno,
                protocol::ERR_FS_ERROR
                    | protocol::ERR_IO_ERROR
                    | protocol::ERR_SERVER_ERROR
                    | protocol::ERR_NOT_FOUND
            ),
            _ => false,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::TimedOut => Error::SocketTimeout,
            std::io::ErrorKind::UnexpectedEof => Error::SocketDisconnected,
            _ => Error::SocketError(e.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
