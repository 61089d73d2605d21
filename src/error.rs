use std::io;

use http::{Method, StatusCode};
use n0_error::{AnyError, e, stack_error};

/// Errors raised while serving one proxied exchange.
///
/// The variants separate the retry decision (transient vs. fatal) from the
/// reply decision ([`response_status`](Self::response_status)): a worker
/// loops on transient errors, reconnects on peer-closed upstreams, and
/// synthesizes an error response for everything that maps to a status code.
#[stack_error(derive, add_meta)]
#[non_exhaustive]
pub enum ProxyError {
    /// The operation would block; retry.
    #[error("operation would block")]
    Transient,

    /// The peer closed the connection (zero-byte read).
    #[error("peer closed the connection")]
    PeerClosed,

    /// Fatal socket error.
    #[error("socket error")]
    Io {
        #[error(source, std_err)]
        source: io::Error,
    },

    /// Malformed request line, header section, or chunk framing.
    #[error("malformed message")]
    Parse {
        #[error(source)]
        source: AnyError,
    },

    /// The proxy or gateway deadline elapsed.
    #[error("timed out")]
    Timeout,

    /// The shutdown flag was observed mid-operation.
    #[error("proxy is shutting down")]
    Cancelled,

    /// The blacklist rejected the target host or IP.
    #[error("host {host} is blocked")]
    Blocked { host: String },

    /// Resolution failed or every candidate address refused the connection.
    #[error("origin is unreachable")]
    NotFound {
        #[error(source)]
        source: AnyError,
    },

    /// Only GET and CONNECT requests are forwarded.
    #[error("method {method} is not supported")]
    BadMethod { method: Method },
}

impl ProxyError {
    /// Returns the status code to synthesize for the client, if any.
    ///
    /// Transient, peer-closed and plain IO failures have no reply: the
    /// worker either retries or tears the connection down. A shutdown that
    /// interrupts an exchange in flight still owes the client a complete
    /// response, so it maps to 500.
    pub fn response_status(&self) -> Option<StatusCode> {
        match self {
            ProxyError::Transient { .. } | ProxyError::PeerClosed { .. } | ProxyError::Io { .. } => {
                None
            }
            ProxyError::Parse { .. } => Some(StatusCode::BAD_REQUEST),
            ProxyError::Timeout { .. } => Some(StatusCode::GATEWAY_TIMEOUT),
            ProxyError::Cancelled { .. } => Some(StatusCode::INTERNAL_SERVER_ERROR),
            ProxyError::Blocked { .. } => Some(StatusCode::FORBIDDEN),
            ProxyError::NotFound { .. } => Some(StatusCode::NOT_FOUND),
            ProxyError::BadMethod { .. } => Some(StatusCode::BAD_REQUEST),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, ProxyError::Transient { .. })
    }

    pub fn is_peer_closed(&self) -> bool {
        matches!(self, ProxyError::PeerClosed { .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, ProxyError::Timeout { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, ProxyError::Cancelled { .. })
    }

    pub(crate) fn parse(source: AnyError) -> Self {
        e!(ProxyError::Parse { source })
    }

    pub(crate) fn not_found(source: AnyError) -> Self {
        e!(ProxyError::NotFound { source })
    }

    pub(crate) fn blocked(host: impl Into<String>) -> Self {
        e!(ProxyError::Blocked { host: host.into() })
    }

    pub(crate) fn bad_method(method: Method) -> Self {
        e!(ProxyError::BadMethod { method })
    }

    pub(crate) fn timeout() -> Self {
        e!(ProxyError::Timeout)
    }

    pub(crate) fn cancelled() -> Self {
        e!(ProxyError::Cancelled)
    }

    pub(crate) fn peer_closed() -> Self {
        e!(ProxyError::PeerClosed)
    }
}

impl From<io::Error> for ProxyError {
    #[track_caller]
    fn from(source: io::Error) -> Self {
        match source.kind() {
            io::ErrorKind::WouldBlock => e!(ProxyError::Transient),
            io::ErrorKind::UnexpectedEof => e!(ProxyError::PeerClosed),
            _ => e!(ProxyError::Io { source }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert_eq!(
            ProxyError::blocked("x.test").response_status(),
            Some(StatusCode::FORBIDDEN)
        );
        assert_eq!(
            ProxyError::timeout().response_status(),
            Some(StatusCode::GATEWAY_TIMEOUT)
        );
        assert_eq!(
            ProxyError::bad_method(Method::POST).response_status(),
            Some(StatusCode::BAD_REQUEST)
        );
        assert_eq!(
            ProxyError::cancelled().response_status(),
            Some(StatusCode::INTERNAL_SERVER_ERROR)
        );
        assert_eq!(ProxyError::peer_closed().response_status(), None);
    }

    #[test]
    fn io_errors_classify() {
        let err: ProxyError = io::Error::from(io::ErrorKind::WouldBlock).into();
        assert!(err.is_transient());
        let err: ProxyError = io::Error::from(io::ErrorKind::ConnectionReset).into();
        assert!(!err.is_transient());
        assert_eq!(err.response_status(), None);
    }
}
