use std::{io, time::Duration};

use http::StatusCode;
use n0_error::{AnyError, e, stack_error};

use crate::parse::Authority;

/// Errors that end the handling of a single proxied request or tunnel.
///
/// Every variant is terminal for its connection and never affects other
/// connections. [`ProxyError::response_status`] tells which status line, if
/// any, is written to the client before the connection is closed.
#[stack_error(derive, add_meta)]
#[non_exhaustive]
pub enum ProxyError {
    /// The request head could not be parsed.
    #[error("invalid HTTP request")]
    BadRequest {
        #[error(source)]
        source: AnyError,
    },

    /// CONNECT authority or forward target could not be resolved to host and port.
    #[error("malformed request target")]
    MalformedTarget {
        #[error(source)]
        source: AnyError,
    },

    /// The target is the proxy's own listening address.
    #[error("request target {authority} points back at the proxy")]
    Loop { authority: Authority },

    /// The outbound dial failed.
    #[error("failed to connect to {authority}")]
    Connect {
        /// The authority we tried to reach.
        authority: Authority,
        #[error(source, std_err)]
        source: io::Error,
    },

    /// The origin answered with something that is not an HTTP/1.x response.
    #[error("invalid response from origin")]
    InvalidResponse {
        #[error(source)]
        source: AnyError,
    },

    /// The authentication hook returned an error.
    #[error("authentication hook failed")]
    AuthFailed {
        #[error(source)]
        source: AnyError,
    },

    /// The authentication hook did not decide in time.
    #[error("authentication hook did not decide within {timeout:?}")]
    AuthTimeout { timeout: Duration },

    /// A peer or the hook broke the protocol, e.g. by deciding twice.
    #[error("protocol violation: {reason}")]
    ProtocolViolation { reason: String },

    /// The authentication hook denied the request. The denial was already written.
    #[error("request denied with status {status}")]
    Denied { status: StatusCode },

    /// IO error on the client or target stream.
    #[error("io error")]
    Io {
        #[error(source, std_err)]
        source: io::Error,
    },
}

impl From<io::Error> for ProxyError {
    #[track_caller]
    fn from(source: io::Error) -> Self {
        e!(ProxyError::Io { source })
    }
}

impl ProxyError {
    /// Returns the status to send to the client on the forward path, if any.
    ///
    /// `None` means the connection is closed without a (further) response.
    pub fn response_status(&self) -> Option<StatusCode> {
        match self {
            ProxyError::BadRequest { .. } | ProxyError::MalformedTarget { .. } => {
                Some(StatusCode::BAD_REQUEST)
            }
            ProxyError::Loop { .. } => Some(StatusCode::LOOP_DETECTED),
            ProxyError::Connect { .. } | ProxyError::InvalidResponse { .. } => {
                Some(StatusCode::BAD_GATEWAY)
            }
            ProxyError::AuthFailed { .. } | ProxyError::AuthTimeout { .. } => {
                Some(StatusCode::INTERNAL_SERVER_ERROR)
            }
            ProxyError::ProtocolViolation { .. }
            | ProxyError::Denied { .. }
            | ProxyError::Io { .. } => None,
        }
    }

    pub(crate) fn malformed_target(source: impl Into<AnyError>) -> Self {
        e!(ProxyError::MalformedTarget {
            source: source.into()
        })
    }

    pub(crate) fn bad_request(source: impl Into<AnyError>) -> Self {
        e!(ProxyError::BadRequest {
            source: source.into()
        })
    }

    pub(crate) fn invalid_response(source: impl Into<AnyError>) -> Self {
        e!(ProxyError::InvalidResponse {
            source: source.into()
        })
    }

    pub(crate) fn protocol_violation(reason: impl ToString) -> Self {
        e!(ProxyError::ProtocolViolation {
            reason: reason.to_string()
        })
    }
}
