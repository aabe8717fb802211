//! Errors

use std::fmt::{self, Display, Formatter};
use std::io;

use super::frame::FrameError;
use super::MessageType;
use crate::runtime;

/// Errors returned by user hooks and handlers.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

pub type Result<T> = std::result::Result<T, Error>;

/// Close status code, RFC 6455 section 7.4.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CloseCode(pub u16);

impl CloseCode {
    pub const NORMAL: CloseCode = CloseCode(1000);
    pub const GOING_AWAY: CloseCode = CloseCode(1001);
    pub const PROTOCOL_ERROR: CloseCode = CloseCode(1002);
    pub const UNSUPPORTED_DATA: CloseCode = CloseCode(1003);
    /// Never sent on the wire; reported when a Close frame had no body.
    pub const NO_STATUS: CloseCode = CloseCode(1005);
    /// Never sent on the wire; reported when the transport went away.
    pub const ABNORMAL: CloseCode = CloseCode(1006);
    pub const INVALID_PAYLOAD: CloseCode = CloseCode(1007);
    pub const POLICY_VIOLATION: CloseCode = CloseCode(1008);
    pub const MESSAGE_TOO_BIG: CloseCode = CloseCode(1009);
    pub const MANDATORY_EXTENSION: CloseCode = CloseCode(1010);
    pub const INTERNAL_ERROR: CloseCode = CloseCode(1011);

    /// Whether the code may appear in a Close frame.
    pub fn is_sendable(self) -> bool {
        matches!(self.0, 1000..=1003 | 1007..=1011 | 3000..=4999)
    }
}

impl Display for CloseCode {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Status code and reason carried by a Close frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseFrame {
    pub code: CloseCode,
    pub reason: String,
}

impl CloseFrame {
    pub fn new(code: CloseCode, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }
}

impl Display for CloseFrame {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        if self.reason.is_empty() {
            write!(f, "{}", self.code)
        } else {
            write!(f, "{} {}", self.code, self.reason)
        }
    }
}

/// Upgrade failures on either side of the opening handshake.
#[derive(Debug)]
pub enum HandshakeError {
    HttpMethod,

    HttpVersion,

    HttpStatusCode(u16),

    HttpHost,

    Upgrade,

    Connection,

    SecWebSocketKey,

    SecWebSocketAccept,

    SecWebSocketVersion,

    /// The server picked a subprotocol the client never offered.
    SecWebSocketProtocol(String),

    /// The request or response head grew past the size limit.
    HeadTooLarge,

    /// The peer closed before the head was complete.
    UnexpectedEof,

    InvalidUrl(String),

    UnknownScheme(String),

    /// A `wss` url was dialed without a TLS connector.
    NoTlsConnector,

    Httparse(httparse::Error),
}

impl Display for HandshakeError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        use HandshakeError::*;
        match self {
            HttpMethod => write!(f, "illegal http method"),
            HttpVersion => write!(f, "illegal http version"),
            HttpStatusCode(code) => write!(f, "unexpected http status code {code}"),
            HttpHost => write!(f, "missing http host header"),
            Upgrade => write!(f, "missing or illegal upgrade header"),
            Connection => write!(f, "missing or illegal connection header"),
            SecWebSocketKey => write!(f, "missing or illegal sec-websocket-key header"),
            SecWebSocketAccept => write!(f, "missing or illegal sec-websocket-accept header"),
            SecWebSocketVersion => write!(f, "missing or illegal sec-websocket-version header"),
            SecWebSocketProtocol(p) => write!(f, "unrequested subprotocol {p:?}"),
            HeadTooLarge => write!(f, "http head too large"),
            UnexpectedEof => write!(f, "connection closed during handshake"),
            InvalidUrl(url) => write!(f, "invalid url {url:?}"),
            UnknownScheme(scheme) => write!(f, "unexpected websocket scheme: {scheme:?}"),
            NoTlsConnector => write!(f, "wss requires a tls connector"),
            Httparse(e) => write!(f, "http parse error: {e}"),
        }
    }
}

impl From<httparse::Error> for HandshakeError {
    fn from(e: httparse::Error) -> Self {
        HandshakeError::Httparse(e)
    }
}

impl std::error::Error for HandshakeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        if let HandshakeError::Httparse(e) = self {
            Some(e)
        } else {
            None
        }
    }
}

#[derive(Debug)]
pub enum Error {
    /// Transport failure, including deadlines and closed connections.
    Io(io::Error),

    /// The peer violated the framing rules; the connection was closed with `code`.
    Protocol { code: CloseCode, reason: String },

    /// A text message was not valid UTF-8.
    InvalidUtf8,

    Handshake(HandshakeError),

    /// The peer sent a Close frame.
    Closed(CloseFrame),

    /// A message of the wrong type arrived on a fixed-type connection.
    /// The message was discarded.
    MessageTypeMismatch { got: MessageType, want: MessageType },

    /// The call is not valid for how the connection is set up.
    Config(&'static str),

    /// A user hook refused the connection.
    Hook(BoxError),
}

impl Error {
    pub(crate) fn protocol(code: CloseCode, reason: impl Into<String>) -> Self {
        Error::Protocol {
            code,
            reason: reason.into(),
        }
    }

    /// Deadline exceeded.
    pub fn is_timeout(&self) -> bool {
        match self {
            Error::Io(e) => runtime::is_timeout(e),
            _ => false,
        }
    }

    /// The connection is gone, either side having closed it.
    pub fn is_closed(&self) -> bool {
        match self {
            Error::Io(e) => {
                runtime::is_closed(e)
                    || matches!(
                        e.kind(),
                        io::ErrorKind::BrokenPipe
                            | io::ErrorKind::ConnectionReset
                            | io::ErrorKind::ConnectionAborted
                            | io::ErrorKind::UnexpectedEof
                    )
            }
            Error::Closed(_) => true,
            _ => false,
        }
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        use Error::*;
        match self {
            Io(e) => write!(f, "{e}"),
            Protocol { code, reason } => write!(f, "protocol error ({code}): {reason}"),
            InvalidUtf8 => write!(f, "invalid utf-8 in text message"),
            Handshake(e) => write!(f, "websocket upgrade: {e}"),
            Closed(frame) => write!(f, "connection closed by peer: {frame}"),
            MessageTypeMismatch { got, want } => {
                write!(f, "inconsistent message type from read: {got}, want {want}")
            }
            Config(msg) => write!(f, "{msg}"),
            Hook(e) => write!(f, "websocket upgrade: {e}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            Error::Handshake(e) => Some(e),
            Error::Hook(e) => Some(e.as_ref()),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<HandshakeError> for Error {
    fn from(e: HandshakeError) -> Self {
        Error::Handshake(e)
    }
}

impl From<httparse::Error> for Error {
    fn from(e: httparse::Error) -> Self {
        Error::Handshake(HandshakeError::Httparse(e))
    }
}

impl From<FrameError> for Error {
    fn from(e: FrameError) -> Self {
        Error::protocol(CloseCode::PROTOCOL_ERROR, e.to_string())
    }
}

impl From<Error> for io::Error {
    fn from(e: Error) -> Self {
        match e {
            Error::Io(e) => e,
            Error::Closed(_) => runtime::closed_error(),
            Error::InvalidUtf8 => io::Error::new(io::ErrorKind::InvalidData, e),
            Error::Config(_) => io::Error::new(io::ErrorKind::Unsupported, e),
            other => io::Error::new(io::ErrorKind::Other, other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handshake_annotation() {
        let err = Error::from(HandshakeError::SecWebSocketKey);
        assert_eq!(
            err.to_string(),
            "websocket upgrade: missing or illegal sec-websocket-key header"
        );
        let err = Error::Hook("rejected".into());
        assert_eq!(err.to_string(), "websocket upgrade: rejected");
    }

    #[test]
    fn test_predicates() {
        assert!(Error::Io(runtime::timeout_error()).is_timeout());
        assert!(!Error::InvalidUtf8.is_timeout());
        assert!(Error::Io(runtime::closed_error()).is_closed());
        assert!(Error::Closed(CloseFrame::new(CloseCode::NORMAL, "")).is_closed());
        assert!(!Error::Config("x").is_closed());
    }

    #[test]
    fn test_into_io() {
        let e: io::Error = Error::Io(runtime::timeout_error()).into();
        assert!(runtime::is_timeout(&e));
        let e: io::Error = Error::Closed(CloseFrame::new(CloseCode::NORMAL, "bye")).into();
        assert!(runtime::is_closed(&e));
        let e: io::Error = Error::InvalidUtf8.into();
        assert_eq!(e.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_close_codes() {
        assert!(CloseCode::NORMAL.is_sendable());
        assert!(CloseCode(4000).is_sendable());
        assert!(!CloseCode::NO_STATUS.is_sendable());
        assert!(!CloseCode::ABNORMAL.is_sendable());
        assert!(!CloseCode(999).is_sendable());
        assert!(!CloseCode(1016).is_sendable());
        assert_eq!(CloseFrame::new(CloseCode::GOING_AWAY, "bye").to_string(), "1001 bye");
    }
}
