//! Observable transport errors.
//!
//! Transport operations return `std::io::Result`. Callers distinguish the
//! three interesting cases by kind:
//!
//! - `WouldBlock`: not enough data yet (EAGAIN); retried on the next event.
//! - `TimedOut`: a deadline was exceeded.
//! - connection closed: wraps the private [`ConnClosed`] marker.

use std::fmt;
use std::io;

/// Marker carried inside the connection-closed `io::Error`.
#[derive(Debug, Clone, Copy)]
struct ConnClosed;

impl fmt::Display for ConnClosed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "connection is closed")
    }
}

impl std::error::Error for ConnClosed {}

/// Error returned by operations on a closed connection.
pub fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, ConnClosed)
}

/// Error returned when not enough data is buffered yet.
pub fn again_error() -> io::Error {
    io::Error::new(io::ErrorKind::WouldBlock, "not enough data")
}

/// Error returned when a read or write deadline passes.
pub fn timeout_error() -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, "i/o deadline exceeded")
}

/// True for the EAGAIN-style "retry on next event" error.
pub fn is_again(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::WouldBlock
}

/// True when the error means the connection is gone.
pub fn is_closed(e: &io::Error) -> bool {
    if e.get_ref().is_some_and(|inner| inner.is::<ConnClosed>()) {
        return true;
    }
    matches!(
        e.kind(),
        io::ErrorKind::NotConnected
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::UnexpectedEof
    )
}

/// True when the error is a deadline expiry.
pub fn is_timeout(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::TimedOut
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_predicates() {
        assert!(is_closed(&closed_error()));
        assert!(!is_timeout(&closed_error()));
        assert!(is_again(&again_error()));
        assert!(is_timeout(&timeout_error()));
        assert!(!is_closed(&timeout_error()));
    }

    #[test]
    fn test_peer_reset_counts_as_closed() {
        let e = io::Error::from(io::ErrorKind::ConnectionReset);
        assert!(is_closed(&e));
        let e = io::Error::from(io::ErrorKind::BrokenPipe);
        assert!(is_closed(&e));
    }

    #[test]
    fn test_closed_display() {
        assert_eq!(closed_error().to_string(), "connection is closed");
    }
}
