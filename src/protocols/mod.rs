//! Protocols layered on the transport runtime.
//!
//! - `websocket`: RFC 6455 server and client over [`TcpConn`](crate::runtime::TcpConn)
//!   or any other [`RawConn`](websocket::RawConn)

pub mod websocket;
