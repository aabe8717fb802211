//! ringnet: an event-driven TCP/UDP transport and a low-memory websocket
//! layer built on it.
//!
//! - [`runtime`]: poller pool, ring buffers, `TcpConn`, services, dialers,
//!   worker pools and metrics
//! - [`protocols::websocket`]: handshake, framing, `WebSocketConn`, `Service`
//!   and `dial`

pub mod protocols;
pub mod runtime;
