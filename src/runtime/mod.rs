//! Event-driven transport runtime.
//!
//! A small pool of poller threads multiplexes every TCP and UDP socket in the
//! process using nonblocking sockets and edge-triggered readiness (`mio`:
//! epoll on Linux, kqueue on macOS).
//!
//! Main pieces:
//! - `RingBuffer`: per-connection inbound/outbound byte rings with
//!   `readv`/`writev` scatter-gather I/O
//! - `TcpConn`: connection state machine, handler dispatch, flush-write,
//!   backpressure, deadlines and idle eviction
//! - `TcpService` / `UdpService`: accepting servers
//! - `submit`: worker pool for work that must leave the poller threads

mod buffer;
mod connection;
mod dialer;
mod error;
pub mod metrics;
mod poller;
mod pool;
mod postpone;
mod service;
mod timer;
mod udp;

pub use buffer::{BufferError, RingBuffer};
pub use connection::{
    set_buffer_ceiling, Backpressure, BackpressureMode, ConnState, Metadata, OnClosed, OnRequest,
    TcpConn,
};
pub use dialer::{dial_tcp, dial_tcp_with, dial_udp};
pub use error::{again_error, closed_error, is_again, is_closed, is_timeout, timeout_error};
pub use metrics::{show_metrics, show_metrics_of_period};
pub use poller::{num_pollers, set_num_pollers};
pub use pool::submit;
pub use service::{listen, OnOpened, TcpOptions, TcpService, DEFAULT_KEEP_ALIVE};
pub use timer::TIMER_RESOLUTION;
pub use udp::{listen_udp, OnPacket, UdpConn, UdpOptions, UdpService};

pub(crate) use dialer::connect_stream;
pub(crate) use pool::sys_pool;
pub(crate) use timer::check_idle_duration;
