//! ringnet-echo: a websocket echo server.
//!
//! Every message a client sends is written back with the same type.
//! Configuration via CLI arguments or TOML file.

mod config;

use std::sync::Arc;
use std::thread;

use config::Config;
use ringnet::protocols::websocket::{Handler, ServerOptions, Service, WebSocketConn};
use ringnet::runtime;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load()?;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    if let Some(n) = config.pollers {
        runtime::set_num_pollers(n)?;
    }

    info!(
        listen = %config.listen,
        idle_timeout = ?config.idle_timeout,
        message_type = ?config.message_type,
        combined_writes = config.combined_writes,
        "Starting ringnet-echo"
    );

    let mut options = ServerOptions::default()
        .with_keep_alive(config.keep_alive)
        .with_idle_timeout(config.idle_timeout)
        .with_combined_writes(config.combined_writes)
        .with_on_closed(|wc: &WebSocketConn| {
            debug!(peer = %wc.peer_addr(), "WebSocket closed");
        });
    if let Some(tp) = config.message_type {
        options = options.with_message_type(tp);
    }

    let echo: Handler = Arc::new(|wc: &WebSocketConn| {
        let (tp, payload) = wc.read_message()?;
        wc.write_message(tp, &payload)
    });

    let listener = runtime::listen(config.listen.parse()?)?;
    let service = Service::new(listener, echo, options)?;

    if let Some(period) = config.show_metrics {
        thread::Builder::new()
            .name("ringnet-metrics".to_string())
            .spawn(move || loop {
                runtime::show_metrics_of_period(period);
            })?;
    }

    service.serve()?;
    Ok(())
}
