//! Dialing websocket servers.

use std::sync::Arc;
use std::time::Instant;

use super::conn::{ConnConfig, WebSocketConn};
use super::error::{HandshakeError, Result};
use super::handshake::client_handshake;
use super::options::ClientOptions;
use super::raw::RawConn;
use super::Role;
use crate::runtime::{self, TcpOptions};

/// Where a websocket url points.
#[derive(Debug, PartialEq, Eq)]
struct Target {
    tls: bool,
    /// `host:port` to connect to.
    addr: String,
    /// Value for the `Host` header, as written in the url.
    authority: String,
    /// Host without brackets or port, for TLS server name checks.
    server_name: String,
    path: String,
}

fn parse_url(url: &str) -> std::result::Result<Target, HandshakeError> {
    let invalid = || HandshakeError::InvalidUrl(url.to_string());
    let (scheme, rest) = url.split_once("://").ok_or_else(invalid)?;
    let tls = match scheme.to_ascii_lowercase().as_str() {
        "ws" => false,
        "wss" => true,
        _ => return Err(HandshakeError::UnknownScheme(scheme.to_string())),
    };

    let (authority, path) = match rest.find(['/', '?', '#']) {
        Some(i) => (&rest[..i], &rest[i..]),
        None => (rest, ""),
    };
    let path = path.split('#').next().unwrap_or_default();
    let path = match path.chars().next() {
        None => "/".to_string(),
        Some('/') => path.to_string(),
        Some(_) => format!("/{path}"),
    };
    let authority = authority.rsplit('@').next().unwrap_or_default();
    if authority.is_empty() {
        return Err(invalid());
    }

    // A colon after the closing bracket of an IPv6 literal starts the port.
    let port_at = authority
        .rfind(':')
        .filter(|&i| authority.rfind(']').map_or(true, |j| i > j));
    let (host, addr) = match port_at {
        Some(i) => {
            if authority[i + 1..].parse::<u16>().is_err() {
                return Err(invalid());
            }
            (&authority[..i], authority.to_string())
        }
        None => {
            let port = if tls { 443 } else { 80 };
            (authority, format!("{authority}:{port}"))
        }
    };
    let server_name = host.trim_start_matches('[').trim_end_matches(']');
    if server_name.is_empty() {
        return Err(invalid());
    }
    Ok(Target {
        tls,
        addr,
        authority: authority.to_string(),
        server_name: server_name.to_string(),
        path,
    })
}

/// Connect to a `ws://` or `wss://` url and perform the opening handshake.
///
/// `wss` needs a [`TlsConnector`](super::TlsConnector) in `options`. The
/// options timeout bounds connecting and the handshake together.
pub fn dial(url: &str, options: &ClientOptions) -> Result<WebSocketConn> {
    let target = parse_url(url)?;
    let raw: Arc<dyn RawConn> = if target.tls {
        let connector = options
            .tls_connector
            .as_ref()
            .ok_or(HandshakeError::NoTlsConnector)?;
        let stream = runtime::connect_stream(target.addr.as_str(), options.timeout)?;
        stream.set_nodelay(true)?;
        let name = options.server_name.as_deref().unwrap_or(&target.server_name);
        connector.connect(name, stream)?
    } else {
        let tcp_options = TcpOptions::default()
            .with_nonblocking(false)
            .with_flush_write(true);
        Arc::new(runtime::dial_tcp_with(
            target.addr.as_str(),
            options.timeout,
            &tcp_options,
        )?)
    };

    if !options.timeout.is_zero() {
        raw.set_deadline(Some(Instant::now() + options.timeout));
    }
    let subprotocol = match client_handshake(
        &*raw,
        &target.authority,
        &target.path,
        &options.subprotocols,
    ) {
        Ok(p) => p,
        Err(e) => {
            raw.close();
            return Err(e);
        }
    };
    raw.set_deadline(None);

    let config = ConnConfig {
        subprotocol,
        message_type: options.message_type,
        combine_writes: options.combine_writes,
        ..Default::default()
    };
    let wc = WebSocketConn::from_raw(Arc::clone(&raw), Role::Client, config);
    raw.set_metadata(Arc::new(wc.clone()));
    Ok(wc)
}
