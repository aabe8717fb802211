//! TCP service, dialer and UDP service over loopback sockets.

use std::io::{Read, Write};
use std::net::{TcpStream, UdpSocket};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use ringnet::runtime::metrics::{Metric, Snapshot};
use ringnet::runtime::{
    self, dial_tcp, listen, listen_udp, OnClosed, OnPacket, OnRequest, TcpConn, TcpOptions,
    TcpService, UdpConn, UdpOptions, UdpService,
};

fn start(handler: OnRequest, options: TcpOptions) -> Arc<TcpService> {
    let listener = listen("127.0.0.1:0".parse().unwrap()).unwrap();
    let service = TcpService::new(listener, handler, options).unwrap();
    let runner = Arc::clone(&service);
    thread::spawn(move || runner.serve().unwrap());
    service
}

/// Length-prefixed echo: one byte of length, then that many bytes. Waits for
/// whole records without blocking the poller.
fn record_echo() -> OnRequest {
    Arc::new(|conn: &TcpConn| {
        let len = conn.peek(1)?[0] as usize;
        let record = conn.peek(1 + len)?;
        conn.skip(1 + len)?;
        conn.write(&record)?;
        Ok(())
    })
}

fn wait_until(deadline: Duration, mut f: impl FnMut() -> bool) -> bool {
    let end = Instant::now() + deadline;
    while Instant::now() < end {
        if f() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    f()
}

#[test]
fn test_partial_records_wait_for_more_data() {
    let service = start(record_echo(), TcpOptions::default());
    let mut client = TcpStream::connect(service.local_addr()).unwrap();
    client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();

    client.write_all(&[5, b'h', b'e']).unwrap();
    thread::sleep(Duration::from_millis(50));
    client.write_all(b"llo").unwrap();
    let mut buf = [0u8; 6];
    client.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"\x05hello");
    service.shutdown();
}

#[test]
fn test_many_clients() {
    let service = start(record_echo(), TcpOptions::default());
    let addr = service.local_addr();
    let clients: Vec<_> = (0..16u8)
        .map(|i| {
            thread::spawn(move || {
                let mut client = TcpStream::connect(addr).unwrap();
                client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
                for round in 0..20u8 {
                    let record = [2, i, round];
                    client.write_all(&record).unwrap();
                    let mut buf = [0u8; 3];
                    client.read_exact(&mut buf).unwrap();
                    assert_eq!(buf, record);
                }
            })
        })
        .collect();
    for c in clients {
        c.join().unwrap();
    }
    service.shutdown();
}

#[test]
fn test_on_closed_fires_once() {
    let closed = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&closed);
    let on_closed: OnClosed = Arc::new(move |_: &TcpConn| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    let handler: OnRequest = Arc::new(|conn: &TcpConn| {
        let data = conn.read_n(conn.len())?;
        conn.write(&data)?;
        conn.close();
        conn.close();
        Ok(())
    });
    let service = start(handler, TcpOptions::default().with_on_closed(on_closed));
    let mut client = TcpStream::connect(service.local_addr()).unwrap();
    client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    client.write_all(b"x").unwrap();
    let mut rest = Vec::new();
    let _ = client.read_to_end(&mut rest);
    assert_eq!(rest, b"x");

    assert!(wait_until(Duration::from_secs(5), || closed.load(Ordering::SeqCst) > 0));
    thread::sleep(Duration::from_millis(100));
    assert_eq!(closed.load(Ordering::SeqCst), 1);
    service.shutdown();
}

#[test]
fn test_idle_timeout_evicts() {
    let idle = Duration::from_millis(300);
    let service = start(record_echo(), TcpOptions::default().with_idle_timeout(idle));
    let mut client = TcpStream::connect(service.local_addr()).unwrap();
    client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();

    let start = Instant::now();
    let mut buf = [0u8; 1];
    assert_eq!(client.read(&mut buf).unwrap_or(0), 0);
    let elapsed = start.elapsed();
    assert!(elapsed >= idle - runtime::TIMER_RESOLUTION, "{elapsed:?}");
    assert!(elapsed <= idle * 2 + runtime::TIMER_RESOLUTION * 2, "{elapsed:?}");
    service.shutdown();
}

#[test]
fn test_idle_timeout_too_small() {
    let conn_err = TcpOptions::default().with_idle_timeout(Duration::from_millis(10));
    let service = start(record_echo(), conn_err);
    let mut client = TcpStream::connect(service.local_addr()).unwrap();
    client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    let mut buf = [0u8; 1];
    // The connection cannot be set up, so it is dropped at once.
    assert_eq!(client.read(&mut buf).unwrap_or(0), 0);
    service.shutdown();
}

#[test]
fn test_dialer_with_service() {
    let service = start(record_echo(), TcpOptions::default());
    let conn = dial_tcp(service.local_addr(), Duration::from_secs(1)).unwrap();
    conn.write(&[3, b'a', b'b', b'c']).unwrap();
    assert_eq!(&conn.next(4).unwrap()[..], b"\x03abc");

    conn.set_read_deadline(Some(Instant::now() + Duration::from_millis(100)));
    let err = conn.read_n(1).unwrap_err();
    assert!(runtime::is_timeout(&err), "{err}");

    conn.close();
    assert!(!conn.is_active());
    let err = conn.write(b"late").unwrap_err();
    assert!(runtime::is_closed(&err), "{err}");
    service.shutdown();
}

#[test]
fn test_shutdown_closes_connections() {
    let service = start(record_echo(), TcpOptions::default());
    let mut client = TcpStream::connect(service.local_addr()).unwrap();
    client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    client.write_all(&[1, b'z']).unwrap();
    let mut buf = [0u8; 2];
    client.read_exact(&mut buf).unwrap();

    service.shutdown();
    assert_eq!(service.num_conns(), 0);
    let mut buf = [0u8; 1];
    assert_eq!(client.read(&mut buf).unwrap_or(0), 0);
}

#[test]
fn test_metrics_count_connections() {
    let before = Snapshot::take();
    let service = start(record_echo(), TcpOptions::default());
    let mut client = TcpStream::connect(service.local_addr()).unwrap();
    client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    client.write_all(&[1, b'm']).unwrap();
    let mut buf = [0u8; 2];
    client.read_exact(&mut buf).unwrap();

    let diff = Snapshot::take().since(&before);
    assert!(diff.get(Metric::TcpConnsCreate) >= 1);
    assert!(diff.get(Metric::TcpReadvCalls) >= 1);
    assert!(diff.get(Metric::PollWait) >= 1);
    service.shutdown();
}

#[test]
fn test_udp_echo() {
    let handler: OnPacket = Arc::new(|conn: &UdpConn| {
        let (data, from) = conn.read_packet()?;
        conn.write_to(&data, from)?;
        Ok(())
    });
    let socket = listen_udp("127.0.0.1:0".parse().unwrap()).unwrap();
    let service = UdpService::new(socket, handler, UdpOptions::default()).unwrap();
    let runner = Arc::clone(&service);
    thread::spawn(move || runner.serve().unwrap());

    let client = UdpSocket::bind("127.0.0.1:0").unwrap();
    client.set_read_timeout(Some(Duration::from_millis(500))).unwrap();
    let mut buf = [0u8; 16];
    // The service may not be attached yet; retry until it answers.
    let got = (0..20).find_map(|_| {
        client.send_to(b"datagram", service.local_addr()).unwrap();
        client.recv(&mut buf).ok()
    });
    assert_eq!(got, Some(8));
    assert_eq!(&buf[..8], b"datagram");
    service.shutdown();
}
