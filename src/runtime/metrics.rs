//! Runtime counters.
//!
//! A fixed table of atomic counters updated from the pollers and connections
//! without locking. The report shows batching efficiency (bytes per readv,
//! blocks per writev, events per wait), which is the main tuning signal for
//! the engine.

use chrono::{DateTime, Local};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Counter identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum Metric {
    TcpReadvCalls,
    TcpReadvFails,
    TcpReadvBytes,
    TcpWritevCalls,
    TcpWritevFails,
    TcpWritevBlocks,
    TcpWriteNotify,
    TcpOnWriteCalls,
    TcpFlushCalls,
    TcpConnsCreate,
    TcpConnsClose,
    TcpPostponeWriteOff,
    TcpPostponeWriteOn,

    UdpRecvMmsgCalls,
    UdpRecvMmsgFails,
    UdpRecvMmsgPackets,
    UdpWriteToCalls,
    UdpWriteToFails,
    UdpSendMmsgCalls,
    UdpSendMmsgFails,
    UdpSendMmsgPackets,

    PollWait,
    PollNoWait,
    PollEvents,
    TaskAssigned,
}

/// Number of counters.
pub const METRIC_COUNT: usize = Metric::TaskAssigned as usize + 1;

static COUNTERS: [AtomicU64; METRIC_COUNT] = [const { AtomicU64::new(0) }; METRIC_COUNT];

/// Add `delta` to a counter.
#[inline]
pub fn add(metric: Metric, delta: u64) {
    COUNTERS[metric as usize].fetch_add(delta, Ordering::Relaxed);
}

/// Read one counter.
pub fn get(metric: Metric) -> u64 {
    COUNTERS[metric as usize].load(Ordering::Relaxed)
}

/// Point-in-time copy of every counter.
#[derive(Debug, Clone)]
pub struct Snapshot {
    values: [u64; METRIC_COUNT],
    taken_at: DateTime<Local>,
}

impl Snapshot {
    /// Capture the current counters.
    pub fn take() -> Self {
        let mut values = [0u64; METRIC_COUNT];
        for (slot, counter) in values.iter_mut().zip(COUNTERS.iter()) {
            *slot = counter.load(Ordering::Relaxed);
        }
        Self {
            values,
            taken_at: Local::now(),
        }
    }

    pub fn get(&self, metric: Metric) -> u64 {
        self.values[metric as usize]
    }

    /// Counters accumulated since `earlier`.
    pub fn since(&self, earlier: &Snapshot) -> Snapshot {
        let mut values = [0u64; METRIC_COUNT];
        for (i, slot) in values.iter_mut().enumerate() {
            *slot = self.values[i].saturating_sub(earlier.values[i]);
        }
        Snapshot {
            values,
            taken_at: self.taken_at,
        }
    }
}

/// Printable metrics table.
pub struct MetricsReport(pub Snapshot);

impl MetricsReport {
    fn row(f: &mut fmt::Formatter<'_>, label: &str, value: impl fmt::Display) -> fmt::Result {
        writeln!(f, "{label:<59}: {value}")
    }
}

impl fmt::Display for MetricsReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use Metric::*;
        let m = &self.0;
        writeln!(
            f,
            "######### ringnet metrics ( {} ) ###########",
            m.taken_at.format("%Y-%m-%d %H:%M:%S")
        )?;

        Self::row(f, "# TCP - number of Readv system calls", m.get(TcpReadvCalls))?;
        Self::row(f, "# TCP - number of failed Readv system calls", m.get(TcpReadvFails))?;
        let readv_ok = m.get(TcpReadvCalls).saturating_sub(m.get(TcpReadvFails));
        if readv_ok > 0 {
            let per_call = m.get(TcpReadvBytes) / readv_ok;
            Self::row(f, "# TCP - Readv efficiency", format!("{per_call}B"))?;
        }
        Self::row(f, "# TCP - number of Writev system calls", m.get(TcpWritevCalls))?;
        Self::row(f, "# TCP - number of blocks sent by Writev", m.get(TcpWritevBlocks))?;
        Self::row(f, "# TCP - number of failed Writev system calls", m.get(TcpWritevFails))?;
        let writev_ok = m.get(TcpWritevCalls).saturating_sub(m.get(TcpWritevFails));
        if writev_ok > 0 {
            let blocks = m.get(TcpWritevBlocks) as f64 / writev_ok as f64;
            Self::row(f, "# TCP - Writev efficiency", format!("{blocks:.2}"))?;
        }
        Self::row(f, "# TCP - number of write interest registrations", m.get(TcpWriteNotify))?;
        Self::row(f, "# TCP - number of on-write calls", m.get(TcpOnWriteCalls))?;
        Self::row(f, "# TCP - number of eager flushes", m.get(TcpFlushCalls))?;
        Self::row(f, "# TCP - number of connections created", m.get(TcpConnsCreate))?;
        Self::row(f, "# TCP - number of connections closed", m.get(TcpConnsClose))?;
        Self::row(
            f,
            "# TCP - number of times postpone write switched off",
            m.get(TcpPostponeWriteOff),
        )?;
        Self::row(
            f,
            "# TCP - number of times postpone write switched on",
            m.get(TcpPostponeWriteOn),
        )?;

        Self::row(f, "# UDP - number of RecvMMsg system calls", m.get(UdpRecvMmsgCalls))?;
        Self::row(f, "# UDP - number of failed RecvMMsg system calls", m.get(UdpRecvMmsgFails))?;
        let recv_ok = m.get(UdpRecvMmsgCalls).saturating_sub(m.get(UdpRecvMmsgFails));
        if recv_ok > 0 {
            let per_call = m.get(UdpRecvMmsgPackets) as f64 / recv_ok as f64;
            Self::row(f, "# UDP - RecvMMsg efficiency", format!("{per_call:.2}"))?;
        }
        Self::row(f, "# UDP - number of SendMMsg system calls", m.get(UdpSendMmsgCalls))?;
        Self::row(f, "# UDP - number of failed SendMMsg system calls", m.get(UdpSendMmsgFails))?;
        let send_ok = m.get(UdpSendMmsgCalls).saturating_sub(m.get(UdpSendMmsgFails));
        if send_ok > 0 {
            let per_call = m.get(UdpSendMmsgPackets) as f64 / send_ok as f64;
            Self::row(f, "# UDP - SendMMsg efficiency", format!("{per_call:.2}"))?;
        }
        Self::row(f, "# UDP - number of WriteTo system calls", m.get(UdpWriteToCalls))?;
        Self::row(f, "# UDP - number of failed WriteTo system calls", m.get(UdpWriteToFails))?;

        Self::row(f, "# POLL - number of poll returns (tag:b)", m.get(PollWait))?;
        Self::row(f, "# POLL - number of polls with zero timeout (tag:a)", m.get(PollNoWait))?;
        Self::row(f, "# POLL - number of total events", m.get(PollEvents))?;
        if m.get(PollWait) > 0 {
            let wait = m.get(PollWait) as f64;
            let ratio = m.get(PollNoWait) as f64 * 100.0 / wait;
            Self::row(f, "# POLL - a/b * 100%", format!("{ratio:.2}%"))?;
            let per_wait = m.get(PollEvents) as f64 / wait;
            Self::row(f, "# POLL - average events per poll", format!("{per_wait:.2}"))?;
        }
        Self::row(f, "# number of tasks assigned", m.get(TaskAssigned))
    }
}

/// Print all counters since process start.
pub fn show_metrics() {
    println!("{}", MetricsReport(Snapshot::take()));
}

/// Block for `period`, then print the counters accumulated during it.
pub fn show_metrics_of_period(period: Duration) {
    let before = Snapshot::take();
    std::thread::sleep(period);
    let after = Snapshot::take();
    println!("{}", MetricsReport(after.since(&before)));
}
