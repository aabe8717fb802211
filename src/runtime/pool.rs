//! Worker pools.
//!
//! Two pools back the engine, both built on tokio's blocking thread pool:
//!
//! - the system pool runs blocking `on_request` handler loops, asynchronous
//!   control-frame handlers, idle evictions and TLS handshakes;
//! - the user pool sits behind [`submit`] for business logic that must not
//!   run on a poller thread.
//!
//! Each pool builds its runtime lazily on first use.

use std::io;
use std::sync::OnceLock;
use std::time::Duration;
use tokio::runtime::{Builder, Runtime};
use tracing::error;

use super::metrics::{self, Metric};

/// Upper bound on threads per pool.
const MAX_POOL_THREADS: usize = 10_000;

/// Idle pool threads exit after this long.
const THREAD_KEEP_ALIVE: Duration = Duration::from_secs(10);

pub(crate) struct WorkerPool {
    name: &'static str,
    runtime: OnceLock<Option<Runtime>>,
}

impl WorkerPool {
    const fn new(name: &'static str) -> Self {
        Self {
            name,
            runtime: OnceLock::new(),
        }
    }

    fn runtime(&self) -> io::Result<&Runtime> {
        self.runtime
            .get_or_init(|| {
                let built = Builder::new_multi_thread()
                    .worker_threads(1)
                    .max_blocking_threads(MAX_POOL_THREADS)
                    .thread_keep_alive(THREAD_KEEP_ALIVE)
                    .thread_name(self.name)
                    .build();
                match built {
                    Ok(rt) => Some(rt),
                    Err(e) => {
                        error!(pool = self.name, error = %e, "Failed to build worker pool");
                        None
                    }
                }
            })
            .as_ref()
            .ok_or_else(|| io::Error::other(format!("worker pool {} unavailable", self.name)))
    }

    /// Run `f` on a pool thread.
    pub(crate) fn submit<F>(&self, f: F) -> io::Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let rt = self.runtime()?;
        metrics::add(Metric::TaskAssigned, 1);
        drop(rt.spawn_blocking(f));
        Ok(())
    }
}

static SYS_POOL: WorkerPool = WorkerPool::new("ringnet-sys");
static USER_POOL: WorkerPool = WorkerPool::new("ringnet-user");

/// Pool used internally for handler loops and deferred work.
pub(crate) fn sys_pool() -> &'static WorkerPool {
    &SYS_POOL
}

/// Run `f` on the user worker pool.
///
/// Use this from nonblocking handlers to move work that may block off the
/// poller thread.
pub fn submit<F>(f: F) -> io::Result<()>
where
    F: FnOnce() + Send + 'static,
{
    USER_POOL.submit(f)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn test_submit_runs_task() {
        let (tx, rx) = mpsc::channel();
        submit(move || {
            tx.send(42).unwrap();
        })
        .unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 42);
    }

    #[test]
    fn test_sys_pool_runs_many_tasks() {
        let (tx, rx) = mpsc::channel();
        for i in 0..16 {
            let tx = tx.clone();
            sys_pool().submit(move || tx.send(i).unwrap()).unwrap();
        }
        drop(tx);
        let mut got: Vec<i32> = rx.iter().collect();
        got.sort_unstable();
        assert_eq!(got, (0..16).collect::<Vec<_>>());
    }
}
