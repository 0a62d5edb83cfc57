//! The single-threaded cooperative event loop.
//!
//! Exactly one reactor thread exists per mesh handle, built on a
//! current-thread `tokio::runtime::Runtime` paired with a `LocalSet` so
//! non-`Send` callback state can live on it. Socket readiness and
//! timers are ordinary tasks spawned onto that `LocalSet`;
//! `queue_from_outside` is the thread-safe escape hatch foreign threads
//! use to schedule work here.

use std::future::Future;
use std::time::Duration;

use tokio::runtime::{Builder, Runtime};
use tokio::sync::mpsc;
use tokio::task::LocalSet;

use crate::error::*;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Thread-safe handle used by foreign threads to schedule a closure to
/// run on the reactor thread.
#[derive(Clone)]
pub struct ReactorHandle {
    tx: mpsc::UnboundedSender<Job>,
}

impl ReactorHandle {
    pub fn queue_from_outside<F>(&self, job: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.tx.send(Box::new(job)).map_err(|_| Error::simple(ErrorKind::Busy))
    }
}

/// Owns the current-thread runtime and `LocalSet` for one mesh handle.
/// Exactly one `Reactor` exists per handle, started by `start()` and
/// joined by `stop()`.
pub struct Reactor {
    runtime: Runtime,
    local: LocalSet,
    rx: mpsc::UnboundedReceiver<Job>,
    handle: ReactorHandle,
}

impl Reactor {
    pub fn new() -> Result<Self> {
        let runtime = Builder::new_current_thread()
            .enable_all()
            .build()
            .wrapped(ErrorKind::NoMem)?;
        let (tx, rx) = mpsc::unbounded_channel();
        Ok(Reactor {
            runtime,
            local: LocalSet::new(),
            rx,
            handle: ReactorHandle { tx },
        })
    }

    pub fn handle(&self) -> ReactorHandle {
        self.handle.clone()
    }

    /// Spawns a task onto the reactor's `LocalSet`.
    pub fn spawn_local<F>(&self, fut: F)
    where
        F: Future<Output = ()> + 'static,
    {
        self.local.spawn_local(fut);
    }

    /// Registers a one-shot timer that runs `cb` after `delay` on the
    /// reactor thread.
    pub fn set_timer<F>(&self, delay: Duration, cb: F)
    where
        F: FnOnce() + 'static,
    {
        self.spawn_local(async move {
            tokio::time::sleep(delay).await;
            cb();
        });
    }

    /// Drains any jobs queued from outside threads without blocking.
    fn drain_external_jobs(&mut self) {
        while let Ok(job) = self.rx.try_recv() {
            job();
        }
    }

    /// Runs `body` to completion on the reactor thread, draining
    /// externally queued jobs between polls. `stop()` is modelled by
    /// `body` itself returning once its shutdown flag is observed
    /// sets a shutdown flag, wakes the reactor").
    pub fn block_on<F, T>(&mut self, body: F) -> T
    where
        F: Future<Output = T>,
    {
        let local = &self.local;
        let rx = &mut self.rx;
        self.runtime.block_on(local.run_until(async move {
            tokio::pin!(body);
            loop {
                tokio::select! {
                    biased;
                    job = rx.recv() => {
                        if let Some(job) = job {
                            job();
                        }
                    }
                    out = &mut body => return out,
                }
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[test]
    fn queue_from_outside_runs_on_reactor_thread() {
        let mut reactor = Reactor::new().unwrap();
        let handle = reactor.handle();
        let flag = Arc::new(AtomicBool::new(false));
        let flag2 = flag.clone();

        let result = reactor.block_on(async move {
            handle.queue_from_outside(move || flag2.store(true, Ordering::SeqCst)).unwrap();
            tokio::time::sleep(Duration::from_millis(10)).await;
            flag.load(Ordering::SeqCst)
        });
        assert!(result);
    }

    #[test]
    fn set_timer_fires_after_delay() {
        let mut reactor = Reactor::new().unwrap();
        let flag = Arc::new(AtomicBool::new(false));
        let flag2 = flag.clone();
        reactor.set_timer(Duration::from_millis(1), move || flag2.store(true, Ordering::SeqCst));
        reactor.block_on(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
        });
        assert!(flag.load(Ordering::SeqCst));
    }
}
