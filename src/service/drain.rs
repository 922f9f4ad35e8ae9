//! Shutdown coordination: in-flight work counting and drain.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

/// Tracks in-flight handler invocations for graceful shutdown.
///
/// Owned by a [`Service`](super::Service). Each invocation holds a
/// [`WorkGuard`]; the count drops when the guard does, so it can never go
/// negative.
#[derive(Debug)]
pub struct Drain {
    in_flight: AtomicUsize,
    consuming: AtomicBool,
}

impl Default for Drain {
    fn default() -> Self {
        Self::new()
    }
}

impl Drain {
    pub fn new() -> Self {
        Self {
            in_flight: AtomicUsize::new(0),
            consuming: AtomicBool::new(true),
        }
    }

    /// Count a new invocation until the returned guard is dropped.
    pub fn enter(self: &Arc<Self>) -> WorkGuard {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        WorkGuard {
            drain: Arc::clone(self),
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// `false` once shutdown started.
    pub fn is_consuming(&self) -> bool {
        self.consuming.load(Ordering::SeqCst)
    }

    pub fn stop_consuming(&self) {
        self.consuming.store(false, Ordering::SeqCst);
    }

    /// Poll the in-flight count every `poll` until it reaches zero.
    pub async fn wait_idle(&self, poll: Duration) {
        loop {
            let in_flight = self.in_flight();
            if in_flight == 0 {
                return;
            }
            debug!(in_flight, "waiting for in-flight work");
            tokio::time::sleep(poll).await;
        }
    }
}

/// Marks one in-flight invocation.
#[derive(Debug)]
pub struct WorkGuard {
    drain: Arc<Drain>,
}

impl Drop for WorkGuard {
    fn drop(&mut self) {
        self.drain.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}
