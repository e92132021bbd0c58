use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use wasmtime::Engine;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    Deadline,
    OutputQuota,
}

/// Per-invocation kill switch.
///
/// The deadline watchdog and the capped output pipes both fire the same
/// handle; the first reason recorded wins and the engine epoch is bumped so
/// the guest traps at its next yield point.
#[derive(Clone)]
pub struct CancelHandle {
    inner: Arc<CancelInner>,
}

struct CancelInner {
    engine: Engine,
    fired: Mutex<Option<CancelReason>>,
    done: Mutex<bool>,
    cv: Condvar,
}

impl CancelHandle {
    pub(crate) fn new(engine: Engine) -> Self {
        Self {
            inner: Arc::new(CancelInner {
                engine,
                fired: Mutex::new(None),
                done: Mutex::new(false),
                cv: Condvar::new(),
            }),
        }
    }

    pub fn fire(&self, reason: CancelReason) {
        {
            let mut fired = self.inner.fired.lock();
            if fired.is_none() {
                *fired = Some(reason);
            }
        }
        self.inner.engine.increment_epoch();
    }

    pub fn fired(&self) -> Option<CancelReason> {
        *self.inner.fired.lock()
    }

    /// Spawns a watchdog that fires `Deadline` after `deadline` unless the
    /// returned guard is dropped first.
    pub(crate) fn arm(&self, deadline: Duration) -> WatchdogGuard {
        let handle = self.clone();
        let thread = std::thread::spawn(move || {
            let started = Instant::now();
            let mut done = handle.inner.done.lock();
            while !*done {
                let elapsed = started.elapsed();
                if elapsed >= deadline {
                    drop(done);
                    handle.fire(CancelReason::Deadline);
                    return;
                }
                handle.inner.cv.wait_for(&mut done, deadline - elapsed);
            }
        });
        WatchdogGuard {
            handle: self.clone(),
            thread: Some(thread),
        }
    }
}

pub(crate) struct WatchdogGuard {
    handle: CancelHandle,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl Drop for WatchdogGuard {
    fn drop(&mut self) {
        {
            let mut done = self.handle.inner.done.lock();
            *done = true;
        }
        self.handle.inner.cv.notify_all();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wasm_config::sandbox_engine_config;

    #[test]
    fn first_reason_wins() {
        let engine = Engine::new(&sandbox_engine_config(false)).unwrap();
        let handle = CancelHandle::new(engine);
        handle.fire(CancelReason::OutputQuota);
        handle.fire(CancelReason::Deadline);
        assert_eq!(handle.fired(), Some(CancelReason::OutputQuota));
    }

    #[test]
    fn watchdog_fires_after_deadline() {
        let engine = Engine::new(&sandbox_engine_config(false)).unwrap();
        let handle = CancelHandle::new(engine);
        let guard = handle.arm(Duration::from_millis(20));
        std::thread::sleep(Duration::from_millis(120));
        assert_eq!(handle.fired(), Some(CancelReason::Deadline));
        drop(guard);
    }

    #[test]
    fn disarm_before_deadline_never_fires() {
        let engine = Engine::new(&sandbox_engine_config(false)).unwrap();
        let handle = CancelHandle::new(engine);
        let guard = handle.arm(Duration::from_secs(30));
        drop(guard);
        assert_eq!(handle.fired(), None);
    }
}
