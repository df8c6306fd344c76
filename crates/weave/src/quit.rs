//! Cooperative cancellation shared by every domain.
//!
//! The token is the only cancellation primitive: frame loops check it between
//! frames, the orchestrator blocks on it when no domain drives the main loop,
//! and signal handlers hold a clone to request shutdown.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

/// Clonable quit flag with blocking wait.
#[derive(Clone, Default)]
pub struct QuitToken {
    inner: Arc<QuitInner>,
}

#[derive(Default)]
struct QuitInner {
    flag: AtomicBool,
    lock: Mutex<()>,
    cvar: Condvar,
}

impl QuitToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request shutdown. Safe to call from any thread, any number of times.
    pub fn quit(&self) {
        self.inner.flag.store(true, Ordering::Release);
        let _guard = self.inner.lock.lock().unwrap_or_else(|e| e.into_inner());
        self.inner.cvar.notify_all();
    }

    pub fn should_quit(&self) -> bool {
        self.inner.flag.load(Ordering::Acquire)
    }

    /// Clear the flag so the owning app can run again.
    pub fn reset(&self) {
        self.inner.flag.store(false, Ordering::Release);
    }

    /// Block until [`quit`](Self::quit) is called.
    pub fn wait(&self) {
        let mut guard = self.inner.lock.lock().unwrap_or_else(|e| e.into_inner());
        while !self.should_quit() {
            guard = self
                .inner
                .cvar
                .wait(guard)
                .unwrap_or_else(|e| e.into_inner());
        }
    }

    /// Block until quit or timeout. Returns whether quit was requested.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut guard = self.inner.lock.lock().unwrap_or_else(|e| e.into_inner());
        while !self.should_quit() {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            guard = self
                .inner
                .cvar
                .wait_timeout(guard, deadline - now)
                .map(|(g, _)| g)
                .unwrap_or_else(|e| e.into_inner().0);
        }
        true
    }
}

impl std::fmt::Debug for QuitToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuitToken")
            .field("should_quit", &self.should_quit())
            .finish()
    }
}
