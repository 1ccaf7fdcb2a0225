//! Cancellation and deadline signal for blocking database calls.
//!
//! A [`CancelToken`] is checked before every statement this crate runs.
//! While a statement is in flight its connection is registered with the
//! token, so firing the token (explicitly or because its deadline passed)
//! interrupts the statement through SQLite's interrupt mechanism. Either way
//! the caller sees a `Timeout`-kind error and the enclosing transaction rolls
//! back on its normal failure path.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use rusqlite::InterruptHandle;

use crate::error::DbError;

/// Shared cancellation signal with an optional deadline.
///
/// Cloning a token yields a handle to the same signal.
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    cancelled: AtomicBool,
    deadline: Option<Instant>,
    next_watch: AtomicU64,
    watched: Mutex<HashMap<u64, InterruptHandle>>,
}

impl Inner {
    fn watched(&self) -> MutexGuard<'_, HashMap<u64, InterruptHandle>> {
        self.watched.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn fire(&self) {
        if self.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        for handle in self.watched().values() {
            handle.interrupt();
        }
    }
}

impl CancelToken {
    /// Creates a token that only fires when [`cancel`](Self::cancel) is called.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a token that fires once `timeout` has elapsed.
    ///
    /// A watchdog thread interrupts in-flight statements at the deadline.
    /// If the watchdog cannot be spawned the deadline is still enforced
    /// before each statement.
    pub fn with_timeout(timeout: Duration) -> Self {
        let token = Self {
            inner: Arc::new(Inner {
                deadline: Some(Instant::now() + timeout),
                ..Inner::default()
            }),
        };

        let watched = Arc::downgrade(&token.inner);
        let spawned = std::thread::Builder::new()
            .name("cairn-deadline".to_string())
            .spawn(move || {
                std::thread::sleep(timeout);
                if let Some(inner) = watched.upgrade() {
                    tracing::debug!(timeout_ms = timeout.as_millis() as u64, "deadline elapsed");
                    inner.fire();
                }
            });
        if let Err(e) = spawned {
            tracing::warn!(error = %e, "failed to spawn deadline watchdog");
        }

        token
    }

    /// Fires the signal and interrupts every statement currently watched.
    pub fn cancel(&self) {
        self.inner.fire();
    }

    /// Whether the signal has fired or the deadline has passed.
    pub fn is_cancelled(&self) -> bool {
        if self.inner.cancelled.load(Ordering::SeqCst) {
            return true;
        }
        match self.inner.deadline {
            Some(deadline) if Instant::now() >= deadline => {
                self.inner.fire();
                true
            }
            _ => false,
        }
    }

    /// The deadline, if this token has one.
    pub fn deadline(&self) -> Option<Instant> {
        self.inner.deadline
    }

    /// Returns `DbError::Cancelled` for `op` if the signal has fired.
    pub fn check(&self, op: &'static str) -> Result<(), DbError> {
        if self.is_cancelled() {
            return Err(DbError::Cancelled { op });
        }
        Ok(())
    }

    /// Registers a connection's interrupt handle until the guard drops.
    pub(crate) fn watch(&self, handle: InterruptHandle) -> WatchGuard<'_> {
        let id = self.inner.next_watch.fetch_add(1, Ordering::Relaxed);
        self.inner.watched().insert(id, handle);

        // The signal may have fired between the caller's check and the
        // registration above.
        if self.inner.cancelled.load(Ordering::SeqCst) {
            if let Some(handle) = self.inner.watched().get(&id) {
                handle.interrupt();
            }
        }

        WatchGuard { token: self, id }
    }
}

impl fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.inner.cancelled.load(Ordering::SeqCst))
            .field("deadline", &self.inner.deadline)
            .finish()
    }
}

/// Keeps a connection registered with a [`CancelToken`].
pub(crate) struct WatchGuard<'a> {
    token: &'a CancelToken,
    id: u64,
}

impl Drop for WatchGuard<'_> {
    fn drop(&mut self) {
        self.token.inner.watched().remove(&self.id);
    }
}
