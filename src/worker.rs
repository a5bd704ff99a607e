//! Background thread plumbing shared by the capture loop, the recorder, the
//! persistence worker and the viewer server.
//!
//! Cancellation is cooperative: loops poll a `StopSignal` at iteration
//! boundaries and use `wait_timeout` for any sleep that should end early on
//! stop. Joins are always bounded.

use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};

/// Shared stop flag with an interruptible wait.
#[derive(Clone, Debug, Default)]
pub struct StopSignal {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        let (lock, cvar) = &*self.inner;
        *lock.lock().unwrap_or_else(PoisonError::into_inner) = true;
        cvar.notify_all();
    }

    pub fn is_stopped(&self) -> bool {
        let (lock, _) = &*self.inner;
        *lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sleep for up to `timeout`, returning early if stop is requested.
    /// Returns true when the signal is set.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let (lock, cvar) = &*self.inner;
        let deadline = Instant::now() + timeout;
        let mut stopped = lock.lock().unwrap_or_else(PoisonError::into_inner);
        while !*stopped {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let (guard, _) = cvar
                .wait_timeout(stopped, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            stopped = guard;
        }
        *stopped
    }
}

/// Result of a bounded join.
#[derive(Debug)]
pub enum JoinOutcome<T> {
    Finished(T),
    Panicked,
    TimedOut,
    AlreadyJoined,
}

impl<T> JoinOutcome<T> {
    pub fn is_finished(&self) -> bool {
        matches!(self, JoinOutcome::Finished(_))
    }
}

/// A named thread whose completion can be awaited with a deadline.
pub struct Worker<T> {
    name: String,
    handle: Option<JoinHandle<T>>,
    done: Receiver<()>,
}

struct DoneGuard(Sender<()>);

impl Drop for DoneGuard {
    fn drop(&mut self) {
        // Fires on normal return and on unwind.
        let _ = self.0.try_send(());
    }
}

impl<T: Send + 'static> Worker<T> {
    pub fn spawn<F>(name: impl Into<String>, f: F) -> std::io::Result<Self>
    where
        F: FnOnce() -> T + Send + 'static,
    {
        let name = name.into();
        let (done_tx, done_rx) = crossbeam_channel::bounded(1);
        let handle = std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                let _guard = DoneGuard(done_tx);
                f()
            })?;
        Ok(Self {
            name,
            handle: Some(handle),
            done: done_rx,
        })
    }
}

impl<T> Worker<T> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, |h| h.is_finished())
    }

    /// Wait at most `timeout` for the thread to exit. On timeout the thread
    /// keeps running detached once this worker is dropped.
    pub fn join_timeout(&mut self, timeout: Duration) -> JoinOutcome<T> {
        let Some(handle) = self.handle.take() else {
            return JoinOutcome::AlreadyJoined;
        };
        match self.done.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => match handle.join() {
                Ok(value) => JoinOutcome::Finished(value),
                Err(_) => JoinOutcome::Panicked,
            },
            Err(RecvTimeoutError::Timeout) => {
                log::warn!(
                    "thread {} did not exit within {:?}; detaching",
                    self.name,
                    timeout
                );
                JoinOutcome::TimedOut
            }
        }
    }
}
