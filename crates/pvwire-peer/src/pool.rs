use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use tracing::debug;

/// Named-thread executor shared by connections.
///
/// Every task runs on its own named thread. The pool tracks live tasks so
/// [`ThreadPool::shutdown`] can wait for them; once shut down it refuses new
/// work. Threads never keep the process alive.
#[derive(Debug, Clone)]
pub struct ThreadPool {
    inner: Arc<PoolInner>,
}

#[derive(Debug)]
struct PoolInner {
    name: String,
    next_id: AtomicUsize,
    shut_down: AtomicBool,
    active: Mutex<usize>,
    idle: Condvar,
}

impl ThreadPool {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                name: name.into(),
                next_id: AtomicUsize::new(1),
                shut_down: AtomicBool::new(false),
                active: Mutex::new(0),
                idle: Condvar::new(),
            }),
        }
    }

    /// Run `task` on a new thread named `<pool>-<label>-<n>`.
    pub fn spawn<F>(&self, label: &str, task: F) -> io::Result<TaskHandle>
    where
        F: FnOnce() + Send + 'static,
    {
        if self.inner.shut_down.load(Ordering::Acquire) {
            return Err(io::Error::other(format!(
                "thread pool '{}' is shut down",
                self.inner.name
            )));
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let name = format!("{}-{label}-{id}", self.inner.name);
        let (done_tx, done_rx) = mpsc::channel();
        *lock(&self.inner.active) += 1;

        let guard = DoneGuard {
            done: done_tx,
            pool: Arc::clone(&self.inner),
        };
        // On spawn failure the closure, and with it the guard, is dropped,
        // which releases the active count.
        let thread = thread::Builder::new().name(name.clone()).spawn(move || {
            let _guard = guard;
            task();
        })?;

        Ok(TaskHandle {
            name,
            thread: Some(thread),
            done: done_rx,
        })
    }

    /// Number of tasks still running.
    pub fn active(&self) -> usize {
        *lock(&self.inner.active)
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::Acquire)
    }

    /// Stop accepting tasks and wait up to `timeout` for running ones.
    ///
    /// Returns `true` if every task finished in time.
    pub fn shutdown(&self, timeout: Duration) -> bool {
        self.inner.shut_down.store(true, Ordering::Release);
        let deadline = Instant::now() + timeout;
        let mut active = lock(&self.inner.active);
        while *active > 0 {
            let now = Instant::now();
            if now >= deadline {
                debug!(pool = %self.inner.name, active = *active, "shutdown timed out");
                return false;
            }
            active = self
                .inner
                .idle
                .wait_timeout(active, deadline - now)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|poisoned| poisoned.into_inner().0);
        }
        true
    }
}

struct DoneGuard {
    done: Sender<()>,
    pool: Arc<PoolInner>,
}

impl Drop for DoneGuard {
    fn drop(&mut self) {
        let _ = self.done.send(());
        let mut active = lock(&self.pool.active);
        *active = active.saturating_sub(1);
        self.pool.idle.notify_all();
    }
}

/// Handle to a task spawned on a [`ThreadPool`].
#[derive(Debug)]
pub struct TaskHandle {
    name: String,
    thread: Option<JoinHandle<()>>,
    done: Receiver<()>,
}

impl TaskHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn thread_id(&self) -> Option<ThreadId> {
        self.thread.as_ref().map(|thread| thread.thread().id())
    }

    /// Wait up to `timeout` for the task to finish.
    ///
    /// Returns `false` on timeout; the handle stays usable for another try.
    pub fn join_timeout(&mut self, timeout: Duration) -> bool {
        match self.done.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if let Some(thread) = self.thread.take() {
                    let _ = thread.join();
                }
                true
            }
            Err(RecvTimeoutError::Timeout) => false,
        }
    }
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
