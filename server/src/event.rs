//! A boolean flag other tasks can wait on, used for the `connected` and
//! `closing` signals on a [`ClientObject`](crate::client::ClientObject): a
//! flag that can be set/cleared, plus a wait that returns as soon as it
//! becomes set (or never, if it's cleared again first and no deadline is
//! given).

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::Notify;

/// A settable/clearable boolean condition with async waiters.
#[derive(Debug, Default)]
pub struct Event {
    flag: AtomicBool,
    notify: Notify,
}

impl Event {
    /// Creates a new event, initially clear.
    pub fn new() -> Self {
        Self {
            flag: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    /// Sets the event and wakes all current waiters.
    pub fn set(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    /// Clears the event. Future `wait` calls will block again.
    pub fn clear(&self) {
        self.flag.store(false, Ordering::SeqCst);
    }

    /// Returns the current state without waiting.
    pub fn is_set(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Waits until the event is set.
    pub async fn wait(&self) {
        loop {
            if self.is_set() {
                return;
            }
            let notified = self.notify.notified();
            if self.is_set() {
                return;
            }
            notified.await;
        }
    }

    /// Waits until the event is set or `timeout` elapses.
    ///
    /// Returns `true` if the event became set, `false` on timeout.
    pub async fn wait_timeout(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.wait()).await.is_ok()
    }
}
