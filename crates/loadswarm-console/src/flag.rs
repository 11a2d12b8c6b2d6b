//! Boolean condition shared across tasks.
//!
//! `StateFlag` supports atomic read, atomic set, blocking wait for a
//! target value, and a wake-all pulse that releases waiters without
//! changing the value. The controller keeps two of these: `processing`
//! and `shutdown`.

use tokio::sync::watch;

/// A watch-backed boolean condition.
#[derive(Debug)]
pub struct StateFlag {
    tx: watch::Sender<bool>,
}

impl StateFlag {
    /// Create a flag with the given initial value.
    pub fn new(initial: bool) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx }
    }

    /// Current value.
    pub fn get(&self) -> bool {
        *self.tx.borrow()
    }

    /// Set the value, waking all waiters even if the value is unchanged.
    pub fn set(&self, value: bool) {
        self.tx.send_replace(value);
    }

    /// Release every waiter without changing the value. Waiters observe
    /// the current value, which may not be their target.
    pub fn wake_all(&self) {
        let current = *self.tx.borrow();
        self.tx.send_replace(current);
    }

    /// Wait until the value equals `target` or a wake pulse arrives,
    /// then return the value observed. Callers that need the target
    /// value must re-check the result and wait again.
    pub async fn wait_for(&self, target: bool) -> bool {
        let mut rx = self.tx.subscribe();
        let current = *rx.borrow_and_update();
        if current == target {
            return current;
        }
        match rx.changed().await {
            Ok(()) => *rx.borrow_and_update(),
            Err(_) => *rx.borrow(),
        }
    }
}
