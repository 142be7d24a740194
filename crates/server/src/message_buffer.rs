use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::watch;

/// Identifies a waiter within a [`MessageBuffer`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WaiterId(u64);

/// The wake-up side of a pending wait.
///
/// Wake-ups coalesce: a waiter that has not looked at its receiver yet only
/// sees the latest announced sequence.
#[derive(Debug)]
pub struct Waiter {
    id: WaiterId,
    wake: watch::Sender<u64>,
}

impl Waiter {
    /// Returns the waiter's id.
    #[must_use]
    pub const fn id(&self) -> WaiterId {
        self.id
    }

    fn wake(&self, sequence: u64) {
        self.wake.send_replace(sequence);
    }
}

/// Outcome of [`MessageBuffer::remove`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Removal {
    /// The waiter was not registered under the key (already removed).
    NotRegistered,

    /// The waiter was removed and this many waiters remain for the key.
    Remaining(usize),

    /// The waiter was the last one for the key; the entry is gone.
    Emptied,
}

/// Registry of pending waiters per channel key.
///
/// Holds no timeout or resolution logic, it only tracks who to wake up.
#[derive(Debug, Default)]
pub struct MessageBuffer {
    entries: Mutex<HashMap<String, HashMap<WaiterId, Waiter>>>,
    next_id: AtomicU64,
}

impl MessageBuffer {
    /// Creates an empty buffer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a waiter with a unique id together with the receiver its
    /// wake-ups arrive on.
    pub fn waiter(&self) -> (Waiter, watch::Receiver<u64>) {
        let id = WaiterId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (wake, wakeups) = watch::channel(0);

        (Waiter { id, wake }, wakeups)
    }

    /// Registers `waiter` under `key`. Returns `true` if this created the
    /// key's entry.
    pub fn insert(&self, key: &str, waiter: Waiter) -> bool {
        let mut entries = self.entries.lock();

        match entries.get_mut(key) {
            Some(waiters) => {
                waiters.insert(waiter.id, waiter);
                false
            }
            None => {
                entries.insert(key.to_string(), HashMap::from([(waiter.id, waiter)]));
                true
            }
        }
    }

    /// Removes the waiter `id` from `key`. Removing twice is a no-op.
    pub fn remove(&self, key: &str, id: WaiterId) -> Removal {
        let mut entries = self.entries.lock();

        let Some(waiters) = entries.get_mut(key) else {
            return Removal::NotRegistered;
        };

        if waiters.remove(&id).is_none() {
            return Removal::NotRegistered;
        }

        if waiters.is_empty() {
            entries.remove(key);
            Removal::Emptied
        } else {
            Removal::Remaining(waiters.len())
        }
    }

    /// Wakes every waiter registered under `key` with `sequence`. Returns how
    /// many were woken.
    pub fn notify(&self, key: &str, sequence: u64) -> usize {
        let entries = self.entries.lock();

        entries.get(key).map_or(0, |waiters| {
            for waiter in waiters.values() {
                waiter.wake(sequence);
            }
            waiters.len()
        })
    }

    /// Number of waiters registered under `key`.
    #[must_use]
    pub fn len(&self, key: &str) -> usize {
        self.entries.lock().get(key).map_or(0, HashMap::len)
    }

    /// Whether no waiter is registered under any key.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}
