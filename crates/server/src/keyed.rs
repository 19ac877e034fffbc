//! Per-key serialization of async work.
//!
//! `tokio::sync::Mutex` queues waiters FIFO, so holders of the same key run
//! strictly in arrival order. Entries are dropped from the map as soon as the
//! last holder or waiter for a key lets go.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::{Mutex, OwnedMutexGuard};

struct Slot {
    mutex: Arc<Mutex<()>>,
    /// Holders plus waiters, including waiters that are still queued
    users: usize,
}

type Slots = Arc<StdMutex<HashMap<String, Slot>>>;

fn lock_slots(slots: &Slots) -> std::sync::MutexGuard<'_, HashMap<String, Slot>> {
    match slots.lock() {
        Ok(slots) => slots,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[derive(Clone, Default)]
pub struct KeyedSerializer {
    slots: Slots,
}

/// Counts one user of a key; the entry goes away with its last user, whether
/// that user held the lock or gave up waiting.
struct Ticket {
    key: String,
    slots: Slots,
}

impl Drop for Ticket {
    fn drop(&mut self) {
        let mut slots = lock_slots(&self.slots);
        let drained = match slots.get_mut(&self.key) {
            Some(slot) => {
                slot.users = slot.users.saturating_sub(1);
                slot.users == 0
            }
            None => false,
        };
        if drained {
            slots.remove(&self.key);
        }
    }
}

/// Held while work for `key` runs. Dropping it lets the next waiter in.
pub struct KeyGuard {
    // Field order matters: the mutex is released before the ticket is counted out.
    _guard: OwnedMutexGuard<()>,
    _ticket: Ticket,
}

impl KeyedSerializer {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, key: &str) -> KeyGuard {
        let (mutex, ticket) = {
            let mut slots = lock_slots(&self.slots);
            let slot = slots.entry(key.to_string()).or_insert_with(|| Slot {
                mutex: Arc::new(Mutex::new(())),
                users: 0,
            });
            slot.users += 1;
            (
                slot.mutex.clone(),
                Ticket {
                    key: key.to_string(),
                    slots: self.slots.clone(),
                },
            )
        };
        let guard = mutex.lock_owned().await;
        KeyGuard {
            _guard: guard,
            _ticket: ticket,
        }
    }

    /// Keys with a holder or waiter right now.
    pub fn active_keys(&self) -> usize {
        lock_slots(&self.slots).len()
    }
}
