//! Concurrency slots backed by semaphore permits.
//!
//! A [`SlotGuard`] is moved into the call attempt task that uses it and
//! gives the slot back when dropped, whichever way the attempt ends.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tracing::debug;

#[derive(Debug)]
pub struct ConcurrencyBudget {
    name: String,
    semaphore: Arc<Semaphore>,
    limit: AtomicU32,
    shared: Arc<Shared>,
}

#[derive(Debug, Default)]
struct Shared {
    /// Permits still to be retired after a shrink. Slots given back while
    /// this is non-zero are forgotten instead of returned.
    debt: Mutex<u32>,
    released: Notify,
}

/// One occupied slot
#[derive(Debug)]
pub struct SlotGuard {
    permit: Option<OwnedSemaphorePermit>,
    shared: Arc<Shared>,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        if let Some(permit) = self.permit.take() {
            let mut debt = self.shared.debt.lock();
            if *debt > 0 {
                *debt -= 1;
                permit.forget();
            } else {
                // return the permit before waking anyone
                drop(permit);
            }
        }
        self.shared.released.notify_one();
    }
}

impl ConcurrencyBudget {
    pub fn new(name: impl Into<String>, limit: u32) -> Self {
        Self {
            name: name.into(),
            semaphore: Arc::new(Semaphore::new(limit as usize)),
            limit: AtomicU32::new(limit),
            shared: Arc::new(Shared::default()),
        }
    }

    /// Take a slot without waiting
    pub fn try_acquire(&self) -> Option<SlotGuard> {
        let permit = Arc::clone(&self.semaphore).try_acquire_owned().ok()?;
        Some(SlotGuard {
            permit: Some(permit),
            shared: Arc::clone(&self.shared),
        })
    }

    /// Resolves after some slot is given back. A release that happened since
    /// the last wait is remembered, so checking then waiting cannot miss it.
    pub async fn slot_released(&self) {
        self.shared.released.notified().await;
    }

    pub fn limit(&self) -> u32 {
        self.limit.load(Ordering::SeqCst)
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn in_use(&self) -> u32 {
        let debt = *self.shared.debt.lock();
        (self.limit() + debt).saturating_sub(self.available() as u32)
    }

    /// Change the number of slots. Shrinking never interrupts holders: idle
    /// permits are retired at once and the rest as holders give their
    /// slots back. Growing pays that debt down before adding permits.
    pub fn resize(&self, new_limit: u32) {
        let mut debt = self.shared.debt.lock();
        let old = self.limit.swap(new_limit, Ordering::SeqCst);

        if new_limit > old {
            let grow = new_limit - old;
            let repaid = grow.min(*debt);
            *debt -= repaid;
            self.semaphore.add_permits((grow - repaid) as usize);
        } else if new_limit < old {
            let mut surplus = old - new_limit;
            while surplus > 0 {
                match self.semaphore.try_acquire() {
                    Ok(permit) => {
                        permit.forget();
                        surplus -= 1;
                    }
                    Err(_) => break,
                }
            }
            *debt += surplus;
        }

        debug!(
            "Budget {} resized {} -> {} ({} slots still to retire)",
            self.name, old, new_limit, *debt
        );
    }
}
