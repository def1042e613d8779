//! Direct-to-task notification bits.
//!
//! A [`TaskNotifier`] is a 32-bit event word owned by one waiting thread.
//! Any thread (or a driver callback) may OR bits into it with
//! [`TaskNotifier::notify`]; the owner collects and clears them with
//! [`TaskNotifier::wait`]. Bits set while nobody waits are kept until the next
//! wait, so a notification is never lost to a race with the waiter.
//!
//! The event word lives behind a `critical_section` mutex so that notifying is
//! safe from interrupt-style callbacks.

use core::cell::{Cell, RefCell};
use core::fmt;
use critical_section::Mutex;
use std::thread::{self, Thread};
use std::time::{Duration, Instant};

/// Event word with a single waiting owner.
pub struct TaskNotifier {
    bits: Mutex<Cell<u32>>,
    owner: Mutex<RefCell<Option<Thread>>>,
}

impl fmt::Debug for TaskNotifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskNotifier")
            .field("pending", &self.pending())
            .finish()
    }
}

impl Default for TaskNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskNotifier {
    /// Creates a notifier with no bits set.
    pub const fn new() -> Self {
        Self {
            bits: Mutex::new(Cell::new(0)),
            owner: Mutex::new(RefCell::new(None)),
        }
    }

    /// ORs `bits` into the event word and wakes the owner.
    pub fn notify(&self, bits: u32) {
        let owner = critical_section::with(|cs| {
            let word = self.bits.borrow(cs);
            word.set(word.get() | bits);
            self.owner.borrow_ref(cs).clone()
        });
        if let Some(owner) = owner {
            owner.unpark();
        }
    }

    /// Bits currently set, without clearing them.
    pub fn pending(&self) -> u32 {
        critical_section::with(|cs| self.bits.borrow(cs).get())
    }

    /// Blocks the calling thread until any bit is set or `timeout` elapses.
    ///
    /// The calling thread becomes the owner woken by later notifications.
    ///
    /// # Returns
    /// - `Some(bits)`: every bit that was set; the word is cleared
    /// - `None`: the timeout elapsed with no bit set
    pub fn wait(&self, timeout: Duration) -> Option<u32> {
        critical_section::with(|cs| {
            let _ = self.owner.borrow_ref_mut(cs).replace(thread::current());
        });

        let deadline = Instant::now() + timeout;
        loop {
            let bits = critical_section::with(|cs| self.bits.borrow(cs).replace(0));
            if bits != 0 {
                return Some(bits);
            }

            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            thread::park_timeout(deadline - now);
        }
    }
}
