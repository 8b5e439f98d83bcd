// Copyright (C) 2026 Michael Wilson <mike@mdwn.dev>
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free Software
// Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//

//! Counting semaphore backed by a mutex and condition variable.
//!
//! Only ever used to put worker threads to sleep between jobs. Real-time
//! threads signal it (`notify` is a short uncontended lock) but never wait
//! on it.

use parking_lot::{Condvar, Mutex};

/// A counting semaphore.
pub struct Semaphore {
    counter: Mutex<u32>,
    condvar: Condvar,
}

impl Semaphore {
    pub fn new(initial_count: u32) -> Self {
        Self {
            counter: Mutex::new(initial_count),
            condvar: Condvar::new(),
        }
    }

    /// Increments the counter and wakes one waiter.
    pub fn notify(&self) {
        let mut count = self.counter.lock();
        *count += 1;
        self.condvar.notify_one();
    }

    /// Blocks until the counter is positive, then decrements it.
    pub fn wait(&self) {
        let mut count = self.counter.lock();
        while *count == 0 {
            self.condvar.wait(&mut count);
        }
        *count -= 1;
    }

    /// Decrements the counter if it is positive. Returns whether a permit
    /// was taken.
    pub fn try_wait(&self) -> bool {
        let mut count = self.counter.lock();
        if *count > 0 {
            *count -= 1;
            true
        } else {
            false
        }
    }

    pub fn count(&self) -> u32 {
        *self.counter.lock()
    }
}

impl Default for Semaphore {
    fn default() -> Self {
        Self::new(0)
    }
}
