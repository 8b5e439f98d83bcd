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

//! Bounded delayed-event loop for scheduled non-real-time work.
//!
//! Handlers can be emitted from any thread but always execute on the thread
//! that runs [`EventLoop::exec`]. The queue has a fixed capacity; `emit`
//! reports saturation instead of growing.

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// Default queue capacity.
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// How long the loop sleeps when it has nothing scheduled.
pub const DEFAULT_TURNAROUND: Duration = Duration::from_millis(200);

type Handler = Box<dyn FnMut() + Send>;

struct Event {
    handler: Handler,
    expires_at: Instant,
}

struct State {
    events: Vec<Event>,
    exit_code: Option<i32>,
    drain_before_exit: bool,
}

/// Thread-safe, fixed-capacity event loop.
pub struct EventLoop {
    state: Mutex<State>,
    condvar: Condvar,
    turnaround: Duration,
    capacity: usize,
}

impl EventLoop {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_TURNAROUND, DEFAULT_EVENT_CAPACITY)
    }

    pub fn with_capacity(turnaround: Duration, capacity: usize) -> Self {
        Self {
            state: Mutex::new(State {
                events: Vec::with_capacity(capacity),
                exit_code: None,
                drain_before_exit: false,
            }),
            condvar: Condvar::new(),
            turnaround,
            capacity,
        }
    }

    /// Runs the loop on the calling thread until [`EventLoop::quit`] is
    /// called. Returns the exit code passed to `quit`.
    pub fn exec(&self) -> i32 {
        loop {
            let mut state = self.state.lock();

            // Run the oldest due event, without holding the lock.
            let now = Instant::now();
            if let Some(idx) = state.events.iter().position(|e| e.expires_at <= now) {
                let mut event = state.events.remove(idx);
                drop(state);
                (event.handler)();
                continue;
            }

            if let Some(code) = state.exit_code {
                if state.drain_before_exit {
                    // Flush everything that is still scheduled, ignoring
                    // due times.
                    let mut remaining = std::mem::take(&mut state.events);
                    drop(state);
                    for event in &mut remaining {
                        (event.handler)();
                    }
                }
                return code;
            }

            let timeout = state
                .events
                .iter()
                .map(|e| e.expires_at.saturating_duration_since(now))
                .min()
                .map_or(self.turnaround, |d| d.min(self.turnaround));
            self.condvar.wait_for(&mut state, timeout);
        }
    }

    /// Schedules a handler to run as soon as possible. Returns false if the
    /// queue is saturated.
    pub fn emit<F>(&self, handler: F) -> bool
    where
        F: FnMut() + Send + 'static,
    {
        self.emit_at(Box::new(handler), Instant::now())
    }

    /// Schedules a handler to run after the given delay. Returns false if
    /// the queue is saturated.
    pub fn emit_delayed<F>(&self, handler: F, delay: Duration) -> bool
    where
        F: FnMut() + Send + 'static,
    {
        self.emit_at(Box::new(handler), Instant::now() + delay)
    }

    fn emit_at(&self, handler: Handler, expires_at: Instant) -> bool {
        let mut state = self.state.lock();
        if state.events.len() >= self.capacity {
            return false;
        }
        state.events.push(Event {
            handler,
            expires_at,
        });
        self.condvar.notify_one();
        true
    }

    /// Stops the loop after the current event.
    pub fn quit(&self, exit_code: i32) {
        let mut state = self.state.lock();
        state.exit_code = Some(exit_code);
        state.drain_before_exit = false;
        self.condvar.notify_one();
    }

    /// Runs every scheduled event, then stops the loop.
    pub fn process_all_pending_events_and_quit(&self, exit_code: i32) {
        let mut state = self.state.lock();
        state.exit_code = Some(exit_code);
        state.drain_before_exit = true;
        self.condvar.notify_one();
    }

    pub fn has_pending_events(&self) -> bool {
        !self.state.lock().events.is_empty()
    }
}

impl Default for EventLoop {
    fn default() -> Self {
        Self::new()
    }
}
