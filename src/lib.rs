// The MIT License (MIT)

// Copyright (c) 2026 Weft Developers

// Permission is hereby granted, free of charge, to any person obtaining a copy of
// this software and associated documentation files (the "Software"), to deal in
// the Software without restriction, including without limitation the rights to
// use, copy, modify, merge, publish, distribute, sublicense, and/or sell copies of
// the Software, and to permit persons to whom the Software is furnished to do so,
// subject to the following conditions:

// The above copyright notice and this permission notice shall be included in all
// copies or substantial portions of the Software.

// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY, FITNESS
// FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE AUTHORS OR
// COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER LIABILITY, WHETHER
// IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM, OUT OF OR IN
// CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE SOFTWARE.

//! # Weft
//!
//! A stackful coroutine scheduler fused with an event-driven I/O reactor
//! and a transparent syscall interception layer.
//!
//! The pieces, leaves first:
//!
//! * [`coroutine`] — user-space execution units with explicit stacks and
//!   symmetric context switching;
//! * [`scheduler`] — an M:N dispatcher running coroutines and callables
//!   across a worker-thread pool, optionally co-opting the caller thread;
//! * [`timer`] — a deadline-ordered timer set with cancellation, refresh,
//!   reset, and recurrence;
//! * [`iomanager`] — the scheduler extended with an edge-triggered epoll
//!   reactor: per-fd event contexts, a tickle pipe, and the timer set;
//! * [`fd_manager`] — the process-wide fd cache the hook layer consults;
//! * [`hook`] — POSIX I/O, sleep, and fd-lifecycle calls rebound at
//!   dynamic-link time so blocking-style code running inside a coroutine
//!   yields instead of blocking.
//!
//! ```no_run
//! use weft::IoManager;
//!
//! let iom = IoManager::new(2, false, "main").unwrap();
//! iom.spawn(|| {
//!     // Blocking-style socket code runs here; would-block turns into a
//!     // coroutine yield.
//! });
//! iom.stop();
//! ```

#[cfg(not(target_os = "linux"))]
compile_error!("this runtime requires epoll and dlsym interposition (Linux)");

pub mod config;
mod context;
pub mod coroutine;
pub mod fd_manager;
pub mod hook;
pub mod iomanager;
pub mod scheduler;
mod stack;
pub mod timer;
pub mod util;

pub use config::{settings, Settings};
pub use coroutine::{Coroutine, Handle, State};
pub use hook::{connect_with_timeout, is_hook_enabled, set_hook_enabled};
pub use iomanager::{Event, IoManager};
pub use scheduler::{Scheduler, Task};
pub use timer::Timer;

/// Spawn a coroutine on a default-sized stack.
///
/// Equivalent to `Coroutine::new`.
pub fn spawn<F>(f: F) -> Handle
where
    F: FnOnce() + Send + 'static,
{
    Coroutine::new(f)
}

/// The coroutine executing on this thread.
///
/// Equivalent to `Coroutine::current`.
pub fn current() -> Handle {
    Coroutine::current()
}

/// Yield the current coroutine and ask to be re-enqueued.
///
/// Equivalent to `Coroutine::yield_to_ready`.
pub fn yield_now() {
    Coroutine::yield_to_ready()
}
