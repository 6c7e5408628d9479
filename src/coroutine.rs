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

//! Stackful coroutines with symmetric switching.
//!
//! Every thread lazily owns a *main coroutine*: a stackless record of the
//! thread's original entry context. `resume` switches from the thread's
//! dispatch coroutine (the main coroutine, or a scheduler's root coroutine)
//! into a target coroutine; `yield_to_hold`/`yield_to_ready` switch back.
//!
//! ```
//! use weft::coroutine::Coroutine;
//!
//! let co = Coroutine::new(|| {
//!     Coroutine::yield_to_hold();
//! });
//! co.resume(); // runs until the yield
//! co.resume(); // runs to completion
//! ```

use std::cell::{RefCell, UnsafeCell};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};

use log::{error, trace, warn};

use crate::config::settings;
use crate::context::Context;
use crate::stack::{Stack, StackPool};

static COROUTINE_ID: AtomicU64 = AtomicU64::new(0);
static COROUTINE_COUNT: AtomicU64 = AtomicU64::new(0);

thread_local! {
    /// Coroutine currently executing on this thread.
    static CURRENT: RefCell<Option<Handle>> = const { RefCell::new(None) };
    /// This thread's main coroutine, created on first use.
    static THREAD_MAIN: RefCell<Option<Handle>> = const { RefCell::new(None) };
    /// The coroutine yields return to: a scheduler's dispatch coroutine, or
    /// the thread main coroutine outside any scheduler.
    static DISPATCH: RefCell<Option<Handle>> = const { RefCell::new(None) };
    /// Terminated stacks are recycled through a per-thread pool.
    static STACK_POOL: RefCell<StackPool> = RefCell::new(StackPool::new());
}

/// Shared reference to a coroutine.
pub type Handle = Arc<Coroutine>;

/// Lifecycle state of a coroutine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum State {
    /// Constructed or reset, not yet run.
    Init = 0,
    /// Yielded and asking to be re-enqueued.
    Ready = 1,
    /// Currently executing on some thread.
    Exec = 2,
    /// Yielded, parked until someone resumes it.
    Hold = 3,
    /// Ran to completion.
    Term = 4,
    /// The body panicked.
    Except = 5,
}

impl State {
    fn from_u8(v: u8) -> State {
        match v {
            0 => State::Init,
            1 => State::Ready,
            2 => State::Exec,
            3 => State::Hold,
            4 => State::Term,
            _ => State::Except,
        }
    }
}

/// A unit of execution with its own stack and saved machine context.
pub struct Coroutine {
    id: u64,
    state: AtomicU8,
    // `None` for a thread's main coroutine.
    stack: UnsafeCell<Option<Stack>>,
    ctx: UnsafeCell<Context>,
    cb: UnsafeCell<Option<Box<dyn FnOnce() + Send>>>,
    // Root coroutines host a scheduler's dispatch loop on the caller
    // thread; their terminal switch targets the thread main coroutine.
    root: bool,
    self_ref: Weak<Coroutine>,
}

// A coroutine executes on exactly one thread at a time: the scheduler skips
// EXEC coroutines and every other access goes through `resume`, which owns
// the context exclusively until the matching switch back.
unsafe impl Send for Coroutine {}
unsafe impl Sync for Coroutine {}

impl std::fmt::Debug for Coroutine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coroutine")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}

impl Coroutine {
    /// Create a coroutine running `f` on a default-sized stack.
    pub fn new<F>(f: F) -> Handle
    where
        F: FnOnce() + Send + 'static,
    {
        Coroutine::with_stack_size(f, 0)
    }

    /// Create a coroutine with an explicit stack size. A size of zero means
    /// the configured default.
    pub fn with_stack_size<F>(f: F, stack_size: usize) -> Handle
    where
        F: FnOnce() + Send + 'static,
    {
        Coroutine::spawn_inner(Box::new(f), stack_size, false)
    }

    pub(crate) fn from_boxed(f: Box<dyn FnOnce() + Send>) -> Handle {
        Coroutine::spawn_inner(f, 0, false)
    }

    pub(crate) fn new_root(f: Box<dyn FnOnce() + Send>) -> Handle {
        Coroutine::spawn_inner(f, 0, true)
    }

    fn spawn_inner(f: Box<dyn FnOnce() + Send>, stack_size: usize, root: bool) -> Handle {
        let size = if stack_size == 0 {
            settings().stack_size()
        } else {
            stack_size
        };
        let stack = STACK_POOL.with(|p| p.borrow_mut().take_stack(size));
        let ctx = Context::new(coroutine_entry, 0, &stack);
        COROUTINE_COUNT.fetch_add(1, Ordering::Relaxed);
        let co = Arc::new_cyclic(|weak| Coroutine {
            id: COROUTINE_ID.fetch_add(1, Ordering::Relaxed) + 1,
            state: AtomicU8::new(State::Init as u8),
            stack: UnsafeCell::new(Some(stack)),
            ctx: UnsafeCell::new(ctx),
            cb: UnsafeCell::new(Some(f)),
            root,
            self_ref: weak.clone(),
        });
        trace!("coroutine {} created", co.id);
        co
    }

    fn new_main() -> Handle {
        COROUTINE_COUNT.fetch_add(1, Ordering::Relaxed);
        Arc::new_cyclic(|weak| Coroutine {
            id: COROUTINE_ID.fetch_add(1, Ordering::Relaxed) + 1,
            state: AtomicU8::new(State::Exec as u8),
            stack: UnsafeCell::new(None),
            ctx: UnsafeCell::new(Context::empty()),
            cb: UnsafeCell::new(None),
            root: false,
            self_ref: weak.clone(),
        })
    }

    /// Shared handle to this coroutine.
    pub fn handle(&self) -> Handle {
        self.self_ref.upgrade().expect("coroutine already dropped")
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub fn state(&self) -> State {
        State::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub(crate) fn set_state(&self, state: State) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    /// Switch from the thread's dispatch coroutine into this one.
    ///
    /// The target must be INIT, READY, or HOLD. Resuming a coroutine in any
    /// other state is a caller bug: it aborts in debug builds and is
    /// refused in release builds.
    pub fn resume(&self) {
        match self.state() {
            State::Init | State::Ready | State::Hold => {}
            s => {
                debug_assert!(false, "resume of coroutine {} in state {:?}", self.id, s);
                error!("refusing to resume coroutine {} in state {:?}", self.id, s);
                return;
            }
        }
        let from = dispatch_target();
        if std::ptr::eq(Arc::as_ptr(&from), self) {
            debug_assert!(false, "coroutine {} resumed itself", self.id);
            return;
        }
        debug_assert!(
            std::ptr::eq(Arc::as_ptr(&Coroutine::current()), Arc::as_ptr(&from)),
            "resume outside the dispatch coroutine"
        );
        self.set_state(State::Exec);
        set_current(self.handle());
        unsafe { Context::swap(from.ctx.get(), self.ctx.get()) }
    }

    /// Enter a root coroutine from the thread's main coroutine.
    pub(crate) fn call(&self) {
        let main = thread_main();
        self.set_state(State::Exec);
        set_current(self.handle());
        unsafe { Context::swap(main.ctx.get(), self.ctx.get()) }
    }

    /// Switch a root coroutine back to the thread's main coroutine.
    fn back(&self) {
        let main = thread_main();
        set_current(main.clone());
        unsafe { Context::swap(self.ctx.get(), main.ctx.get()) }
    }

    /// Switch back to the thread's dispatch coroutine.
    fn swap_out(&self) {
        let to = dispatch_target();
        set_current(to.clone());
        unsafe { Context::swap(self.ctx.get(), to.ctx.get()) }
    }

    /// Suspend the currently executing coroutine in HOLD and return to the
    /// dispatch coroutine. No-op on a thread's main coroutine.
    pub fn yield_to_hold() {
        Coroutine::yield_with(State::Hold)
    }

    /// Suspend the currently executing coroutine in READY; the scheduler
    /// re-enqueues it.
    pub fn yield_to_ready() {
        Coroutine::yield_with(State::Ready)
    }

    fn yield_with(state: State) {
        let cur = Coroutine::current();
        if Arc::ptr_eq(&cur, &dispatch_target()) {
            warn!("yield outside a coroutine ignored");
            return;
        }
        cur.set_state(state);
        cur.swap_out();
    }

    /// Rebind a finished (or never-started) coroutine to a new callable,
    /// reusing its stack. Allowed in INIT, TERM, and EXCEPT only.
    pub fn reset<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.reset_boxed(Box::new(f))
    }

    pub(crate) fn reset_boxed(&self, f: Box<dyn FnOnce() + Send>) {
        match self.state() {
            State::Init | State::Term | State::Except => {}
            s => {
                debug_assert!(false, "reset of coroutine {} in state {:?}", self.id, s);
                error!("refusing to reset coroutine {} in state {:?}", self.id, s);
                return;
            }
        }
        unsafe {
            let stack = (*self.stack.get())
                .as_ref()
                .expect("reset of a stackless coroutine");
            *self.cb.get() = Some(f);
            (*self.ctx.get()).rebind(coroutine_entry, 0, stack);
        }
        self.set_state(State::Init);
    }

    /// The coroutine executing on this thread. Lazily creates the thread's
    /// main coroutine on first use.
    pub fn current() -> Handle {
        if let Some(cur) = CURRENT.with(|c| c.borrow().clone()) {
            return cur;
        }
        thread_main()
    }

    /// Id of the coroutine executing on this thread, 0 if none.
    pub fn current_id() -> u64 {
        CURRENT.with(|c| c.borrow().as_ref().map(|co| co.id).unwrap_or(0))
    }

    /// Number of live coroutines in the process, main coroutines included.
    pub fn total() -> u64 {
        COROUTINE_COUNT.load(Ordering::Relaxed)
    }
}

impl Drop for Coroutine {
    fn drop(&mut self) {
        let mut stack = self.stack.get_mut().take();
        if stack.is_some() {
            debug_assert!(matches!(
                self.state(),
                State::Init | State::Term | State::Except
            ));
            // Recycle through the pool unless this thread is tearing down.
            let _ = STACK_POOL.try_with(|p| {
                if let Some(s) = stack.take() {
                    p.borrow_mut().give_stack(s);
                }
            });
        }
        COROUTINE_COUNT.fetch_sub(1, Ordering::Relaxed);
    }
}

/// First frame of every coroutine: run the callable, record the outcome,
/// then switch back to the dispatch coroutine. This function must never
/// return on the coroutine stack.
extern "C" fn coroutine_entry(_arg: usize) -> ! {
    let cur = Coroutine::current();
    debug_assert_eq!(cur.state(), State::Exec);

    let cb = unsafe { (*cur.cb.get()).take() };
    let result = panic::catch_unwind(AssertUnwindSafe(move || {
        if let Some(cb) = cb {
            cb()
        }
    }));
    match result {
        Ok(()) => cur.set_state(State::Term),
        Err(cause) => {
            cur.set_state(State::Except);
            let msg = panic_message(&cause);
            error!(
                "coroutine {} panicked: {}\n{}",
                cur.id,
                msg,
                std::backtrace::Backtrace::force_capture()
            );
        }
    }

    // Drop our handle before leaving this stack for the last time; the
    // resuming side still owns one.
    let root = cur.root;
    let raw: *const Coroutine = Arc::as_ptr(&cur);
    drop(cur);
    unsafe {
        if root {
            (*raw).back();
        } else {
            (*raw).swap_out();
        }
    }
    unreachable!("terminated coroutine was resumed");
}

fn panic_message(cause: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = cause.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = cause.downcast_ref::<String>() {
        s
    } else {
        "Box<dyn Any>"
    }
}

fn set_current(co: Handle) {
    CURRENT.with(|c| *c.borrow_mut() = Some(co));
}

/// The thread's main coroutine, created on first access.
pub(crate) fn thread_main() -> Handle {
    THREAD_MAIN.with(|m| {
        let mut slot = m.borrow_mut();
        match &*slot {
            Some(main) => main.clone(),
            None => {
                let main = Coroutine::new_main();
                *slot = Some(main.clone());
                CURRENT.with(|c| {
                    let mut cur = c.borrow_mut();
                    if cur.is_none() {
                        *cur = Some(main.clone());
                    }
                });
                main
            }
        }
    })
}

/// Yield target for coroutines running on this thread.
pub(crate) fn dispatch_target() -> Handle {
    DISPATCH
        .with(|d| d.borrow().clone())
        .unwrap_or_else(thread_main)
}

pub(crate) fn set_dispatch_target(co: Handle) {
    DISPATCH.with(|d| *d.borrow_mut() = Some(co));
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc::channel;

    use super::*;

    #[test]
    fn test_coroutine_basic() {
        let (tx, rx) = channel();
        let co = Coroutine::new(move || {
            tx.send(1).unwrap();
        });
        co.resume();
        assert_eq!(rx.recv().unwrap(), 1);
        assert_eq!(co.state(), State::Term);
    }

    #[test]
    fn test_coroutine_yield() {
        let (tx, rx) = channel();
        let co = Coroutine::new(move || {
            tx.send(1).unwrap();

            Coroutine::yield_to_hold();

            tx.send(2).unwrap();
        });
        co.resume();
        assert_eq!(rx.recv().unwrap(), 1);
        assert!(rx.try_recv().is_err());
        assert_eq!(co.state(), State::Hold);

        co.resume();
        assert_eq!(rx.recv().unwrap(), 2);
        assert_eq!(co.state(), State::Term);
    }

    #[test]
    fn test_coroutine_yield_ready() {
        let co = Coroutine::new(|| {
            Coroutine::yield_to_ready();
        });
        co.resume();
        assert_eq!(co.state(), State::Ready);
        co.resume();
        assert_eq!(co.state(), State::Term);
    }

    #[test]
    fn test_coroutine_reset_reuses_stack() {
        let (tx, rx) = channel();
        let co = Coroutine::new(|| {});
        co.resume();
        assert_eq!(co.state(), State::Term);

        co.reset(move || {
            tx.send(7).unwrap();
        });
        assert_eq!(co.state(), State::Init);
        co.resume();
        assert_eq!(rx.recv().unwrap(), 7);
        assert_eq!(co.state(), State::Term);
    }

    #[test]
    fn test_coroutine_panic_becomes_except() {
        let co = Coroutine::new(|| {
            panic!("panic inside a coroutine");
        });
        co.resume();
        assert_eq!(co.state(), State::Except);
    }

    #[test]
    fn test_resume_after_finished_is_refused() {
        let co = Coroutine::new(|| {});
        co.resume();
        assert_eq!(co.state(), State::Term);
        // Release builds refuse; nothing to observe beyond the state.
        if cfg!(not(debug_assertions)) {
            co.resume();
            assert_eq!(co.state(), State::Term);
        }
    }

    #[test]
    fn test_current_inside_coroutine() {
        let (tx, rx) = channel();
        let co = Coroutine::new(move || {
            tx.send(Coroutine::current_id()).unwrap();
        });
        let id = co.id();
        co.resume();
        assert_eq!(rx.recv().unwrap(), id);
        // Back on the main coroutine.
        assert_ne!(Coroutine::current_id(), id);
    }

    #[test]
    fn test_yield_in_main_is_noop() {
        Coroutine::yield_to_hold();
        Coroutine::yield_to_ready();
    }

    #[test]
    fn test_stack_size_override() {
        let (tx, rx) = channel();
        let co = Coroutine::with_stack_size(
            move || {
                // Enough frames to need a real stack.
                fn depth(n: usize) -> usize {
                    if n == 0 {
                        0
                    } else {
                        1 + depth(n - 1)
                    }
                }
                tx.send(depth(128)).unwrap();
            },
            256 * 1024,
        );
        co.resume();
        assert_eq!(rx.recv().unwrap(), 128);
    }
}
