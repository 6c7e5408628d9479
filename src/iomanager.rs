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

//! Scheduler with an edge-triggered epoll reactor and a timer set.
//!
//! The per-worker idle coroutine hosts the epoll wait: when the queue runs
//! dry, a worker parks in `epoll_wait` bounded by the next timer deadline
//! (capped at three seconds). Readiness and expired timers schedule their
//! targets back onto the scheduler; a one-byte write to an internal pipe
//! ("tickle") interrupts the wait when new work arrives.

use std::cell::RefCell;
use std::io;
use std::ops::Deref;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, RwLock, Weak};

use log::{debug, error, info};

use crate::coroutine::{Coroutine, Handle, State};
use crate::scheduler::{Hooks, Scheduler, Task};
use crate::timer::{Timer, TimerManager, NO_TIMEOUT};
use crate::util::errno;

/// Hard cap on a single epoll wait, so stop requests are noticed even with
/// no timers queued.
const MAX_TIMEOUT_MS: u64 = 3000;
const EVENT_BATCH: usize = 64;

const READ_BIT: u32 = libc::EPOLLIN as u32;
const WRITE_BIT: u32 = libc::EPOLLOUT as u32;
const ET_BIT: u32 = libc::EPOLLET as u32;

thread_local! {
    static CURRENT_IO: RefCell<Option<(Weak<IoCore>, Weak<Scheduler>)>> =
        const { RefCell::new(None) };
}

/// An I/O readiness direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Read,
    Write,
}

impl Event {
    fn bit(self) -> u32 {
        match self {
            Event::Read => READ_BIT,
            Event::Write => WRITE_BIT,
        }
    }
}

/// Where to deliver a fired event: exactly one of a parked coroutine or a
/// callable, plus the scheduler that should run it.
enum EventTarget {
    Coroutine(Handle, Weak<Scheduler>),
    Call(Box<dyn FnOnce() + Send>, Weak<Scheduler>),
}

#[derive(Default)]
struct FdEvents {
    /// Directions currently armed; mirrors what the kernel knows.
    events: u32,
    read: Option<EventTarget>,
    write: Option<EventTarget>,
}

struct FdContext {
    fd: RawFd,
    inner: Mutex<FdEvents>,
}

impl FdContext {
    fn new(fd: RawFd) -> Arc<FdContext> {
        Arc::new(FdContext {
            fd,
            inner: Mutex::new(FdEvents::default()),
        })
    }
}

pub(crate) struct IoCore {
    epfd: RawFd,
    tickle_r: RawFd,
    tickle_w: RawFd,
    pending: AtomicUsize,
    fd_contexts: RwLock<Vec<Arc<FdContext>>>,
    timers: Arc<TimerManager>,
    scheduler: OnceLock<Weak<Scheduler>>,
}

impl IoCore {
    fn new() -> io::Result<Arc<IoCore>> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(io::Error::last_os_error());
        }

        let mut fds = [0 as RawFd; 2];
        let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
        if rc != 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(epfd) };
            return Err(err);
        }
        let (tickle_r, tickle_w) = (fds[0], fds[1]);

        let mut ev = libc::epoll_event {
            events: READ_BIT | ET_BIT,
            u64: tickle_r as u64,
        };
        let rc = unsafe { libc::epoll_ctl(epfd, libc::EPOLL_CTL_ADD, tickle_r, &mut ev) };
        if rc != 0 {
            let err = io::Error::last_os_error();
            unsafe {
                libc::close(epfd);
                libc::close(tickle_r);
                libc::close(tickle_w);
            }
            return Err(err);
        }

        let timers = TimerManager::new(Box::new(move || {
            // A new earliest deadline must interrupt a parked epoll_wait.
            unsafe {
                libc::write(tickle_w, b"T".as_ptr() as *const libc::c_void, 1);
            }
        }));

        let core = Arc::new(IoCore {
            epfd,
            tickle_r,
            tickle_w,
            pending: AtomicUsize::new(0),
            fd_contexts: RwLock::new(Vec::new()),
            timers,
            scheduler: OnceLock::new(),
        });
        core.resize_contexts(64);
        Ok(core)
    }

    fn tickle_write(&self) {
        let rc = unsafe { libc::write(self.tickle_w, b"T".as_ptr() as *const libc::c_void, 1) };
        // A full pipe already guarantees a pending wake-up.
        debug_assert!(rc == 1 || errno() == libc::EAGAIN);
    }

    fn resize_contexts(&self, size: usize) {
        let mut contexts = self.fd_contexts.write().unwrap();
        let old = contexts.len();
        if size <= old {
            return;
        }
        contexts.reserve(size - old);
        for fd in old..size {
            contexts.push(FdContext::new(fd as RawFd));
        }
    }

    fn context_for(&self, fd: RawFd) -> io::Result<Arc<FdContext>> {
        if fd < 0 {
            return Err(io::Error::from_raw_os_error(libc::EBADF));
        }
        {
            let contexts = self.fd_contexts.read().unwrap();
            if let Some(ctx) = contexts.get(fd as usize) {
                return Ok(ctx.clone());
            }
        }
        self.resize_contexts((fd as usize + 1).max(fd as usize * 3 / 2));
        Ok(self.fd_contexts.read().unwrap()[fd as usize].clone())
    }

    fn registration_scheduler(&self) -> Weak<Scheduler> {
        match Scheduler::current() {
            Some(sched) => Arc::downgrade(&sched),
            None => self.scheduler.get().cloned().unwrap_or_default(),
        }
    }

    /// Arm `event` on `fd`. With `cb` the callable is the fire target,
    /// otherwise the current coroutine is (and the caller then yields).
    fn add_event(
        &self,
        fd: RawFd,
        event: Event,
        cb: Option<Box<dyn FnOnce() + Send>>,
    ) -> io::Result<()> {
        let ctx = self.context_for(fd)?;
        let mut state = ctx.inner.lock().unwrap();

        if state.events & event.bit() != 0 {
            error!(
                "add_event: fd={} event={:?} already armed (events={:#x})",
                fd, event, state.events
            );
            debug_assert!(false, "duplicate arming of fd {} {:?}", fd, event);
            return Err(io::Error::from(io::ErrorKind::InvalidInput));
        }

        let op = if state.events == 0 {
            libc::EPOLL_CTL_ADD
        } else {
            libc::EPOLL_CTL_MOD
        };
        let mut ev = libc::epoll_event {
            events: state.events | event.bit() | ET_BIT,
            u64: fd as u64,
        };
        let rc = unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ev) };
        if rc != 0 {
            let err = io::Error::last_os_error();
            error!("epoll_ctl({}, {}, {}): {}", self.epfd, op, fd, err);
            return Err(err);
        }

        self.pending.fetch_add(1, Ordering::SeqCst);
        state.events |= event.bit();

        let sched = self.registration_scheduler();
        let target = match cb {
            Some(f) => EventTarget::Call(f, sched),
            None => {
                let co = Coroutine::current();
                debug_assert_eq!(co.state(), State::Exec);
                EventTarget::Coroutine(co, sched)
            }
        };
        match event {
            Event::Read => state.read = Some(target),
            Event::Write => state.write = Some(target),
        }
        Ok(())
    }

    /// Disarm without firing. Returns false if not armed.
    fn del_event(&self, fd: RawFd, event: Event) -> bool {
        if fd < 0 {
            return false;
        }
        let ctx = {
            let contexts = self.fd_contexts.read().unwrap();
            match contexts.get(fd as usize) {
                Some(ctx) => ctx.clone(),
                None => return false,
            }
        };
        let mut state = ctx.inner.lock().unwrap();
        if state.events & event.bit() == 0 {
            return false;
        }

        let left = state.events & !event.bit();
        if !self.update_kernel(fd, left) {
            return false;
        }

        self.pending.fetch_sub(1, Ordering::SeqCst);
        state.events = left;
        match event {
            Event::Read => state.read = None,
            Event::Write => state.write = None,
        }
        true
    }

    /// Disarm and fire the target once. Returns false if not armed.
    fn cancel_event(&self, fd: RawFd, event: Event) -> bool {
        if fd < 0 {
            return false;
        }
        let ctx = {
            let contexts = self.fd_contexts.read().unwrap();
            match contexts.get(fd as usize) {
                Some(ctx) => ctx.clone(),
                None => return false,
            }
        };
        let mut state = ctx.inner.lock().unwrap();
        if state.events & event.bit() == 0 {
            return false;
        }

        let left = state.events & !event.bit();
        if !self.update_kernel(fd, left) {
            return false;
        }

        self.trigger(&mut state, event);
        self.pending.fetch_sub(1, Ordering::SeqCst);
        true
    }

    /// Disarm and fire both directions; used when an fd is closed.
    fn cancel_all(&self, fd: RawFd) -> bool {
        if fd < 0 {
            return false;
        }
        let ctx = {
            let contexts = self.fd_contexts.read().unwrap();
            match contexts.get(fd as usize) {
                Some(ctx) => ctx.clone(),
                None => return false,
            }
        };
        let mut state = ctx.inner.lock().unwrap();
        if state.events == 0 {
            return false;
        }

        if !self.update_kernel(fd, 0) {
            return false;
        }

        if state.events & READ_BIT != 0 {
            self.trigger(&mut state, Event::Read);
            self.pending.fetch_sub(1, Ordering::SeqCst);
        }
        if state.events & WRITE_BIT != 0 {
            self.trigger(&mut state, Event::Write);
            self.pending.fetch_sub(1, Ordering::SeqCst);
        }
        debug_assert_eq!(state.events, 0);
        true
    }

    /// Push a new armed set for `fd` to the kernel: MOD while directions
    /// remain, DEL once none do.
    fn update_kernel(&self, fd: RawFd, left: u32) -> bool {
        let op = if left != 0 {
            libc::EPOLL_CTL_MOD
        } else {
            libc::EPOLL_CTL_DEL
        };
        let mut ev = libc::epoll_event {
            events: left | ET_BIT,
            u64: fd as u64,
        };
        let rc = unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ev) };
        if rc != 0 {
            error!(
                "epoll_ctl({}, {}, {}): {}",
                self.epfd,
                op,
                fd,
                io::Error::last_os_error()
            );
            return false;
        }
        true
    }

    /// Clear the direction and hand its target to the owning scheduler.
    /// Caller holds the context lock and owns the pending-count decrement.
    fn trigger(&self, state: &mut FdEvents, event: Event) {
        debug_assert!(state.events & event.bit() != 0);
        state.events &= !event.bit();

        let slot = match event {
            Event::Read => state.read.take(),
            Event::Write => state.write.take(),
        };
        let Some(target) = slot else { return };
        let weak = match &target {
            EventTarget::Coroutine(_, w) | EventTarget::Call(_, w) => w.clone(),
        };
        let sched = weak
            .upgrade()
            .or_else(|| self.scheduler.get().and_then(Weak::upgrade));
        let Some(sched) = sched else {
            error!("event target dropped: no scheduler alive");
            return;
        };
        match target {
            EventTarget::Coroutine(co, _) => sched.schedule(Task::coroutine(co)),
            EventTarget::Call(f, _) => sched.schedule(Task::call_boxed(f)),
        }
    }

    fn drain_tickle(&self) {
        let mut buf = [0u8; 256];
        loop {
            let n = unsafe {
                libc::read(
                    self.tickle_r,
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                )
            };
            if n <= 0 {
                break;
            }
        }
    }
}

impl Drop for IoCore {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epfd);
            libc::close(self.tickle_r);
            libc::close(self.tickle_w);
        }
    }
}

/// The epoll wait, hosted by each worker's idle coroutine.
fn idle_loop(core: &Arc<IoCore>, weak: &Weak<Scheduler>) {
    debug!("io idle");
    let mut events = vec![libc::epoll_event { events: 0, u64: 0 }; EVENT_BATCH];

    loop {
        let Some(sched) = weak.upgrade() else { return };
        if sched.stopping_check() {
            info!("name={} idle stopping exit", sched.name());
            // One tickle byte only wakes one edge-triggered waiter; pass
            // the shutdown along to the next parked worker.
            core.tickle_write();
            return;
        }

        let next = core.timers.next_timeout();
        let timeout_ms = if next == NO_TIMEOUT {
            MAX_TIMEOUT_MS
        } else {
            next.min(MAX_TIMEOUT_MS)
        };

        let ready = loop {
            let rc = unsafe {
                libc::epoll_wait(
                    core.epfd,
                    events.as_mut_ptr(),
                    EVENT_BATCH as libc::c_int,
                    timeout_ms as libc::c_int,
                )
            };
            if rc < 0 {
                if errno() == libc::EINTR {
                    continue;
                }
                error!("epoll_wait({}): {}", core.epfd, io::Error::last_os_error());
                break 0;
            }
            break rc as usize;
        };

        let expired = core.timers.take_expired();
        if !expired.is_empty() {
            debug!("{} timers expired", expired.len());
            sched.schedule_all(expired.into_iter().map(|cb| Task::call(move || cb())));
        }

        for ev in events.iter().take(ready) {
            let fd = ev.u64 as RawFd;
            if fd == core.tickle_r {
                core.drain_tickle();
                continue;
            }

            if fd < 0 {
                continue;
            }
            let ctx = {
                let contexts = core.fd_contexts.read().unwrap();
                match contexts.get(fd as usize) {
                    Some(ctx) => ctx.clone(),
                    None => continue,
                }
            };
            let mut state = ctx.inner.lock().unwrap();

            // On error or hang-up fire whatever is armed, so waiters are
            // not silently lost.
            let mut revents = ev.events;
            if revents & (libc::EPOLLERR | libc::EPOLLHUP) as u32 != 0 {
                revents |= (READ_BIT | WRITE_BIT) & state.events;
            }

            let real = revents & (READ_BIT | WRITE_BIT) & state.events;
            if real == 0 {
                continue;
            }

            let left = state.events & !real;
            if !core.update_kernel(ctx.fd, left) {
                continue;
            }

            if real & READ_BIT != 0 {
                core.trigger(&mut state, Event::Read);
                core.pending.fetch_sub(1, Ordering::SeqCst);
            }
            if real & WRITE_BIT != 0 {
                core.trigger(&mut state, Event::Write);
                core.pending.fetch_sub(1, Ordering::SeqCst);
            }
        }

        drop(sched);
        Coroutine::yield_to_hold();
    }
}

/// A scheduler extended with fd-event multiplexing and timers.
///
/// Workers start immediately; `stop` drains and joins them.
#[derive(Clone)]
pub struct IoManager {
    core: Arc<IoCore>,
    scheduler: Arc<Scheduler>,
}

impl Deref for IoManager {
    type Target = Scheduler;

    fn deref(&self) -> &Scheduler {
        &self.scheduler
    }
}

impl IoManager {
    /// Build and start an I/O manager with `threads` workers (0 = one per
    /// CPU). With `use_caller` the constructing thread participates in
    /// dispatch once `stop` is called.
    pub fn new(threads: usize, use_caller: bool, name: &str) -> io::Result<IoManager> {
        let core = IoCore::new()?;

        let scheduler = Scheduler::with_hooks(threads, use_caller, name, |weak| {
            let tickle = {
                let core = core.clone();
                let weak = weak.clone();
                Box::new(move || {
                    if let Some(sched) = weak.upgrade() {
                        if !sched.has_idle_threads() {
                            return;
                        }
                    }
                    core.tickle_write();
                })
            };
            let idle = {
                let core = core.clone();
                let weak = weak.clone();
                Box::new(move || idle_loop(&core, &weak))
            };
            let extra_stopping = {
                let core = core.clone();
                Box::new(move || {
                    core.pending.load(Ordering::SeqCst) == 0
                        && core.timers.next_timeout() == NO_TIMEOUT
                }) as Box<dyn Fn() -> bool + Send + Sync>
            };
            let on_thread_start = {
                let core = Arc::downgrade(&core);
                let weak = weak.clone();
                Box::new(move || {
                    CURRENT_IO.with(|io| {
                        *io.borrow_mut() = Some((core.clone(), weak.clone()));
                    });
                })
            };
            Hooks {
                tickle,
                idle,
                extra_stopping,
                on_thread_start,
            }
        });

        let _ = core.scheduler.set(Arc::downgrade(&scheduler));
        scheduler.start();
        Ok(IoManager { core, scheduler })
    }

    /// The I/O manager driving the current thread, if any.
    pub fn current() -> Option<IoManager> {
        CURRENT_IO.with(|io| {
            let borrow = io.borrow();
            let (core, sched) = borrow.as_ref()?;
            Some(IoManager {
                core: core.upgrade()?,
                scheduler: sched.upgrade()?,
            })
        })
    }

    /// Arm `event` on `fd` with the current coroutine as the fire target;
    /// the caller is expected to yield to HOLD afterwards.
    pub fn add_event(&self, fd: RawFd, event: Event) -> io::Result<()> {
        self.core.add_event(fd, event, None)
    }

    /// Arm `event` on `fd` with a callable fire target.
    pub fn add_event_with<F>(&self, fd: RawFd, event: Event, f: F) -> io::Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.core.add_event(fd, event, Some(Box::new(f)))
    }

    /// Disarm `event` on `fd` without firing it.
    pub fn del_event(&self, fd: RawFd, event: Event) -> bool {
        self.core.del_event(fd, event)
    }

    /// Disarm `event` on `fd` and fire its target once immediately.
    pub fn cancel_event(&self, fd: RawFd, event: Event) -> bool {
        self.core.cancel_event(fd, event)
    }

    /// Disarm and fire every direction armed on `fd`.
    pub fn cancel_all(&self, fd: RawFd) -> bool {
        self.core.cancel_all(fd)
    }

    /// Queue `cb` to run on this manager after `ms` milliseconds.
    pub fn add_timer<F>(&self, ms: u64, cb: F, recurring: bool) -> Timer
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.core.timers.add_timer(ms, cb, recurring)
    }

    /// Queue `cb` gated on `owner` still being alive at the deadline.
    pub fn add_condition_timer<F, T>(&self, ms: u64, cb: F, owner: &Arc<T>, recurring: bool) -> Timer
    where
        F: Fn() + Send + Sync + 'static,
        T: Send + Sync + 'static,
    {
        self.core.timers.add_condition_timer(ms, cb, owner, recurring)
    }

    /// Number of armed fd directions not yet fired.
    pub fn pending_event_count(&self) -> usize {
        self.core.pending.load(Ordering::SeqCst)
    }

    /// Drain queued work and tear the worker pool down.
    pub fn stop(&self) {
        self.scheduler.stop();
    }
}

impl std::fmt::Debug for IoManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoManager")
            .field("scheduler", &self.scheduler)
            .field("pending", &self.pending_event_count())
            .finish()
    }
}
