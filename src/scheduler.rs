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

//! M:N coroutine scheduler.
//!
//! A scheduler owns a task FIFO and a pool of worker threads, each running
//! the dispatch loop: pick an eligible task, resume it (wrapping bare
//! callables in a reusable coroutine), and fall back to the per-worker idle
//! coroutine when the queue is empty. With `use_caller` the constructing
//! thread is co-opted as an extra worker; its dispatch loop runs inside a
//! *root coroutine* that `stop()` enters to drain remaining work.
//!
//! The reactor subclassing of the original design is expressed as a set of
//! closure hooks (`tickle`, `idle`, extra stopping condition, thread-start)
//! installed at construction; the I/O manager provides epoll-backed ones.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread;

use log::{error, info, trace};

use crate::coroutine::{self, Coroutine, Handle, State};
use crate::util;

thread_local! {
    static CURRENT_SCHEDULER: std::cell::RefCell<Option<Weak<Scheduler>>> =
        const { std::cell::RefCell::new(None) };
}

/// Any worker may run the task.
pub const ANY_THREAD: i64 = -1;

enum TaskTarget {
    Coroutine(Handle),
    Call(Box<dyn FnOnce() + Send>),
}

/// One queued unit of work: a coroutine or a bare callable, optionally
/// pinned to a worker's kernel thread id.
pub struct Task {
    target: TaskTarget,
    thread: i64,
}

impl Task {
    pub fn coroutine(co: Handle) -> Task {
        Task {
            target: TaskTarget::Coroutine(co),
            thread: ANY_THREAD,
        }
    }

    pub fn call<F>(f: F) -> Task
    where
        F: FnOnce() + Send + 'static,
    {
        Task {
            target: TaskTarget::Call(Box::new(f)),
            thread: ANY_THREAD,
        }
    }

    pub(crate) fn call_boxed(f: Box<dyn FnOnce() + Send>) -> Task {
        Task {
            target: TaskTarget::Call(f),
            thread: ANY_THREAD,
        }
    }

    /// Pin the task to the worker whose kernel thread id is `tid`.
    pub fn on_thread(mut self, tid: u64) -> Task {
        self.thread = tid as i64;
        self
    }
}

/// Behavior points a reactor can override.
pub(crate) struct Hooks {
    /// Wake one sleeping worker.
    pub tickle: Box<dyn Fn() + Send + Sync>,
    /// Body of the per-worker idle coroutine. Loops, yielding HOLD between
    /// rounds, and returns once the scheduler is stopping.
    pub idle: Box<dyn Fn() + Send + Sync>,
    /// Additional stopping condition AND-ed with the base one.
    pub extra_stopping: Box<dyn Fn() -> bool + Send + Sync>,
    /// Runs once per worker before its first descent into the dispatch
    /// loop.
    pub on_thread_start: Box<dyn Fn() + Send + Sync>,
}

fn default_hooks(weak: &Weak<Scheduler>) -> Hooks {
    let w = weak.clone();
    Hooks {
        tickle: Box::new(|| trace!("tickle")),
        idle: Box::new(move || {
            info!("idle");
            while let Some(sched) = w.upgrade() {
                if sched.stopping_check() {
                    break;
                }
                drop(sched);
                Coroutine::yield_to_hold();
            }
        }),
        extra_stopping: Box::new(|| true),
        on_thread_start: Box::new(|| {}),
    }
}

/// Dispatches coroutines and callables across a worker-thread pool.
pub struct Scheduler {
    name: String,
    /// Number of spawned worker threads (excludes the caller thread).
    worker_count: usize,
    /// Kernel tid of the thread hosting the root coroutine, -1 if none.
    root_thread: i64,
    root: Option<Handle>,
    queue: Mutex<VecDeque<Task>>,
    threads: Mutex<Vec<thread::JoinHandle<()>>>,
    thread_ids: Mutex<Vec<u64>>,
    started_workers: AtomicUsize,
    stopping: AtomicBool,
    auto_stop: AtomicBool,
    active_count: AtomicUsize,
    idle_count: AtomicUsize,
    hooks: Hooks,
    self_ref: Weak<Scheduler>,
}

impl Scheduler {
    /// Create a scheduler with `threads` workers (0 means one per CPU). If
    /// `use_caller`, the calling thread is co-opted as one of the workers
    /// and only `threads - 1` extra threads are spawned by `start`.
    pub fn new(threads: usize, use_caller: bool, name: &str) -> Arc<Scheduler> {
        Scheduler::with_hooks(threads, use_caller, name, default_hooks)
    }

    pub(crate) fn with_hooks<F>(
        threads: usize,
        use_caller: bool,
        name: &str,
        make_hooks: F,
    ) -> Arc<Scheduler>
    where
        F: FnOnce(&Weak<Scheduler>) -> Hooks,
    {
        let threads = if threads == 0 {
            num_cpus::get()
        } else {
            threads
        };

        Arc::new_cyclic(|weak: &Weak<Scheduler>| {
            let hooks = make_hooks(weak);
            let mut worker_count = threads;
            let mut root = None;
            let mut root_thread = ANY_THREAD;
            let mut thread_ids = Vec::new();

            if use_caller {
                // The caller thread becomes a worker: its dispatch loop
                // lives in the root coroutine, entered from stop().
                coroutine::thread_main();
                worker_count -= 1;
                set_current_scheduler(weak.clone());

                let w = weak.clone();
                root = Some(Coroutine::new_root(Box::new(move || {
                    if let Some(sched) = w.upgrade() {
                        sched.run();
                    }
                })));
                root_thread = util::tid() as i64;
                thread_ids.push(util::tid());
            }

            Scheduler {
                name: name.to_string(),
                worker_count,
                root_thread,
                root,
                queue: Mutex::new(VecDeque::new()),
                threads: Mutex::new(Vec::new()),
                thread_ids: Mutex::new(thread_ids),
                started_workers: AtomicUsize::new(0),
                stopping: AtomicBool::new(true),
                auto_stop: AtomicBool::new(false),
                active_count: AtomicUsize::new(0),
                idle_count: AtomicUsize::new(0),
                hooks,
                self_ref: weak.clone(),
            }
        })
    }

    /// The scheduler driving the current thread, if any.
    pub fn current() -> Option<Arc<Scheduler>> {
        CURRENT_SCHEDULER.with(|s| s.borrow().as_ref().and_then(Weak::upgrade))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Kernel thread ids of all workers, usable as `Task::on_thread` pins.
    pub fn thread_ids(&self) -> Vec<u64> {
        self.thread_ids.lock().unwrap().clone()
    }

    fn handle(&self) -> Arc<Scheduler> {
        self.self_ref.upgrade().expect("scheduler already dropped")
    }

    /// Spawn the worker threads. Idempotent while running.
    pub fn start(&self) {
        if !self.stopping.swap(false, Ordering::SeqCst) {
            return;
        }
        self.auto_stop.store(false, Ordering::SeqCst);

        let mut threads = self.threads.lock().unwrap();
        debug_assert!(threads.is_empty());
        for i in 0..self.worker_count {
            let sched = self.handle();
            let t = thread::Builder::new()
                .name(format!("{}_{}", self.name, i))
                .spawn(move || sched.run())
                .expect("failed to spawn worker thread");
            threads.push(t);
        }
        drop(threads);

        // Workers record their kernel tids on the way into the dispatch
        // loop; pinned scheduling needs them known once start returns.
        while self.started_workers.load(Ordering::SeqCst) < self.worker_count {
            thread::yield_now();
        }
    }

    /// Enqueue a task. Wakes one idle worker if the queue was empty.
    pub fn schedule(&self, task: Task) {
        let need_tickle = {
            let mut q = self.queue.lock().unwrap();
            let was_empty = q.is_empty();
            q.push_back(task);
            was_empty
        };
        if need_tickle {
            (self.hooks.tickle)();
        }
    }

    /// Enqueue a batch under one lock acquisition, tickling at most once.
    pub fn schedule_all<I>(&self, tasks: I)
    where
        I: IntoIterator<Item = Task>,
    {
        let need_tickle = {
            let mut q = self.queue.lock().unwrap();
            let was_empty = q.is_empty();
            q.extend(tasks);
            was_empty && !q.is_empty()
        };
        if need_tickle {
            (self.hooks.tickle)();
        }
    }

    /// Enqueue a bare callable.
    pub fn spawn<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.schedule(Task::call(f));
    }

    /// Drain and tear down: signal stopping, wake every worker, run the
    /// root coroutine if the caller hosts one, then join the pool.
    pub fn stop(&self) {
        self.auto_stop.store(true, Ordering::SeqCst);

        if let Some(root) = &self.root {
            if self.worker_count == 0
                && (root.state() == State::Term || root.state() == State::Init)
            {
                info!("{} stopped", self.name);
                self.stopping.store(true, Ordering::SeqCst);
                if self.stopping_check() {
                    return;
                }
            }
        }

        self.stopping.store(true, Ordering::SeqCst);
        for _ in 0..self.worker_count {
            (self.hooks.tickle)();
        }
        if self.root.is_some() {
            (self.hooks.tickle)();
        }

        if let Some(root) = &self.root {
            if util::tid() as i64 != self.root_thread {
                // The root coroutine only ever runs on its hosting thread.
                error!(
                    "{} stop() called off the hosting thread; skipping root drain",
                    self.name
                );
            } else if !self.stopping_check()
                && matches!(root.state(), State::Init | State::Ready | State::Hold)
            {
                root.call();
            }
        }

        let threads = {
            let mut guard = self.threads.lock().unwrap();
            std::mem::take(&mut *guard)
        };
        for t in threads {
            let _ = t.join();
        }
        self.started_workers.store(0, Ordering::SeqCst);
    }

    pub(crate) fn has_idle_threads(&self) -> bool {
        self.idle_count.load(Ordering::SeqCst) > 0
    }

    /// True once the scheduler may shut down: stop requested, no queued
    /// work, no active workers, and the reactor (if any) agrees.
    pub(crate) fn stopping_check(&self) -> bool {
        self.base_stopping() && (self.hooks.extra_stopping)()
    }

    fn base_stopping(&self) -> bool {
        self.auto_stop.load(Ordering::SeqCst)
            && self.stopping.load(Ordering::SeqCst)
            && self.queue.lock().unwrap().is_empty()
            && self.active_count.load(Ordering::SeqCst) == 0
    }

    /// The dispatch loop, one instance per worker.
    pub(crate) fn run(&self) {
        info!("{} run", self.name);
        set_current_scheduler(self.self_ref.clone());
        crate::hook::set_hook_enabled(true);
        (self.hooks.on_thread_start)();

        let my_tid = util::tid();
        if my_tid as i64 != self.root_thread {
            // Worker thread: yields come back to the thread main coroutine.
            coroutine::set_dispatch_target(coroutine::thread_main());
            self.thread_ids.lock().unwrap().push(my_tid);
            self.started_workers.fetch_add(1, Ordering::SeqCst);
        } else {
            // Caller thread: the root coroutine is the dispatch target.
            coroutine::set_dispatch_target(Coroutine::current());
        }

        let sched = self.handle();
        let idle_co = Coroutine::new(move || (sched.hooks.idle)());
        let mut cb_coroutine: Option<Handle> = None;

        loop {
            let mut task: Option<Task> = None;
            let mut tickle_me = false;
            let mut is_active = false;
            {
                let mut q = self.queue.lock().unwrap();
                let mut i = 0;
                while i < q.len() {
                    let t = &q[i];
                    // Pinned to another worker: leave it and wake them.
                    if t.thread != ANY_THREAD && t.thread != my_tid as i64 {
                        i += 1;
                        tickle_me = true;
                        continue;
                    }
                    // Already running on another worker.
                    if let TaskTarget::Coroutine(co) = &t.target {
                        if co.state() == State::Exec {
                            i += 1;
                            continue;
                        }
                    }
                    task = q.remove(i);
                    self.active_count.fetch_add(1, Ordering::SeqCst);
                    is_active = true;
                    break;
                }
            }
            if tickle_me {
                (self.hooks.tickle)();
            }

            match task {
                Some(Task {
                    target: TaskTarget::Coroutine(co),
                    ..
                }) if co.state() != State::Term && co.state() != State::Except => {
                    co.resume();
                    self.active_count.fetch_sub(1, Ordering::SeqCst);

                    match co.state() {
                        State::Ready => self.schedule(Task::coroutine(co)),
                        State::Term | State::Except => {}
                        _ => co.set_state(State::Hold),
                    }
                }
                Some(Task {
                    target: TaskTarget::Call(f),
                    ..
                }) => {
                    // One reusable coroutine per worker hosts bare callables.
                    let co = match cb_coroutine.take() {
                        Some(co) => {
                            co.reset_boxed(f);
                            co
                        }
                        None => Coroutine::from_boxed(f),
                    };
                    co.resume();
                    self.active_count.fetch_sub(1, Ordering::SeqCst);

                    match co.state() {
                        State::Ready => self.schedule(Task::coroutine(co)),
                        State::Term | State::Except => cb_coroutine = Some(co),
                        _ => co.set_state(State::Hold),
                    }
                }
                Some(_) => {
                    // A coroutine task that already finished; drop it.
                    if is_active {
                        self.active_count.fetch_sub(1, Ordering::SeqCst);
                    }
                    continue;
                }
                None => {
                    if idle_co.state() == State::Term {
                        info!("{} idle coroutine terminated", self.name);
                        break;
                    }
                    if idle_co.state() == State::Except {
                        error!("{} idle coroutine failed", self.name);
                        break;
                    }
                    self.idle_count.fetch_add(1, Ordering::SeqCst);
                    idle_co.resume();
                    self.idle_count.fetch_sub(1, Ordering::SeqCst);
                    if idle_co.state() != State::Term && idle_co.state() != State::Except {
                        idle_co.set_state(State::Hold);
                    }
                }
            }
        }

        // The caller thread gets its original yield target and hook state
        // back once its stint as a worker ends.
        if my_tid as i64 == self.root_thread {
            coroutine::set_dispatch_target(coroutine::thread_main());
            crate::hook::set_hook_enabled(false);
        }
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("name", &self.name)
            .field("workers", &self.worker_count)
            .field("stopping", &self.stopping.load(Ordering::SeqCst))
            .finish()
    }
}

fn set_current_scheduler(weak: Weak<Scheduler>) {
    CURRENT_SCHEDULER.with(|s| *s.borrow_mut() = Some(weak));
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;

    #[test]
    fn schedule_runs_callables() {
        let sched = Scheduler::new(2, false, "sched_basic");
        sched.start();

        let hits = Arc::new(AtomicUsize::new(0));
        for _ in 0..100 {
            let h = hits.clone();
            sched.spawn(move || {
                h.fetch_add(1, Ordering::SeqCst);
            });
        }
        sched.stop();
        assert_eq!(hits.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn schedule_runs_coroutines() {
        let sched = Scheduler::new(1, false, "sched_coroutine");
        sched.start();

        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let co = Coroutine::new(move || {
            h.fetch_add(1, Ordering::SeqCst);
            Coroutine::yield_to_ready();
            h.fetch_add(1, Ordering::SeqCst);
        });
        sched.schedule(Task::coroutine(co));
        sched.stop();
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn batch_schedule_dispatches_each_once() {
        let sched = Scheduler::new(3, false, "sched_batch");
        sched.start();

        let hits = Arc::new(AtomicUsize::new(0));
        let tasks: Vec<Task> = (0..64)
            .map(|_| {
                let h = hits.clone();
                Task::call(move || {
                    h.fetch_add(1, Ordering::SeqCst);
                })
            })
            .collect();
        sched.schedule_all(tasks);
        sched.stop();
        assert_eq!(hits.load(Ordering::SeqCst), 64);
    }

    #[test]
    fn pinned_task_runs_on_its_worker() {
        let sched = Scheduler::new(3, false, "sched_pin");
        sched.start();

        let tids = sched.thread_ids();
        assert_eq!(tids.len(), 3);

        let (tx, rx) = std::sync::mpsc::channel();
        for &tid in &tids {
            let tx = tx.clone();
            sched.schedule(
                Task::call(move || {
                    tx.send((tid, crate::util::tid())).unwrap();
                })
                .on_thread(tid),
            );
        }
        for _ in 0..tids.len() {
            let (want, got) = rx.recv_timeout(std::time::Duration::from_secs(5)).unwrap();
            assert_eq!(want, got);
        }
        sched.stop();
    }

    #[test]
    fn use_caller_drains_on_stop() {
        let sched = Scheduler::new(1, true, "sched_caller");
        sched.start();

        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        sched.spawn(move || {
            h.fetch_add(1, Ordering::SeqCst);
        });
        // One thread + use_caller: everything runs inside stop().
        sched.stop();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn use_caller_with_workers() {
        let sched = Scheduler::new(3, true, "sched_caller_workers");
        sched.start();

        let hits = Arc::new(AtomicUsize::new(0));
        for _ in 0..32 {
            let h = hits.clone();
            sched.spawn(move || {
                h.fetch_add(1, Ordering::SeqCst);
            });
        }
        sched.stop();
        assert_eq!(hits.load(Ordering::SeqCst), 32);
    }

    #[test]
    fn stop_joins_workers() {
        let sched = Scheduler::new(2, false, "sched_stop");
        sched.start();
        sched.spawn(|| {});
        sched.stop();
        assert!(sched.threads.lock().unwrap().is_empty());
        assert_eq!(sched.active_count.load(Ordering::SeqCst), 0);
    }
}
