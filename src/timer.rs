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

//! Deadline-ordered timers.
//!
//! A `TimerManager` keeps timers ordered by (deadline, insertion id) under a
//! reader-writer lock. The owner supplies a notify callable that is invoked
//! whenever an insertion becomes the new earliest deadline, so a sleeping
//! reactor can re-arm its wait.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use log::warn;

use crate::util::now_ms;

/// No-deadline sentinel.
pub const NO_TIMEOUT: u64 = u64::MAX;

/// A clock jump further back than this is treated as rollback and expires
/// everything queued.
const ROLLBACK_THRESHOLD_MS: u64 = 60 * 60 * 1000;

static TIMER_ID: AtomicU64 = AtomicU64::new(0);

pub(crate) type TimerCallback = Arc<dyn Fn() + Send + Sync>;

struct TimerNode {
    id: u64,
    mgr: Weak<TimerManager>,
    inner: Mutex<TimerData>,
}

struct TimerData {
    /// Period in milliseconds.
    ms: u64,
    /// Absolute deadline in monotonic milliseconds.
    next: u64,
    recurring: bool,
    /// Cleared once a one-shot timer fires or the timer is cancelled.
    cb: Option<TimerCallback>,
}

/// Handle to a queued timer.
#[derive(Clone)]
pub struct Timer {
    node: Arc<TimerNode>,
}

impl Timer {
    /// Remove the timer without firing it. Returns false if it already
    /// fired or was cancelled.
    pub fn cancel(&self) -> bool {
        let Some(mgr) = self.node.mgr.upgrade() else {
            return false;
        };
        let mut timers = mgr.timers.write().unwrap();
        let mut data = self.node.inner.lock().unwrap();
        if data.cb.is_none() {
            return false;
        }
        data.cb = None;
        timers.remove(&(data.next, self.node.id));
        true
    }

    /// Push the deadline out to now + period.
    pub fn refresh(&self) -> bool {
        let Some(mgr) = self.node.mgr.upgrade() else {
            return false;
        };
        let mut timers = mgr.timers.write().unwrap();
        let mut data = self.node.inner.lock().unwrap();
        if data.cb.is_none() {
            return false;
        }
        if timers.remove(&(data.next, self.node.id)).is_none() {
            return false;
        }
        data.next = now_ms() + data.ms;
        timers.insert((data.next, self.node.id), self.node.clone());
        true
    }

    /// Rebind the period, optionally restarting the deadline from now.
    pub fn reset(&self, ms: u64, from_now: bool) -> bool {
        let Some(mgr) = self.node.mgr.upgrade() else {
            return false;
        };
        let at_front;
        {
            let mut timers = mgr.timers.write().unwrap();
            let mut data = self.node.inner.lock().unwrap();
            if ms == data.ms && !from_now {
                return true;
            }
            if data.cb.is_none() {
                return false;
            }
            if timers.remove(&(data.next, self.node.id)).is_none() {
                return false;
            }
            let start = if from_now {
                now_ms()
            } else {
                data.next - data.ms
            };
            data.ms = ms;
            data.next = start + ms;
            at_front = mgr.insert_locked(&mut timers, self.node.clone(), data.next);
        }
        if at_front {
            (mgr.notify)();
        }
        true
    }
}

/// Ordered set of deadlines with cancellation, refresh, reset, recurrence.
pub struct TimerManager {
    self_ref: Weak<TimerManager>,
    timers: RwLock<BTreeMap<(u64, u64), Arc<TimerNode>>>,
    /// Set when a front insertion already notified the owner, cleared when
    /// the owner reads `next_timeout`. Collapses redundant wake-ups.
    tickled: Mutex<bool>,
    prev_time: Mutex<u64>,
    notify: Box<dyn Fn() + Send + Sync>,
}

impl TimerManager {
    /// `notify` runs (outside the timer lock) whenever an inserted timer
    /// becomes the earliest deadline.
    pub fn new(notify: Box<dyn Fn() + Send + Sync>) -> Arc<TimerManager> {
        Arc::new_cyclic(|weak| TimerManager {
            self_ref: weak.clone(),
            timers: RwLock::new(BTreeMap::new()),
            tickled: Mutex::new(false),
            prev_time: Mutex::new(now_ms()),
            notify,
        })
    }

    /// Queue `cb` to run after `ms` milliseconds, and every `ms` after that
    /// if `recurring`.
    pub fn add_timer<F>(&self, ms: u64, cb: F, recurring: bool) -> Timer
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.add_timer_callback(ms, Arc::new(cb), recurring)
    }

    pub(crate) fn add_timer_callback(
        &self,
        ms: u64,
        cb: TimerCallback,
        recurring: bool,
    ) -> Timer {
        let node = Arc::new(TimerNode {
            id: TIMER_ID.fetch_add(1, Ordering::Relaxed) + 1,
            mgr: self.self_ref.clone(),
            inner: Mutex::new(TimerData {
                ms,
                next: now_ms() + ms,
                recurring,
                cb: Some(cb),
            }),
        });
        let at_front;
        {
            let mut timers = self.timers.write().unwrap();
            let next = node.inner.lock().unwrap().next;
            at_front = self.insert_locked(&mut timers, node.clone(), next);
        }
        if at_front {
            (self.notify)();
        }
        Timer { node }
    }

    /// Queue `cb` gated on `owner` still being alive when the deadline
    /// arrives.
    pub fn add_condition_timer<F, T>(
        &self,
        ms: u64,
        cb: F,
        owner: &Arc<T>,
        recurring: bool,
    ) -> Timer
    where
        F: Fn() + Send + Sync + 'static,
        T: Send + Sync + 'static,
    {
        let weak = Arc::downgrade(owner);
        self.add_timer(
            ms,
            move || {
                if weak.upgrade().is_some() {
                    cb()
                }
            },
            recurring,
        )
    }

    /// Milliseconds until the earliest deadline: 0 if already due,
    /// `NO_TIMEOUT` if the set is empty.
    pub fn next_timeout(&self) -> u64 {
        let timers = self.timers.read().unwrap();
        *self.tickled.lock().unwrap() = false;
        match timers.keys().next() {
            None => NO_TIMEOUT,
            Some(&(next, _)) => {
                let now = now_ms();
                if now >= next {
                    0
                } else {
                    next - now
                }
            }
        }
    }

    pub fn has_timer(&self) -> bool {
        !self.timers.read().unwrap().is_empty()
    }

    /// Remove every timer whose deadline has passed and return their
    /// callables. Recurring timers are reinserted at now + period.
    pub(crate) fn take_expired(&self) -> Vec<TimerCallback> {
        let now = now_ms();
        {
            let timers = self.timers.read().unwrap();
            if timers.is_empty() {
                return Vec::new();
            }
        }

        let mut timers = self.timers.write().unwrap();
        if timers.is_empty() {
            return Vec::new();
        }

        let rollover = self.detect_clock_rollover(now);
        if !rollover {
            if let Some(&(next, _)) = timers.keys().next() {
                if next > now {
                    return Vec::new();
                }
            }
        }
        if rollover {
            warn!("clock rollback detected, expiring all queued timers");
        }

        let expired = if rollover {
            std::mem::take(&mut *timers)
        } else {
            // Every key at or past (now + 1, 0) has a deadline after now.
            let rest = timers.split_off(&(now + 1, 0));
            std::mem::replace(&mut *timers, rest)
        };

        let mut cbs = Vec::with_capacity(expired.len());
        for (_, node) in expired {
            let mut data = node.inner.lock().unwrap();
            let Some(cb) = data.cb.clone() else { continue };
            if data.recurring {
                data.next = now + data.ms;
                let key = (data.next, node.id);
                drop(data);
                timers.insert(key, node.clone());
            } else {
                data.cb = None;
            }
            cbs.push(cb);
        }
        cbs
    }

    /// Insert under the held write lock; true means the caller must notify
    /// once the lock is released.
    fn insert_locked(
        &self,
        timers: &mut BTreeMap<(u64, u64), Arc<TimerNode>>,
        node: Arc<TimerNode>,
        next: u64,
    ) -> bool {
        let key = (next, node.id);
        timers.insert(key, node);
        let at_front = timers.keys().next() == Some(&key);
        if at_front {
            let mut tickled = self.tickled.lock().unwrap();
            if *tickled {
                return false;
            }
            *tickled = true;
        }
        at_front
    }

    fn detect_clock_rollover(&self, now: u64) -> bool {
        let mut prev = self.prev_time.lock().unwrap();
        let rollover = now < prev.saturating_sub(ROLLBACK_THRESHOLD_MS);
        *prev = now;
        rollover
    }
}
