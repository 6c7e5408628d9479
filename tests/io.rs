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

//! Reactor-level scenarios: explicit event registration, timers through
//! the I/O manager, and shutdown draining.

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::channel;
use std::sync::Arc;
use std::time::{Duration, Instant};

use weft::{Coroutine, Event, IoManager};

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn make_pipe() -> (RawFd, RawFd) {
    let mut fds = [0 as RawFd; 2];
    let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK) };
    assert_eq!(rc, 0);
    (fds[0], fds[1])
}

fn close_fd(fd: RawFd) {
    unsafe { libc::close(fd) };
}

fn write_byte(fd: RawFd) {
    let n = unsafe { libc::write(fd, b"x".as_ptr() as *const libc::c_void, 1) };
    assert_eq!(n, 1);
}

#[test]
fn callback_fires_on_readable() {
    init_logger();
    let iom = IoManager::new(2, false, "io_cb").unwrap();
    let (r, w) = make_pipe();

    let (tx, rx) = channel();
    iom.add_event_with(r, Event::Read, move || {
        tx.send(()).unwrap();
    })
    .unwrap();
    assert_eq!(iom.pending_event_count(), 1);

    write_byte(w);
    rx.recv_timeout(Duration::from_secs(5)).unwrap();

    // Firing disarms: the pending count returns to zero.
    let deadline = Instant::now() + Duration::from_secs(1);
    while iom.pending_event_count() != 0 && Instant::now() < deadline {
        std::thread::yield_now();
    }
    assert_eq!(iom.pending_event_count(), 0);

    iom.stop();
    close_fd(r);
    close_fd(w);
}

#[test]
fn coroutine_parks_until_readable() {
    init_logger();
    let iom = IoManager::new(1, false, "io_park").unwrap();
    let (r, w) = make_pipe();

    let (tx, rx) = channel();
    let iom2 = iom.clone();
    iom.spawn(move || {
        iom2.add_event(r, Event::Read).unwrap();
        Coroutine::yield_to_hold();

        let mut buf = [0u8; 8];
        let n = unsafe { libc::read(r, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        tx.send(n).unwrap();
    });

    std::thread::sleep(Duration::from_millis(50));
    write_byte(w);

    assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 1);
    iom.stop();
    close_fd(r);
    close_fd(w);
}

#[test]
fn add_then_del_leaves_no_trace() {
    init_logger();
    let iom = IoManager::new(1, false, "io_del").unwrap();
    let (r, w) = make_pipe();

    let hits = Arc::new(AtomicUsize::new(0));
    let h = hits.clone();
    iom.add_event_with(r, Event::Read, move || {
        h.fetch_add(1, Ordering::SeqCst);
    })
    .unwrap();
    assert_eq!(iom.pending_event_count(), 1);

    assert!(iom.del_event(r, Event::Read));
    assert_eq!(iom.pending_event_count(), 0);
    assert!(!iom.del_event(r, Event::Read));

    write_byte(w);
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(hits.load(Ordering::SeqCst), 0);

    iom.stop();
    close_fd(r);
    close_fd(w);
}

#[test]
fn cancel_event_fires_immediately() {
    init_logger();
    let iom = IoManager::new(1, false, "io_cancel").unwrap();
    let (r, w) = make_pipe();

    let (tx, rx) = channel();
    iom.add_event_with(r, Event::Read, move || {
        tx.send(()).unwrap();
    })
    .unwrap();

    // No data was ever written; the cancel alone delivers the wake-up.
    assert!(iom.cancel_event(r, Event::Read));
    rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(iom.pending_event_count(), 0);

    iom.stop();
    close_fd(r);
    close_fd(w);
}

#[test]
fn cancel_all_fires_both_directions() {
    init_logger();
    let iom = IoManager::new(2, false, "io_cancel_all").unwrap();

    let mut sv = [0 as RawFd; 2];
    let rc = unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, sv.as_mut_ptr()) };
    assert_eq!(rc, 0);

    let fired = Arc::new(AtomicUsize::new(0));
    let f1 = fired.clone();
    let f2 = fired.clone();
    iom.add_event_with(sv[0], Event::Read, move || {
        f1.fetch_add(1, Ordering::SeqCst);
    })
    .unwrap();
    iom.add_event_with(sv[1], Event::Read, move || {
        f2.fetch_add(1, Ordering::SeqCst);
    })
    .unwrap();
    assert_eq!(iom.pending_event_count(), 2);

    assert!(iom.cancel_all(sv[0]));
    assert!(iom.cancel_all(sv[1]));

    let deadline = Instant::now() + Duration::from_secs(5);
    while fired.load(Ordering::SeqCst) != 2 && Instant::now() < deadline {
        std::thread::yield_now();
    }
    assert_eq!(fired.load(Ordering::SeqCst), 2);
    assert_eq!(iom.pending_event_count(), 0);

    iom.stop();
    close_fd(sv[0]);
    close_fd(sv[1]);
}

#[test]
fn duplicate_arming_is_refused() {
    init_logger();
    let iom = IoManager::new(1, false, "io_dup").unwrap();
    let (r, w) = make_pipe();

    iom.add_event_with(r, Event::Read, || {}).unwrap();
    if cfg!(not(debug_assertions)) {
        assert!(iom.add_event_with(r, Event::Read, || {}).is_err());
    }
    assert!(iom.del_event(r, Event::Read));

    iom.stop();
    close_fd(r);
    close_fd(w);
}

#[test]
fn recurring_timer_through_reactor() {
    init_logger();
    let iom = IoManager::new(1, false, "io_timer").unwrap();

    let hits = Arc::new(AtomicUsize::new(0));
    let h = hits.clone();
    let timer = iom.add_timer(
        50,
        move || {
            h.fetch_add(1, Ordering::SeqCst);
        },
        true,
    );

    std::thread::sleep(Duration::from_millis(525));
    timer.cancel();
    let count = hits.load(Ordering::SeqCst);
    assert!(
        (8..=12).contains(&count),
        "50ms recurring timer fired {} times in 525ms",
        count
    );

    iom.stop();
}

#[test]
fn condition_timer_skips_dead_owner() {
    init_logger();
    let iom = IoManager::new(1, false, "io_cond").unwrap();

    let hits = Arc::new(AtomicUsize::new(0));
    let owner = Arc::new(());
    let h = hits.clone();
    iom.add_condition_timer(
        30,
        move || {
            h.fetch_add(1, Ordering::SeqCst);
        },
        &owner,
        false,
    );
    drop(owner);

    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(hits.load(Ordering::SeqCst), 0);

    iom.stop();
}

#[test]
fn one_shot_timer_fires_no_earlier_than_deadline() {
    init_logger();
    let iom = IoManager::new(1, false, "io_oneshot").unwrap();

    let (tx, rx) = channel();
    let start = Instant::now();
    iom.add_timer(
        80,
        move || {
            let _ = tx.send(start.elapsed());
        },
        false,
    );
    let elapsed = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(elapsed >= Duration::from_millis(80), "fired at {:?}", elapsed);

    iom.stop();
}

#[test]
fn use_caller_reactor_drains_on_stop() {
    init_logger();
    let iom = IoManager::new(1, true, "io_caller").unwrap();

    let hits = Arc::new(AtomicUsize::new(0));
    let h = hits.clone();
    iom.add_timer(
        30,
        move || {
            h.fetch_add(1, Ordering::SeqCst);
        },
        false,
    );
    let h = hits.clone();
    iom.spawn(move || {
        h.fetch_add(10, Ordering::SeqCst);
    });

    // With one thread and use_caller, everything runs inside stop().
    iom.stop();
    assert_eq!(hits.load(Ordering::SeqCst), 11);
}

#[test]
fn stop_leaves_nothing_pending() {
    init_logger();
    let iom = IoManager::new(2, false, "io_stop").unwrap();

    let (tx, rx) = channel();
    for i in 0..16 {
        let tx = tx.clone();
        iom.spawn(move || {
            tx.send(i).unwrap();
        });
    }
    iom.stop();

    let mut got: Vec<i32> = (0..16).map(|_| rx.try_recv().unwrap()).collect();
    got.sort_unstable();
    assert_eq!(got, (0..16).collect::<Vec<_>>());
    assert_eq!(iom.pending_event_count(), 0);
}
