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

//! Blocking-style POSIX code running inside coroutines, transparently
//! rewritten by the hook layer.
//!
//! Sockets used by the parked paths are pre-registered in the fd cache
//! (the hook registers fds it sees `socket`/`accept` create; pairs made
//! with `socketpair` on the test thread are registered by hand).

use std::os::unix::io::RawFd;
use std::sync::mpsc::channel;
use std::time::{Duration, Instant};

use weft::fd_manager::FdManager;
use weft::IoManager;

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn socket_pair() -> (RawFd, RawFd) {
    let mut sv = [0 as RawFd; 2];
    let rc = unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, sv.as_mut_ptr()) };
    assert_eq!(rc, 0);
    // The hook only owns blocking semantics for fds it has seen.
    FdManager::instance().get(sv[0], true).unwrap();
    FdManager::instance().get(sv[1], true).unwrap();
    (sv[0], sv[1])
}

fn close_fd(fd: RawFd) {
    FdManager::instance().del(fd);
    unsafe { libc::close(fd) };
}

fn last_errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

#[test]
fn blocked_reader_resumes_when_peer_writes() {
    init_logger();
    // One worker: the reader can only finish if recv yields.
    let iom = IoManager::new(1, false, "hook_echo").unwrap();
    let (a, b) = socket_pair();

    let (tx, rx) = channel();
    iom.spawn(move || {
        let mut buf = [0u8; 16];
        let n = unsafe { libc::recv(a, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0) };
        tx.send((n, buf[..n.max(0) as usize].to_vec())).unwrap();
    });
    iom.spawn(move || {
        let n = unsafe { libc::send(b, b"hello".as_ptr() as *const libc::c_void, 5, 0) };
        assert_eq!(n, 5);
    });

    let (n, data) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(n, 5);
    assert_eq!(data, b"hello");

    iom.stop();
    close_fd(a);
    close_fd(b);
}

#[test]
fn pipe_echo_across_workers() {
    init_logger();
    // A pipe is not a socket, so the hook passes the blocking read through;
    // the second worker supplies the bytes.
    let iom = IoManager::new(2, false, "hook_pipe").unwrap();

    let mut fds = [0 as RawFd; 2];
    assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
    let (r, w) = (fds[0], fds[1]);

    let (tx, rx) = channel();
    iom.spawn(move || {
        let mut buf = [0u8; 16];
        let n = unsafe { libc::read(r, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        tx.send((n, buf[..n.max(0) as usize].to_vec())).unwrap();
    });
    iom.spawn(move || {
        let n = unsafe { libc::write(w, b"hello".as_ptr() as *const libc::c_void, 5) };
        assert_eq!(n, 5);
    });

    let (n, data) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(n, 5);
    assert_eq!(data, b"hello");

    iom.stop();
    close_fd(r);
    close_fd(w);
}

#[test]
fn recv_times_out_with_so_rcvtimeo() {
    init_logger();
    let iom = IoManager::new(1, false, "hook_timeout").unwrap();
    let (a, b) = socket_pair();

    let (tx, rx) = channel();
    iom.spawn(move || {
        let tv = libc::timeval {
            tv_sec: 0,
            tv_usec: 100_000,
        };
        let rc = unsafe {
            libc::setsockopt(
                a,
                libc::SOL_SOCKET,
                libc::SO_RCVTIMEO,
                &tv as *const libc::timeval as *const libc::c_void,
                std::mem::size_of::<libc::timeval>() as libc::socklen_t,
            )
        };
        assert_eq!(rc, 0);

        let start = Instant::now();
        let mut buf = [0u8; 4];
        let n = unsafe { libc::recv(a, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0) };
        tx.send((n, last_errno(), start.elapsed())).unwrap();
    });

    let (n, err, elapsed) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(n, -1);
    assert_eq!(err, libc::ETIMEDOUT);
    assert!(
        elapsed >= Duration::from_millis(100) && elapsed < Duration::from_millis(500),
        "timed out after {:?}",
        elapsed
    );

    iom.stop();
    close_fd(a);
    close_fd(b);
}

#[test]
fn sleeps_interleave_on_one_worker() {
    init_logger();
    let iom = IoManager::new(1, false, "hook_sleep").unwrap();

    let (tx, rx) = channel();
    let start = Instant::now();
    for _ in 0..3 {
        let tx = tx.clone();
        iom.spawn(move || {
            unsafe { libc::sleep(1) };
            tx.send(()).unwrap();
        });
    }
    for _ in 0..3 {
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
    }
    let elapsed = start.elapsed();
    // Cooperative: three one-second sleeps share the single worker.
    assert!(
        elapsed >= Duration::from_millis(950) && elapsed < Duration::from_millis(1800),
        "three sleeps took {:?}",
        elapsed
    );

    iom.stop();
}

#[test]
fn usleep_yields_for_the_requested_time() {
    init_logger();
    let iom = IoManager::new(1, false, "hook_usleep").unwrap();

    let (tx, rx) = channel();
    iom.spawn(move || {
        let start = Instant::now();
        unsafe { libc::usleep(200_000) };
        tx.send(start.elapsed()).unwrap();
    });
    let elapsed = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(
        elapsed >= Duration::from_millis(200) && elapsed < Duration::from_millis(800),
        "usleep took {:?}",
        elapsed
    );

    iom.stop();
}

#[test]
fn close_unblocks_parked_reader_with_ebadf() {
    init_logger();
    let iom = IoManager::new(1, false, "hook_close").unwrap();
    let (a, b) = socket_pair();

    let (tx, rx) = channel();
    iom.spawn(move || {
        let mut buf = [0u8; 4];
        let n = unsafe { libc::recv(a, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0) };
        tx.send((n, last_errno())).unwrap();
    });
    // Runs after the reader has parked (single worker, FIFO).
    iom.spawn(move || {
        let rc = unsafe { libc::close(a) };
        assert_eq!(rc, 0);
    });

    let (n, err) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(n, -1);
    assert_eq!(err, libc::EBADF);
    assert_eq!(iom.pending_event_count(), 0);

    iom.stop();
    close_fd(b);
}

#[test]
fn connect_respects_configured_timeout() {
    init_logger();
    weft::settings().set_connect_timeout_ms(300);
    let iom = IoManager::new(1, false, "hook_connect").unwrap();

    let (tx, rx) = channel();
    iom.spawn(move || {
        let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) };
        assert!(fd >= 0);

        // TEST-NET-1: routable but unanswered.
        let addr = libc::sockaddr_in {
            sin_family: libc::AF_INET as libc::sa_family_t,
            sin_port: 81u16.to_be(),
            sin_addr: libc::in_addr {
                s_addr: u32::from_be_bytes([192, 0, 2, 1]).to_be(),
            },
            sin_zero: [0; 8],
        };
        let start = Instant::now();
        let rc = unsafe {
            libc::connect(
                fd,
                &addr as *const libc::sockaddr_in as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        };
        let res = (rc, last_errno(), start.elapsed());
        unsafe { libc::close(fd) };
        tx.send(res).unwrap();
    });

    let (rc, err, elapsed) = rx.recv_timeout(Duration::from_secs(10)).unwrap();
    assert_eq!(rc, -1);
    if err == libc::ETIMEDOUT {
        // The 300ms setting applied, not the 5s default.
        assert!(
            elapsed >= Duration::from_millis(280) && elapsed < Duration::from_millis(2000),
            "connect timed out after {:?}",
            elapsed
        );
    }
    // Environments without a route fail faster with a network error; both
    // shapes surface the raw errno unchanged.

    iom.stop();
    weft::settings().set_connect_timeout_ms(5000);
}

#[test]
fn fcntl_keeps_user_and_kernel_views_apart() {
    init_logger();
    let iom = IoManager::new(1, false, "hook_fcntl").unwrap();

    let (tx, rx) = channel();
    iom.spawn(move || {
        let fd = unsafe { libc::socket(libc::AF_UNIX, libc::SOCK_STREAM, 0) };
        assert!(fd >= 0);

        // The runtime forced O_NONBLOCK on, but the application never
        // asked for it: F_GETFL reports the application's view.
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
        let user_nonblock_before = flags & libc::O_NONBLOCK != 0;

        // Once the application opts in, would-block results surface raw.
        unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
        let mut buf = [0u8; 4];
        let n = unsafe { libc::recv(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0) };
        let err = last_errno();

        unsafe { libc::close(fd) };
        tx.send((user_nonblock_before, n, err)).unwrap();
    });

    let (user_nonblock_before, n, err) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(!user_nonblock_before);
    assert_eq!(n, -1);
    // Unconnected UNIX stream sockets report ENOTCONN or EINVAL instead of
    // EAGAIN on some kernels; all three prove the call did not park.
    assert!(
        err == libc::EAGAIN || err == libc::ENOTCONN || err == libc::EINVAL,
        "errno {}",
        err
    );

    iom.stop();
}

#[test]
fn accepted_sockets_inherit_default_read_timeout() {
    init_logger();
    weft::settings().set_accept_read_timeout_ms(120_000);
    let iom = IoManager::new(2, false, "hook_accept").unwrap();

    let (tx, rx) = channel();
    iom.spawn(move || {
        let listener = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) };
        assert!(listener >= 0);

        let mut addr = libc::sockaddr_in {
            sin_family: libc::AF_INET as libc::sa_family_t,
            sin_port: 0,
            sin_addr: libc::in_addr {
                s_addr: u32::from_be_bytes([127, 0, 0, 1]).to_be(),
            },
            sin_zero: [0; 8],
        };
        let mut len = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
        unsafe {
            assert_eq!(
                libc::bind(
                    listener,
                    &addr as *const libc::sockaddr_in as *const libc::sockaddr,
                    len
                ),
                0
            );
            assert_eq!(libc::listen(listener, 8), 0);
            assert_eq!(
                libc::getsockname(
                    listener,
                    &mut addr as *mut libc::sockaddr_in as *mut libc::sockaddr,
                    &mut len
                ),
                0
            );
        }
        let port = u16::from_be(addr.sin_port);

        // Peer connects from a plain OS thread.
        let peer = std::thread::spawn(move || {
            let stream =
                std::net::TcpStream::connect(("127.0.0.1", port)).expect("peer connect failed");
            std::thread::sleep(Duration::from_millis(100));
            drop(stream);
        });

        let accepted = unsafe { libc::accept(listener, std::ptr::null_mut(), std::ptr::null_mut()) };
        assert!(accepted >= 0);

        let ctx = FdManager::instance().get(accepted, false).unwrap();
        let timeout = ctx.timeout_ms(libc::SO_RCVTIMEO);

        unsafe {
            libc::close(accepted);
            libc::close(listener);
        }
        peer.join().unwrap();
        tx.send(timeout).unwrap();
    });

    let timeout = rx.recv_timeout(Duration::from_secs(10)).unwrap();
    assert_eq!(timeout, 120_000);

    iom.stop();
}
