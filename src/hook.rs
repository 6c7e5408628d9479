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

//! Transparent syscall interposition.
//!
//! Each intercepted POSIX call is exported under its original symbol name,
//! with the platform's implementation resolved once via
//! `dlsym(RTLD_NEXT, ...)`. On a thread where hooking is enabled (workers
//! turn it on entering the dispatch loop), a blocking-style call on a
//! cached socket that would block instead arms the fd on the current I/O
//! manager and parks the calling coroutine; the worker is free to dispatch
//! other work until readiness or timeout.
//!
//! The hook never changes a call's return-value/errno shape: callers see
//! exactly what the raw syscall would report, with EAGAIN replaced by
//! either a completed retry or ETIMEDOUT.

use std::cell::Cell;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, LazyLock};

use libc::{c_char, c_int, c_long, c_uint, c_ulong, c_void, size_t, socklen_t, ssize_t};
use log::error;

use crate::config::settings;
use crate::coroutine::Coroutine;
use crate::fd_manager::{FdManager, NO_TIMEOUT};
use crate::iomanager::{Event, IoManager};
use crate::scheduler::Task;
use crate::util::{errno, set_errno};

thread_local! {
    static HOOK_ENABLED: Cell<bool> = const { Cell::new(false) };
}

/// Whether blocking calls on this thread are rewritten into yielding ones.
pub fn is_hook_enabled() -> bool {
    HOOK_ENABLED.with(|h| h.get())
}

/// Per-thread opt-in; the scheduler enables this on each worker.
pub fn set_hook_enabled(enabled: bool) {
    HOOK_ENABLED.with(|h| h.set(enabled));
}

macro_rules! original {
    ($name:ident, $sym:literal, fn($($arg:ty),*) -> $ret:ty) => {
        static $name: LazyLock<unsafe extern "C" fn($($arg),*) -> $ret> =
            LazyLock::new(|| unsafe {
                let sym = libc::dlsym(
                    libc::RTLD_NEXT,
                    concat!($sym, "\0").as_ptr() as *const c_char,
                );
                if sym.is_null() {
                    panic!(concat!("dlsym(RTLD_NEXT, ", $sym, ") failed"));
                }
                std::mem::transmute(sym)
            });
    };
}

original!(SLEEP_F, "sleep", fn(c_uint) -> c_uint);
original!(USLEEP_F, "usleep", fn(c_uint) -> c_int);
original!(NANOSLEEP_F, "nanosleep", fn(*const libc::timespec, *mut libc::timespec) -> c_int);
original!(SOCKET_F, "socket", fn(c_int, c_int, c_int) -> c_int);
original!(CONNECT_F, "connect", fn(c_int, *const libc::sockaddr, socklen_t) -> c_int);
original!(ACCEPT_F, "accept", fn(c_int, *mut libc::sockaddr, *mut socklen_t) -> c_int);
original!(READ_F, "read", fn(c_int, *mut c_void, size_t) -> ssize_t);
original!(READV_F, "readv", fn(c_int, *const libc::iovec, c_int) -> ssize_t);
original!(RECV_F, "recv", fn(c_int, *mut c_void, size_t, c_int) -> ssize_t);
original!(
    RECVFROM_F,
    "recvfrom",
    fn(c_int, *mut c_void, size_t, c_int, *mut libc::sockaddr, *mut socklen_t) -> ssize_t
);
original!(RECVMSG_F, "recvmsg", fn(c_int, *mut libc::msghdr, c_int) -> ssize_t);
original!(WRITE_F, "write", fn(c_int, *const c_void, size_t) -> ssize_t);
original!(WRITEV_F, "writev", fn(c_int, *const libc::iovec, c_int) -> ssize_t);
original!(SEND_F, "send", fn(c_int, *const c_void, size_t, c_int) -> ssize_t);
original!(
    SENDTO_F,
    "sendto",
    fn(c_int, *const c_void, size_t, c_int, *const libc::sockaddr, socklen_t) -> ssize_t
);
original!(SENDMSG_F, "sendmsg", fn(c_int, *const libc::msghdr, c_int) -> ssize_t);
original!(CLOSE_F, "close", fn(c_int) -> c_int);
original!(FCNTL_F, "fcntl", fn(c_int, c_int, c_long) -> c_int);
original!(IOCTL_F, "ioctl", fn(c_int, c_ulong, *mut c_void) -> c_int);
original!(
    GETSOCKOPT_F,
    "getsockopt",
    fn(c_int, c_int, c_int, *mut c_void, *mut socklen_t) -> c_int
);
original!(
    SETSOCKOPT_F,
    "setsockopt",
    fn(c_int, c_int, c_int, *const c_void, socklen_t) -> c_int
);

/// Shared between an I/O wait and its timeout timer: non-zero once the
/// timer fired, holding the errno to surface.
#[derive(Default)]
struct TimerInfo {
    cancelled: AtomicI32,
}

/// The generic hooked-I/O flow: try, retry on EINTR, and on EAGAIN park
/// the coroutine on the reactor (bounded by the fd's per-direction
/// timeout) before trying again.
unsafe fn do_io<F>(
    fd: c_int,
    name: &str,
    event: Event,
    timeout_kind: c_int,
    mut call: F,
) -> ssize_t
where
    F: FnMut() -> ssize_t,
{
    if !is_hook_enabled() {
        return call();
    }

    let Some(ctx) = FdManager::instance().get(fd, false) else {
        return call();
    };
    if ctx.is_closed() {
        set_errno(libc::EBADF);
        return -1;
    }
    if !ctx.is_socket() || ctx.user_nonblock() {
        return call();
    }

    let timeout = ctx.timeout_ms(timeout_kind);

    loop {
        let mut n = call();
        while n == -1 && errno() == libc::EINTR {
            n = call();
        }
        if n != -1 || errno() != libc::EAGAIN {
            return n;
        }

        // Off-coroutine there is nothing to park; surface the non-blocking
        // result as-is.
        let Some(iom) = IoManager::current() else {
            return n;
        };

        let tinfo = Arc::new(TimerInfo::default());
        let timer = if timeout != NO_TIMEOUT {
            let winfo = Arc::downgrade(&tinfo);
            let iom2 = iom.clone();
            Some(iom.add_condition_timer(
                timeout,
                move || {
                    let Some(t) = winfo.upgrade() else { return };
                    if t.cancelled.load(Ordering::SeqCst) != 0 {
                        return;
                    }
                    t.cancelled.store(libc::ETIMEDOUT, Ordering::SeqCst);
                    iom2.cancel_event(fd, event);
                },
                &tinfo,
                false,
            ))
        } else {
            None
        };

        if let Err(err) = iom.add_event(fd, event) {
            error!("{} add_event({}, {:?}): {}", name, fd, event, err);
            if let Some(timer) = &timer {
                timer.cancel();
            }
            set_errno(err.raw_os_error().unwrap_or(libc::EINVAL));
            return -1;
        }

        Coroutine::yield_to_hold();

        if let Some(timer) = &timer {
            timer.cancel();
        }
        let cancelled = tinfo.cancelled.load(Ordering::SeqCst);
        if cancelled != 0 {
            set_errno(cancelled);
            return -1;
        }
        // Readiness reported: try the call again.
    }
}

fn sleep_on_timer(ms: u64) -> bool {
    if !is_hook_enabled() {
        return false;
    }
    let Some(iom) = IoManager::current() else {
        return false;
    };
    let co = Coroutine::current();
    let iom2 = iom.clone();
    iom.add_timer(
        ms,
        move || {
            iom2.schedule(Task::coroutine(co.clone()));
        },
        false,
    );
    Coroutine::yield_to_hold();
    true
}

/// # Safety
///
/// C ABI export; same contract as the libc function it replaces.
#[no_mangle]
pub unsafe extern "C" fn sleep(seconds: c_uint) -> c_uint {
    if sleep_on_timer(seconds as u64 * 1000) {
        return 0;
    }
    (*SLEEP_F)(seconds)
}

/// # Safety
///
/// C ABI export; same contract as the libc function it replaces.
#[no_mangle]
pub unsafe extern "C" fn usleep(usec: c_uint) -> c_int {
    if sleep_on_timer(usec as u64 / 1000) {
        return 0;
    }
    (*USLEEP_F)(usec)
}

/// # Safety
///
/// C ABI export; same contract as the libc function it replaces.
#[no_mangle]
pub unsafe extern "C" fn nanosleep(
    req: *const libc::timespec,
    rem: *mut libc::timespec,
) -> c_int {
    if !req.is_null() {
        let ms = (*req).tv_sec as u64 * 1000 + (*req).tv_nsec as u64 / 1_000_000;
        if sleep_on_timer(ms) {
            return 0;
        }
    }
    (*NANOSLEEP_F)(req, rem)
}

/// # Safety
///
/// C ABI export; same contract as the libc function it replaces.
#[no_mangle]
pub unsafe extern "C" fn socket(domain: c_int, ty: c_int, protocol: c_int) -> c_int {
    if !is_hook_enabled() {
        return (*SOCKET_F)(domain, ty, protocol);
    }
    let fd = (*SOCKET_F)(domain, ty, protocol);
    if fd == -1 {
        return fd;
    }
    FdManager::instance().get(fd, true);
    fd
}

/// Hooked `connect` with an explicit timeout in milliseconds
/// (`NO_TIMEOUT` to wait indefinitely).
///
/// # Safety
///
/// `addr` must point to a valid socket address of length `addrlen`.
pub unsafe fn connect_with_timeout(
    fd: c_int,
    addr: *const libc::sockaddr,
    addrlen: socklen_t,
    timeout_ms: u64,
) -> c_int {
    if !is_hook_enabled() {
        return (*CONNECT_F)(fd, addr, addrlen);
    }
    let Some(ctx) = FdManager::instance().get(fd, false) else {
        set_errno(libc::EBADF);
        return -1;
    };
    if ctx.is_closed() {
        set_errno(libc::EBADF);
        return -1;
    }
    if !ctx.is_socket() || ctx.user_nonblock() {
        return (*CONNECT_F)(fd, addr, addrlen);
    }

    let n = (*CONNECT_F)(fd, addr, addrlen);
    if n == 0 {
        return 0;
    }
    if n != -1 || errno() != libc::EINPROGRESS {
        return n;
    }

    let Some(iom) = IoManager::current() else {
        return n;
    };

    let tinfo = Arc::new(TimerInfo::default());
    let timer = if timeout_ms != NO_TIMEOUT {
        let winfo = Arc::downgrade(&tinfo);
        let iom2 = iom.clone();
        Some(iom.add_condition_timer(
            timeout_ms,
            move || {
                let Some(t) = winfo.upgrade() else { return };
                if t.cancelled.load(Ordering::SeqCst) != 0 {
                    return;
                }
                t.cancelled.store(libc::ETIMEDOUT, Ordering::SeqCst);
                iom2.cancel_event(fd, Event::Write);
            },
            &tinfo,
            false,
        ))
    } else {
        None
    };

    match iom.add_event(fd, Event::Write) {
        Ok(()) => {
            Coroutine::yield_to_hold();
            if let Some(timer) = &timer {
                timer.cancel();
            }
            let cancelled = tinfo.cancelled.load(Ordering::SeqCst);
            if cancelled != 0 {
                set_errno(cancelled);
                return -1;
            }
        }
        Err(err) => {
            if let Some(timer) = &timer {
                timer.cancel();
            }
            error!("connect add_event({}, WRITE): {}", fd, err);
        }
    }

    // The connection finished (or failed) in the background; the verdict
    // lives in SO_ERROR.
    let mut error: c_int = 0;
    let mut len = std::mem::size_of::<c_int>() as socklen_t;
    if (*GETSOCKOPT_F)(
        fd,
        libc::SOL_SOCKET,
        libc::SO_ERROR,
        &mut error as *mut c_int as *mut c_void,
        &mut len,
    ) == -1
    {
        return -1;
    }
    if error == 0 {
        0
    } else {
        set_errno(error);
        -1
    }
}

/// # Safety
///
/// C ABI export; same contract as the libc function it replaces.
#[no_mangle]
pub unsafe extern "C" fn connect(
    sockfd: c_int,
    addr: *const libc::sockaddr,
    addrlen: socklen_t,
) -> c_int {
    connect_with_timeout(sockfd, addr, addrlen, settings().connect_timeout_ms())
}

/// # Safety
///
/// C ABI export; same contract as the libc function it replaces.
#[no_mangle]
pub unsafe extern "C" fn accept(
    sockfd: c_int,
    addr: *mut libc::sockaddr,
    addrlen: *mut socklen_t,
) -> c_int {
    let fd = do_io(sockfd, "accept", Event::Read, libc::SO_RCVTIMEO, || {
        (*ACCEPT_F)(sockfd, addr, addrlen) as ssize_t
    }) as c_int;
    if fd >= 0 {
        if let Some(ctx) = FdManager::instance().get(fd, true) {
            // Accepted sockets start with the configured read timeout.
            let default_timeout = settings().accept_read_timeout_ms();
            if ctx.timeout_ms(libc::SO_RCVTIMEO) == NO_TIMEOUT && default_timeout != 0 {
                ctx.set_timeout_ms(libc::SO_RCVTIMEO, default_timeout);
            }
        }
    }
    fd
}

/// # Safety
///
/// C ABI export; same contract as the libc function it replaces.
#[no_mangle]
pub unsafe extern "C" fn read(fd: c_int, buf: *mut c_void, count: size_t) -> ssize_t {
    do_io(fd, "read", Event::Read, libc::SO_RCVTIMEO, || {
        (*READ_F)(fd, buf, count)
    })
}

/// # Safety
///
/// C ABI export; same contract as the libc function it replaces.
#[no_mangle]
pub unsafe extern "C" fn readv(fd: c_int, iov: *const libc::iovec, iovcnt: c_int) -> ssize_t {
    do_io(fd, "readv", Event::Read, libc::SO_RCVTIMEO, || {
        (*READV_F)(fd, iov, iovcnt)
    })
}

/// # Safety
///
/// C ABI export; same contract as the libc function it replaces.
#[no_mangle]
pub unsafe extern "C" fn recv(sockfd: c_int, buf: *mut c_void, len: size_t, flags: c_int) -> ssize_t {
    do_io(sockfd, "recv", Event::Read, libc::SO_RCVTIMEO, || {
        (*RECV_F)(sockfd, buf, len, flags)
    })
}

/// # Safety
///
/// C ABI export; same contract as the libc function it replaces.
#[no_mangle]
pub unsafe extern "C" fn recvfrom(
    sockfd: c_int,
    buf: *mut c_void,
    len: size_t,
    flags: c_int,
    src_addr: *mut libc::sockaddr,
    addrlen: *mut socklen_t,
) -> ssize_t {
    do_io(sockfd, "recvfrom", Event::Read, libc::SO_RCVTIMEO, || {
        (*RECVFROM_F)(sockfd, buf, len, flags, src_addr, addrlen)
    })
}

/// # Safety
///
/// C ABI export; same contract as the libc function it replaces.
#[no_mangle]
pub unsafe extern "C" fn recvmsg(sockfd: c_int, msg: *mut libc::msghdr, flags: c_int) -> ssize_t {
    do_io(sockfd, "recvmsg", Event::Read, libc::SO_RCVTIMEO, || {
        (*RECVMSG_F)(sockfd, msg, flags)
    })
}

/// # Safety
///
/// C ABI export; same contract as the libc function it replaces.
#[no_mangle]
pub unsafe extern "C" fn write(fd: c_int, buf: *const c_void, count: size_t) -> ssize_t {
    do_io(fd, "write", Event::Write, libc::SO_SNDTIMEO, || {
        (*WRITE_F)(fd, buf, count)
    })
}

/// # Safety
///
/// C ABI export; same contract as the libc function it replaces.
#[no_mangle]
pub unsafe extern "C" fn writev(fd: c_int, iov: *const libc::iovec, iovcnt: c_int) -> ssize_t {
    do_io(fd, "writev", Event::Write, libc::SO_SNDTIMEO, || {
        (*WRITEV_F)(fd, iov, iovcnt)
    })
}

/// # Safety
///
/// C ABI export; same contract as the libc function it replaces.
#[no_mangle]
pub unsafe extern "C" fn send(sockfd: c_int, buf: *const c_void, len: size_t, flags: c_int) -> ssize_t {
    do_io(sockfd, "send", Event::Write, libc::SO_SNDTIMEO, || {
        (*SEND_F)(sockfd, buf, len, flags)
    })
}

/// # Safety
///
/// C ABI export; same contract as the libc function it replaces.
#[no_mangle]
pub unsafe extern "C" fn sendto(
    sockfd: c_int,
    buf: *const c_void,
    len: size_t,
    flags: c_int,
    dest_addr: *const libc::sockaddr,
    addrlen: socklen_t,
) -> ssize_t {
    do_io(sockfd, "sendto", Event::Write, libc::SO_SNDTIMEO, || {
        (*SENDTO_F)(sockfd, buf, len, flags, dest_addr, addrlen)
    })
}

/// # Safety
///
/// C ABI export; same contract as the libc function it replaces.
#[no_mangle]
pub unsafe extern "C" fn sendmsg(sockfd: c_int, msg: *const libc::msghdr, flags: c_int) -> ssize_t {
    do_io(sockfd, "sendmsg", Event::Write, libc::SO_SNDTIMEO, || {
        (*SENDMSG_F)(sockfd, msg, flags)
    })
}

/// # Safety
///
/// C ABI export; same contract as the libc function it replaces.
#[no_mangle]
pub unsafe extern "C" fn close(fd: c_int) -> c_int {
    if !is_hook_enabled() {
        return (*CLOSE_F)(fd);
    }
    if FdManager::instance().get(fd, false).is_some() {
        if let Some(iom) = IoManager::current() {
            iom.cancel_all(fd);
        }
        FdManager::instance().del(fd);
    }
    (*CLOSE_F)(fd)
}

/// # Safety
///
/// C ABI export. The variadic tail is flattened to one register-passed
/// argument, which covers every interposed command.
#[no_mangle]
pub unsafe extern "C" fn fcntl(fd: c_int, cmd: c_int, arg: c_long) -> c_int {
    match cmd {
        libc::F_SETFL => {
            let mut flags = arg as c_int;
            match FdManager::instance().get(fd, false) {
                Some(ctx) if ctx.is_socket() && !ctx.is_closed() => {
                    ctx.set_user_nonblock(flags & libc::O_NONBLOCK != 0);
                    // The kernel view stays whatever the runtime needs.
                    if ctx.sys_nonblock() {
                        flags |= libc::O_NONBLOCK;
                    } else {
                        flags &= !libc::O_NONBLOCK;
                    }
                    (*FCNTL_F)(fd, cmd, flags as c_long)
                }
                _ => (*FCNTL_F)(fd, cmd, arg),
            }
        }
        libc::F_GETFL => {
            let flags = (*FCNTL_F)(fd, cmd, 0);
            if flags == -1 {
                return flags;
            }
            match FdManager::instance().get(fd, false) {
                Some(ctx) if ctx.is_socket() && !ctx.is_closed() => {
                    if ctx.user_nonblock() {
                        flags | libc::O_NONBLOCK
                    } else {
                        flags & !libc::O_NONBLOCK
                    }
                }
                _ => flags,
            }
        }
        _ => (*FCNTL_F)(fd, cmd, arg),
    }
}

/// # Safety
///
/// C ABI export. The variadic tail is flattened to one pointer argument,
/// which covers every interposed request.
#[no_mangle]
pub unsafe extern "C" fn ioctl(fd: c_int, request: c_ulong, arg: *mut c_void) -> c_int {
    if request == libc::FIONBIO as c_ulong && !arg.is_null() {
        if let Some(ctx) = FdManager::instance().get(fd, false) {
            if ctx.is_socket() && !ctx.is_closed() {
                ctx.set_user_nonblock(*(arg as *const c_int) != 0);
            }
        }
    }
    (*IOCTL_F)(fd, request, arg)
}

/// # Safety
///
/// C ABI export; same contract as the libc function it replaces.
#[no_mangle]
pub unsafe extern "C" fn getsockopt(
    sockfd: c_int,
    level: c_int,
    optname: c_int,
    optval: *mut c_void,
    optlen: *mut socklen_t,
) -> c_int {
    (*GETSOCKOPT_F)(sockfd, level, optname, optval, optlen)
}

/// # Safety
///
/// C ABI export; same contract as the libc function it replaces.
#[no_mangle]
pub unsafe extern "C" fn setsockopt(
    sockfd: c_int,
    level: c_int,
    optname: c_int,
    optval: *const c_void,
    optlen: socklen_t,
) -> c_int {
    if is_hook_enabled()
        && level == libc::SOL_SOCKET
        && (optname == libc::SO_RCVTIMEO || optname == libc::SO_SNDTIMEO)
        && !optval.is_null()
    {
        if let Some(ctx) = FdManager::instance().get(sockfd, false) {
            let tv = &*(optval as *const libc::timeval);
            let ms = tv.tv_sec as u64 * 1000 + tv.tv_usec as u64 / 1000;
            ctx.set_timeout_ms(optname, if ms == 0 { NO_TIMEOUT } else { ms });
        }
    }
    (*SETSOCKOPT_F)(sockfd, level, optname, optval, optlen)
}
