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

//! Process-wide cache of per-fd metadata consulted by the hook layer.
//!
//! On first observation of an fd the cache decides whether it is a socket
//! (`fstat`) and, if so, forces the kernel-level non-blocking flag on: the
//! hook then owns blocking semantics, while the *user's* requested
//! non-blocking mode is tracked separately and reflected back through
//! `fcntl`/`ioctl`.

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, RwLock};

/// Timeout sentinel: no timeout configured.
pub const NO_TIMEOUT: u64 = u64::MAX;

/// Cached state of one file descriptor.
pub struct FdCtx {
    fd: RawFd,
    is_socket: bool,
    /// Non-blocking as forced by the runtime (sockets only).
    sys_nonblock: AtomicBool,
    /// Non-blocking as requested by the application.
    user_nonblock: AtomicBool,
    closed: AtomicBool,
    recv_timeout_ms: AtomicU64,
    send_timeout_ms: AtomicU64,
}

impl FdCtx {
    fn new(fd: RawFd) -> FdCtx {
        let mut stat: libc::stat = unsafe { std::mem::zeroed() };
        let is_socket = unsafe { libc::fstat(fd, &mut stat) } == 0
            && (stat.st_mode & libc::S_IFMT) == libc::S_IFSOCK;

        let ctx = FdCtx {
            fd,
            is_socket,
            sys_nonblock: AtomicBool::new(false),
            user_nonblock: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            recv_timeout_ms: AtomicU64::new(NO_TIMEOUT),
            send_timeout_ms: AtomicU64::new(NO_TIMEOUT),
        };

        if is_socket {
            // Raw syscalls: the interposed fcntl consults this cache and
            // must not re-enter it mid-construction.
            let flags =
                unsafe { libc::syscall(libc::SYS_fcntl, fd, libc::F_GETFL, 0) } as libc::c_int;
            if flags >= 0 && flags & libc::O_NONBLOCK == 0 {
                unsafe { libc::syscall(libc::SYS_fcntl, fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
            }
            ctx.sys_nonblock.store(true, Ordering::Relaxed);
        }
        ctx
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    #[inline]
    pub fn is_socket(&self) -> bool {
        self.is_socket
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

    pub(crate) fn mark_closed(&self) {
        self.closed.store(true, Ordering::Relaxed);
    }

    pub fn sys_nonblock(&self) -> bool {
        self.sys_nonblock.load(Ordering::Relaxed)
    }

    pub(crate) fn set_sys_nonblock(&self, v: bool) {
        self.sys_nonblock.store(v, Ordering::Relaxed);
    }

    pub fn user_nonblock(&self) -> bool {
        self.user_nonblock.load(Ordering::Relaxed)
    }

    pub(crate) fn set_user_nonblock(&self, v: bool) {
        self.user_nonblock.store(v, Ordering::Relaxed);
    }

    /// Timeout for one direction; `kind` is `SO_RCVTIMEO` or `SO_SNDTIMEO`.
    pub fn timeout_ms(&self, kind: libc::c_int) -> u64 {
        if kind == libc::SO_RCVTIMEO {
            self.recv_timeout_ms.load(Ordering::Relaxed)
        } else {
            self.send_timeout_ms.load(Ordering::Relaxed)
        }
    }

    pub fn set_timeout_ms(&self, kind: libc::c_int, ms: u64) {
        if kind == libc::SO_RCVTIMEO {
            self.recv_timeout_ms.store(ms, Ordering::Relaxed);
        } else {
            self.send_timeout_ms.store(ms, Ordering::Relaxed);
        }
    }
}

/// Grow-only vector of fd contexts behind a reader-writer lock.
pub struct FdManager {
    contexts: RwLock<Vec<Option<Arc<FdCtx>>>>,
}

impl FdManager {
    fn new() -> FdManager {
        FdManager {
            contexts: RwLock::new(Vec::with_capacity(64)),
        }
    }

    /// The process-wide instance.
    pub fn instance() -> &'static FdManager {
        static INSTANCE: OnceLock<FdManager> = OnceLock::new();
        INSTANCE.get_or_init(FdManager::new)
    }

    /// Look up `fd`, creating the entry when `auto_create` is set.
    pub fn get(&self, fd: RawFd, auto_create: bool) -> Option<Arc<FdCtx>> {
        if fd < 0 {
            return None;
        }
        {
            let contexts = self.contexts.read().unwrap();
            if let Some(Some(ctx)) = contexts.get(fd as usize) {
                return Some(ctx.clone());
            }
            if !auto_create {
                return None;
            }
        }

        let mut contexts = self.contexts.write().unwrap();
        if contexts.len() <= fd as usize {
            contexts.resize((fd as usize + 1).max(fd as usize * 3 / 2), None);
        }
        let slot = &mut contexts[fd as usize];
        match slot {
            Some(ctx) => Some(ctx.clone()),
            None => {
                let ctx = Arc::new(FdCtx::new(fd));
                *slot = Some(ctx.clone());
                Some(ctx)
            }
        }
    }

    /// Drop the entry for `fd`; called when the fd is closed.
    pub fn del(&self, fd: RawFd) {
        if fd < 0 {
            return;
        }
        let mut contexts = self.contexts.write().unwrap();
        if let Some(slot) = contexts.get_mut(fd as usize) {
            if let Some(ctx) = slot.take() {
                ctx.mark_closed();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(fd: RawFd) {
        unsafe { libc::close(fd) };
    }

    #[test]
    fn pipe_fd_is_not_a_socket() {
        let mut fds = [0; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);

        let ctx = FdManager::instance().get(fds[0], true).unwrap();
        assert!(!ctx.is_socket());
        assert!(!ctx.sys_nonblock());

        FdManager::instance().del(fds[0]);
        assert!(FdManager::instance().get(fds[0], false).is_none());
        close(fds[0]);
        close(fds[1]);
    }

    #[test]
    fn socket_fd_forced_nonblocking() {
        let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) };
        assert!(fd >= 0);

        let ctx = FdManager::instance().get(fd, true).unwrap();
        assert!(ctx.is_socket());
        assert!(ctx.sys_nonblock());
        assert!(!ctx.user_nonblock());

        // Kernel view, bypassing the interposed fcntl.
        let flags = unsafe { libc::syscall(libc::SYS_fcntl, fd, libc::F_GETFL, 0) } as libc::c_int;
        assert!(flags & libc::O_NONBLOCK != 0);

        FdManager::instance().del(fd);
        close(fd);
    }

    #[test]
    fn timeouts_are_per_direction() {
        let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0) };
        assert!(fd >= 0);

        let ctx = FdManager::instance().get(fd, true).unwrap();
        assert_eq!(ctx.timeout_ms(libc::SO_RCVTIMEO), NO_TIMEOUT);
        ctx.set_timeout_ms(libc::SO_RCVTIMEO, 250);
        ctx.set_timeout_ms(libc::SO_SNDTIMEO, 750);
        assert_eq!(ctx.timeout_ms(libc::SO_RCVTIMEO), 250);
        assert_eq!(ctx.timeout_ms(libc::SO_SNDTIMEO), 750);

        FdManager::instance().del(fd);
        close(fd);
    }

    #[test]
    fn lookup_without_create_misses() {
        assert!(FdManager::instance().get(1 << 20, false).is_none());
        assert!(FdManager::instance().get(-1, true).is_none());
    }
}
