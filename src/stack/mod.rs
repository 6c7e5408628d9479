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

//! Coroutine stacks: anonymous mappings with a guard page, plus a bounded
//! per-thread reuse pool.

pub use self::pool::StackPool;

mod pool;

use std::fmt;
use std::ptr;

fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

/// An owned coroutine stack.
pub struct Stack {
    base: *mut libc::c_void,
    len: usize,
    min_size: usize,
}

unsafe impl Send for Stack {}

impl fmt::Debug for Stack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stack")
            .field("base", &self.base)
            .field("len", &self.len)
            .field("min_size", &self.min_size)
            .finish()
    }
}

impl Stack {
    /// Map a stack of at least `size` usable bytes.
    ///
    /// The lowest page of the mapping is made inaccessible so overflow hits
    /// the guard instead of adjacent memory. Allocation failure is fatal to
    /// the call, matching the contract for resource exhaustion.
    pub fn new(size: usize) -> Stack {
        let page = page_size();
        // Round the usable area up to whole pages and add the guard page.
        let usable = (size.max(page) + page - 1) & !(page - 1);
        let len = usable + page;

        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_STACK | libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            panic!(
                "mmap for stack of size {} failed: {}",
                size,
                std::io::Error::last_os_error()
            );
        }

        // The stack grows downward: the guard sits at the low end.
        let rc = unsafe { libc::mprotect(base, page, libc::PROT_NONE) };
        if rc != 0 {
            unsafe {
                libc::munmap(base, len);
            }
            panic!(
                "could not protect stack guard page: {}",
                std::io::Error::last_os_error()
            );
        }

        Stack {
            base,
            len,
            min_size: size,
        }
    }

    /// Lowest usable address, just above the guard page.
    pub fn start(&self) -> *const u8 {
        unsafe { (self.base as *const u8).add(page_size()) }
    }

    /// One byte past the highest usable address.
    pub fn end(&self) -> *const u8 {
        unsafe { (self.base as *const u8).add(self.len) }
    }

    /// The size this stack was requested with.
    #[inline]
    pub fn min_size(&self) -> usize {
        self.min_size
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        let rc = unsafe { libc::munmap(self.base, self.len) };
        debug_assert_eq!(rc, 0);
    }
}
