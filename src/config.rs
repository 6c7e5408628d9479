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

//! Process-scoped runtime settings.
//!
//! Constructed once on first access, seeded from the environment, and
//! adjustable at runtime. The hook layer re-reads the timeout values on
//! every intercepted call, so changes take effect immediately.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::OnceLock;

/// Default coroutine stack size: 1 MiB.
const DEFAULT_STACK_SIZE: usize = 1024 * 1024;
/// Default hooked `connect` timeout in milliseconds.
const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5000;
/// Default receive timeout installed on accepted sockets: two minutes.
const DEFAULT_ACCEPT_READ_TIMEOUT_MS: u64 = 120_000;

/// Runtime knobs honored by the core.
pub struct Settings {
    stack_size: AtomicUsize,
    connect_timeout_ms: AtomicU64,
    accept_read_timeout_ms: AtomicU64,
}

impl Settings {
    fn from_env() -> Settings {
        Settings {
            stack_size: AtomicUsize::new(env_or("WEFT_STACK_SIZE", DEFAULT_STACK_SIZE)),
            connect_timeout_ms: AtomicU64::new(env_or(
                "WEFT_CONNECT_TIMEOUT_MS",
                DEFAULT_CONNECT_TIMEOUT_MS,
            )),
            accept_read_timeout_ms: AtomicU64::new(env_or(
                "WEFT_ACCEPT_READ_TIMEOUT_MS",
                DEFAULT_ACCEPT_READ_TIMEOUT_MS,
            )),
        }
    }

    /// Default stack size in bytes for new coroutines.
    pub fn stack_size(&self) -> usize {
        self.stack_size.load(Ordering::Relaxed)
    }

    pub fn set_stack_size(&self, bytes: usize) {
        self.stack_size.store(bytes, Ordering::Relaxed);
    }

    /// Timeout in milliseconds applied to hooked `connect` calls.
    pub fn connect_timeout_ms(&self) -> u64 {
        self.connect_timeout_ms.load(Ordering::Relaxed)
    }

    pub fn set_connect_timeout_ms(&self, ms: u64) {
        self.connect_timeout_ms.store(ms, Ordering::Relaxed);
    }

    /// Receive timeout in milliseconds installed on sockets returned by a
    /// hooked `accept`.
    pub fn accept_read_timeout_ms(&self) -> u64 {
        self.accept_read_timeout_ms.load(Ordering::Relaxed)
    }

    pub fn set_accept_read_timeout_ms(&self, ms: u64) {
        self.accept_read_timeout_ms.store(ms, Ordering::Relaxed);
    }
}

fn env_or<T: std::str::FromStr + Copy>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// The process-wide settings registry.
pub fn settings() -> &'static Settings {
    static SETTINGS: OnceLock<Settings> = OnceLock::new();
    SETTINGS.get_or_init(Settings::from_env)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_and_overrides() {
        let s = settings();
        assert!(s.stack_size() > 0);
        let old = s.connect_timeout_ms();
        s.set_connect_timeout_ms(123);
        assert_eq!(s.connect_timeout_ms(), 123);
        s.set_connect_timeout_ms(old);
    }
}
