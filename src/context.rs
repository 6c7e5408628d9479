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

//! Saved register contexts and the symmetric switch primitive.
//!
//! A `Context` holds the callee-saved register set of a suspended execution.
//! `Context::swap` stores the current registers into one context and loads
//! another, transferring control to wherever the target context last saved
//! itself. Fresh contexts are pointed at a small assembly bootstrap that
//! builds a clean frame and jumps into the coroutine entry function.
//!
//! Only the callee-saved set is kept: everything else is already on the
//! stack at the `swap` call site, exactly as for an ordinary function call.

use crate::stack::Stack;

/// Entry function installed into a fresh context. Must never return; the
/// final switch out of a finished coroutine is its only exit.
pub type EntryFn = extern "C" fn(usize) -> !;

extern "C" {
    fn weft_swap_registers(out_regs: *mut Registers, in_regs: *const Registers);
    fn weft_bootstrap();
}

/// Saved machine context sufficient to resume a suspended execution.
#[derive(Debug)]
pub struct Context {
    regs: Registers,
}

impl Context {
    /// An all-zero context, used as the save slot for a thread's original
    /// entry context. Switching *into* an empty context that was never the
    /// source of a swap is undefined.
    pub fn empty() -> Context {
        Context {
            regs: Registers::new(),
        }
    }

    /// Build a context that will start executing `entry(arg)` on `stack`
    /// when first switched to.
    pub fn new(entry: EntryFn, arg: usize, stack: &Stack) -> Context {
        let mut regs = Registers::new();
        initialize_call_frame(&mut regs, entry, arg, stack);
        Context { regs }
    }

    /// Reinitialize an existing context to start `entry(arg)` on `stack`.
    pub fn rebind(&mut self, entry: EntryFn, arg: usize, stack: &Stack) {
        self.regs = Registers::new();
        initialize_call_frame(&mut self.regs, entry, arg, stack);
    }

    /// Suspend the current execution into `out_context` and resume
    /// `in_context`.
    ///
    /// # Safety
    ///
    /// `in_context` must hold either a frame produced by `Context::new`/
    /// `rebind` or registers saved by an earlier `swap`, and its stack must
    /// still be alive. The two pointers must not alias.
    pub unsafe fn swap(out_context: *mut Context, in_context: *const Context) {
        debug_assert!(!std::ptr::eq(out_context, in_context as *mut Context));
        weft_swap_registers(&mut (*out_context).regs, &(*in_context).regs)
    }
}

#[cfg(target_arch = "x86_64")]
#[repr(C)]
#[derive(Debug)]
struct Registers {
    // rbx, rsp, rbp, r12, r13, r14, r15 — the System V callee-saved set.
    gpr: [u64; 7],
}

#[cfg(target_arch = "x86_64")]
impl Registers {
    fn new() -> Registers {
        Registers { gpr: [0; 7] }
    }
}

#[cfg(target_arch = "x86_64")]
const RSP: usize = 1;
#[cfg(target_arch = "x86_64")]
const R12: usize = 3;
#[cfg(target_arch = "x86_64")]
const R13: usize = 4;

/// Lay out a fake frame so that restoring `regs` lands in `weft_bootstrap`,
/// which moves the stashed argument into place and jumps to `entry`.
#[cfg(target_arch = "x86_64")]
fn initialize_call_frame(regs: &mut Registers, entry: EntryFn, arg: usize, stack: &Stack) {
    let top = stack.end() as usize & !15;
    // One slot below the aligned top holds the bootstrap address that the
    // restoring `ret` pops.
    let sp = (top - 16) as *mut usize;
    unsafe {
        *sp = weft_bootstrap as usize;
    }

    regs.gpr[RSP] = sp as u64;
    regs.gpr[R12] = arg as u64;
    regs.gpr[R13] = entry as usize as u64;
}

#[cfg(target_arch = "x86_64")]
core::arch::global_asm!(
    ".text",
    ".p2align 4",
    ".globl weft_swap_registers",
    ".type weft_swap_registers, @function",
    "weft_swap_registers:",
    "mov [rdi + 0x00], rbx",
    "mov [rdi + 0x08], rsp",
    "mov [rdi + 0x10], rbp",
    "mov [rdi + 0x18], r12",
    "mov [rdi + 0x20], r13",
    "mov [rdi + 0x28], r14",
    "mov [rdi + 0x30], r15",
    "mov rbx, [rsi + 0x00]",
    "mov rsp, [rsi + 0x08]",
    "mov rbp, [rsi + 0x10]",
    "mov r12, [rsi + 0x18]",
    "mov r13, [rsi + 0x20]",
    "mov r14, [rsi + 0x28]",
    "mov r15, [rsi + 0x30]",
    "ret",
    // Landing pad for fresh contexts: r12 carries the entry argument, r13
    // the entry function. Zero rbp so backtraces terminate, realign the
    // stack to the ABI's call-boundary shape, leave a null return address.
    ".p2align 4",
    ".globl weft_bootstrap",
    ".type weft_bootstrap, @function",
    "weft_bootstrap:",
    "mov rdi, r12",
    "xor rbp, rbp",
    "and rsp, -16",
    "push rbp",
    "jmp r13",
);

#[cfg(target_arch = "aarch64")]
#[repr(C)]
#[derive(Debug)]
struct Registers {
    // x19-x28, x29 (fp), x30 (lr), sp.
    gpr: [u64; 13],
    // d8-d15.
    fpr: [u64; 8],
}

#[cfg(target_arch = "aarch64")]
impl Registers {
    fn new() -> Registers {
        Registers {
            gpr: [0; 13],
            fpr: [0; 8],
        }
    }
}

#[cfg(target_arch = "aarch64")]
const X19: usize = 0;
#[cfg(target_arch = "aarch64")]
const X20: usize = 1;
#[cfg(target_arch = "aarch64")]
const LR: usize = 11;
#[cfg(target_arch = "aarch64")]
const SP: usize = 12;

#[cfg(target_arch = "aarch64")]
fn initialize_call_frame(regs: &mut Registers, entry: EntryFn, arg: usize, stack: &Stack) {
    // sp must stay 16-byte aligned at all times on aarch64.
    let top = stack.end() as usize & !15;

    regs.gpr[SP] = top as u64;
    regs.gpr[LR] = weft_bootstrap as usize as u64;
    regs.gpr[X19] = arg as u64;
    regs.gpr[X20] = entry as usize as u64;
}

#[cfg(target_arch = "aarch64")]
core::arch::global_asm!(
    ".text",
    ".p2align 2",
    ".globl weft_swap_registers",
    ".type weft_swap_registers, @function",
    "weft_swap_registers:",
    "stp x19, x20, [x0, #0x00]",
    "stp x21, x22, [x0, #0x10]",
    "stp x23, x24, [x0, #0x20]",
    "stp x25, x26, [x0, #0x30]",
    "stp x27, x28, [x0, #0x40]",
    "stp x29, x30, [x0, #0x50]",
    "mov x9, sp",
    "str x9, [x0, #0x60]",
    "stp d8, d9, [x0, #0x68]",
    "stp d10, d11, [x0, #0x78]",
    "stp d12, d13, [x0, #0x88]",
    "stp d14, d15, [x0, #0x98]",
    "ldp x19, x20, [x1, #0x00]",
    "ldp x21, x22, [x1, #0x10]",
    "ldp x23, x24, [x1, #0x20]",
    "ldp x25, x26, [x1, #0x30]",
    "ldp x27, x28, [x1, #0x40]",
    "ldp x29, x30, [x1, #0x50]",
    "ldr x9, [x1, #0x60]",
    "mov sp, x9",
    "ldp d8, d9, [x1, #0x68]",
    "ldp d10, d11, [x1, #0x78]",
    "ldp d12, d13, [x1, #0x88]",
    "ldp d14, d15, [x1, #0x98]",
    "ret",
    // Landing pad for fresh contexts: x19 carries the entry argument, x20
    // the entry function. Zero fp/lr so backtraces terminate.
    ".p2align 2",
    ".globl weft_bootstrap",
    ".type weft_bootstrap, @function",
    "weft_bootstrap:",
    "mov x0, x19",
    "mov x29, xzr",
    "mov x30, xzr",
    "br x20",
);

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
compile_error!("no register-switch support for this architecture");
