//! Abstraction over userspace multitasking.
//!
//! Provides an implementation for every CPU architecture.

use std::arch::naked_asm;
use std::ptr;

/// Handle to a stack pointer set up for context switching.
#[repr(transparent)]
#[derive(Debug, Copy, Clone)]
pub(super) struct Continuation(*const ());

impl Continuation {
    /// Placeholder for a context that hasn't been switched away from yet.
    pub(super) const fn empty() -> Self {
        Continuation(ptr::null())
    }
}

#[cfg(not(unix))]
compile_error!("stackful only supports Unix targets");

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
compile_error!("stackful only supports x86_64 and aarch64");

// Initial frame, lowest address first:
// mxcsr/fpucw, r15, r14, r13, r12, rbx, rbp, entry, null return address, padding, padding.
// The entry is reached through `ret`, leaving %rsp+8 16-byte aligned as the SysV ABI expects.
#[cfg(target_arch = "x86_64")]
const FRAME_WORDS: usize = 11;
#[cfg(target_arch = "x86_64")]
const ENTRY_SLOT: usize = 7;
#[cfg(target_arch = "x86_64")]
const DEFAULT_CONTROL_WORDS: usize = 0x1F80 | (0x037F << 32);

// Initial frame, lowest address first:
// x19..x28, x29, x30, d8..d15, null frame record.
// `ret` branches to x30 with sp 16-byte aligned.
#[cfg(target_arch = "aarch64")]
const FRAME_WORDS: usize = 22;
#[cfg(target_arch = "aarch64")]
const ENTRY_SLOT: usize = 11;

/// Initializes a stack for context switching.
///
/// The first [jump] into the returned continuation starts executing [func] on that stack.
///
/// # Safety
/// [stack] must be the 16-byte aligned, exclusively owned top of a stack with room for the initial frame.
pub(super) unsafe fn prepare_stack(stack: *mut u8, func: extern "C" fn() -> !) -> Continuation {
    debug_assert_eq!(stack as usize % 16, 0);

    let frame = (stack as *mut usize).sub(FRAME_WORDS);
    ptr::write_bytes(frame, 0, FRAME_WORDS);
    frame.add(ENTRY_SLOT).write(func as usize);

    #[cfg(target_arch = "x86_64")]
    frame.write(DEFAULT_CONTROL_WORDS);

    Continuation(frame as *const ())
}

/// Executes a context switch.
///
/// Spills registers, sets [from] to updated stack pointer.
/// Sets stack pointer to [to], restores registers.
///
/// # Safety
/// [to] must hold a continuation produced by [prepare_stack] or by an earlier [jump], and nothing else may be running on it.
#[cfg(target_arch = "x86_64")]
#[unsafe(naked)]
pub(super) unsafe extern "C" fn jump(from: *mut Continuation, to: *const Continuation) {
    naked_asm!(
        // callee-saved registers
        "push rbp",
        "push rbx",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        // floating point control words
        "sub rsp, 8",
        "stmxcsr [rsp]",
        "fnstcw [rsp + 4]",
        // swap stacks
        "mov [rdi], rsp",
        "mov rsp, [rsi]",
        "ldmxcsr [rsp]",
        "fldcw [rsp + 4]",
        "add rsp, 8",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop rbx",
        "pop rbp",
        "ret",
    );
}

/// Executes a context switch.
///
/// Spills registers, sets [from] to updated stack pointer.
/// Sets stack pointer to [to], restores registers.
///
/// # Safety
/// [to] must hold a continuation produced by [prepare_stack] or by an earlier [jump], and nothing else may be running on it.
#[cfg(target_arch = "aarch64")]
#[unsafe(naked)]
pub(super) unsafe extern "C" fn jump(from: *mut Continuation, to: *const Continuation) {
    naked_asm!(
        // callee-saved registers
        "sub sp, sp, #160",
        "stp x19, x20, [sp, #0]",
        "stp x21, x22, [sp, #16]",
        "stp x23, x24, [sp, #32]",
        "stp x25, x26, [sp, #48]",
        "stp x27, x28, [sp, #64]",
        "stp x29, x30, [sp, #80]",
        "stp d8, d9, [sp, #96]",
        "stp d10, d11, [sp, #112]",
        "stp d12, d13, [sp, #128]",
        "stp d14, d15, [sp, #144]",
        // swap stacks
        "mov x2, sp",
        "str x2, [x0]",
        "ldr x2, [x1]",
        "mov sp, x2",
        "ldp x19, x20, [sp, #0]",
        "ldp x21, x22, [sp, #16]",
        "ldp x23, x24, [sp, #32]",
        "ldp x25, x26, [sp, #48]",
        "ldp x27, x28, [sp, #64]",
        "ldp x29, x30, [sp, #80]",
        "ldp d8, d9, [sp, #96]",
        "ldp d10, d11, [sp, #112]",
        "ldp d12, d13, [sp, #128]",
        "ldp d14, d15, [sp, #144]",
        "add sp, sp, #160",
        "ret",
    );
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::num::NonZeroUsize;

    use super::*;
    use crate::fiber::stack::Stack;

    thread_local! {
        static MAIN: Cell<Continuation> = const { Cell::new(Continuation::empty()) };
        static OTHER: Cell<Continuation> = const { Cell::new(Continuation::empty()) };
        static VISITS: Cell<u32> = const { Cell::new(0) };
    }

    extern "C" fn ping_pong() -> ! {
        loop {
            VISITS.with(|visits| visits.set(visits.get() + 1));

            let (from, to) = (OTHER.with(Cell::as_ptr), MAIN.with(Cell::as_ptr));
            unsafe { jump(from, to) };
        }
    }

    #[test]
    fn jumps_into_fresh_stack_and_back() {
        let stack = Stack::new(NonZeroUsize::MIN, NonZeroUsize::new(4).unwrap()).unwrap();
        OTHER.with(|other| other.set(unsafe { prepare_stack(stack.base(), ping_pong) }));

        let (from, to) = (MAIN.with(Cell::as_ptr), OTHER.with(Cell::as_ptr));
        unsafe { jump(from, to) };
        assert_eq!(VISITS.with(Cell::get), 1);

        unsafe { jump(from, to) };
        unsafe { jump(from, to) };
        assert_eq!(VISITS.with(Cell::get), 3);
    }

    #[test]
    fn preserves_floating_point_state() {
        let stack = Stack::new(NonZeroUsize::MIN, NonZeroUsize::new(4).unwrap()).unwrap();
        OTHER.with(|other| other.set(unsafe { prepare_stack(stack.base(), ping_pong) }));

        let x = std::hint::black_box(1.5f64);
        let (from, to) = (MAIN.with(Cell::as_ptr), OTHER.with(Cell::as_ptr));
        unsafe { jump(from, to) };

        assert_eq!(x * 2.0, 3.0);
    }
}
