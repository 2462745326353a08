//! Stack-switch primitive
//!
//! Saves the callee-saved register set and the stack pointer of the
//! outgoing context, installs the incoming stack pointer, restores its
//! registers and returns into it. A freshly created thread's stack is laid
//! out so that this return lands in the scheduler trampoline.

/// Number of callee-saved registers the switch pushes (rbp, rbx, r12-r15).
pub const SAVED_REGISTERS: usize = 6;

#[cfg(target_arch = "x86_64")]
core::arch::global_asm!(
    ".global __onyx_context_switch",
    "__onyx_context_switch:",
    "push rbp",
    "push rbx",
    "push r12",
    "push r13",
    "push r14",
    "push r15",
    "mov [rdi], rsp",
    "mov rsp, rsi",
    "pop r15",
    "pop r14",
    "pop r13",
    "pop r12",
    "pop rbx",
    "pop rbp",
    "ret",
);

#[cfg(target_arch = "x86_64")]
extern "C" {
    fn __onyx_context_switch(old_rsp: *mut u64, new_rsp: u64);
}

/// Switch stacks: `*old_rsp` receives the suspended context, `new_rsp` is
/// resumed.
///
/// # Safety
///
/// `old_rsp` must be a valid slot to store the outgoing stack pointer and
/// `new_rsp` must hold a stack pointer previously produced by this
/// function or by the scheduler's initial-frame layout. The call returns
/// only when some other context switches back here.
#[cfg(target_arch = "x86_64")]
pub unsafe fn context_switch(old_rsp: *mut u64, new_rsp: u64) {
    // SAFETY: forwarded contract; the assembly only moves the stack
    // pointer and callee-saved registers.
    unsafe { __onyx_context_switch(old_rsp, new_rsp) }
}
