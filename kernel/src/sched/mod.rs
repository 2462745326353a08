//! Cooperative kernel thread scheduler
//!
//! A fixed table of threads, one FIFO run queue, and explicit yields; no
//! timer preemption and no SMP. Each thread owns a static 16 KiB stack. A
//! thread runs until it yields or returns from its entry function; the
//! run queue dispenses ready threads in strict round-robin order.
//!
//! `start()` parks the bootstrap context and dispatches the first thread;
//! it returns to its caller only when every thread has finished.

mod context;

use spin::Mutex;

use crate::error::KernelError;
use context::{context_switch, SAVED_REGISTERS};

/// Thread table capacity.
pub const MAX_THREADS: usize = 8;
/// Per-thread stack bytes.
pub const STACK_SIZE: usize = 16 * 1024;

/// Lifecycle of a thread table slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    /// On the run queue, waiting for dispatch
    Ready,
    /// Currently executing
    Running,
    /// Entry function returned; slot is reusable
    Done,
}

/// Thread entry function.
pub type ThreadEntry = fn(usize);

/// Diagnostic snapshot of one thread (for `ps`).
#[derive(Debug, Clone, Copy)]
pub struct ThreadInfo {
    pub id: usize,
    pub state: ThreadState,
    pub stack_pointer: u64,
}

#[derive(Clone, Copy)]
struct Tcb {
    used: bool,
    state: ThreadState,
    rsp: u64,
    entry: Option<ThreadEntry>,
    arg: usize,
    next: Option<usize>,
}

const UNUSED_TCB: Tcb = Tcb {
    used: false,
    state: ThreadState::Done,
    rsp: 0,
    entry: None,
    arg: 0,
    next: None,
};

struct Scheduler {
    threads: [Tcb; MAX_THREADS],
    queue_head: Option<usize>,
    queue_tail: Option<usize>,
    current: Option<usize>,
    /// Suspended context of whoever called `start()`
    boot_rsp: u64,
}

impl Scheduler {
    const fn new() -> Self {
        Self {
            threads: [UNUSED_TCB; MAX_THREADS],
            queue_head: None,
            queue_tail: None,
            current: None,
            boot_rsp: 0,
        }
    }

    fn enqueue(&mut self, slot: usize) {
        self.threads[slot].next = None;
        match self.queue_tail {
            Some(tail) => self.threads[tail].next = Some(slot),
            None => self.queue_head = Some(slot),
        }
        self.queue_tail = Some(slot);
    }

    fn dequeue(&mut self) -> Option<usize> {
        let head = self.queue_head?;
        self.queue_head = self.threads[head].next;
        if self.queue_head.is_none() {
            self.queue_tail = None;
        }
        self.threads[head].next = None;
        Some(head)
    }

    /// A slot that holds no live thread. Finished slots are recycled.
    fn free_slot(&self) -> Option<usize> {
        (0..MAX_THREADS).find(|&i| {
            let tcb = &self.threads[i];
            !tcb.used || (tcb.state == ThreadState::Done && self.current != Some(i))
        })
    }
}

static SCHEDULER: Mutex<Scheduler> = Mutex::new(Scheduler::new());

#[repr(C, align(16))]
struct Stack([u8; STACK_SIZE]);

const ZERO_STACK: Stack = Stack([0; STACK_SIZE]);
static mut STACKS: [Stack; MAX_THREADS] = [ZERO_STACK; MAX_THREADS];

/// First frame of every thread. Runs the entry function, marks the thread
/// finished, and dispatches the next ready thread; with an empty queue it
/// resumes the bootstrap context parked in `start()`.
extern "C" fn thread_trampoline() -> ! {
    let (entry, arg) = {
        let sched = SCHEDULER.lock();
        let cur = sched.current.expect("trampoline without a current thread");
        let tcb = &sched.threads[cur];
        (tcb.entry.expect("thread slot without an entry"), tcb.arg)
    };

    entry(arg);

    let old_ptr: *mut u64;
    let new_rsp: u64;
    {
        let mut sched = SCHEDULER.lock();
        let cur = sched.current.expect("trampoline without a current thread");
        sched.threads[cur].state = ThreadState::Done;
        // the dying thread's slot is a scratch store for its final rsp
        old_ptr = &mut sched.threads[cur].rsp as *mut u64;
        match sched.dequeue() {
            Some(next) => {
                sched.threads[next].state = ThreadState::Running;
                sched.current = Some(next);
                new_rsp = sched.threads[next].rsp;
            }
            None => {
                sched.current = None;
                new_rsp = sched.boot_rsp;
            }
        }
    }
    // SAFETY: new_rsp is a context saved by this module; the lock is
    // dropped, and on this single hardware thread nobody observes the
    // stale slot before the switch completes.
    unsafe { context_switch(old_ptr, new_rsp) };
    unreachable!("finished thread was resumed");
}

/// Create a thread that will run `entry(arg)` and append it to the run
/// queue. Returns the thread id.
pub fn spawn(entry: ThreadEntry, arg: usize) -> Result<usize, KernelError> {
    let mut sched = SCHEDULER.lock();
    let slot = sched.free_slot().ok_or(KernelError::ResourceExhausted)?;

    // Initial frame, downward from the aligned stack top:
    //   [top-16]           return address = trampoline
    //   [top-16-8*6 .. )   zeroed callee-saved registers
    // so the switch's pops plus `ret` enter the trampoline with the stack
    // pointer at top-8, matching the ABI state right after a call.
    // SAFETY: the slot is free, so its stack has no other user.
    let rsp = unsafe {
        let base = core::ptr::addr_of_mut!(STACKS[slot]) as *mut u8;
        let top = (base as u64 + STACK_SIZE as u64) & !0xF;
        let ret_slot = (top - 16) as *mut u64;
        ret_slot.write(thread_trampoline as usize as u64);
        for i in 1..=SAVED_REGISTERS {
            ret_slot.sub(i).write(0);
        }
        top - 16 - (SAVED_REGISTERS as u64) * 8
    };

    sched.threads[slot] = Tcb {
        used: true,
        state: ThreadState::Ready,
        rsp,
        entry: Some(entry),
        arg,
        next: None,
    };
    sched.enqueue(slot);
    Ok(slot)
}

/// Dispatch the first ready thread. Returns immediately if the queue is
/// empty or a thread is already running; otherwise returns only after the
/// last thread has finished.
pub fn start() {
    let old_ptr: *mut u64;
    let new_rsp: u64;
    {
        let mut sched = SCHEDULER.lock();
        if sched.current.is_some() {
            return;
        }
        let Some(next) = sched.dequeue() else {
            log::warn!(target: "sched", "start with an empty run queue");
            return;
        };
        sched.threads[next].state = ThreadState::Running;
        sched.current = Some(next);
        old_ptr = &mut sched.boot_rsp as *mut u64;
        new_rsp = sched.threads[next].rsp;
    }
    // SAFETY: new_rsp was crafted by spawn(); the bootstrap context lands
    // in boot_rsp and is resumed exactly once, when the queue drains.
    unsafe { context_switch(old_ptr, new_rsp) };
}

/// Hand the processor to the next ready thread, FIFO order. Returns
/// immediately when nothing else is ready. Calling outside a scheduled
/// thread is a no-op.
pub fn yield_now() {
    let old_ptr: *mut u64;
    let new_rsp: u64;
    {
        let mut sched = SCHEDULER.lock();
        let Some(cur) = sched.current else { return };
        let Some(next) = sched.dequeue() else { return };
        if sched.threads[cur].state == ThreadState::Running {
            sched.threads[cur].state = ThreadState::Ready;
            sched.enqueue(cur);
        }
        sched.threads[next].state = ThreadState::Running;
        sched.current = Some(next);
        old_ptr = &mut sched.threads[cur].rsp as *mut u64;
        new_rsp = sched.threads[next].rsp;
    }
    // SAFETY: both contexts were produced by this module; the lock is
    // released before the switch so the resumed thread can take it again.
    unsafe { context_switch(old_ptr, new_rsp) };
}

/// Snapshot live threads into `out`; returns the number written.
pub fn threads(out: &mut [ThreadInfo]) -> usize {
    let sched = SCHEDULER.lock();
    let mut written = 0;
    for (id, tcb) in sched.threads.iter().enumerate() {
        if !tcb.used || written >= out.len() {
            continue;
        }
        out[written] = ThreadInfo {
            id,
            state: tcb.state,
            stack_pointer: tcb.rsp,
        };
        written += 1;
    }
    written
}

/// Id of the running thread, if any.
pub fn current_id() -> Option<usize> {
    SCHEDULER.lock().current
}

/// Serializes tests that drive the global scheduler.
#[cfg(all(test, not(target_os = "none")))]
pub(crate) fn test_guard() -> std::sync::MutexGuard<'static, ()> {
    static GUARD: std::sync::Mutex<()> = std::sync::Mutex::new(());
    GUARD.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
