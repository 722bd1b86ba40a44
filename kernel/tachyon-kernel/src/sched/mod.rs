//! The cooperative scheduler.
//!
//! Single CPU, no preemption of kernel code: the running process keeps
//! the CPU until it yields, exits, joins, suspends or blocks. Interrupt
//! handlers only flip wakeup flags; the next [`yield_now`] observes them
//! through the pick logic in `tachyon-sched`.
//!
//! Exited processes are torn down by the reaper built into the yield
//! path: `pick_next` dequeues them, their table Arc moves to the zombie
//! list, and the next yield from a live process (standing on its own
//! stack, never the zombie's) drops them.

use alloc::sync::Arc;
use alloc::vec::Vec;

use tachyon_core::cell::RacyCell;
use tachyon_core::sync::IrqLock;
use tachyon_sched::{Pick, PickInfo, ProcessId, RunQueue, State, pick_next};

use crate::arch::x86_64::{context, gdt, instructions, msr};
use crate::proc::{self, Process};

/// Per-CPU status block, addressed through GS.base.
///
/// The syscall entry stub reads `kernel_rsp` at GS:0 and parks the user
/// stack pointer at GS:8; field order is load-bearing.
#[repr(C)]
pub struct CpuStatus {
    /// Kernel stack top of the running process (GS:0).
    pub kernel_rsp: u64,
    /// Scratch slot for the user RSP during syscall entry (GS:8).
    pub user_rsp_scratch: u64,
    /// Pointer to the running process (GS:16).
    pub current_process: u64,
}

static CPU_STATUS: RacyCell<CpuStatus> = RacyCell::new(CpuStatus {
    kernel_rsp: 0,
    user_rsp_scratch: 0,
    current_process: 0,
});

static QUEUE: IrqLock<RunQueue> = IrqLock::new(RunQueue::new());

/// Exited processes removed from the table, awaiting teardown from a
/// stack that is not their own.
static ZOMBIES: IrqLock<Vec<Arc<Process>>> = IrqLock::new(Vec::new());

/// Puts a process on the run queue.
pub fn enqueue(id: ProcessId) -> bool {
    QUEUE.lock().enqueue(id)
}

/// Takes a process off the run queue.
pub fn dequeue(id: ProcessId) -> bool {
    QUEUE.lock().dequeue(id)
}

/// The currently running process.
///
/// # Panics
///
/// Panics before [`run`] has started the first process.
pub fn current_process() -> Arc<Process> {
    let id = QUEUE.lock().current().expect("scheduler not running");
    proc::process(id).expect("current process missing from table")
}

/// Id of the currently running process.
pub fn current_id() -> Option<ProcessId> {
    QUEUE.lock().current()
}

fn snapshot(id: ProcessId) -> PickInfo {
    let Some(process) = proc::process(id) else {
        // Raced with a reap; treat as gone.
        return PickInfo {
            state: State::Exited,
            join_target_exited: false,
            event_signalled: false,
        };
    };
    let join_target_exited = process.joining_with().is_some_and(|target| {
        // A reaped target no longer appears in the table; the joiner
        // holds its own Arc and can still read the status.
        proc::process(target).is_none_or(|t| t.state() == State::Exited)
    });
    PickInfo {
        state: process.state(),
        join_target_exited,
        event_signalled: process.event_signalled(),
    }
}

fn reap_zombies() {
    loop {
        let Some(zombie) = ZOMBIES.lock().pop() else {
            return;
        };
        drop(zombie);
    }
}

/// Marks a process runnable, updates the CPU status block and TSS, loads
/// its address space and performs the context switch.
///
/// Consumes the Arc and drops it before the switch: an Arc left on the
/// outgoing stack would be frozen there (exited stacks never unwind) and
/// keep the incoming process alive forever.
fn switch_to_process(old_rsp_slot: *mut u64, next: Arc<Process>) {
    next.set_state(State::Running);

    let stack_top = next.kernel_stack_top();
    let space = next.space();
    let new_rsp = next.kernel_rsp.load(core::sync::atomic::Ordering::Acquire);

    let status = CPU_STATUS.get();
    // SAFETY: Interrupts are disabled; the status block is only touched
    // here and by the syscall entry stub.
    unsafe {
        (*status).kernel_rsp = stack_top;
        (*status).current_process = Arc::as_ptr(&next) as u64;
    }
    gdt::set_tss_rsp0(stack_top);

    // The process stays alive through the table and run queue.
    drop(next);

    // SAFETY: The space shares the kernel half, so the switch keeps this
    // code mapped.
    unsafe { crate::mm::switch_to(space) };
    // SAFETY: new_rsp holds a context laid out by switch_to or by the
    // initial stack builder; old_rsp_slot is the outgoing slot.
    unsafe { context::switch_to(old_rsp_slot, new_rsp) };
}

/// Hands the CPU to the next runnable process.
///
/// Returns when this process is scheduled again. Exited processes
/// encountered along the way are reaped; with nothing runnable the CPU
/// halts with interrupts briefly enabled and retries.
///
/// # Panics
///
/// Panics when the last process exits.
pub fn yield_now() {
    reap_zombies();

    let origin_arc = current_process();
    let origin = origin_arc.id;
    // The outgoing RSP slot, valid through the switch: an exiting
    // process stays alive on the zombie list until a later yield, which
    // runs on another stack, drops it.
    let old_rsp_slot = origin_arc.kernel_rsp.as_ptr();
    if origin_arc.state() == State::Running {
        origin_arc.set_state(State::Waiting);
    }

    instructions::disable_interrupts();

    let picked = loop {
        let pick = {
            let mut queue = QUEUE.lock();
            pick_next(&mut queue, origin, snapshot, |dead| {
                tachyon_core::kdebug!("sched: reaping process {dead}");
                if let Some(zombie) = proc::remove(dead) {
                    ZOMBIES.lock().push(zombie);
                }
            })
        };

        match pick {
            Pick::Keep => {
                origin_arc.set_state(State::Running);
                instructions::enable_interrupts();
                return;
            }
            Pick::Switch(id) => break id,
            Pick::Idle => instructions::halt_with_interrupts(),
            Pick::AllExited => {
                panic!("all processes exited");
            }
        }
    };

    // Nothing of the origin may stay borrowed across the switch: a local
    // Arc would be frozen on an exited process's dead stack and leak it.
    drop(origin_arc);

    let next = proc::process(picked).expect("picked process missing from table");
    switch_to_process(old_rsp_slot, next);

    // Back on this process's stack: it is running again.
    instructions::enable_interrupts();
}

/// Terminates the current process. Never returns; the reaper running in
/// other processes' yields releases the resources.
pub fn exit(status: u64) -> ! {
    {
        let current = current_process();
        current.set_state(State::Exited);
        current.set_status(status);
    }
    loop {
        yield_now();
    }
}

/// Parks the current process until `target` exits, then returns the
/// target's exit status. Returns `None` for an unknown target or a
/// self-join.
pub fn join(target: ProcessId) -> Option<u64> {
    let target_arc = proc::process(target)?;
    let current = current_process();
    if Arc::ptr_eq(&target_arc, &current) {
        return None;
    }

    current.set_state(State::SuspendedEvents);
    current.set_joining_with(target);
    yield_now();
    current.set_joining_with(proc::NO_PROCESS);

    Some(target_arc.status())
}

/// Parks the current process until [`resume`] unparks it.
pub fn suspend() {
    current_process().set_state(State::Suspended);
    yield_now();
}

/// Unparks a suspended process. A no-op for any other state.
pub fn resume(id: ProcessId) {
    if let Some(process) = proc::process(id) {
        if process.state() == State::Suspended {
            process.set_state(State::Waiting);
        }
    }
}

/// Starts scheduling: installs the per-CPU status block in GS.base and
/// switches into the first queued process. Never returns.
///
/// # Panics
///
/// Panics when the queue is empty.
pub fn run() -> ! {
    instructions::disable_interrupts();

    // SAFETY: The status block lives in a static; KERNEL_GS_BASE starts
    // as the user-facing zero that swapgs swaps against.
    unsafe {
        msr::write(msr::IA32_GS_BASE, CPU_STATUS.get() as u64);
        msr::write(msr::IA32_KERNEL_GS_BASE, 0);
    }

    let first = {
        let mut queue = QUEUE.lock();
        queue.rewind();
        queue.current().expect("nothing to schedule")
    };
    let next = proc::process(first).expect("first process missing from table");

    tachyon_core::kinfo!("sched: starting with process {first}");
    let mut discard = 0u64;
    switch_to_process(&mut discard, next);
    unreachable!("initial context cannot be resumed");
}
