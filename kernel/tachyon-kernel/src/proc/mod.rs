//! Processes.
//!
//! A [`Process`] owns its address space, its 4 KiB kernel stack, a file
//! descriptor table and its scheduler bookkeeping. The table maps ids to
//! `Arc<Process>`; the reference count is the ownership story: the
//! reaper drops the table's Arc once a process has exited and left the
//! run queue, and `Drop` tears the address space down.
//!
//! Creation pre-builds the kernel stack so the first context switch into
//! the process unwinds cleanly: kernel-land stacks end in `rip`/`rflags`
//! for a plain `ret`, user-land stacks end in a full iret frame plus the
//! swapgs+iretq entry stub.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::alloc::Layout;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, AtomicU64, Ordering};

use tachyon_core::sync::{IrqLock, SpinLock};
use tachyon_fs::file::{FdTable, FileHandle};
use tachyon_mm::layout::LOWER_HALF_END;
use tachyon_mm::space::{MapFlags, Space};
use tachyon_sched::{Land, MAX_PROCESSES, ProcessId, SlotTable, StackFrame, State};

use crate::arch::x86_64::context::user_entry_stub;
use crate::arch::x86_64::gdt::{USER_CODE_SELECTOR, USER_DATA_SELECTOR};
use crate::mm;

/// Kernel stack size per process.
pub const KERNEL_STACK_SIZE: usize = 4 * 1024;

/// User stack size, mapped at the top of the lower half.
pub const USER_STACK_SIZE: u64 = 64 * 1024;

/// Sentinel for "not joining anything".
pub const NO_PROCESS: ProcessId = ProcessId::MAX;

/// Initial RFLAGS for a fresh process: IF set plus the fixed reserved bit.
const INITIAL_RFLAGS: u64 = 0x202;

/// Process creation errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcError {
    /// All process slots are taken.
    TooManyProcesses,
    /// A stack or frame allocation failed.
    OutOfMemory,
}

/// A heap-allocated, 16-byte-aligned kernel stack.
struct KernelStack(NonNull<u8>);

// SAFETY: The stack memory is exclusively owned and only touched by the
// process it belongs to (or by the scheduler with interrupts disabled).
unsafe impl Send for KernelStack {}
unsafe impl Sync for KernelStack {}

impl KernelStack {
    const LAYOUT: Layout = match Layout::from_size_align(KERNEL_STACK_SIZE, 16) {
        Ok(layout) => layout,
        Err(_) => panic!("bad kernel stack layout"),
    };

    fn new() -> Option<Self> {
        // SAFETY: The layout is non-zero.
        let ptr = unsafe { alloc::alloc::alloc_zeroed(Self::LAYOUT) };
        NonNull::new(ptr).map(Self)
    }

    fn top(&self) -> u64 {
        self.0.as_ptr() as u64 + KERNEL_STACK_SIZE as u64
    }
}

impl Drop for KernelStack {
    fn drop(&mut self) {
        // SAFETY: Allocated with the same layout in `new`.
        unsafe { alloc::alloc::dealloc(self.0.as_ptr(), Self::LAYOUT) };
    }
}

/// One process.
pub struct Process {
    /// Stable id, the slot index in the process table.
    pub id: ProcessId,
    /// Privilege the process executes with.
    pub land: Land,
    state: AtomicU8,
    status: AtomicU64,
    space: Space,
    kernel_stack: KernelStack,
    /// Saved kernel stack pointer while the process is switched out.
    pub(crate) kernel_rsp: AtomicU64,
    /// Physical base of the user stack (0 for kernel land).
    pub user_stack_phys: u64,
    joining_with: AtomicU32,
    event_signalled: AtomicBool,
    /// Files the process is parked on; keeps them alive while it sleeps.
    wait_files: IrqLock<Vec<FileHandle>>,
    cwd: SpinLock<String>,
    /// Open file descriptors.
    pub fd_table: SpinLock<FdTable>,
}

fn decode_state(raw: u8) -> State {
    match raw {
        0 => State::Waiting,
        1 => State::Running,
        2 => State::Suspended,
        3 => State::SuspendedEvents,
        _ => State::Exited,
    }
}

impl Process {
    /// Current lifecycle state.
    pub fn state(&self) -> State {
        decode_state(self.state.load(Ordering::Acquire))
    }

    /// Transitions the lifecycle state.
    pub fn set_state(&self, state: State) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Exit status (0xFFFFFFFF until the process exits).
    pub fn status(&self) -> u64 {
        self.status.load(Ordering::Acquire)
    }

    /// Records the exit status.
    pub fn set_status(&self, status: u64) {
        self.status.store(status, Ordering::Release);
    }

    /// The process's address space handle.
    pub fn space(&self) -> Space {
        self.space
    }

    /// Top of the kernel stack, loaded into the CPU status block and
    /// TSS.RSP0 while the process runs.
    pub fn kernel_stack_top(&self) -> u64 {
        self.kernel_stack.top()
    }

    /// The process this one is joining, if any.
    pub fn joining_with(&self) -> Option<ProcessId> {
        let id = self.joining_with.load(Ordering::Acquire);
        (id != NO_PROCESS).then_some(id)
    }

    /// Marks (or clears, with [`NO_PROCESS`]) the join target.
    pub fn set_joining_with(&self, id: ProcessId) {
        self.joining_with.store(id, Ordering::Release);
    }

    /// Whether an awaited event fired since the process parked.
    pub fn event_signalled(&self) -> bool {
        self.event_signalled.load(Ordering::Acquire)
    }

    /// Sets or clears the event-signalled flag.
    pub fn set_event_signalled(&self, signalled: bool) {
        self.event_signalled.store(signalled, Ordering::Release);
    }

    /// Replaces the set of files the process is parked on.
    pub fn set_wait_files(&self, files: Vec<FileHandle>) {
        *self.wait_files.lock() = files;
    }

    /// Current working directory.
    pub fn cwd(&self) -> String {
        self.cwd.lock().clone()
    }

    /// Replaces the working directory. Empty paths are rejected.
    pub fn set_cwd(&self, path: &str) -> bool {
        if path.is_empty() {
            return false;
        }
        *self.cwd.lock() = String::from(path);
        true
    }
}

impl Drop for Process {
    fn drop(&mut self) {
        tachyon_core::kdebug!("proc: tearing down process {}", self.id);
        // The fd table and wait set drop first (fields drop in declaration
        // order after this body), closing every file; the address space
        // teardown below returns the user half's frames, including the
        // user stack.
        // SAFETY: The process is off the run queue and not current when
        // the last Arc drops.
        unsafe { mm::destroy_space(self.space) };
    }
}

static PROCESSES: IrqLock<SlotTable<Arc<Process>, MAX_PROCESSES>> =
    IrqLock::new(SlotTable::new());

/// Looks up a process by id.
pub fn process(id: ProcessId) -> Option<Arc<Process>> {
    PROCESSES.lock().get(id as usize).cloned()
}

/// Removes a process from the table, returning its Arc.
pub(crate) fn remove(id: ProcessId) -> Option<Arc<Process>> {
    PROCESSES.lock().remove(id as usize)
}

/// Number of live processes.
pub fn process_count() -> usize {
    PROCESSES.lock().len()
}

/// Builds the initial kernel stack image and returns the stack pointer
/// the first context switch should load.
///
/// Kernel land: `rip`, `rflags`, then the 15 GPRs, so the switch pops
/// the GPRs and flags and `ret`s straight into the entry point. User
/// land: the iret frame (user selectors), the swapgs+iretq stub as
/// synthetic return address, a kernel RFLAGS image with interrupts
/// masked, then the GPRs; the first entry into ring 3 goes through the
/// stub.
fn build_initial_stack(stack: &KernelStack, land: Land, frame: &StackFrame) -> u64 {
    /// # Safety: `sp` must have room below it inside the stack.
    unsafe fn push(sp: &mut *mut u64, value: u64) {
        // SAFETY: Caller contract.
        unsafe {
            *sp = sp.sub(1);
            sp.write(value);
        }
    }

    let mut sp = stack.top() as *mut u64;
    // SAFETY: All writes stay inside the freshly allocated stack; the
    // deepest layout (user land) uses 22 of the 512 available slots.
    unsafe {
        match land {
            Land::Kernel => {
                push(&mut sp, frame.rip);
                push(&mut sp, frame.rflags);
            }
            Land::User => {
                push(&mut sp, USER_DATA_SELECTOR);
                push(&mut sp, frame.user_rsp);
                push(&mut sp, frame.rflags);
                push(&mut sp, USER_CODE_SELECTOR);
                push(&mut sp, frame.rip);

                let stub: unsafe extern "C" fn() = user_entry_stub;
                push(&mut sp, stub as u64);
                push(&mut sp, 0x2); // kernel RFLAGS: interrupts stay masked
            }
        }

        for index in 0..StackFrame::GPR_COUNT {
            push(&mut sp, frame.gpr(index));
        }
    }
    sp as u64
}

/// Creates a process around an existing address space.
///
/// `alloc_user_stack` distinguishes fresh user processes (map a new
/// 64 KiB stack at the top of the lower half) from forks (the stack came
/// over with the copied space).
///
/// The id is returned; the process is not yet on the run queue.
///
/// # Errors
///
/// [`ProcError::TooManyProcesses`] or [`ProcError::OutOfMemory`]. The
/// space is untouched on failure; the caller owns its cleanup.
pub fn create_process(
    space: Space,
    land: Land,
    alloc_user_stack: bool,
    frame: &StackFrame,
    cwd: &str,
) -> Result<ProcessId, ProcError> {
    let kernel_stack = KernelStack::new().ok_or(ProcError::OutOfMemory)?;

    let user_stack_phys = if land == Land::User {
        let virt_page = (LOWER_HALF_END - USER_STACK_SIZE) / 4096;
        let stack_pages = USER_STACK_SIZE / 4096;
        if alloc_user_stack {
            let phys = mm::alloc_frames(stack_pages).ok_or(ProcError::OutOfMemory)?;
            if mm::map_pages(
                space,
                virt_page,
                phys.frame_index(),
                stack_pages,
                MapFlags::WRITE | MapFlags::USER,
            )
            .is_err()
            {
                mm::free_frames(phys, stack_pages);
                return Err(ProcError::OutOfMemory);
            }
            phys.as_u64()
        } else {
            mm::translate_in(space, tachyon_core::addr::VirtAddr::from_page(virt_page))
                .map_or(0, |phys| phys.as_u64())
        }
    } else {
        0
    };

    let kernel_rsp = build_initial_stack(&kernel_stack, land, frame);

    let mut table = PROCESSES.lock();
    let index = table
        .insert_with(|index| {
            Arc::new(Process {
                id: index as ProcessId,
                land,
                state: AtomicU8::new(State::Waiting as u8),
                status: AtomicU64::new(0xFFFF_FFFF),
                space,
                kernel_stack,
                kernel_rsp: AtomicU64::new(kernel_rsp),
                user_stack_phys,
                joining_with: AtomicU32::new(NO_PROCESS),
                event_signalled: AtomicBool::new(false),
                wait_files: IrqLock::new(Vec::new()),
                cwd: SpinLock::new(String::from(cwd)),
                fd_table: SpinLock::new(FdTable::new()),
            })
        })
        .ok_or(ProcError::TooManyProcesses)?;

    Ok(index as ProcessId)
}

fn dummy_frame(entry: u64) -> StackFrame {
    let mut frame = StackFrame::default();
    for index in 0..StackFrame::GPR_COUNT {
        frame.set_gpr(index, index as u64);
    }
    frame.rip = entry;
    frame.rflags = INITIAL_RFLAGS;
    frame.user_rsp = LOWER_HALF_END;
    frame
}

/// Spawns a kernel-land process running `entry` and enqueues it.
///
/// # Errors
///
/// Propagates creation failures; the fresh space is destroyed on error.
pub fn spawn_kernel(entry: fn()) -> Result<ProcessId, ProcError> {
    let space = mm::create_space().map_err(|_| ProcError::OutOfMemory)?;
    let frame = dummy_frame(entry as u64);

    match create_process(space, Land::Kernel, false, &frame, "/") {
        Ok(id) => {
            crate::sched::enqueue(id);
            Ok(id)
        }
        Err(err) => {
            // SAFETY: The space was never loaded into CR3.
            unsafe { mm::destroy_space(space) };
            Err(err)
        }
    }
}

/// Spawns a user-land process in `space` at `entry` and enqueues it.
///
/// This is the seam the binary loader plugs into: it builds the space,
/// maps the segments, and hands over here. The user stack is mapped by
/// this call.
///
/// # Errors
///
/// Propagates creation failures; the caller keeps ownership of `space`
/// on error.
pub fn spawn_user(space: Space, entry: u64, cwd: &str) -> Result<ProcessId, ProcError> {
    let frame = dummy_frame(entry);
    let id = create_process(space, Land::User, true, &frame, cwd)?;
    crate::sched::enqueue(id);
    Ok(id)
}

/// Forks the current process: copied address space (including the user
/// stack), duplicated file descriptors, and the child resuming from
/// `frame`. The caller sets the child's `rax` before calling.
///
/// # Errors
///
/// [`ProcError::OutOfMemory`] for non-user callers or allocation
/// failures.
pub fn fork(frame: &StackFrame) -> Result<ProcessId, ProcError> {
    let parent = crate::sched::current_process();
    if parent.land != Land::User {
        tachyon_core::kerr!("proc: only user-land processes fork");
        return Err(ProcError::OutOfMemory);
    }

    let space = mm::fork_space(parent.space()).map_err(|_| ProcError::OutOfMemory)?;

    let id = match create_process(space, Land::User, false, frame, &parent.cwd()) {
        Ok(id) => id,
        Err(err) => {
            // SAFETY: The copied space was never loaded into CR3.
            unsafe { mm::destroy_space(space) };
            return Err(err);
        }
    };

    // Duplicate the descriptor table; clones share cursors and fire the
    // duplicate hooks (pipe endpoint counting relies on this).
    if let Some(child) = process(id) {
        let parent_table = parent.fd_table.lock();
        let mut child_table = child.fd_table.lock();
        for (fd, handle) in parent_table.iter() {
            let _ = child_table.set(fd, handle.clone());
        }
    }

    crate::sched::enqueue(id);
    Ok(id)
}
