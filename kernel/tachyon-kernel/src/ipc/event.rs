//! Counting event files and the poll-style wait primitive.
//!
//! An event is an anonymous file whose 8-byte writes add to a counter and
//! whose 8-byte reads return and clear it, blocking while it is zero.
//! [`wait_on_events`] parks the calling process on up to 64 event files
//! and returns a bitmask of the ones with a pending count.
//!
//! The no-lost-wakeup protocol is the recheck-after-disable pattern: the
//! waiter scans the counters with interrupts masked before parking, so a
//! writer either published its count before the scan (the waiter never
//! parks) or finds the registered waiter and flags it (the scheduler
//! wakes it on the next pass).

use alloc::sync::Arc;
use alloc::vec::Vec;

use tachyon_core::sync::IrqLock;
use tachyon_fs::file::{File, FileHandle, FileOps, Mode};
use tachyon_sched::{ProcessId, State};

use crate::{proc, sched};

/// Most files one wait can cover; the signalled mask is a u64.
pub const MAX_WAIT_FILES: usize = 64;

struct EventInner {
    /// Pending count: writes add, reads clear.
    count: u64,
    /// Process parked on this event, if any.
    waiter: Option<ProcessId>,
}

/// A counting event behind an anonymous file.
pub struct Event {
    inner: IrqLock<EventInner>,
    close_hook: Option<fn(u64)>,
    close_data: u64,
}

impl Event {
    fn pending(&self) -> u64 {
        self.inner.lock().count
    }

    /// Clears the pending count (when `reset`) and drops any registered
    /// waiter. Returns whether a count was pending.
    fn collect(&self, reset: bool) -> bool {
        let mut inner = self.inner.lock();
        let pending = inner.count > 0;
        if reset {
            inner.count = 0;
        }
        inner.waiter = None;
        pending
    }

    fn register_waiter(&self, id: ProcessId) {
        self.inner.lock().waiter = Some(id);
    }

    /// Adds to the count and flags the parked waiter, if any.
    pub fn signal(&self, amount: u64) {
        let mut inner = self.inner.lock();
        inner.count += amount;
        if let Some(waiter) = inner.waiter {
            if let Some(process) = proc::process(waiter) {
                process.set_event_signalled(true);
            }
        }
    }
}

impl FileOps for Event {
    fn read(&self, _file: &File, buf: &mut [u8]) -> u64 {
        if buf.len() != 8 {
            return 0;
        }

        loop {
            {
                let mut inner = self.inner.lock();
                if inner.count > 0 {
                    buf.copy_from_slice(&inner.count.to_ne_bytes());
                    inner.count = 0;
                    inner.waiter = None;
                    return 8;
                }
                // Park: register under the same interrupt-masked section
                // that observed count == 0.
                let current = sched::current_process();
                inner.waiter = Some(current.id);
                current.set_event_signalled(false);
                current.set_state(State::SuspendedEvents);
            }
            sched::yield_now();
        }
    }

    fn write(&self, _file: &File, buf: &[u8]) -> u64 {
        if buf.len() != 8 {
            return 0;
        }
        let mut amount = [0u8; 8];
        amount.copy_from_slice(buf);
        self.signal(u64::from_ne_bytes(amount));
        8
    }

    fn on_close(&self, _file: &File) {
        if let Some(hook) = self.close_hook {
            hook(self.close_data);
        }
    }
}

/// Creates an event file. `close_hook` (with `close_data`) fires when
/// the last handle drops; device drivers use it to deregister.
pub fn create_event(close_hook: Option<fn(u64)>, close_data: u64) -> FileHandle {
    FileHandle::new(
        Arc::new(Event {
            inner: IrqLock::new(EventInner {
                count: 0,
                waiter: None,
            }),
            close_hook,
            close_data,
        }),
        None,
        Mode::ReadWrite,
    )
}

/// The [`Event`] behind a file, when the file is one.
#[must_use]
pub fn as_event(handle: &FileHandle) -> Option<&Event> {
    handle.ops().as_any().downcast_ref::<Event>()
}

/// Builds the signalled mask over `files`, clearing counts when `reset`
/// and dropping every waiter registration.
fn signalled_mask(files: &[&FileHandle], reset: bool) -> u64 {
    let mut mask = 0u64;
    for (index, handle) in files.iter().enumerate() {
        let Some(event) = as_event(handle) else {
            continue;
        };
        if event.collect(reset) {
            mask |= 1 << index;
        }
    }
    mask
}

/// Waits until at least one of `files` has a pending event count.
///
/// Non-event files are ignored. Returns the mask with bit `i` set iff
/// `files[i]` had a pending count; counts are cleared iff `reset`. At
/// most [`MAX_WAIT_FILES`] files; more returns 0 immediately.
pub fn wait_on_events(files: &[&FileHandle], reset: bool) -> u64 {
    if files.len() > MAX_WAIT_FILES {
        return 0;
    }

    // One interrupt-masked scan; registration happens in the same
    // section, so a signal either lands before the scan (no park) or
    // finds a registered waiter to flag.
    crate::arch::x86_64::instructions::disable_interrupts();
    let park = if files
        .iter()
        .any(|handle| as_event(handle).is_some_and(|event| event.pending() > 0))
    {
        false
    } else {
        let current = sched::current_process();
        for handle in files {
            if let Some(event) = as_event(handle) {
                event.register_waiter(current.id);
            }
        }
        current.set_wait_files(files.iter().map(|&handle| handle.clone()).collect::<Vec<_>>());
        current.set_event_signalled(false);
        current.set_state(State::SuspendedEvents);
        true
    };
    crate::arch::x86_64::instructions::enable_interrupts();

    if park {
        sched::yield_now();
        sched::current_process().set_wait_files(Vec::new());
    }

    signalled_mask(files, reset)
}
