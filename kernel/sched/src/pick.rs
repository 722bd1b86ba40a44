//! Next-process selection.
//!
//! The selection loop of `yield` as a pure step over the run queue, so
//! every case (reap an exited process, take a waiting one, wake a parked
//! one, idle) is testable without a context switch. The kernel calls
//! [`pick_next`] with interrupts disabled; on [`Pick::Idle`] it halts with
//! interrupts briefly enabled and calls again.

use crate::{ProcessId, RunQueue, State};

/// Snapshot of one process's wakeup-relevant state.
#[derive(Debug, Clone, Copy)]
pub struct PickInfo {
    /// Lifecycle state.
    pub state: State,
    /// The process is joining a target that has exited.
    pub join_target_exited: bool,
    /// An event the process waits on fired.
    pub event_signalled: bool,
}

/// Outcome of one selection pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pick {
    /// The outgoing process is still the best choice; no switch.
    Keep,
    /// Switch to this process.
    Switch(ProcessId),
    /// Nothing is runnable; halt until an interrupt and retry.
    Idle,
    /// The last process exited; the system is done.
    AllExited,
}

/// Returns `true` if a process in `info`'s state should run now.
fn runnable(info: PickInfo) -> bool {
    match info.state {
        State::Waiting => true,
        State::SuspendedEvents => info.join_target_exited || info.event_signalled,
        State::Running | State::Suspended | State::Exited => false,
    }
}

/// Advances the queue cursor until it lands on a runnable process,
/// dequeuing exited processes along the way.
///
/// `origin` is the process that yielded. `info` reports per-process state;
/// `reap` is called for every exited process after it leaves the queue and
/// must release it.
pub fn pick_next(
    queue: &mut RunQueue,
    origin: ProcessId,
    mut info: impl FnMut(ProcessId) -> PickInfo,
    mut reap: impl FnMut(ProcessId),
) -> Pick {
    let Some(mut candidate) = queue.advance() else {
        return Pick::AllExited;
    };

    // A full lap without reaping anything means nothing is runnable.
    let mut lap = 0;

    loop {
        let snapshot = info(candidate);

        if snapshot.state == State::Exited {
            if queue.is_single() {
                return Pick::AllExited;
            }
            queue.dequeue(candidate);
            reap(candidate);
            lap = 0;
            match queue.current() {
                Some(next) => {
                    candidate = next;
                    continue;
                }
                None => return Pick::AllExited,
            }
        }

        if runnable(snapshot) {
            return if candidate == origin {
                Pick::Keep
            } else {
                Pick::Switch(candidate)
            };
        }

        if candidate == origin || lap >= queue.len() {
            return Pick::Idle;
        }

        lap += 1;
        match queue.advance() {
            Some(next) => candidate = next,
            None => return Pick::AllExited,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue_of(ids: &[ProcessId]) -> RunQueue {
        let mut queue = RunQueue::new();
        for &id in ids {
            assert!(queue.enqueue(id));
        }
        queue
    }

    fn plain(state: State) -> PickInfo {
        PickInfo {
            state,
            join_target_exited: false,
            event_signalled: false,
        }
    }

    #[test]
    fn single_waiting_process_keeps_running() {
        let mut queue = queue_of(&[0]);
        let got = pick_next(&mut queue, 0, |_| plain(State::Waiting), |_| {});
        assert_eq!(got, Pick::Keep);
    }

    #[test]
    fn round_robin_between_two_waiting() {
        let mut queue = queue_of(&[0, 1]);
        let got = pick_next(&mut queue, 0, |_| plain(State::Waiting), |_| {});
        assert_eq!(got, Pick::Switch(1));
    }

    #[test]
    fn exited_process_is_reaped_once() {
        let mut queue = queue_of(&[0, 1]);
        let mut reaped = Vec::new();
        let got = pick_next(
            &mut queue,
            0,
            |id| plain(if id == 1 { State::Exited } else { State::Waiting }),
            |id| reaped.push(id),
        );
        assert_eq!(got, Pick::Keep);
        assert_eq!(reaped, vec![1]);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn last_process_exiting_halts_the_system() {
        let mut queue = queue_of(&[0]);
        let got = pick_next(&mut queue, 0, |_| plain(State::Exited), |_| {});
        assert_eq!(got, Pick::AllExited);
    }

    #[test]
    fn join_target_exit_wakes_joiner() {
        let mut queue = queue_of(&[0, 1]);
        let got = pick_next(
            &mut queue,
            0,
            |id| {
                if id == 1 {
                    PickInfo {
                        state: State::SuspendedEvents,
                        join_target_exited: true,
                        event_signalled: false,
                    }
                } else {
                    plain(State::Waiting)
                }
            },
            |_| {},
        );
        assert_eq!(got, Pick::Switch(1));
    }

    #[test]
    fn signalled_event_wakes_waiter() {
        let mut queue = queue_of(&[0, 1]);
        let got = pick_next(
            &mut queue,
            0,
            |id| {
                if id == 1 {
                    PickInfo {
                        state: State::SuspendedEvents,
                        join_target_exited: false,
                        event_signalled: true,
                    }
                } else {
                    plain(State::Waiting)
                }
            },
            |_| {},
        );
        assert_eq!(got, Pick::Switch(1));
    }

    #[test]
    fn unsignalled_waiters_idle() {
        let mut queue = queue_of(&[0, 1, 2]);
        // Origin is running, the others are parked with nothing pending.
        let got = pick_next(
            &mut queue,
            0,
            |id| plain(if id == 0 { State::Running } else { State::SuspendedEvents }),
            |_| {},
        );
        assert_eq!(got, Pick::Idle);
    }

    #[test]
    fn suspended_is_not_runnable() {
        let mut queue = queue_of(&[0, 1]);
        let got = pick_next(
            &mut queue,
            0,
            |id| plain(if id == 0 { State::Running } else { State::Suspended }),
            |_| {},
        );
        assert_eq!(got, Pick::Idle);
    }

    #[test]
    fn exited_origin_switches_away_and_reaps() {
        let mut queue = queue_of(&[0, 1]);
        let mut reaped = Vec::new();
        // Origin 0 has exited; 1 is waiting. The pass that comes back
        // around to 0 dequeues and reaps it.
        let got = pick_next(
            &mut queue,
            0,
            |id| plain(if id == 0 { State::Exited } else { State::Waiting }),
            |id| reaped.push(id),
        );
        assert_eq!(got, Pick::Switch(1));
        assert_eq!(reaped, Vec::<ProcessId>::new());

        // Next pass from 1 reaps the exited 0.
        let got = pick_next(
            &mut queue,
            1,
            |id| plain(if id == 0 { State::Exited } else { State::Waiting }),
            |id| reaped.push(id),
        );
        assert_eq!(got, Pick::Keep);
        assert_eq!(reaped, vec![0]);
        assert_eq!(queue.len(), 1);
    }
}
