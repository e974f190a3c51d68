// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The scheduler adapter (`spec.md` C1): the only contract the interpreter
//! assumes of its host. `spec.md` treats the scheduler as an external
//! collaborator and only specifies the interface; this module also ships two
//! concrete implementations so the crate is usable on its own, mirroring how
//! `kasync` pairs its `Park`/`Clock` traits with a real (`StdPark`) and a
//! mock (`MockClock`) implementation.

use std::cell::{Cell, RefCell};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, VecDeque};
use std::fmt;
use std::rc::Rc;
use std::time::{Duration, Instant};

/// A unit of deferred work.
pub type Thunk = Box<dyn FnOnce()>;

/// Schedules thunks "as soon as possible" or after a delay.
///
/// All handlers execute on a single cooperative thread of control; this
/// trait never requires `Send`/`Sync` because `spec.md` §5 rules out
/// preemption across OS threads for the core.
pub trait Scheduler: 'static {
    /// Runs `task` on the scheduler's next tick.
    fn asap(&self, task: Thunk) -> CancelHandle;

    /// Runs `task` after at least `after` has elapsed.
    fn delay(&self, task: Thunk, after: Duration) -> CancelHandle;
}

/// An idempotent, nullary cancellation token returned by [`Scheduler::asap`]
/// and [`Scheduler::delay`].
///
/// Cancelling after the task has already executed (or already been
/// cancelled) is a no-op, per `spec.md` §4.1.
#[derive(Clone)]
pub struct CancelHandle {
    cancel: Rc<dyn Fn()>,
}

impl CancelHandle {
    pub(crate) fn new(cancel: impl Fn() + 'static) -> Self {
        Self {
            cancel: Rc::new(cancel),
        }
    }

    /// A handle whose cancellation has no effect, used when no scheduler
    /// handle is currently outstanding (e.g. `Never`).
    pub fn noop() -> Self {
        Self::new(|| {})
    }

    pub fn cancel(&self) {
        (self.cancel)();
    }
}

impl fmt::Debug for CancelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CancelHandle")
    }
}

struct ReadyEntry {
    cancelled: Rc<Cell<bool>>,
    task: RefCell<Option<Thunk>>,
}

struct DelayedEntry<T> {
    deadline: T,
    seq: u64,
    cancelled: Rc<Cell<bool>>,
    task: RefCell<Option<Thunk>>,
}

impl<T: Eq> PartialEq for DelayedEntry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}
impl<T: Eq> Eq for DelayedEntry<T> {}

impl<T: Ord> PartialOrd for DelayedEntry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T: Ord> Ord for DelayedEntry<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed so `BinaryHeap` (a max-heap) pops the earliest deadline first.
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

fn run_ready_once(ready: &RefCell<VecDeque<ReadyEntry>>) -> bool {
    let entry = ready.borrow_mut().pop_front();
    match entry {
        Some(entry) => {
            if !entry.cancelled.get() {
                if let Some(task) = entry.task.borrow_mut().take() {
                    task();
                }
            }
            true
        }
        None => false,
    }
}

/// A wall-clock, single-threaded cooperative scheduler.
///
/// Intended to back [`crate::Runtime::unsafe_run_sync`] and `block_on`-style
/// application entry points. Not an attempt at a general-purpose multi-core
/// executor like `kasync::Executor`: `spec.md` explicitly places preemptive,
/// multi-thread scheduling out of scope for the core.
#[derive(Clone)]
pub struct LocalScheduler {
    inner: Rc<LocalInner>,
}

struct LocalInner {
    ready: RefCell<VecDeque<ReadyEntry>>,
    delayed: RefCell<BinaryHeap<DelayedEntry<Instant>>>,
    next_id: Cell<u64>,
}

impl Default for LocalScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalScheduler {
    pub fn new() -> Self {
        Self {
            inner: Rc::new(LocalInner {
                ready: RefCell::new(VecDeque::new()),
                delayed: RefCell::new(BinaryHeap::new()),
                next_id: Cell::new(0),
            }),
        }
    }

    fn next_id(&self) -> u64 {
        let id = self.inner.next_id.get();
        self.inner.next_id.set(id + 1);
        id
    }

    fn promote_expired(&self) -> usize {
        let now = Instant::now();
        let mut promoted = 0;
        let mut delayed = self.inner.delayed.borrow_mut();
        while let Some(top) = delayed.peek() {
            if top.deadline > now {
                break;
            }
            let entry = delayed.pop().expect("just peeked");
            if !entry.cancelled.get() {
                self.inner.ready.borrow_mut().push_back(ReadyEntry {
                    cancelled: entry.cancelled,
                    task: entry.task,
                });
                promoted += 1;
            }
        }
        promoted
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.inner.delayed.borrow().peek().map(|e| e.deadline)
    }

    /// Drives ready work and expired timers until there is nothing left to
    /// do, parking (sleeping) between ticks when only a future delay remains.
    pub fn run_until_idle(&self) {
        loop {
            while run_ready_once(&self.inner.ready) {}

            if self.promote_expired() > 0 {
                continue;
            }

            match self.next_deadline() {
                None => break,
                Some(deadline) => {
                    let now = Instant::now();
                    if deadline > now {
                        tracing::trace!(?deadline, "scheduler parking until next deadline");
                        std::thread::sleep(deadline - now);
                    }
                }
            }
        }
    }
}

impl Scheduler for LocalScheduler {
    fn asap(&self, task: Thunk) -> CancelHandle {
        let cancelled = Rc::new(Cell::new(false));
        self.inner.ready.borrow_mut().push_back(ReadyEntry {
            cancelled: cancelled.clone(),
            task: RefCell::new(Some(task)),
        });
        CancelHandle::new(move || cancelled.set(true))
    }

    fn delay(&self, task: Thunk, after: Duration) -> CancelHandle {
        let cancelled = Rc::new(Cell::new(false));
        let seq = self.next_id();
        self.inner.delayed.borrow_mut().push(DelayedEntry {
            deadline: Instant::now() + after,
            seq,
            cancelled: cancelled.clone(),
            task: RefCell::new(Some(task)),
        });
        CancelHandle::new(move || cancelled.set(true))
    }
}

/// A scheduler with a manually-advanced virtual clock, for deterministic
/// tests of timeout/race/cancellation behavior (`spec.md` §8 property 5).
///
/// Modeled on `kasync::time::test_util::MockClock`: time only moves when
/// [`TestScheduler::advance`] is called.
#[derive(Clone)]
pub struct TestScheduler {
    inner: Rc<TestInner>,
}

struct TestInner {
    now: Cell<Duration>,
    ready: RefCell<VecDeque<ReadyEntry>>,
    delayed: RefCell<BinaryHeap<DelayedEntry<Duration>>>,
    next_id: Cell<u64>,
}

impl Default for TestScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl TestScheduler {
    pub fn new() -> Self {
        Self {
            inner: Rc::new(TestInner {
                now: Cell::new(Duration::ZERO),
                ready: RefCell::new(VecDeque::new()),
                delayed: RefCell::new(BinaryHeap::new()),
                next_id: Cell::new(0),
            }),
        }
    }

    pub fn now(&self) -> Duration {
        self.inner.now.get()
    }

    fn next_id(&self) -> u64 {
        let id = self.inner.next_id.get();
        self.inner.next_id.set(id + 1);
        id
    }

    /// Runs every currently-ready task (and any tasks they in turn schedule
    /// `asap`) without moving the virtual clock.
    pub fn run_ready(&self) {
        while run_ready_once(&self.inner.ready) {}
    }

    fn promote_expired(&self) -> usize {
        let now = self.inner.now.get();
        let mut promoted = 0;
        let mut delayed = self.inner.delayed.borrow_mut();
        while let Some(top) = delayed.peek() {
            if top.deadline > now {
                break;
            }
            let entry = delayed.pop().expect("just peeked");
            if !entry.cancelled.get() {
                self.inner.ready.borrow_mut().push_back(ReadyEntry {
                    cancelled: entry.cancelled,
                    task: entry.task,
                });
                promoted += 1;
            }
        }
        promoted
    }

    /// Moves the virtual clock forward by `by`, running every task whose
    /// deadline falls at or before the new time, in deadline order.
    pub fn advance(&self, by: Duration) {
        let target = self.inner.now.get() + by;
        loop {
            self.run_ready();
            match self.inner.delayed.borrow().peek().map(|e| e.deadline) {
                Some(deadline) if deadline <= target => {
                    self.inner.now.set(deadline);
                    self.promote_expired();
                }
                _ => break,
            }
        }
        if self.inner.now.get() < target {
            self.inner.now.set(target);
        }
        self.run_ready();
    }
}

impl Scheduler for TestScheduler {
    fn asap(&self, task: Thunk) -> CancelHandle {
        let cancelled = Rc::new(Cell::new(false));
        self.inner.ready.borrow_mut().push_back(ReadyEntry {
            cancelled: cancelled.clone(),
            task: RefCell::new(Some(task)),
        });
        CancelHandle::new(move || cancelled.set(true))
    }

    fn delay(&self, task: Thunk, after: Duration) -> CancelHandle {
        let cancelled = Rc::new(Cell::new(false));
        let seq = self.next_id();
        self.inner.delayed.borrow_mut().push(DelayedEntry {
            deadline: self.inner.now.get() + after,
            seq,
            cancelled: cancelled.clone(),
            task: RefCell::new(Some(task)),
        });
        CancelHandle::new(move || cancelled.set(true))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell as StdRefCell;

    #[test]
    fn asap_runs_fifo() {
        let sched = TestScheduler::new();
        let order = Rc::new(StdRefCell::new(Vec::new()));

        for i in 0..3 {
            let order = order.clone();
            sched.asap(Box::new(move || order.borrow_mut().push(i)));
        }
        sched.run_ready();

        assert_eq!(*order.borrow(), vec![0, 1, 2]);
    }

    #[test]
    fn delay_runs_in_deadline_order() {
        let sched = TestScheduler::new();
        let order = Rc::new(StdRefCell::new(Vec::new()));

        for (i, ms) in [(0, 30), (1, 10), (2, 20)] {
            let order = order.clone();
            sched.delay(
                Box::new(move || order.borrow_mut().push(i)),
                Duration::from_millis(ms),
            );
        }
        sched.advance(Duration::from_millis(30));

        assert_eq!(*order.borrow(), vec![1, 2, 0]);
    }

    #[test]
    fn cancel_is_idempotent_and_prevents_execution() {
        let sched = TestScheduler::new();
        let ran = Rc::new(Cell::new(false));
        let ran2 = ran.clone();

        let handle = sched.asap(Box::new(move || ran2.set(true)));
        handle.cancel();
        handle.cancel();
        sched.run_ready();

        assert!(!ran.get());
    }
}
