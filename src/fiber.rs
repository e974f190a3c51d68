// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The fiber handle (`spec.md` C4) and its internal mutable core.
//!
//! [`FiberCore<E>`] is the mutable record `spec.md` §3 describes: `status`,
//! `waiters`, and (owned by [`crate::interpreter::Evaluator`], not here)
//! `cancelHandle`. It erases the success channel to
//! [`AnyValue`](crate::dyn_value::AnyValue) exactly as [`crate::eff::Raw`]
//! does, so a `Fork` node (which only ever sees `Raw<E>`, never the erased
//! fiber's `A`) can spawn a child without knowing its success type; the
//! public [`Fiber<E, A>`] handle re-attaches `A` via `PhantomData` at the
//! point the typed `Eff::fork`/interpreter machinery constructed it, which
//! is always sound by construction (see `crate::eff` module docs).

use crate::dyn_value::AnyValue;
use crate::error::Outcome;
use crate::scheduler::CancelHandle;
use std::any::Any;
use std::cell::RefCell;
use std::fmt;
use std::marker::PhantomData;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

/// An opaque ID uniquely identifying a fiber among currently-running fibers,
/// for diagnostics (`spec.md` §3: "`id`: unique integer for diagnostics").
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
pub struct Id(u64);

impl Id {
    pub(crate) fn next() -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        Self(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

enum Status<E> {
    Pending,
    Done(Outcome<E, AnyValue>),
}

/// A diagnostic snapshot of a fiber's lifecycle state (`spec.md` §3's
/// `status` field), exposed read-only through [`Fiber::status`]. Distinct
/// from [`Outcome`]: it never carries the success/failure payload, just
/// which of the three states the fiber is in, so it can be produced without
/// requiring `A`/`E` to be `Clone`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FiberStatus {
    Pending,
    Succeeded,
    Failed,
    Interrupted,
}

/// The mutable state a fiber's evaluator exclusively owns and the external
/// [`Fiber`] handle observes by shared reference (`spec.md` §3).
///
/// `cancel_handle` is *not* stored here: it is owned by
/// `crate::interpreter::Evaluator` because only the evaluator driving this
/// fiber ever sets or clears it (invariant 3 in `spec.md` §3: "valid only
/// while status == Pending; replaced, not accumulated").
pub(crate) struct FiberCore<E> {
    pub(crate) id: Id,
    status: RefCell<Status<E>>,
    waiters: RefCell<Vec<Box<dyn FnOnce(Outcome<E, AnyValue>)>>>,
    cancel: RefCell<Option<CancelHandle>>,
}

impl<E: Clone + 'static> FiberCore<E> {
    pub(crate) fn new(id: Id) -> Rc<Self> {
        Rc::new(Self {
            id,
            status: RefCell::new(Status::Pending),
            waiters: RefCell::new(Vec::new()),
            cancel: RefCell::new(None),
        })
    }

    pub(crate) fn is_terminal(&self) -> bool {
        !matches!(&*self.status.borrow(), Status::Pending)
    }

    pub(crate) fn status(&self) -> FiberStatus {
        match &*self.status.borrow() {
            Status::Pending => FiberStatus::Pending,
            Status::Done(Outcome::Success(_)) => FiberStatus::Succeeded,
            Status::Done(Outcome::Failure(_)) => FiberStatus::Failed,
            Status::Done(Outcome::Interrupted) => FiberStatus::Interrupted,
        }
    }

    /// Returns the final outcome if this fiber has already completed,
    /// without subscribing a waiter. Used by `Runtime::unsafe_run_sync` to
    /// read back a root fiber's result after the scheduler goes idle.
    pub(crate) fn try_outcome(&self) -> Option<Outcome<E, AnyValue>> {
        match &*self.status.borrow() {
            Status::Done(outcome) => Some(outcome.clone()),
            Status::Pending => None,
        }
    }

    pub(crate) fn set_cancel_handle(&self, handle: CancelHandle) {
        *self.cancel.borrow_mut() = Some(handle);
    }

    pub(crate) fn take_cancel_handle(&self) -> Option<CancelHandle> {
        self.cancel.borrow_mut().take()
    }

    /// Monotonically transitions `Pending -> Done(outcome)` (invariant 1)
    /// and drains every waiter exactly once (invariant 2). A no-op if
    /// already terminal.
    pub(crate) fn complete(&self, outcome: Outcome<E, AnyValue>) {
        {
            let mut status = self.status.borrow_mut();
            if !matches!(&*status, Status::Pending) {
                return;
            }
            *status = Status::Done(outcome.clone());
        }
        self.cancel.borrow_mut().take();
        for waiter in self.waiters.borrow_mut().drain(..) {
            waiter(outcome.clone());
        }
    }

    /// Registers `cb` to run exactly once with the final outcome. If the
    /// fiber is already terminal, `cb` runs immediately (still exactly
    /// once).
    pub(crate) fn add_waiter(&self, cb: impl FnOnce(Outcome<E, AnyValue>) + 'static) {
        let existing = match &*self.status.borrow() {
            Status::Done(outcome) => Some(outcome.clone()),
            Status::Pending => None,
        };
        match existing {
            Some(outcome) => cb(outcome),
            None => self.waiters.borrow_mut().push(Box::new(cb)),
        }
    }

    /// `Fiber::abort`'s core (`spec.md` §4.3 Cancellation protocol): a no-op
    /// if already terminal; otherwise cancels the outstanding scheduler
    /// handle (if any) and completes as `Interrupted`, notifying every
    /// waiter.
    pub(crate) fn abort(&self) {
        if self.is_terminal() {
            return;
        }
        if let Some(handle) = self.take_cancel_handle() {
            handle.cancel();
        }
        self.complete(Outcome::Interrupted);
    }
}

/// External reference to a running or completed evaluation (`spec.md` C4).
/// Supports `join`, `await_`, `abort`; see the module docs for how `A` is
/// reattached to the erased [`FiberCore`].
pub struct Fiber<E, A> {
    pub(crate) core: Rc<FiberCore<E>>,
    _marker: PhantomData<fn() -> A>,
}

impl<E, A> Clone for Fiber<E, A> {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
            _marker: PhantomData,
        }
    }
}

impl<E, A> Fiber<E, A> {
    pub(crate) fn from_core(core: Rc<FiberCore<E>>) -> Self {
        Self {
            core,
            _marker: PhantomData,
        }
    }
}

impl<E: Clone + 'static, A: Any + Clone> Fiber<E, A> {
    /// This fiber's diagnostic id.
    pub fn id(&self) -> Id {
        self.core.id
    }

    pub fn is_done(&self) -> bool {
        self.core.is_terminal()
    }

    /// A snapshot of this fiber's lifecycle state, for diagnostics
    /// (`spec.md` §3's "`id`: unique integer for diagnostics" field, extended
    /// to the `status` field it sits alongside).
    pub fn status(&self) -> FiberStatus {
        self.core.status()
    }

    /// A `UIO<void>` that requests interruption of this fiber (`spec.md`
    /// §4.3 Cancellation protocol). A no-op if the fiber has already
    /// terminated, otherwise idempotent with respect to repeated calls.
    pub fn abort<R: 'static>(&self) -> crate::eff::Uio<(), R> {
        let core = self.core.clone();
        crate::eff::Eff::async_(move |ctx| {
            core.abort();
            ctx.resolve(());
            CancelHandle::noop()
        })
    }

    /// Resumes with `None` if this fiber was aborted, `Some` with its exit
    /// otherwise (`spec.md` §4.3: "`Fiber.await` returns ... `Option<Either
    /// <E,A>>`").
    pub fn await_<R: 'static>(&self) -> crate::eff::Uio<Option<Result<A, E>>, R> {
        let core = self.core.clone();
        crate::eff::Eff::async_(move |ctx| {
            let ctx = ctx.clone();
            core.add_waiter(move |outcome: Outcome<E, AnyValue>| {
                let mapped = outcome.map(crate::dyn_value::downcast::<A>);
                ctx.resolve(mapped.into_option());
            });
            CancelHandle::noop()
        })
    }

    /// `await_` followed by propagation: success/failure travel on this
    /// fiber's own channels, and interruption bypasses `Catch` entirely by
    /// propagating as this fiber's own interruption (`spec.md` §4.3).
    pub fn join<R: 'static>(&self) -> crate::eff::Eff<E, A, R> {
        let core = self.core.clone();
        crate::eff::Eff::from_raw(crate::eff::Raw::AwaitFiber(Rc::new(
            move |jctx: crate::eff::JoinCtx<E>| {
                let core = core.clone();
                core.add_waiter(move |outcome: Outcome<E, AnyValue>| match outcome {
                    Outcome::Success(v) => (jctx.resolve)(v),
                    Outcome::Failure(e) => (jctx.reject)(e),
                    Outcome::Interrupted => (jctx.interrupt)(),
                });
                CancelHandle::noop()
            },
        )))
    }
}

/// Reads back a fiber's outcome without subscribing a waiter, re-attaching
/// its success type. Used by `Runtime::unsafe_run_sync` once the driving
/// scheduler has gone idle.
pub(crate) fn peek_outcome<E: Clone + 'static, A: Any + Clone>(
    fiber: &Fiber<E, A>,
) -> Option<Outcome<E, A>> {
    fiber
        .core
        .try_outcome()
        .map(|outcome| outcome.map(crate::dyn_value::downcast::<A>))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eff::Eff;
    use crate::error::Never;
    use crate::runtime::Runtime;

    #[test]
    fn join_propagates_the_forked_success() {
        let eff: Eff<Never, i32, ()> =
            Eff::const_(21).map(|x: i32| x * 2).fork().chain(|f| f.join::<()>());
        assert_eq!(
            Runtime::unsafe_run_sync(eff, ()),
            Some(Outcome::Success(42))
        );
    }

    #[test]
    fn aborted_fiber_reports_interrupted_status_and_none_from_await() {
        let scheduler = crate::scheduler::TestScheduler::new();
        let runtime = Runtime::new(scheduler.clone());
        let fiber: Fiber<Never, ()> = runtime.unsafe_run(Eff::never());
        assert_eq!(fiber.status(), FiberStatus::Pending);

        let observed: Fiber<Never, Option<Result<(), Never>>> =
            runtime.unsafe_run(fiber.await_::<()>());
        let _ = runtime.unsafe_run(fiber.abort::<()>());
        scheduler.run_ready();

        assert_eq!(fiber.status(), FiberStatus::Interrupted);
        assert_eq!(
            crate::fiber::peek_outcome(&observed),
            Some(Outcome::Success(None))
        );
    }
}
