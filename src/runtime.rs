// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The runtime handle (`spec.md` C1/§4.1): a cheaply-cloneable wrapper
//! around a [`Scheduler`] plus the entry points that kick off a top-level
//! fiber.

use crate::dyn_value::boxed;
use crate::eff::Eff;
use crate::error::{EffError, Outcome};
use crate::fiber::Fiber;
use crate::scheduler::{LocalScheduler, Scheduler, TestScheduler};
use std::any::Any;
use std::rc::Rc;

/// A handle to the scheduler driving the current (or a to-be-spawned) tree
/// of fibers.
///
/// Cloning a `Runtime` is cheap (an `Rc` bump) and yields a handle to the
/// same underlying scheduler, mirroring `spec.md`'s description of the
/// runtime as ambient, shared context available via `Eff::runtime`.
pub struct Runtime<S> {
    scheduler: Rc<S>,
}

impl<S> Clone for Runtime<S> {
    fn clone(&self) -> Self {
        Self {
            scheduler: self.scheduler.clone(),
        }
    }
}

impl<S: Scheduler> Runtime<S> {
    pub fn new(scheduler: S) -> Self {
        Self {
            scheduler: Rc::new(scheduler),
        }
    }

    /// Rebinds this runtime to a different scheduler, keeping everything
    /// else about how callers use it unchanged (`spec.md` §6's
    /// `withScheduler`).
    pub fn with_scheduler<S2: Scheduler>(self, scheduler: S2) -> Runtime<S2> {
        Runtime::new(scheduler)
    }

    pub(crate) fn scheduler(&self) -> &S {
        &self.scheduler
    }

    /// Spawns `eff` as a root fiber under environment `env`, returning its
    /// handle immediately without blocking (`spec.md` §4.1's `run`).
    pub fn unsafe_run_with_env<E, A, R>(&self, eff: Eff<E, A, R>, env: R) -> Fiber<E, A>
    where
        E: From<EffError> + Clone + 'static,
        A: Any + Clone,
        R: Any + Clone,
    {
        crate::interpreter::spawn(self.clone(), eff, env)
    }

    /// [`unsafe_run_with_env`](Self::unsafe_run_with_env) for effects that
    /// require no environment.
    pub fn unsafe_run<E, A>(&self, eff: Eff<E, A, ()>) -> Fiber<E, A>
    where
        E: From<EffError> + Clone + 'static,
        A: Any + Clone,
    {
        self.unsafe_run_with_env(eff, ())
    }
}

impl Runtime<LocalScheduler> {
    /// A runtime backed by a wall-clock, real-time scheduler.
    pub fn local() -> Self {
        Self::new(LocalScheduler::new())
    }

    /// Runs `eff` to completion on a fresh [`LocalScheduler`] and returns its
    /// outcome, blocking the calling thread (`spec.md` §4.1's
    /// `unsafeRunSync`).
    ///
    /// `spec.md` spells this operation's return type as `A | E | undefined`;
    /// Rust has no untagged union well-suited to three disjoint cases here,
    /// so this returns `Option<Outcome<E, A>>` instead: `None` if the root
    /// fiber never completed (impossible for `LocalScheduler::run_until_idle`
    /// short of an infinite `never()`/unresolved `Async`, which is itself the
    /// effect-author's bug, not this function's), `Some(outcome)` otherwise.
    /// See `DESIGN.md`.
    pub fn unsafe_run_sync<E, A, R>(eff: Eff<E, A, R>, env: R) -> Option<Outcome<E, A>>
    where
        E: From<EffError> + Clone + 'static,
        A: Any + Clone,
        R: Any + Clone,
    {
        let scheduler = LocalScheduler::new();
        let runtime = Runtime::new(scheduler.clone());
        let fiber = runtime.unsafe_run_with_env(eff, env);
        scheduler.run_until_idle();
        fiber_outcome(&fiber)
    }
}

impl Runtime<TestScheduler> {
    /// A runtime backed by a manually-advanced virtual clock, for
    /// deterministic tests (`spec.md` §8 property 5).
    pub fn test() -> Self {
        Self::new(TestScheduler::new())
    }

    /// Like [`Runtime::<LocalScheduler>::unsafe_run_sync`] but driven by a
    /// caller-supplied [`TestScheduler`] via `run_ready`/`advance` rather
    /// than a real clock; the caller is responsible for advancing time far
    /// enough for `eff` to settle.
    pub fn unsafe_run_test<E, A, R>(
        scheduler: &TestScheduler,
        eff: Eff<E, A, R>,
        env: R,
    ) -> Fiber<E, A>
    where
        E: From<EffError> + Clone + 'static,
        A: Any + Clone,
        R: Any + Clone,
    {
        let runtime = Runtime::new(scheduler.clone());
        runtime.unsafe_run_with_env(eff, env)
    }
}

fn fiber_outcome<E, A>(fiber: &Fiber<E, A>) -> Option<Outcome<E, A>>
where
    E: Clone + 'static,
    A: Any + Clone,
{
    crate::fiber::peek_outcome(fiber)
}
