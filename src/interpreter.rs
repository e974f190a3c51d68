// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The interpreter (`spec.md` C3): a trampolined stack machine that reduces
//! an `Eff<E, A, R>` to an outcome on a given [`Scheduler`], with
//! cancellation.
//!
//! [`Evaluator`] is the per-fiber state `spec.md` §3/§4.3 describes: the
//! current instruction, a LIFO continuation stack of [`Frame`]s, and the
//! erased environment cell. [`Evaluator::drive`] is the synchronous subloop:
//! it reduces pure constructors without yielding and only returns control to
//! the scheduler at `Async`, `AwaitFiber`, `Never`, or fiber completion. This
//! is the trampoline that keeps `Call`-based user recursion off the host
//! stack (`spec.md` §8 property 4).

use crate::dyn_value::AnyValue;
use crate::eff::{AsyncCtx, JoinCtx, Raw};
use crate::error::{EffError, Outcome};
use crate::fiber::{Fiber, FiberCore, Id};
use crate::runtime::Runtime;
use crate::scheduler::{CancelHandle, Scheduler};
use std::any::Any;
use std::cell::{Cell, RefCell};
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;

/// A continuation-stack frame (`spec.md` §3's "Instruction stream").
enum Frame<E> {
    /// `Chain`'s continuation: consumes a success value, produces the next
    /// effect.
    Apply(Rc<dyn Fn(AnyValue) -> Rc<Raw<E>>>),
    /// `Map`'s pure transform: consumes a success value, produces a new
    /// (still erased) success value synchronously.
    MapPure(Rc<dyn Fn(AnyValue) -> AnyValue>),
    /// `Catch`'s handler: consumes a failure value, produces the next
    /// effect. Popped and discarded (not invoked) while unwinding a success
    /// or an interruption.
    Recover(Rc<dyn Fn(E) -> Rc<Raw<E>>>),
    /// Restores the environment active before a `Provide` was entered, on
    /// every exit path including interruption (`spec.md` §3 invariant 4).
    WithEnv(AnyValue),
}

/// One step of interpretation: either the next node to reduce, or a value
/// propagating up the continuation stack.
enum Step<E> {
    Eval(Rc<Raw<E>>),
    Success(AnyValue),
    Failure(E),
    Interrupted,
}

enum Reduced<E> {
    Step(Step<E>),
    /// The fiber has suspended; the evaluator's `drive` loop returns and
    /// waits to be re-entered from a scheduler tick.
    Suspended,
}

/// Per-fiber evaluator state. Lives behind an `Rc` so async callbacks
/// (`begin_async`/`begin_await_fiber`) can clone it and re-enter `drive`
/// from a scheduler tick without borrowing across the suspension.
pub(crate) struct Evaluator<S, E> {
    id: Id,
    runtime: Runtime<S>,
    core: Rc<FiberCore<E>>,
    stack: RefCell<Vec<Frame<E>>>,
    env: RefCell<AnyValue>,
}

/// Spawns a new fiber evaluating `eff` under `env`, scheduling its first
/// tick via `runtime`'s scheduler (`spec.md` §4.3 point 5: "schedule its
/// initial tick via `rt.asap`"). Returns the erased core immediately; the
/// caller (`Eff::fork`'s reduction, or `Runtime::unsafe_run`) wraps it in a
/// typed [`Fiber`] handle.
pub(crate) fn spawn_core<S, E>(runtime: Runtime<S>, eff: Rc<Raw<E>>, env: AnyValue) -> Rc<FiberCore<E>>
where
    S: Scheduler,
    E: From<EffError> + Clone + 'static,
{
    let id = Id::next();
    let core = FiberCore::new(id);
    let evaluator = Rc::new(Evaluator {
        id,
        runtime: runtime.clone(),
        core: core.clone(),
        stack: RefCell::new(Vec::new()),
        env: RefCell::new(env),
    });
    tracing::debug!(fiber = %id, "fiber created");
    let first = evaluator.clone();
    runtime
        .scheduler()
        .asap(Box::new(move || first.drive(Step::Eval(eff))));
    core
}

impl<S, E> Evaluator<S, E>
where
    S: Scheduler,
    E: From<EffError> + Clone + 'static,
{
    /// The synchronous subloop (`spec.md` §4.3): reduces pure constructors
    /// without yielding, returning only at suspension or completion.
    fn drive(self: Rc<Self>, mut step: Step<E>) {
        loop {
            if self.core.is_terminal() {
                // Aborted out from under us (e.g. while suspended in Async)
                // between scheduling this tick and running it.
                return;
            }
            step = match step {
                Step::Eval(raw) => {
                    tracing::trace!(fiber = %self.id, tag = raw.tag(), "reducing");
                    match self.reduce(raw) {
                        Reduced::Step(next) => next,
                        Reduced::Suspended => return,
                    }
                }
                Step::Success(v) => match self.unwind_success(v) {
                    Some(next) => next,
                    None => return,
                },
                Step::Failure(e) => match self.unwind_failure(e) {
                    Some(next) => next,
                    None => return,
                },
                Step::Interrupted => match self.unwind_interrupted() {
                    Some(next) => next,
                    None => return,
                },
            };
        }
    }

    fn reduce(self: &Rc<Self>, raw: Rc<Raw<E>>) -> Reduced<E> {
        match &*raw {
            Raw::Const(v) => Reduced::Step(Step::Success(v.clone())),
            Raw::Reject(e) => Reduced::Step(Step::Failure(e.clone())),
            Raw::Try(thunk) => match panic::catch_unwind(AssertUnwindSafe(|| thunk())) {
                Ok(v) => Reduced::Step(Step::Success(v)),
                Err(payload) => {
                    Reduced::Step(Step::Failure(E::from(EffError::from_panic(payload))))
                }
            },
            Raw::TryM(thunk) => match panic::catch_unwind(AssertUnwindSafe(|| thunk())) {
                Ok(next) => Reduced::Step(Step::Eval(next)),
                Err(payload) => {
                    Reduced::Step(Step::Failure(E::from(EffError::from_panic(payload))))
                }
            },
            Raw::Map(eff, f) => {
                self.stack.borrow_mut().push(Frame::MapPure(f.clone()));
                Reduced::Step(Step::Eval(eff.clone()))
            }
            Raw::Chain(eff, k) => {
                self.stack.borrow_mut().push(Frame::Apply(k.clone()));
                Reduced::Step(Step::Eval(eff.clone()))
            }
            Raw::Catch(eff, h) => {
                self.stack.borrow_mut().push(Frame::Recover(h.clone()));
                Reduced::Step(Step::Eval(eff.clone()))
            }
            Raw::Access(f) => {
                let v = f(&self.env.borrow());
                Reduced::Step(Step::Success(v))
            }
            Raw::Provide(eff, r) => {
                let prev = self.env.replace(r.clone());
                self.stack.borrow_mut().push(Frame::WithEnv(prev));
                Reduced::Step(Step::Eval(eff.clone()))
            }
            Raw::Runtime => Reduced::Step(Step::Success(crate::dyn_value::boxed(
                self.runtime.clone(),
            ))),
            Raw::Fork(eff, wrap) => {
                let env = self.env.borrow().clone();
                let child = spawn_core(self.runtime.clone(), eff.clone(), env);
                Reduced::Step(Step::Success(wrap(child)))
            }
            Raw::Never => {
                tracing::trace!(fiber = %self.id, "suspending forever");
                Reduced::Suspended
            }
            Raw::Call(f) => match panic::catch_unwind(AssertUnwindSafe(|| f())) {
                Ok(next) => Reduced::Step(Step::Eval(next)),
                Err(payload) => {
                    Reduced::Step(Step::Failure(E::from(EffError::from_panic(payload))))
                }
            },
            Raw::Async(register) => {
                self.begin_async(register.clone());
                Reduced::Suspended
            }
            Raw::AwaitFiber(register) => {
                self.begin_await_fiber(register.clone());
                Reduced::Suspended
            }
            Raw::Interrupt => Reduced::Step(Step::Interrupted),
            Raw::WidenNever(never_raw, k) => {
                let env = self.env.borrow().clone();
                let child = spawn_core::<S, crate::error::Never>(
                    self.runtime.clone(),
                    never_raw.clone(),
                    env,
                );
                self.begin_widen(child, k.clone());
                Reduced::Suspended
            }
        }
    }

    /// Pops frames for a propagating success, applying `MapPure`s and
    /// `WithEnv` restores in place, stopping at the next `Apply`. Returns
    /// `None` once the stack empties and the fiber has completed.
    fn unwind_success(self: &Rc<Self>, mut v: AnyValue) -> Option<Step<E>> {
        loop {
            match self.stack.borrow_mut().pop() {
                None => {
                    self.core.complete(Outcome::Success(v));
                    return None;
                }
                Some(Frame::MapPure(f)) => v = f(v),
                Some(Frame::Apply(k)) => return Some(Step::Eval(k(v))),
                Some(Frame::Recover(_)) => {}
                Some(Frame::WithEnv(prev)) => {
                    *self.env.borrow_mut() = prev;
                }
            }
        }
    }

    fn unwind_failure(self: &Rc<Self>, e: E) -> Option<Step<E>> {
        loop {
            match self.stack.borrow_mut().pop() {
                None => {
                    self.core.complete(Outcome::Failure(e));
                    return None;
                }
                Some(Frame::Recover(h)) => return Some(Step::Eval(h(e))),
                Some(Frame::WithEnv(prev)) => {
                    *self.env.borrow_mut() = prev;
                }
                Some(Frame::Apply(_)) | Some(Frame::MapPure(_)) => {}
            }
        }
    }

    /// `spec.md` §7: interruption bypasses every `Catch` frame on the way
    /// out; only `WithEnv` restores still run.
    fn unwind_interrupted(self: &Rc<Self>) -> Option<Step<E>> {
        loop {
            match self.stack.borrow_mut().pop() {
                None => {
                    self.core.complete(Outcome::Interrupted);
                    return None;
                }
                Some(Frame::WithEnv(prev)) => {
                    *self.env.borrow_mut() = prev;
                }
                _ => {}
            }
        }
    }

    fn begin_async(self: &Rc<Self>, register: Rc<dyn Fn(AsyncCtx<E>) -> CancelHandle>) {
        let fired = Rc::new(Cell::new(false));

        let resolve: Rc<dyn Fn(AnyValue)> = {
            let me = self.clone();
            let fired = fired.clone();
            Rc::new(move |v: AnyValue| {
                if fired.replace(true) {
                    return;
                }
                let me = me.clone();
                me.core.take_cancel_handle();
                me.runtime
                    .scheduler()
                    .asap(Box::new(move || me.drive(Step::Success(v))));
            })
        };
        let reject: Rc<dyn Fn(E)> = {
            let me = self.clone();
            let fired = fired.clone();
            Rc::new(move |e: E| {
                if fired.replace(true) {
                    return;
                }
                let me = me.clone();
                me.core.take_cancel_handle();
                me.runtime
                    .scheduler()
                    .asap(Box::new(move || me.drive(Step::Failure(e))));
            })
        };

        let handle = register(AsyncCtx { resolve, reject });
        self.core.set_cancel_handle(handle);
    }

    fn begin_await_fiber(self: &Rc<Self>, register: Rc<dyn Fn(JoinCtx<E>) -> CancelHandle>) {
        let fired = Rc::new(Cell::new(false));

        let resolve: Rc<dyn Fn(AnyValue)> = {
            let me = self.clone();
            let fired = fired.clone();
            Rc::new(move |v: AnyValue| {
                if fired.replace(true) {
                    return;
                }
                let me = me.clone();
                me.core.take_cancel_handle();
                me.runtime
                    .scheduler()
                    .asap(Box::new(move || me.drive(Step::Success(v))));
            })
        };
        let reject: Rc<dyn Fn(E)> = {
            let me = self.clone();
            let fired = fired.clone();
            Rc::new(move |e: E| {
                if fired.replace(true) {
                    return;
                }
                let me = me.clone();
                me.core.take_cancel_handle();
                me.runtime
                    .scheduler()
                    .asap(Box::new(move || me.drive(Step::Failure(e))));
            })
        };
        let interrupt: Rc<dyn Fn()> = {
            let me = self.clone();
            let fired = fired.clone();
            Rc::new(move || {
                if fired.replace(true) {
                    return;
                }
                let me = me.clone();
                me.core.take_cancel_handle();
                me.runtime
                    .scheduler()
                    .asap(Box::new(move || me.drive(Step::Interrupted)));
            })
        };

        let handle = register(JoinCtx {
            resolve,
            reject,
            interrupt,
        });
        self.core.set_cancel_handle(handle);
    }

    /// Backs [`Raw::WidenNever`]: `child` can only ever succeed, so there is
    /// no failure arm. If this evaluation is aborted while suspended here,
    /// `child` is left running detached, the same semantics
    /// `Fiber::await_`'s own `CancelHandle::noop()` already gives a waiter
    /// that outlives its watcher.
    fn begin_widen(
        self: &Rc<Self>,
        child: Rc<FiberCore<crate::error::Never>>,
        k: Rc<dyn Fn(AnyValue) -> Rc<Raw<E>>>,
    ) {
        let me = self.clone();
        child.add_waiter(move |outcome: Outcome<crate::error::Never, AnyValue>| {
            let me = me.clone();
            let k = k.clone();
            me.runtime.scheduler().asap(Box::new(move || match outcome {
                Outcome::Success(v) => me.drive(Step::Eval(k(v))),
                Outcome::Failure(never) => match never {},
                Outcome::Interrupted => me.drive(Step::Interrupted),
            }));
        });
    }
}

/// Spawns a root fiber and returns the typed [`Fiber`] handle, used by
/// `Runtime::unsafe_run_with_env`.
pub(crate) fn spawn<S, E, A, R>(runtime: Runtime<S>, eff: crate::eff::Eff<E, A, R>, env: R) -> Fiber<E, A>
where
    S: Scheduler,
    E: From<EffError> + Clone + 'static,
    A: Any + Clone,
    R: Any + Clone,
{
    let core = spawn_core(runtime, eff.raw, crate::dyn_value::boxed(env));
    Fiber::from_core(core)
}
