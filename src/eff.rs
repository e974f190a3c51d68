// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! `Eff<E, A, R>` (`spec.md` C2): an immutable, freely-shareable description
//! of a computation that may fail with `E`, succeed with `A`, and requires
//! an environment `R`.
//!
//! Rust has no GADTs, so the ~15 constructors in `spec.md` §4.2 are
//! represented internally by [`Raw<E>`], which erases *both* the success
//! type and the environment type behind [`crate::dyn_value::AnyValue`].
//! `Eff<E, A, R>` is a thin, statically-typed handle around an `Rc<Raw<E>>`
//! plus a `PhantomData<(A, R)>`; all downcasting happens at the interpreter
//! boundary in [`crate::interpreter`] and in `Access`/`Provide`'s own erased
//! closures, never anywhere else.
//!
//! Erasing `R` as well as `A` is what makes `Eff::provide` and
//! `Eff::contramap_env` able to change a tree's environment type: a single
//! fiber's interpreter (`crate::interpreter::Evaluator`) carries one erased
//! environment cell regardless of how many different `R` types the
//! composed tree was written against, so `Provide(eff, r)` can hand back an
//! `Eff<E, A, R2>` for any `R2` the caller needs: the tree underneath no
//! longer reads the ambient environment at all once `r` is baked in.
//!
//! Every constructor stores its sub-effects behind `Rc`, not `Box`: `Eff`
//! values are immutable and have no identity (`spec.md` §3), so the same
//! node can be evaluated by more than one fiber (e.g. a forked effect, or an
//! `Await`'s stored computation).

use crate::dyn_value::{AnyValue, boxed, downcast_ref};
use crate::error::{EffError, Outcome};
use crate::fiber::{Fiber, FiberCore};
use crate::scheduler::CancelHandle;
use std::any::Any;
use std::marker::PhantomData;
use std::rc::Rc;

/// Callbacks handed to an [`Eff::async_`] registration function.
///
/// Exactly one of [`resolve`][Self::resolve]/[`reject`][Self::reject] may be
/// observed to take effect; subsequent calls are ignored, per `spec.md`
/// §4.2's `Async` row. Construction is interpreter-internal.
pub struct AsyncCtx<E> {
    pub(crate) resolve: Rc<dyn Fn(AnyValue)>,
    pub(crate) reject: Rc<dyn Fn(E)>,
}

impl<E> AsyncCtx<E> {
    pub fn resolve<A: Any + Clone>(&self, value: A) {
        (self.resolve)(boxed(value));
    }

    /// Resolves with an already-erased value. Used internally by `Await` and
    /// `Fiber::join` to forward a downstream outcome without re-boxing it.
    pub(crate) fn resolve_any(&self, value: AnyValue) {
        (self.resolve)(value);
    }

    pub fn reject(&self, err: E) {
        (self.reject)(err);
    }
}

impl<E> Clone for AsyncCtx<E> {
    fn clone(&self) -> Self {
        Self {
            resolve: self.resolve.clone(),
            reject: self.reject.clone(),
        }
    }
}

/// Callbacks handed to the internal-only `AwaitFiber` registration function
/// backing [`Fiber::join`](crate::fiber::Fiber::join). Like [`AsyncCtx`] but
/// with a third arm: a joined fiber can also have been `Interrupted`, which
/// `spec.md` §7 says must bypass `Catch` rather than travel as a `Reject`.
pub(crate) struct JoinCtx<E> {
    pub(crate) resolve: Rc<dyn Fn(AnyValue)>,
    pub(crate) reject: Rc<dyn Fn(E)>,
    pub(crate) interrupt: Rc<dyn Fn()>,
}

/// The type-erased representation of an effect tree. See the module docs.
pub(crate) enum Raw<E> {
    Const(AnyValue),
    Reject(E),
    Try(Rc<dyn Fn() -> AnyValue>),
    TryM(Rc<dyn Fn() -> Rc<Raw<E>>>),
    Map(Rc<Raw<E>>, Rc<dyn Fn(AnyValue) -> AnyValue>),
    Chain(Rc<Raw<E>>, Rc<dyn Fn(AnyValue) -> Rc<Raw<E>>>),
    Catch(Rc<Raw<E>>, Rc<dyn Fn(E) -> Rc<Raw<E>>>),
    Async(Rc<dyn Fn(AsyncCtx<E>) -> CancelHandle>),
    /// Internal-only; never reachable through a public constructor. Backs
    /// [`Fiber::join`](crate::fiber::Fiber::join) (see [`JoinCtx`]).
    AwaitFiber(Rc<dyn Fn(JoinCtx<E>) -> CancelHandle>),
    Access(Rc<dyn Fn(&AnyValue) -> AnyValue>),
    Provide(Rc<Raw<E>>, AnyValue),
    Runtime,
    Fork(Rc<Raw<E>>, Rc<dyn Fn(Rc<FiberCore<E>>) -> AnyValue>),
    Never,
    Call(Rc<dyn Fn() -> Rc<Raw<E>>>),
    /// Not reachable from any public combinator. Produced internally when
    /// propagating a joined fiber's interruption, or when a parallel
    /// combinator's losing/failing branch must short-circuit the winner's
    /// own fiber (`spec.md` §7: interruption bypasses `Catch` and
    /// short-circuits straight to termination).
    Interrupt,
    /// Internal-only; backs [`Eff::widen`]. `Raw<E>` is monomorphic in its
    /// error type, so a `Uio` (whose error channel is the uninhabited
    /// `Never`) cannot be reinterpreted in place as an `Eff<E, _, _>`. This
    /// node spawns the `Never`-channeled tree as an independent child fiber
    /// and, since it can only ever succeed, resumes this evaluation with the
    /// continuation applied to that success value.
    WidenNever(
        Rc<Raw<crate::error::Never>>,
        Rc<dyn Fn(AnyValue) -> Rc<Raw<E>>>,
    ),
}

impl<E> Raw<E> {
    pub(crate) fn tag(&self) -> &'static str {
        match self {
            Raw::Const(_) => "Const",
            Raw::Reject(_) => "Reject",
            Raw::Try(_) => "Try",
            Raw::TryM(_) => "TryM",
            Raw::Map(..) => "Map",
            Raw::Chain(..) => "Chain",
            Raw::Catch(..) => "Catch",
            Raw::Async(_) => "Async",
            Raw::AwaitFiber(_) => "AwaitFiber",
            Raw::Access(_) => "Access",
            Raw::Provide(..) => "Provide",
            Raw::Runtime => "Runtime",
            Raw::Fork(..) => "Fork",
            Raw::Never => "Never",
            Raw::Call(_) => "Call",
            Raw::Interrupt => "Interrupt",
            Raw::WidenNever(..) => "WidenNever",
        }
    }
}

/// An immutable description of a computation with error channel `E`,
/// success channel `A`, and environment requirement `R`. See the module docs
/// and `spec.md` §3-4.
pub struct Eff<E, A, R> {
    pub(crate) raw: Rc<Raw<E>>,
    _marker: PhantomData<fn(R) -> A>,
}

impl<E, A, R> Clone for Eff<E, A, R> {
    fn clone(&self) -> Self {
        Self {
            raw: self.raw.clone(),
            _marker: PhantomData,
        }
    }
}

impl<E, A, R> Eff<E, A, R> {
    pub(crate) fn from_raw(raw: Raw<E>) -> Self {
        Self {
            raw: Rc::new(raw),
            _marker: PhantomData,
        }
    }

    pub(crate) fn from_rc(raw: Rc<Raw<E>>) -> Self {
        Self {
            raw,
            _marker: PhantomData,
        }
    }
}

/// A `UIO` per `spec.md`'s glossary: an effect that cannot fail.
pub type Uio<A, R> = Eff<crate::error::Never, A, R>;

// === constructors ===

impl<E, A, R> Eff<E, A, R>
where
    E: 'static,
    A: Any + Clone,
    R: 'static,
{
    /// Succeeds synchronously with `a`.
    pub fn const_(a: A) -> Self {
        Self::from_raw(Raw::Const(boxed(a)))
    }
}

impl<E, A, R> Eff<E, A, R>
where
    E: Clone + 'static,
    A: 'static,
    R: 'static,
{
    /// Fails synchronously with `e`.
    pub fn reject(e: E) -> Self {
        Self::from_raw(Raw::Reject(e))
    }
}

impl<E, A, R> Eff<E, A, R>
where
    E: From<EffError> + 'static,
    A: Any + Clone,
    R: 'static,
{
    /// Runs `thunk`; a panic is caught and reified onto the error channel as
    /// an [`EffError`], matching `spec.md`'s "any thrown value -> Reject"
    /// rule for a statically-typed host.
    pub fn try_(thunk: impl Fn() -> A + 'static) -> Self {
        Self::from_raw(Raw::Try(Rc::new(move || boxed(thunk()))))
    }
}

impl<E, A, R> Eff<E, A, R>
where
    E: 'static,
    A: 'static,
    R: 'static,
{
    /// Runs `thunk`, substituting the `Eff` it returns at this point.
    pub fn try_m(thunk: impl Fn() -> Eff<E, A, R> + 'static) -> Self {
        Self::from_raw(Raw::TryM(Rc::new(move || thunk().raw)))
    }

    /// Evaluates `f` inside the interpreter loop rather than the host call
    /// stack, so arbitrarily deep recursion through `Call` never exhausts
    /// native stack space (`spec.md` §4.2, §8 property 4).
    pub fn call(f: impl Fn() -> Eff<E, A, R> + 'static) -> Self {
        Self::from_raw(Raw::Call(Rc::new(move || f().raw)))
    }

    /// Suspends forever; only cancellation of the enclosing fiber ever
    /// terminates it.
    pub fn never() -> Self {
        Self::from_raw(Raw::Never)
    }

    /// Registers an externally-resolved computation. `register` is invoked
    /// synchronously when this node is reduced, with callbacks that resume
    /// the fiber with the first outcome observed; the returned
    /// [`CancelHandle`] is stored as the fiber's outstanding cancellation
    /// handle while suspended. Resumption is always deferred to the
    /// scheduler's next `asap` tick, even if a callback is invoked
    /// synchronously from within `register` (`spec.md` §4.3 point 4).
    pub fn async_(register: impl Fn(AsyncCtx<E>) -> CancelHandle + 'static) -> Self {
        Self::from_raw(Raw::Async(Rc::new(register)))
    }
}

impl<E, A, R> Eff<E, A, R>
where
    E: 'static,
    A: Any + Clone,
    R: Any,
{
    /// Succeeds with `f` applied to the current environment.
    pub fn access(f: impl Fn(&R) -> A + 'static) -> Self {
        Self::from_raw(Raw::Access(Rc::new(move |env: &AnyValue| {
            boxed(f(downcast_ref::<R>(env)))
        })))
    }
}

impl<E, A, R> Eff<E, A, R>
where
    E: 'static,
    A: 'static,
    R: 'static,
{
    /// Succeeds with the handle to the runtime currently executing this
    /// fiber.
    pub fn runtime<S: crate::scheduler::Scheduler>() -> Eff<E, crate::runtime::Runtime<S>, R> {
        Eff::from_raw(Raw::Runtime)
    }
}

// === combinators that change the success type ===

impl<E, A, R> Eff<E, A, R>
where
    E: 'static,
    A: 'static,
    R: 'static,
{
    /// Transforms a successful result with a pure function. A panic inside
    /// `f` fails the effect the same way `Try` does.
    pub fn map<B>(self, f: impl Fn(A) -> B + 'static) -> Eff<E, B, R>
    where
        E: From<EffError>,
        B: Any + Clone,
    {
        let f = Rc::new(f);
        Eff::from_raw(Raw::Map(
            self.raw,
            Rc::new(move |a| {
                let a: A = crate::dyn_value::downcast(a);
                boxed(f(a))
            }),
        ))
    }

    /// Sequences `self` into `k`: on success, evaluates `k(a)`; on failure,
    /// propagates.
    pub fn chain<B>(self, k: impl Fn(A) -> Eff<E, B, R> + 'static) -> Eff<E, B, R>
    where
        B: 'static,
    {
        Eff::from_raw(Raw::Chain(
            self.raw,
            Rc::new(move |a| {
                let a: A = crate::dyn_value::downcast(a);
                k(a).raw
            }),
        ))
    }

    /// Alias for [`chain`][Self::chain], spelled the way `spec.md`'s
    /// "`and`, `do`" derivations are usually invoked in application code.
    pub fn and_then<B>(self, k: impl Fn(A) -> Eff<E, B, R> + 'static) -> Eff<E, B, R>
    where
        B: 'static,
    {
        self.chain(k)
    }

    /// Sequences `self` then `next`, discarding `self`'s success value.
    pub fn and<B>(self, next: Eff<E, B, R>) -> Eff<E, B, R>
    where
        B: 'static,
    {
        self.chain(move |_| next.clone())
    }

    /// Replaces a successful result with `b`, discarding `self`'s value.
    pub fn const_value<B>(self, b: B) -> Eff<E, B, R>
    where
        B: Any + Clone,
    {
        self.chain(move |_| Eff::const_(b.clone()))
    }

    /// Discards the success value, analogous to `spec.md`'s derived `void`.
    pub fn void(self) -> Eff<E, (), R> {
        self.const_value(())
    }

    /// Recovers from a failure; does not run for `Interrupted` (`spec.md`
    /// §7: `Catch` does not recover from interruption; see
    /// `crate::interpreter`'s interrupted unwind path, which never pops a
    /// `Catch` frame).
    pub fn catch(self, h: impl Fn(E) -> Eff<E, A, R> + 'static) -> Eff<E, A, R> {
        Eff::from_raw(Raw::Catch(self.raw, Rc::new(move |e| h(e).raw)))
    }

    /// Installs `r` as the environment for the duration of `self`,
    /// restoring the previous environment on any exit path. Because `self`
    /// no longer reads the ambient environment once `r` is baked in, the
    /// result can be used under any environment `R2`.
    pub fn provide<R2>(self, r: R) -> Eff<E, A, R2>
    where
        R: Any + Clone,
    {
        Eff::from_raw(Raw::Provide(self.raw, boxed(r)))
    }

    /// Narrows the environment this effect requires by mapping from a wider
    /// environment type. A reader-monad convenience implied, but not named,
    /// by `spec.md` §9 ("`Provide` + `Access` form a reader monad").
    pub fn contramap_env<R2>(self, f: impl Fn(&R2) -> R + 'static) -> Eff<E, A, R2>
    where
        R: Any + Clone,
        R2: Any,
    {
        Eff::<E, R, R2>::access(f).chain(move |r: R| self.clone().provide(r))
    }

    /// Builds an `Eff` directly from a completed [`Outcome`], used
    /// internally to reproduce a captured exit (`Managed::use_`, the
    /// `raceWith`-derived combinators, `Fiber::join`'s interrupted path).
    pub(crate) fn from_outcome(outcome: Outcome<E, A>) -> Self
    where
        E: Clone,
        A: Any + Clone,
    {
        match outcome {
            Outcome::Success(a) => Eff::const_(a),
            Outcome::Failure(e) => Eff::reject(e),
            Outcome::Interrupted => Eff::from_raw(Raw::Interrupt),
        }
    }

    /// Forks `self` into a new, independently-running [`Fiber`], scheduled
    /// via the current runtime's `asap`; succeeds immediately with its
    /// handle without descheduling the parent (`spec.md` §4.2 `Fork` row,
    /// §4.3 point 5). Per `spec.md` §9's third open question, the child
    /// inherits the parent's environment at the point of the fork (see
    /// `DESIGN.md`).
    pub fn fork(self) -> Eff<E, Fiber<E, A>, R>
    where
        E: Clone,
        A: Any + Clone,
    {
        Eff::from_raw(Raw::Fork(
            self.raw,
            Rc::new(|core: Rc<FiberCore<E>>| boxed(Fiber::from_core(core))),
        ))
    }
}

impl<A, R> Eff<crate::error::Never, A, R>
where
    A: 'static,
    R: 'static,
{
    /// Widens a `Uio`'s uninhabited error channel to any `E`.
    ///
    /// A `Uio` can never actually reach a `Reject`, but `Raw<E>` is
    /// monomorphic in its error type, so `Eff<Never, A, R>` and
    /// `Eff<E, A, R>` are different Rust types even though one is a strict
    /// subset of the other's possible outcomes. See [`Raw::WidenNever`] for
    /// how the interpreter bridges them.
    pub fn widen<E: 'static>(self) -> Eff<E, A, R> {
        Eff::from_raw(Raw::WidenNever(
            self.raw,
            Rc::new(|v: AnyValue| Rc::new(Raw::Const(v))),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Never, Outcome};
    use crate::runtime::Runtime;

    // S1 (`spec.md` §8): `Try(() -> 42)` run -> `Success(42)`.
    #[test]
    fn try_success_runs_the_thunk() {
        let eff: Eff<Never, i32, ()> = Eff::try_(|| 42);
        assert_eq!(Runtime::unsafe_run_sync(eff, ()), Some(Outcome::Success(42)));
    }

    // S2: `Try(() -> { throw "FAILED" })` run -> `Failure(Error("FAILED"))`.
    #[test]
    fn try_panicking_is_reified_as_a_failure() {
        let eff: Eff<EffError, i32, ()> = Eff::try_(|| panic!("FAILED"));
        match Runtime::unsafe_run_sync(eff, ()) {
            Some(Outcome::Failure(err)) => {
                assert_eq!(err.message(), Some("FAILED"));
            }
            other => panic!("expected a reified failure, got {other:?}"),
        }
    }

    // spec.md §8 property 4: Call-based recursion of depth N (N >= 10^5)
    // completes without host-stack exhaustion.
    #[test]
    fn call_recursion_is_stack_safe_to_a_hundred_thousand() {
        fn count_down(n: u64) -> Eff<Never, u64, ()> {
            if n == 0 {
                Eff::const_(0)
            } else {
                Eff::call(move || count_down(n - 1).map(|acc: u64| acc + 1))
            }
        }
        let eff = count_down(100_000);
        assert_eq!(
            Runtime::unsafe_run_sync(eff, ()),
            Some(Outcome::Success(100_000))
        );
    }

    // spec.md §8 property 1: monad laws for Const/chain.
    #[test]
    fn left_identity() {
        let f = |x: i32| Eff::<Never, i32, ()>::const_(x + 1);
        let lhs = Runtime::unsafe_run_sync(Eff::const_(41).chain(f), ());
        let rhs = Runtime::unsafe_run_sync(f(41), ());
        assert_eq!(lhs, rhs);
    }

    #[test]
    fn right_identity() {
        let m: Eff<Never, i32, ()> = Eff::const_(7);
        let lhs = Runtime::unsafe_run_sync(m.clone().chain(|x: i32| Eff::const_(x)), ());
        let rhs = Runtime::unsafe_run_sync(m, ());
        assert_eq!(lhs, rhs);
    }

    #[test]
    fn associativity() {
        let f = |x: i32| Eff::<Never, i32, ()>::const_(x + 1);
        let g = |x: i32| Eff::<Never, i32, ()>::const_(x * 2);
        let m: Eff<Never, i32, ()> = Eff::const_(3);
        let lhs = Runtime::unsafe_run_sync(m.clone().chain(f).chain(g), ());
        let rhs = Runtime::unsafe_run_sync(m.chain(move |x| f(x).chain(g)), ());
        assert_eq!(lhs, rhs);
    }

    // spec.md §8 property 2: Catch identity.
    #[test]
    fn catch_is_a_no_op_on_success() {
        let eff: Eff<&'static str, i32, ()> = Eff::const_(9).catch(|_| Eff::const_(0));
        assert_eq!(Runtime::unsafe_run_sync(eff, ()), Some(Outcome::Success(9)));
    }

    #[test]
    fn catch_invokes_the_handler_on_failure() {
        let eff: Eff<&'static str, i32, ()> = Eff::reject("boom").catch(|e| Eff::const_(e.len() as i32));
        assert_eq!(Runtime::unsafe_run_sync(eff, ()), Some(Outcome::Success(4)));
    }

    // spec.md §8 property 3: fork independence.
    #[test]
    fn forking_then_joining_yields_the_same_success_as_running_directly() {
        let direct: Eff<Never, i32, ()> = Eff::const_(5).map(|x: i32| x * 3);
        let forked: Eff<Never, i32, ()> =
            Eff::const_(5).map(|x: i32| x * 3).fork().chain(|f| f.join::<()>());
        assert_eq!(
            Runtime::unsafe_run_sync(direct, ()),
            Runtime::unsafe_run_sync(forked, ())
        );
    }
}
