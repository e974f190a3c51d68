// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Derived combinators (`spec.md` §4.2's "Derived combinators" table):
//! `race`/`zip_with_par`/`par`/`par_n` built on [`race_with`], plus
//! `delay`/`timeout`/`once`/`seq`/`from_result`/`uninterruptible`. None of
//! these add new interpreter semantics: they are all ordinary compositions
//! of the constructors in [`crate::eff`].

use crate::eff::{AsyncCtx, Eff};
use crate::error::Outcome;
use crate::fiber::Fiber;
use crate::runtime::Runtime;
use crate::scheduler::Scheduler;
use crate::sync::Await;
use std::any::Any;
use std::rc::Rc;
use std::time::Duration;

/// The canonical primitive underlying `race`/`zip`/`par`/`zip_with_par`
/// (`spec.md` §4.3 "raceWith"):
///
/// 1. Fork `a` and `b`.
/// 2. Create a shared `Await`.
/// 3. Whichever of `a`/`b` completes first runs its callback with its own
///    exit and the *other* fiber's handle; the result is `set` on the shared
///    `Await`.
/// 4. The loser's callback, when it eventually fires, finds the `Await`
///    already set and is a no-op (`Await::set`'s "first write wins").
///
/// Single-threaded cooperative scheduling means step 3 can never interleave
/// between the two branches, so "whichever fires first" is well-defined
/// without any additional synchronization (`spec.md` §4.3's tie-break note).
pub fn race_with<E, A, B, C, R>(
    a: Eff<E, A, R>,
    b: Eff<E, B, R>,
    cb1: impl Fn(Outcome<E, A>, Fiber<E, B>) -> Eff<E, C, R> + 'static,
    cb2: impl Fn(Outcome<E, B>, Fiber<E, A>) -> Eff<E, C, R> + 'static,
) -> Eff<E, C, R>
where
    E: From<crate::error::EffError> + Clone + 'static,
    A: Any + Clone,
    B: Any + Clone,
    C: Any + Clone,
    R: Any + Clone + 'static,
{
    let cb1 = Rc::new(cb1);
    let cb2 = Rc::new(cb2);
    a.fork().chain(move |fa: Fiber<E, A>| {
        let b = b.clone();
        let cb1 = cb1.clone();
        let cb2 = cb2.clone();
        let fa_outer = fa.clone();
        b.fork().chain(move |fb: Fiber<E, B>| {
            let fa = fa_outer.clone();
            let cb1 = cb1.clone();
            let cb2 = cb2.clone();
            Await::<E, C>::of::<R>().chain(move |done: Await<E, C>| {
                let done_a = done.clone();
                let fb_for_a = fb.clone();
                let cb1 = cb1.clone();
                // `await_` is a `Uio` regardless of `fa`'s own error channel;
                // widen it back to `E` before composing the rest of the
                // pipeline in that channel.
                let observe_a = fa.clone().await_::<R>().widen::<E>().chain(move |exit| {
                    let outcome = outcome_of(exit);
                    let done_ok = done_a.clone();
                    let done_err = done_a.clone();
                    cb1(outcome, fb_for_a.clone())
                        .chain(move |c: C| done_ok.set::<R>(Eff::const_(c)).void())
                        .catch(move |e: E| done_err.set::<R>(Eff::reject(e)).void())
                });

                let done_b = done.clone();
                let fa_for_b = fa.clone();
                let cb2 = cb2.clone();
                let observe_b = fb.clone().await_::<R>().widen::<E>().chain(move |exit| {
                    let outcome = outcome_of(exit);
                    let done_ok = done_b.clone();
                    let done_err = done_b.clone();
                    cb2(outcome, fa_for_b.clone())
                        .chain(move |c: C| done_ok.set::<R>(Eff::const_(c)).void())
                        .catch(move |e: E| done_err.set::<R>(Eff::reject(e)).void())
                });

                observe_a
                    .fork()
                    .void()
                    .and(observe_b.fork().void())
                    .and(done.get::<R>())
            })
        })
    })
}

fn outcome_of<A, E>(exit: Option<Result<A, E>>) -> Outcome<E, A> {
    match exit {
        Some(Ok(a)) => Outcome::Success(a),
        Some(Err(e)) => Outcome::Failure(e),
        None => Outcome::Interrupted,
    }
}

/// Races `a` against `b`; the winner's exit becomes the result and the loser
/// is aborted (`spec.md` §4.2 `race` row, §5 "`race` aborts the losing
/// fiber").
pub fn race<E, A, R>(a: Eff<E, A, R>, b: Eff<E, A, R>) -> Eff<E, A, R>
where
    E: From<crate::error::EffError> + Clone + 'static,
    A: Any + Clone,
    R: Any + Clone + 'static,
{
    race_with(
        a,
        b,
        |exit: Outcome<E, A>, loser: Fiber<E, A>| loser.abort::<R>().and(Eff::from_outcome(exit)),
        |exit: Outcome<E, A>, loser: Fiber<E, A>| loser.abort::<R>().and(Eff::from_outcome(exit)),
    )
}

/// Runs `a` and `b` to completion concurrently and combines their results
/// with `f`, applied in the effects' declared (left, right) order regardless
/// of which side actually finished first (`spec.md` §4.3 Ordering
/// guarantees). If either side fails or is interrupted, the other is
/// aborted and that outcome propagates (`spec.md` §5: "`parN`/`par` abort
/// siblings on first error").
pub fn zip_with_par<E, A, B, C, R>(
    a: Eff<E, A, R>,
    b: Eff<E, B, R>,
    f: impl Fn(A, B) -> C + 'static,
) -> Eff<E, C, R>
where
    E: From<crate::error::EffError> + Clone + 'static,
    A: Any + Clone,
    B: Any + Clone,
    C: Any + Clone,
    R: Any + Clone + 'static,
{
    let f = Rc::new(f);
    let f_a = f.clone();
    let f_b = f;
    race_with(
        a,
        b,
        move |exit: Outcome<E, A>, loser: Fiber<E, B>| -> Eff<E, C, R> {
            let f = f_a.clone();
            match exit {
                Outcome::Success(av) => loser.join::<R>().map(move |bv| f(av.clone(), bv)),
                Outcome::Failure(e) => loser.abort::<R>().and(Eff::reject(e)),
                Outcome::Interrupted => loser.abort::<R>().and(Eff::from_outcome(Outcome::Interrupted)),
            }
        },
        move |exit: Outcome<E, B>, loser: Fiber<E, A>| -> Eff<E, C, R> {
            let f = f_b.clone();
            match exit {
                Outcome::Success(bv) => loser.join::<R>().map(move |av| f(av, bv.clone())),
                Outcome::Failure(e) => loser.abort::<R>().and(Eff::reject(e)),
                Outcome::Interrupted => loser.abort::<R>().and(Eff::from_outcome(Outcome::Interrupted)),
            }
        },
    )
}

/// Runs every effect in `effs` concurrently, collecting results in their
/// original order (`spec.md` §4.2 `par` row: "left fold by `zipWithPar`").
pub fn par<E, A, R>(effs: Vec<Eff<E, A, R>>) -> Eff<E, Vec<A>, R>
where
    E: From<crate::error::EffError> + Clone + 'static,
    A: Any + Clone,
    R: Any + Clone + 'static,
{
    effs.into_iter().fold(Eff::const_(Vec::new()), |acc, eff| {
        zip_with_par(acc, eff, |mut v: Vec<A>, a: A| {
            v.push(a);
            v
        })
    })
}

/// `par`, chunked so at most `n` effects run concurrently at a time
/// (`spec.md` §4.2 `parN` row).
pub fn par_n<E, A, R>(n: usize, effs: Vec<Eff<E, A, R>>) -> Eff<E, Vec<A>, R>
where
    E: From<crate::error::EffError> + Clone + 'static,
    A: Any + Clone,
    R: Any + Clone + 'static,
{
    let chunk_size = n.max(1);
    let chunks: Vec<Vec<Eff<E, A, R>>> = effs
        .chunks(chunk_size)
        .map(<[Eff<E, A, R>]>::to_vec)
        .collect();
    chunks.into_iter().fold(Eff::const_(Vec::new()), |acc, chunk| {
        acc.chain(move |mut all: Vec<A>| {
            let chunk = chunk.clone();
            par(chunk).map(move |mut v: Vec<A>| {
                all.append(&mut v);
                all
            })
        })
    })
}

/// Sequences every effect in `effs`, left to right, collecting results in
/// order (`spec.md` §4.2 `seq` row: "left fold by `Chain`").
pub fn seq<E, A, R>(effs: Vec<Eff<E, A, R>>) -> Eff<E, Vec<A>, R>
where
    E: From<crate::error::EffError> + 'static,
    A: Any + Clone,
    R: 'static,
{
    effs.into_iter().fold(Eff::const_(Vec::new()), |acc, eff| {
        acc.chain(move |mut v: Vec<A>| {
            eff.clone().map(move |a: A| {
                v.push(a);
                v
            })
        })
    })
}

/// Builds an `Eff` from a `Result`: `Ok(a)` succeeds with `a`, `Err(e)` fails
/// with `e` (`spec.md` §4.2's `fromEither`, spelled the Rust way).
pub fn from_result<E, A, R>(result: Result<A, E>) -> Eff<E, A, R>
where
    E: Clone + 'static,
    A: Any + Clone,
    R: 'static,
{
    match result {
        Ok(a) => Eff::const_(a),
        Err(e) => Eff::reject(e),
    }
}

/// Suspends for at least `ms`, then succeeds with `()` (`spec.md` §4.2
/// `delay(ms)`).
///
/// Generic over the scheduler type `S` for the same reason
/// [`Eff::runtime`](crate::eff::Eff::runtime) is: scheduling the resumption
/// requires calling the concrete [`Scheduler::delay`], which the `Eff`
/// algebra only exposes once a `Runtime<S>` has been pulled out of the
/// ambient environment.
pub fn delay<E, R, S>(ms: Duration) -> Eff<E, (), R>
where
    E: 'static,
    R: 'static,
    S: Scheduler,
{
    Eff::runtime::<S>().chain(move |rt: Runtime<S>| {
        Eff::async_(move |ctx: AsyncCtx<E>| {
            rt.scheduler()
                .delay(Box::new(move || ctx.resolve(())), ms)
        })
    })
}

/// Suspends for at least `ms`, then succeeds with `v` (`spec.md` §4.2
/// `timeout(v, ms)`).
pub fn timeout<E, A, R, S>(v: A, ms: Duration) -> Eff<E, A, R>
where
    E: 'static,
    A: Any + Clone,
    R: 'static,
    S: Scheduler,
{
    delay::<E, R, S>(ms).const_value(v)
}

/// Lazily memoizes `eff`: the first caller (whether through a direct call,
/// a `fork`, or any other path that reduces this node) forks the inner
/// effect exactly once and stores a replay of its *exit* in a shared
/// [`Await`]; every caller, including the first, observes that single shared
/// outcome without re-running `eff`'s body (`spec.md` §4.2 `once` row, §8
/// property 6).
pub fn once<E, A, R>(eff: Eff<E, A, R>) -> Eff<E, A, R>
where
    E: From<crate::error::EffError> + Clone + 'static,
    A: Any + Clone,
    R: Any + Clone + 'static,
{
    let slot: Rc<std::cell::RefCell<Option<Await<E, A>>>> = Rc::new(std::cell::RefCell::new(None));
    Eff::try_m(move || -> Eff<E, A, R> {
        let existing = slot.borrow().clone();
        match existing {
            Some(awaited) => awaited.get(),
            None => {
                let fresh: Await<E, A> = Await::empty();
                *slot.borrow_mut() = Some(fresh.clone());
                let fresh_for_get = fresh.clone();
                // Fork the body once and await its exit, then store a pure
                // `Const`/`Reject` replay of that exit rather than the body
                // itself: `Await::get` re-forks whatever is stored on every
                // observation, so storing the body would re-run it once per
                // observer instead of sharing a single run.
                eff.clone().fork().chain(move |f: Fiber<E, A>| {
                    let fresh = fresh.clone();
                    let fresh_for_get = fresh_for_get.clone();
                    f.await_::<R>().widen::<E>().chain(move |exit| {
                        let replay: Eff<E, A, ()> = Eff::from_outcome(outcome_of(exit));
                        let fresh_for_get = fresh_for_get.clone();
                        fresh.set::<R>(replay).chain(move |_| fresh_for_get.get())
                    })
                })
            }
        }
    })
}

/// Forks `eff` and joins it, so that aborting the *caller's* fiber never
/// cancels `eff` itself: only the caller's own wait for it is cut short
/// (`spec.md` §4.2's `uninterruptibleIO` adapter).
pub fn uninterruptible<E, A, R>(eff: Eff<E, A, R>) -> Eff<E, A, R>
where
    E: Clone + 'static,
    A: Any + Clone,
    R: Any + Clone + 'static,
{
    eff.fork().chain(|f: Fiber<E, A>| f.join::<R>())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Never;
    use crate::runtime::Runtime;
    use crate::scheduler::TestScheduler;
    use std::cell::Cell;
    use std::time::Duration;

    #[test]
    fn race_picks_the_earlier_delay() {
        let scheduler = TestScheduler::new();
        let a: Eff<Never, &'static str, ()> = delay::<Never, (), TestScheduler>(Duration::from_millis(10))
            .const_value("a");
        let b: Eff<Never, &'static str, ()> = delay::<Never, (), TestScheduler>(Duration::from_millis(30))
            .const_value("b");
        let fiber = Runtime::unsafe_run_test(&scheduler, race(a, b), ());
        scheduler.advance(Duration::from_millis(50));
        assert_eq!(
            crate::fiber::peek_outcome(&fiber),
            Some(Outcome::Success("a"))
        );
    }

    #[test]
    fn zip_with_par_combines_in_declared_order() {
        let scheduler = TestScheduler::new();
        let fast: Eff<Never, i32, ()> =
            delay::<Never, (), TestScheduler>(Duration::from_millis(5)).const_value(1);
        let slow: Eff<Never, i32, ()> =
            delay::<Never, (), TestScheduler>(Duration::from_millis(20)).const_value(2);
        let zipped = zip_with_par(fast, slow, |a: i32, b: i32| (a, b));
        let fiber = Runtime::unsafe_run_test(&scheduler, zipped, ());
        scheduler.advance(Duration::from_millis(50));
        assert_eq!(
            crate::fiber::peek_outcome(&fiber),
            Some(Outcome::Success((1, 2)))
        );
    }

    #[test]
    fn par_collects_in_original_order() {
        let effs: Vec<Eff<Never, i32, ()>> = vec![Eff::const_(1), Eff::const_(2), Eff::const_(3)];
        let outcome = Runtime::unsafe_run_sync(par(effs), ());
        assert_eq!(outcome, Some(Outcome::Success(vec![1, 2, 3])));
    }

    #[test]
    fn seq_collects_in_order() {
        let effs: Vec<Eff<Never, i32, ()>> = vec![Eff::const_(1), Eff::const_(2), Eff::const_(3)];
        let outcome = Runtime::unsafe_run_sync(seq(effs), ());
        assert_eq!(outcome, Some(Outcome::Success(vec![1, 2, 3])));
    }

    #[test]
    fn once_runs_the_inner_effect_exactly_once() {
        let counter = Rc::new(Cell::new(0));
        let counter2 = counter.clone();
        let inner: Eff<Never, i32, ()> = Eff::try_(move || {
            counter2.set(counter2.get() + 1);
            counter2.get()
        });
        let memoized = once(inner);
        let m2 = memoized.clone();
        let combined = memoized.chain(move |a: i32| m2.clone().map(move |b: i32| (a, b)));
        let outcome = Runtime::unsafe_run_sync(combined, ());
        assert_eq!(outcome, Some(Outcome::Success((1, 1))));
        assert_eq!(counter.get(), 1);
    }
}
