// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! [`Await`] (`spec.md` C5): a single-assignment one-shot latch carrying an
//! effect rather than a plain value. First `set` wins; concurrent `get`s
//! suspend until the first `set`.
//!
//! Built entirely out of the `Eff` algebra (`try_`/`try_m`/`chain`/`fork`)
//! plus a shared `RefCell` cell, per `spec.md` §3's closing note that
//! `Await`/`Managed`/`Queue` "are implemented strictly in terms of the `Eff`
//! algebra plus mutable cells accessed via controlled effectful operations".
//! None of this module reaches into `crate::interpreter`.

use crate::eff::{AsyncCtx, Eff};
use crate::error::EffError;
use std::any::Any;
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

type Waiter<E, A> = Box<dyn FnOnce(Eff<E, A, ()>) -> Eff<E, (), ()>>;

enum State<E, A> {
    Empty(Vec<Waiter<E, A>>),
    Set(Eff<E, A, ()>),
}

/// A one-shot latch carrying an effect. See the module docs and `spec.md`
/// §4.4.
pub struct Await<E, A> {
    core: Rc<RefCell<State<E, A>>>,
}

impl<E, A> Clone for Await<E, A> {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
        }
    }
}

impl<E, A> fmt::Debug for Await<E, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &*self.core.borrow() {
            State::Empty(waiters) => format!("Empty({} waiters)", waiters.len()),
            State::Set(_) => "Set".to_string(),
        };
        f.debug_struct("Await").field("state", &state).finish()
    }
}

impl<E, A> Await<E, A>
where
    E: From<EffError> + Clone + 'static,
    A: Any + Clone,
{
    /// Constructs an empty latch directly, without going through the `of`
    /// effect. Used internally by [`crate::combinators::once`], which needs a
    /// fresh `Await` available synchronously inside a `try_m` body before it
    /// can compose the `set`/`get` effects around it.
    pub(crate) fn empty() -> Self {
        Self {
            core: Rc::new(RefCell::new(State::Empty(Vec::new()))),
        }
    }

    /// Constructs an empty latch (`spec.md` §4.4 `of`). A `Try`, not a
    /// `Const`, so that forking or otherwise re-evaluating the returned `Eff`
    /// more than once yields a fresh `Await` each time rather than sharing
    /// one instance across evaluations.
    pub fn of<R: 'static>() -> Eff<E, Self, R> {
        Eff::try_(Self::empty)
    }

    /// If the cell is empty: stores `eff` and forks it once per current
    /// waiter (each waiter gets its own evaluation, wired to resume that
    /// waiter's suspended `get`), then returns `true`. If the cell is
    /// already set, this is a no-op returning `false` (`spec.md` §4.4: "`set`
    /// succeeds at most once per Await").
    pub fn set<R: 'static>(&self, eff: Eff<E, A, ()>) -> Eff<E, bool, R> {
        let core = self.core.clone();
        Eff::try_m(move || -> Eff<E, bool, R> {
            let waiters = {
                let mut state = core.borrow_mut();
                if matches!(&*state, State::Set(_)) {
                    None
                } else {
                    match std::mem::replace(&mut *state, State::Set(eff.clone())) {
                        State::Empty(waiters) => Some(waiters),
                        State::Set(_) => unreachable!("just checked Set above"),
                    }
                }
            };
            match waiters {
                None => Eff::const_(false),
                Some(waiters) => {
                    let wake_all = waiters.into_iter().fold(
                        Eff::const_(()) as Eff<E, (), ()>,
                        |acc, waiter| acc.and(waiter(eff.clone()).fork().void()),
                    );
                    wake_all.contramap_env(|_: &R| ()).const_value(true)
                }
            }
        })
    }

    /// Resumes with the stored effect's own evaluation: if the cell is
    /// already set, forks a fresh evaluation of the stored effect for this
    /// caller and joins it (so concurrent callers each get an independent
    /// run); if empty, suspends until the first `set`, at which point its
    /// own fresh evaluation is forked and joined the same way (`spec.md`
    /// §4.4 `get`).
    pub fn get<R: 'static>(&self) -> Eff<E, A, R> {
        self.get_with_cancel(Rc::new(|| {}))
    }

    /// Like [`get`][Self::get], but if the caller is still suspended waiting
    /// (the `Empty` branch) when its own fiber is aborted, `on_cancel` runs
    /// as part of that abort, before this caller's own fiber completes.
    ///
    /// Used by [`crate::managed::Managed::use_`] to cascade the abort of the
    /// fiber running `use_` into an abort of the forked body fiber (`spec.md`
    /// §4.5, §9 "Awaiter + mutable cells").
    pub(crate) fn get_with_cancel<R: 'static>(&self, on_cancel: Rc<dyn Fn()>) -> Eff<E, A, R> {
        let core = self.core.clone();
        Eff::try_m(move || -> Eff<E, A, R> {
            let stored = match &*core.borrow() {
                State::Set(eff) => Some(eff.clone()),
                State::Empty(_) => None,
            };
            match stored {
                Some(eff) => eff
                    .contramap_env(|_: &R| ())
                    .fork()
                    .chain(|f| f.join::<R>()),
                None => {
                    let core = core.clone();
                    let on_cancel = on_cancel.clone();
                    Eff::async_(move |ctx: AsyncCtx<E>| {
                        let ctx = ctx.clone();
                        let waiter: Waiter<E, A> = Box::new(move |eff: Eff<E, A, ()>| {
                            let ctx = ctx.clone();
                            eff.fork().chain(move |f| {
                                let ctx = ctx.clone();
                                // `await_` is a `Uio`; widen its `Never`
                                // channel back to `E`.
                                f.await_::<()>()
                                    .chain(move |exit| {
                                        match exit {
                                            Some(Ok(a)) => ctx.resolve(a),
                                            Some(Err(e)) => ctx.reject(e),
                                            // An interrupted waiter's fork
                                            // never resolves this observer.
                                            None => {}
                                        }
                                        Eff::const_(())
                                    })
                                    .widen::<E>()
                            })
                        });
                        // Empty check and registration run in the same tick.
                        match &mut *core.borrow_mut() {
                            State::Empty(waiters) => waiters.push(waiter),
                            State::Set(_) => unreachable!(
                                "Await state cannot change between the Empty check and registration on a single-threaded scheduler"
                            ),
                        }
                        let on_cancel = on_cancel.clone();
                        crate::scheduler::CancelHandle::new(move || on_cancel())
                    })
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Never;
    use crate::runtime::Runtime;
    use std::cell::Cell;

    #[test]
    fn set_then_get_resolves() {
        let eff: Eff<Never, i32, ()> = Await::<Never, i32>::of::<()>().chain(|awaited: Await<Never, i32>| {
            awaited
                .set::<()>(Eff::const_(42))
                .chain(move |_| awaited.get())
        });
        let outcome = Runtime::unsafe_run_sync(eff, ());
        assert_eq!(outcome, Some(crate::error::Outcome::Success(42)));
    }

    #[test]
    fn get_before_set_suspends_until_set() {
        let counter = Rc::new(Cell::new(0));
        let counter2 = counter.clone();

        let eff: Eff<Never, (i32, i32), ()> = Await::<Never, i32>::of::<()>().chain(move |awaited: Await<Never, i32>| {
            let awaited2 = awaited.clone();
            let reader: Eff<Never, i32, ()> = awaited.get().map(move |v: i32| {
                counter2.set(counter2.get() + 1);
                v
            });
            reader.fork().chain(move |f: crate::fiber::Fiber<Never, i32>| {
                awaited2
                    .set::<()>(Eff::const_(7))
                    .chain(move |_| f.join::<()>())
                    .map(|a: i32| (a, a))
            })
        });
        let outcome = Runtime::unsafe_run_sync(eff, ());
        assert_eq!(outcome, Some(crate::error::Outcome::Success((7, 7))));
        assert_eq!(counter.get(), 1);
    }

    #[test]
    fn second_set_is_a_no_op() {
        let eff: Eff<Never, bool, ()> = Await::<Never, i32>::of::<()>().chain(|awaited: Await<Never, i32>| {
            awaited
                .set::<()>(Eff::const_(1))
                .chain(move |_| awaited.set::<()>(Eff::const_(2)))
        });
        let outcome = Runtime::unsafe_run_sync(eff, ());
        assert_eq!(outcome, Some(crate::error::Outcome::Success(false)));
    }
}
