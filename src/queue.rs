// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! [`Queue`] (`spec.md` C7): a bounded FIFO with suspending `take` and
//! non-blocking `try_offer`, plus a suspending `offer` for when the caller is
//! content to wait for room.
//!
//! `items` and `takers` are never both non-empty at a quiescent moment
//! (`spec.md` §3's Queue invariant): `offer` always checks `takers` first and
//! hands the value straight to a waiting taker instead of queuing it, and
//! `take` only ever consults `items`. A third internal list, `offer_waiters`,
//! holds offerers suspended on a full bounded queue; `take` admits the
//! longest-waiting one (if any) each time it frees a slot, preserving FIFO
//! order for blocked offerers too.
//!
//! Built out of the `Eff` algebra plus [`crate::sync::Await`], per the same
//! "no interpreter-internal shortcuts" design note as [`crate::sync`] and
//! [`crate::managed`]. `spec.md`'s `asStream` (an unfold over repeated
//! `take`) is out of scope here along with the rest of the core's streaming
//! adapters (`spec.md` §1 Non-goals); a caller wanting that can build it from
//! `take` directly.

use crate::eff::Eff;
use crate::error::{EffError, Never};
use crate::sync::Await;
use std::any::Any;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

struct Core<A> {
    capacity: usize,
    items: VecDeque<A>,
    takers: VecDeque<Await<Never, A>>,
    offer_waiters: VecDeque<(A, Await<Never, ()>)>,
}

/// A bounded (or effectively unbounded) FIFO queue (`spec.md` §4.6).
pub struct Queue<A> {
    core: Rc<RefCell<Core<A>>>,
}

impl<A> Clone for Queue<A> {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
        }
    }
}

impl<A: Any + Clone> Queue<A> {
    fn new(capacity: usize) -> Self {
        Self {
            core: Rc::new(RefCell::new(Core {
                capacity,
                items: VecDeque::new(),
                takers: VecDeque::new(),
                offer_waiters: VecDeque::new(),
            })),
        }
    }

    /// A queue that admits at most `capacity` queued items before `offer`
    /// starts suspending (`spec.md` §4.6 `bounded`).
    pub fn bounded<E, R>(capacity: usize) -> Eff<E, Self, R>
    where
        E: From<EffError> + 'static,
        R: 'static,
    {
        Eff::try_(move || Self::new(capacity))
    }

    /// A queue whose `offer` never suspends for capacity (`spec.md` §4.6
    /// `unbounded`, "cap = max safe integer").
    pub fn unbounded<E, R>() -> Eff<E, Self, R>
    where
        E: From<EffError> + 'static,
        R: 'static,
    {
        Self::bounded(usize::MAX)
    }

    /// Enqueues `a`, suspending if the queue is at capacity until a `take`
    /// frees a slot (`spec.md` §4.6 `offer`). Hands `a` directly to the
    /// longest-waiting `take` if one is already suspended, bypassing the
    /// backing store entirely.
    pub fn offer<E, R>(&self, a: A) -> Eff<E, (), R>
    where
        E: From<EffError> + Clone + 'static,
        R: 'static,
    {
        let core = self.core.clone();
        Eff::try_m(move || -> Eff<E, (), R> {
            let taker = core.borrow_mut().takers.pop_front();
            match taker {
                Some(taker) => taker.set::<R>(Eff::const_(a.clone())).void().widen::<E>(),
                None => {
                    let admitted = {
                        let mut core = core.borrow_mut();
                        if core.items.len() < core.capacity {
                            core.items.push_back(a.clone());
                            true
                        } else {
                            false
                        }
                    };
                    if admitted {
                        Eff::const_(())
                    } else {
                        let latch: Await<Never, ()> = Await::empty();
                        core.borrow_mut()
                            .offer_waiters
                            .push_back((a.clone(), latch.clone()));
                        latch.get::<R>().widen::<E>()
                    }
                }
            }
        })
    }

    /// Enqueues `a` without suspending: `true` if there was room (or a
    /// waiting taker to hand it to directly), `false` if the queue was
    /// already at capacity and `a` was not admitted. A supplement to
    /// `spec.md`'s `offer`, mirroring how `try_take`-style non-blocking
    /// variants are usually paired with a suspending primitive in this kind
    /// of API.
    pub fn try_offer<E, R>(&self, a: A) -> Eff<E, bool, R>
    where
        E: From<EffError> + Clone + 'static,
        R: 'static,
    {
        let core = self.core.clone();
        Eff::try_m(move || -> Eff<E, bool, R> {
            let taker = core.borrow_mut().takers.pop_front();
            match taker {
                Some(taker) => taker
                    .set::<R>(Eff::const_(a.clone()))
                    .void()
                    .const_value(true)
                    .widen::<E>(),
                None => {
                    let admitted = {
                        let mut core = core.borrow_mut();
                        if core.items.len() < core.capacity {
                            core.items.push_back(a.clone());
                            true
                        } else {
                            false
                        }
                    };
                    Eff::const_(admitted)
                }
            }
        })
    }

    /// Dequeues the oldest item, suspending if the queue is empty until an
    /// `offer` arrives (`spec.md` §4.6 `take`). Admits the longest-waiting
    /// blocked offerer, if any, into the slot this `take` just freed.
    pub fn take<E, R>(&self) -> Eff<E, A, R>
    where
        E: From<EffError> + Clone + 'static,
        R: 'static,
    {
        let core = self.core.clone();
        Eff::try_m(move || -> Eff<E, A, R> {
            let item = core.borrow_mut().items.pop_front();
            match item {
                Some(a) => {
                    let admitted = core.borrow_mut().offer_waiters.pop_front();
                    match admitted {
                        Some((value, latch)) => {
                            core.borrow_mut().items.push_back(value);
                            latch
                                .set::<R>(Eff::const_(()))
                                .void()
                                .widen::<E>()
                                .and(Eff::const_(a))
                        }
                        None => Eff::const_(a),
                    }
                }
                None => {
                    let taker: Await<Never, A> = Await::empty();
                    core.borrow_mut().takers.push_back(taker.clone());
                    taker.get::<R>().widen::<E>()
                }
            }
        })
    }

    /// `take`, `n` times, collecting results in order (`spec.md` §4.6
    /// `takeN`).
    pub fn take_n<E, R>(&self, n: usize) -> Eff<E, Vec<A>, R>
    where
        E: From<EffError> + Clone + 'static,
        R: 'static,
    {
        let queue = self.clone();
        (0..n).fold(Eff::const_(Vec::with_capacity(n)) as Eff<E, Vec<A>, R>, move |acc, _| {
            let queue = queue.clone();
            acc.chain(move |mut taken: Vec<A>| {
                queue.take::<E, R>().map(move |a: A| {
                    taken.push(a);
                    taken
                })
            })
        })
    }

    /// The number of items currently queued. A snapshot, not synchronized
    /// with any in-flight `take` (`spec.md` §4.6).
    pub fn size(&self) -> usize {
        self.core.borrow().items.len()
    }

    /// The queue's configured capacity (`usize::MAX` for `unbounded`).
    pub fn length(&self) -> usize {
        self.core.borrow().capacity
    }

    /// A snapshot of the queued items, oldest first.
    pub fn as_array(&self) -> Vec<A> {
        self.core.borrow().items.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Never, Outcome};
    use crate::runtime::Runtime;
    use std::time::Duration;

    #[test]
    fn offer_then_take_round_trips_in_fifo_order() {
        let eff: Eff<Never, Vec<i32>, ()> = Queue::<i32>::bounded::<Never, ()>(4).chain(|q: Queue<i32>| {
            q.offer::<Never, ()>(1)
                .and(q.offer::<Never, ()>(2))
                .and(q.offer::<Never, ()>(3))
                .and(q.take_n::<Never, ()>(3))
        });
        let outcome = Runtime::unsafe_run_sync(eff, ());
        assert_eq!(outcome, Some(Outcome::Success(vec![1, 2, 3])));
    }

    #[test]
    fn take_before_offer_suspends_until_offered() {
        let eff: Eff<Never, i32, ()> = Queue::<i32>::bounded::<Never, ()>(1).chain(|q: Queue<i32>| {
            let q2 = q.clone();
            q.take::<Never, ()>()
                .fork()
                .chain(move |taker: crate::fiber::Fiber<Never, i32>| {
                    q2.offer::<Never, ()>(9).chain(move |_| taker.join::<()>())
                })
        });
        let outcome = Runtime::unsafe_run_sync(eff, ());
        assert_eq!(outcome, Some(Outcome::Success(9)));
    }

    #[test]
    fn try_offer_reports_failure_once_full_and_offer_suspends_then_admits() {
        let scheduler = crate::scheduler::TestScheduler::new();
        let root = Runtime::unsafe_run_test(&scheduler, admits_blocked_offerer(), ());
        scheduler.advance(Duration::from_millis(0));
        let outcome = crate::fiber::peek_outcome(&root);
        assert_eq!(outcome, Some(Outcome::Success((false, 1, 2))));
    }

    fn admits_blocked_offerer() -> Eff<Never, (bool, i32, i32), ()> {
        Queue::<i32>::bounded::<Never, ()>(1).chain(|q: Queue<i32>| {
            let q_try = q.clone();
            q.try_offer::<Never, ()>(1).chain(move |_first_admitted: bool| {
                let q_try2 = q_try.clone();
                q_try.try_offer::<Never, ()>(2).chain(move |second_admitted: bool| {
                    let q_offer = q_try2.clone();
                    let q_take = q_try2.clone();
                    q_offer
                        .offer::<Never, ()>(2)
                        .fork()
                        .chain(move |offerer: crate::fiber::Fiber<Never, ()>| {
                            let q_take2 = q_take.clone();
                            // Let the offerer's own fiber actually run and
                            // suspend into `offer_waiters` before this fiber
                            // frees the slot; otherwise the fork's first tick
                            // and this fiber's own `take` race, and whichever
                            // runs first determines whether the offerer ever
                            // truly blocks.
                            crate::combinators::delay::<
                                Never,
                                (),
                                crate::scheduler::TestScheduler,
                            >(Duration::from_millis(0))
                            .chain(move |_| {
                                q_take.take::<Never, ()>().chain(move |first: i32| {
                                    offerer.join::<()>().chain(move |_| {
                                        q_take2.take::<Never, ()>().map(move |second: i32| {
                                            (second_admitted, first, second)
                                        })
                                    })
                                })
                            })
                        })
                })
            })
        })
    }

    #[test]
    fn size_length_and_as_array_reflect_a_snapshot() {
        let eff: Eff<Never, Queue<i32>, ()> = Queue::<i32>::bounded::<Never, ()>(5).chain(|q: Queue<i32>| {
            q.offer::<Never, ()>(1)
                .and(q.offer::<Never, ()>(2))
                .const_value(q)
        });
        let outcome = Runtime::unsafe_run_sync(eff, ());
        let queue = match outcome {
            Some(Outcome::Success(q)) => q,
            _ => panic!("expected Success"),
        };
        assert_eq!(queue.size(), 2);
        assert_eq!(queue.length(), 5);
        assert_eq!(queue.as_array(), vec![1, 2]);
    }
}
