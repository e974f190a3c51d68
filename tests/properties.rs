// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Property-based tests for the universal laws in `spec.md` §8: `once`
//! idempotence, `Managed` release counting, and Queue FIFO ordering, run
//! against randomized inputs via `proptest` rather than the fixed examples
//! already covered by each module's own `#[cfg(test)]` unit tests.

use std::cell::Cell;
use std::rc::Rc;

use effect_rt::{Eff, Managed, Never, Outcome, Queue, Runtime};
use proptest::prelude::*;

// spec.md §8 property 6: `once` idempotence. `e = counter.incr.once` forked
// K >= 2 times on the same runtime advances the counter exactly once.
proptest! {
    #[test]
    fn once_advances_the_counter_exactly_once(k in 2usize..12) {
        let counter = Rc::new(Cell::new(0));
        let inner_counter = counter.clone();
        let inner: Eff<Never, i32, ()> = Eff::try_(move || {
            inner_counter.set(inner_counter.get() + 1);
            inner_counter.get()
        });
        let memoized = effect_rt::combinators::once(inner);

        let observers: Vec<Eff<Never, i32, ()>> =
            (0..k).map(|_| memoized.clone()).collect();
        let joined = effect_rt::combinators::par(observers);

        let outcome = Runtime::unsafe_run_sync(joined, ());
        prop_assert_eq!(counter.get(), 1);
        match outcome {
            Some(Outcome::Success(values)) => {
                prop_assert!(values.iter().all(|&v| v == 1));
                prop_assert_eq!(values.len(), k);
            }
            other => prop_assert!(false, "expected Success, got {other:?}"),
        }
    }
}

// spec.md §8 property 7: Managed release count. For any sequence of use
// exits (success or failure), release invocations exactly equal acquire
// invocations.
proptest! {
    #[test]
    fn managed_release_count_matches_acquire_count(
        exits in prop::collection::vec(any::<bool>(), 1..20)
    ) {
        let acquired = Rc::new(Cell::new(0));
        let released = Rc::new(Cell::new(0));

        for succeeds in exits {
            let acquired = acquired.clone();
            let released = released.clone();
            let managed: Managed<&'static str, i32, ()> = Managed::make(
                Eff::try_(move || {
                    acquired.set(acquired.get() + 1);
                    acquired.get()
                }),
                move |_: i32| {
                    released.set(released.get() + 1);
                    Eff::const_(())
                },
            );
            let eff = managed.use_(move |a: i32| {
                if succeeds {
                    Eff::const_(a)
                } else {
                    Eff::reject("fail")
                }
            });
            let _ = Runtime::unsafe_run_sync(eff, ());
        }

        prop_assert_eq!(acquired.get(), released.get());
    }
}

/// Offers every value in `values` (in order) into `q`, then takes them all
/// back out, for use by both the concrete and property-based FIFO tests.
fn offer_then_take_all(q: &Queue<i32>, values: Vec<i32>) -> Eff<Never, Vec<i32>, ()> {
    let n = values.len();
    let offer_all = values.into_iter().fold(Eff::const_(()) as Eff<Never, (), ()>, {
        let q = q.clone();
        move |acc, v| {
            let q = q.clone();
            acc.and(q.offer::<Never, ()>(v))
        }
    });
    offer_all.and(q.take_n::<Never, ()>(n))
}

// spec.md §8 property 8: Queue FIFO. The sequence returned by `take`s equals
// the sequence passed to `offer`s.
proptest! {
    #[test]
    fn queue_take_order_matches_offer_order(values in prop::collection::vec(any::<i32>(), 0..50)) {
        let expected = values.clone();
        let n = values.len();
        let eff: Eff<Never, Vec<i32>, ()> =
            Queue::<i32>::bounded::<Never, ()>(n.max(1)).chain(move |q: Queue<i32>| {
                offer_then_take_all(&q, values.clone())
            });
        let outcome = Runtime::unsafe_run_sync(eff, ());
        prop_assert_eq!(outcome, Some(Outcome::Success(expected)));
    }
}

// A concrete, non-random exercise of the same law.
#[test]
fn queue_fifo_concrete_sequence() {
    let inputs = vec![10, 20, 30, 40, 50];
    let expected = inputs.clone();
    let eff: Eff<Never, Vec<i32>, ()> = Queue::<i32>::bounded::<Never, ()>(5)
        .chain(move |q: Queue<i32>| offer_then_take_all(&q, inputs.clone()));
    let outcome = Runtime::unsafe_run_sync(eff, ());
    assert_eq!(outcome, Some(Outcome::Success(expected)));
}
