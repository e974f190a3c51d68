// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use criterion::{criterion_group, criterion_main, Criterion};
use effect_rt::{Eff, Runtime};

/// A chain of `n` synchronous `Chain` nodes, to measure the trampoline's
/// per-step overhead in isolation from any scheduler round-trip.
fn chain_of(n: usize) -> Eff<effect_rt::Never, u64, ()> {
    (0..n).fold(Eff::const_(0u64), |acc, _| acc.map(|x: u64| x + 1))
}

fn chain_1k(c: &mut Criterion) {
    c.bench_function("chain_1k", |b| {
        b.iter(|| Runtime::unsafe_run_sync(chain_of(1_000), ()));
    });
}

/// Forks `n` independent child fibers and joins each in turn, measuring the
/// `Fork`/`asap`/`join` round trip this crate's concurrency is built from.
fn fork_join_n(n: usize) -> Eff<effect_rt::Never, u64, ()> {
    (0..n).fold(Eff::const_(0u64), |acc, i| {
        acc.chain(move |sum: u64| {
            Eff::const_(i as u64)
                .fork()
                .chain(move |f| f.join::<()>().map(move |v: u64| sum + v))
        })
    })
}

fn fork_join_1k(c: &mut Criterion) {
    c.bench_function("fork_join_1k", |b| {
        b.iter(|| Runtime::unsafe_run_sync(fork_join_n(1_000), ()));
    });
}

criterion_group!(fork_join, chain_1k, fork_join_1k);
criterion_main!(fork_join);
