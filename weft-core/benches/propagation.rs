//! Criterion benchmarks for change propagation.
//!
//! - Diamond: one source, two branches, one observed tip
//! - Fan-out: one source read by many observed atoms
//! - Batch: many dispatches folded into one transaction

use std::hint::black_box;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};

use weft_core::{Action, Atom, AtomMut, Context};

fn diamond(c: &mut Criterion) {
    let ctx = Context::new();
    let a = AtomMut::new(0_u64);
    let b = Atom::new({
        let a = a.clone();
        move |spy, _| Ok(spy.get(&a)? + 1)
    });
    let c2 = Atom::new({
        let a = a.clone();
        move |spy, _| Ok(spy.get(&a)? * 2)
    });
    let d = Atom::new(move |spy, _| Ok(spy.get(&b)? + spy.get(&c2)?));
    let _sub = ctx.subscribe(&d, |v| {
        black_box(v);
    })
    .unwrap();

    let mut n = 0;
    c.bench_function("diamond_set", |bench| {
        bench.iter(|| {
            n += 1;
            ctx.set(&a, n).unwrap();
        })
    });
}

fn fan_out(c: &mut Criterion) {
    let mut group = c.benchmark_group("fan_out_set");
    for width in [10_usize, 100, 1000] {
        let ctx = Context::new();
        let source = AtomMut::new(0_u64);
        let subs: Vec<_> = (0..width as u64)
            .map(|i| {
                let source = source.clone();
                let atom = Atom::new(move |spy, _| Ok(spy.get(&source)? + i));
                ctx.subscribe(&atom, |v| {
                    black_box(v);
                })
                .unwrap()
            })
            .collect();

        let mut n = 0;
        group.bench_with_input(BenchmarkId::from_parameter(width), &width, |bench, _| {
            bench.iter(|| {
                n += 1;
                ctx.set(&source, n).unwrap();
            })
        });
        drop(subs);
    }
    group.finish();
}

fn batched_dispatch(c: &mut Criterion) {
    let ctx = Context::new();
    let add: Action<u64> = Action::new();
    let total = Atom::new({
        let add = add.clone();
        move |spy, prev: Option<&u64>| {
            let added: u64 = spy.get(&add)?.iter().map(|call| call.payload).sum();
            Ok(prev.copied().unwrap_or(0) + added)
        }
    });
    let _sub = ctx.subscribe(&total, |v| {
        black_box(v);
    })
    .unwrap();

    c.bench_function("batch_100_dispatches", |bench| {
        bench.iter(|| {
            ctx.batch(|ctx| {
                for i in 0..100 {
                    ctx.dispatch(&add, i)?;
                }
                Ok(())
            })
            .unwrap();
        })
    });
}

criterion_group!(benches, diamond, fan_out, batched_dispatch);
criterion_main!(benches);
