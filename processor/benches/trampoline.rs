use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use doeff_processor::{effects, run, DoExpr, Value};

/// A bind chain of the given depth, built lazily so construction cost stays out of the way.
fn chain(depth: i64) -> DoExpr {
    if depth == 0 {
        DoExpr::pure(0)
    } else {
        DoExpr::pure(depth)
            .flat_map(|value| Ok(chain(value.as_int()? - 1)))
    }
}

fn bench_bind_chain(c: &mut Criterion) {
    c.bench_function("bind_chain_10k", |b| {
        b.iter_batched(
            || chain(10_000),
            |program| run(program).unwrap().unwrap_value(),
            BatchSize::SmallInput,
        )
    });
}

fn bench_state_effects(c: &mut Criterion) {
    c.bench_function("state_counter_1k", |b| {
        b.iter_batched(
            || {
                let mut program = effects::put("n", 0);
                for _ in 0..1_000 {
                    program = program
                        .then(effects::modify("n", |v| Ok(Value::Int(v.as_int()? + 1))));
                }
                program.then(effects::get("n"))
            },
            |program| run(program).unwrap().unwrap_value(),
            BatchSize::SmallInput,
        )
    });
}

criterion_group!(benches, bench_bind_chain, bench_state_effects);
criterion_main!(benches);
