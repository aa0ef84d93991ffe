//! Event pool throughput: insertion and head-of-line extraction.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use quantum_repeater_sim::event::Event;
use quantum_repeater_sim::pool::EventPool;
use quantum_repeater_sim::rng::SimRng;
use quantum_repeater_sim::time::Time;

fn bench_pool(c: &mut Criterion) {
    c.bench_function("pool_add_pop_10k", |b| {
        let mut rng = SimRng::from_seed(0);
        let times: Vec<i64> = (0..10_000).map(|_| rng.pick(1_000_000) as i64).collect();
        b.iter(|| {
            let mut pool: EventPool<usize> =
                EventPool::new(Time::new(0, 1_000_000), Some(Time::new(1_000_000, 1_000_000)));
            for (id, t) in times.iter().enumerate() {
                pool.add(Event::new(Time::new(*t, 1_000_000), id));
            }
            let mut drained = 0usize;
            while let Some(event) = pool.pop_head() {
                drained += black_box(event.into_payload());
            }
            black_box(drained)
        });
    });

    c.bench_function("pool_interleaved_add_pop", |b| {
        let mut rng = SimRng::from_seed(1);
        let offsets: Vec<i64> = (0..10_000).map(|_| 1 + rng.pick(1000) as i64).collect();
        b.iter(|| {
            let mut pool: EventPool<usize> = EventPool::new(Time::new(0, 1_000_000), None);
            pool.add(Event::new(Time::new(0, 1_000_000), 0));
            for (id, offset) in offsets.iter().enumerate() {
                let head = pool.pop_head().expect("pool primed");
                pool.add(Event::new(
                    Time::new(head.time().ticks() + offset, 1_000_000),
                    id,
                ));
            }
            black_box(pool.len())
        });
    });
}

criterion_group!(benches, bench_pool);
criterion_main!(benches);
