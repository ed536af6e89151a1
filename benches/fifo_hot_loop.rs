use criterion::{Criterion, criterion_group, criterion_main};
use ensemble_rt::io::SemFifo;
use std::hint::black_box;
use std::thread;
use std::time::Instant;

fn bench_put_get_uncontended(c: &mut Criterion) {
    let fifo = SemFifo::<u64>::new(1024);

    c.bench_function("semfifo_put_get_uncontended", |b| {
        b.iter(|| {
            fifo.try_put(black_box(1)).unwrap();
            black_box(fifo.try_get().unwrap())
        })
    });
}

fn bench_spsc_handoff(c: &mut Criterion) {
    c.bench_function("semfifo_spsc_handoff", |b| {
        b.iter_custom(|iters| {
            let fifo = SemFifo::<u64>::new(1024);

            let consumer = thread::spawn({
                let fifo = fifo.clone();
                move || {
                    let mut received = 0u64;
                    while fifo.get().is_some() {
                        received += 1;
                    }
                    received
                }
            });

            let start = Instant::now();
            for i in 0..iters {
                fifo.put(i).unwrap();
            }
            fifo.wait_for_empty(None);
            let elapsed = start.elapsed();

            fifo.release();
            assert_eq!(consumer.join().unwrap(), iters);

            elapsed
        })
    });
}

criterion_group!(benches, bench_put_get_uncontended, bench_spsc_handoff);
criterion_main!(benches);
