//! Benchmarks for looper-runtime
//!
//! These measure the hot paths of the message runtime:
//! - Building and reading message entries
//! - Queue insertion and delivery through a running looper
//! - Synchronous request/reply round trips

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

use looper_runtime::{Handler, Looper, Message, StartOptions};

fn echo_looper() -> (Arc<Looper>, Arc<Handler>) {
    let looper = Looper::new();
    looper.set_name("bench-echo");
    looper.start(StartOptions::default()).unwrap();

    let handler = Handler::from_fn(|_, mut msg: Message| {
        if let Some(token) = msg.sender_awaits_response() {
            Message::new(msg.what()).post_reply(&token).unwrap();
        }
    });
    looper.register_handler(&handler).unwrap();
    (looper, handler)
}

// ============================================================================
// Message Benchmarks
// ============================================================================

fn bench_message_entries(c: &mut Criterion) {
    let mut group = c.benchmark_group("message_entries");

    group.bench_function("set_find_int32", |b| {
        b.iter(|| {
            let mut msg = Message::new(1);
            msg.set_int32("x", black_box(42));
            black_box(msg.find_int32("x"))
        })
    });

    group.bench_function("overwrite_same_key", |b| {
        let mut msg = Message::new(1);
        b.iter(|| {
            msg.set_int64("pts", black_box(7));
            msg.set_int32("pts", black_box(8));
        })
    });

    for entries in [8usize, 64, 256].iter() {
        group.bench_with_input(BenchmarkId::new("fill", entries), entries, |b, &n| {
            let keys: Vec<String> = (0..n).map(|i| format!("key-{}", i)).collect();
            b.iter(|| {
                let mut msg = Message::new(1);
                for (i, key) in keys.iter().enumerate() {
                    msg.set_size(key, i);
                }
                black_box(msg.count_entries())
            })
        });
    }

    group.finish();
}

// ============================================================================
// Delivery Benchmarks
// ============================================================================

fn bench_post_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("post_throughput");
    group.sample_size(30);

    for count in [100u64, 1000].iter() {
        group.throughput(Throughput::Elements(*count));
        group.bench_with_input(BenchmarkId::new("post_deliver", count), count, |b, &n| {
            let looper = Looper::new();
            looper.start(StartOptions::default()).unwrap();

            let delivered = Arc::new(AtomicU64::new(0));
            let handler = {
                let delivered = Arc::clone(&delivered);
                Handler::from_fn(move |_, _| {
                    delivered.fetch_add(1, Ordering::Release);
                })
            };
            looper.register_handler(&handler).unwrap();

            b.iter(|| {
                let target = delivered.load(Ordering::Acquire) + n;
                for what in 0..n {
                    handler.obtain_message(what as u32).post(0).unwrap();
                }
                while delivered.load(Ordering::Acquire) < target {
                    thread::yield_now();
                }
            });

            looper.stop().unwrap();
        });
    }

    group.finish();
}

fn bench_request_reply(c: &mut Criterion) {
    let mut group = c.benchmark_group("request_reply");

    group.bench_function("round_trip", |b| {
        let (looper, handler) = echo_looper();
        b.iter(|| {
            let reply = handler
                .obtain_message(black_box(3))
                .post_and_await_response()
                .unwrap();
            black_box(reply.what())
        });
        looper.stop().unwrap();
    });

    group.finish();
}

// ============================================================================
// Criterion Configuration
// ============================================================================

criterion_group!(message_benches, bench_message_entries);

criterion_group!(delivery_benches, bench_post_throughput, bench_request_reply);

criterion_main!(message_benches, delivery_benches);
