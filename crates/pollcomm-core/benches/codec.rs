use criterion::{black_box, criterion_group, criterion_main, Criterion};
use pollcomm_core::message::Message;

const SAMPLE: &str = "<alpha:images beta:snapwatch/STATUS cpu=13;memory=2048;note=\"a;b\";path=/var/log/x";

fn bench_parse(c: &mut Criterion) {
    c.bench_function("parse", |b| {
        b.iter(|| Message::parse(black_box(SAMPLE)))
    });
}

fn bench_serialize(c: &mut Criterion) {
    let msg = Message::parse(SAMPLE).unwrap();
    c.bench_function("serialize_cold", |b| {
        b.iter(|| {
            let fresh = black_box(&msg).clone();
            let mut copy = fresh;
            copy.add_parameter("seq", 1).unwrap();
            copy.to_message()
        })
    });
    c.bench_function("serialize_cached", |b| {
        b.iter(|| black_box(&msg).to_message())
    });
}

criterion_group!(benches, bench_parse, bench_serialize);
criterion_main!(benches);
