//! Benchmarks for the hot string-conversion paths: every property write
//! crosses them, and recovery replays them for every persisted pair.

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use alice_warden::container::normalize_name;
use alice_warden::value::{parse_unit_uint, parse_uint_map, split_escaped, Value, ValueType};

fn bench_parse_unit(c: &mut Criterion) {
    c.bench_function("parse_unit_uint", |b| {
        b.iter(|| parse_unit_uint(black_box("32M")).unwrap())
    });
}

fn bench_parse_map(c: &mut Criterion) {
    let input = "cpu: 2; memory: 4G; net: 100M; io: 50M; pids: 4096";
    c.bench_function("parse_uint_map", |b| {
        b.iter(|| parse_uint_map(black_box(input)).unwrap())
    });
}

fn bench_split_escaped(c: &mut Criterion) {
    let input = "PATH=/bin;HOME=/root;MARK=a\\;b;TERM=xterm";
    c.bench_function("split_escaped", |b| {
        b.iter(|| split_escaped(black_box(input), ';'))
    });
}

fn bench_value_round_trip(c: &mut Criterion) {
    c.bench_function("uint_value_round_trip", |b| {
        b.iter(|| {
            let v = Value::parse(ValueType::Uint, black_box("1536K"), true).unwrap();
            black_box(v.format())
        })
    });
}

fn bench_normalize_name(c: &mut Criterion) {
    c.bench_function("normalize_name", |b| {
        b.iter(|| normalize_name(black_box("prod/web/worker-17")).unwrap())
    });
}

criterion_group!(
    benches,
    bench_parse_unit,
    bench_parse_map,
    bench_split_escaped,
    bench_value_round_trip,
    bench_normalize_name
);
criterion_main!(benches);
