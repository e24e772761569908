//! Wire codec and tree engine benchmarks.
//!
//! The varint and field paths sit under every tree operation; parse and
//! serialize measure the full engine including the eval-size cache.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use knvtree::encoding::{decode_varint, field_len, varint_len, FieldReader, FieldWriter};
use knvtree::{Key, KnvArena, WireType};

fn bench_varint(c: &mut Criterion) {
    let mut group = c.benchmark_group("varint");

    let values: &[(u64, &str)] = &[
        (0, "zero"),
        (127, "1_byte_max"),
        (16383, "2_byte_max"),
        (268435455, "4_byte_max"),
        (u64::MAX, "max_u64"),
    ];

    for &(value, name) in values {
        group.bench_with_input(BenchmarkId::new("eval_len", name), &value, |b, &v| {
            b.iter(|| varint_len(black_box(v)))
        });
        group.bench_with_input(BenchmarkId::new("decode", name), &value, |b, &v| {
            let mut buf = [0u8; 16];
            let mut w = FieldWriter::new(&mut buf);
            w.put_varint(1, v).unwrap();
            b.iter(|| decode_varint(black_box(&buf[1..])).unwrap())
        });
    }

    group.finish();
}

fn bench_field_writer(c: &mut Criterion) {
    let mut group = c.benchmark_group("field_writer");
    let payload = vec![0x5Au8; 256];

    group.bench_function("put_bytes_256", |b| {
        let mut buf = [0u8; 512];
        b.iter(|| {
            let mut w = FieldWriter::new(&mut buf);
            w.put_bytes(black_box(101), black_box(&payload)).unwrap();
            w.written()
        })
    });
    group.bench_function("eval_field_len", |b| {
        b.iter(|| field_len(black_box(3501), WireType::Bytes, 0, black_box(256)))
    });
    group.finish();
}

fn sample_record(arena: &mut KnvArena, children: u64) -> Vec<u8> {
    let root = arena.new_tree(3501, Key::from_int(12345678)).unwrap();
    for i in 0..children {
        let sub = arena.insert_subnode(root, 11, Key::from_int(i)).unwrap();
        arena.insert_str_leaf(sub, 101, b"Shaneyu").unwrap();
        arena.insert_int_leaf(sub, 102, 19801010 + i).unwrap();
    }
    let bytes = arena.serialize(root, true).unwrap();
    arena.release(root);
    bytes
}

fn bench_tree(c: &mut Criterion) {
    let mut group = c.benchmark_group("tree");

    for &n in &[4u64, 64, 512] {
        let mut arena = KnvArena::new();
        let bytes = sample_record(&mut arena, n);

        group.bench_with_input(BenchmarkId::new("parse_and_find", n), &bytes, |b, bytes| {
            b.iter(|| {
                let mut arena = KnvArena::new();
                let root = arena.parse(black_box(bytes)).unwrap();
                let child = arena.find_child(root, 11, &Key::from_int(n / 2)).unwrap();
                let v = arena.child_int(child, 102);
                arena.release(root);
                v
            })
        });

        group.bench_with_input(BenchmarkId::new("reader_walk", n), &bytes, |b, bytes| {
            b.iter(|| {
                let mut r = FieldReader::new(black_box(bytes));
                let mut count = 0u32;
                while let Ok(Some(_)) = r.next_field() {
                    count += 1;
                }
                count
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_varint, bench_field_writer, bench_tree);
criterion_main!(benches);
