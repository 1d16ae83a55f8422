//! Benchmark: group insert, lookup and iteration throughput.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use rustyhdf5_symtab::btree::IterStatus;
use rustyhdf5_symtab::stab::{self, IterOrder};
use rustyhdf5_symtab::{File, FileAccessProps, FileCreateProps, LinkTarget, ObjectType};

fn names(n: usize) -> Vec<String> {
    // Spread inserts across the tree instead of always appending.
    (0..n).map(|i| format!("dataset_{:06}", (i * 7919) % n)).collect()
}

fn populated(names: &[String]) -> File {
    let file = File::create(FileCreateProps::new(), FileAccessProps::new()).unwrap();
    let root = file.root_group().clone();
    for (i, name) in names.iter().enumerate() {
        let target = LinkTarget::Hard {
            object_header_address: 0x1000 + i as u64,
        };
        stab::insert(&file, &root, name, &target, ObjectType::Dataset, None).unwrap();
    }
    file
}

fn bench_insert(c: &mut Criterion) {
    let mut group = c.benchmark_group("stab_insert");
    for n in [100, 1_000, 10_000] {
        let names = names(n);
        group.bench_with_input(BenchmarkId::from_parameter(n), &names, |b, names| {
            b.iter(|| populated(black_box(names)))
        });
    }
    group.finish();
}

fn bench_lookup(c: &mut Criterion) {
    let names = names(10_000);
    let file = populated(&names);
    let root = file.root_group().clone();

    c.bench_function("stab_lookup_10k", |b| {
        let mut i = 0;
        b.iter(|| {
            i = (i + 1) % names.len();
            stab::lookup(&file, &root, black_box(&names[i])).unwrap()
        })
    });

    c.bench_function("stab_iterate_10k", |b| {
        b.iter(|| {
            let mut n = 0u64;
            stab::iterate(&file, &root, IterOrder::Native, 0, |_| {
                n += 1;
                Ok(IterStatus::Continue)
            })
            .unwrap();
            n
        })
    });
}

criterion_group!(benches, bench_insert, bench_lookup);
criterion_main!(benches);
