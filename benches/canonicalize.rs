//! Benchmarks for path canonicalization.

use bex::paths::CanonicalPath;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

fn bench_canonicalize(c: &mut Criterion) {
    let mut group = c.benchmark_group("canonicalize");

    let samples: &[(&str, &str)] = &[
        ("plain", "src/subdir/deeper/file.cc"),
        ("dotted", "./src/./subdir/../subdir/deeper/./file.cc"),
        ("updirs", "a/b/c/d/e/../../../../../out/obj/file.o"),
    ];

    for (name, path) in samples {
        group.bench_with_input(BenchmarkId::new("posix", name), path, |b, path| {
            b.iter(|| {
                let canonical = CanonicalPath::with_windows_semantics(black_box(*path), false);
                black_box(canonical)
            });
        });
    }

    let backslashed = "a\\b\\c\\d\\..\\..\\obj\\file.o";
    group.bench_with_input(
        BenchmarkId::new("windows", "backslashed"),
        &backslashed,
        |b, path| {
            b.iter(|| {
                let canonical = CanonicalPath::with_windows_semantics(black_box(*path), true);
                black_box(canonical)
            });
        },
    );

    group.finish();
}

criterion_group!(benches, bench_canonicalize);
criterion_main!(benches);
