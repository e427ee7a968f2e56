//! Criterion benchmarks for the neurocluster resolve path.
//!
//! Run with:
//!   cargo bench
//!   cargo bench --features parallel,simd
//!
//! Results are saved to target/criterion/

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use neurocluster::bank::StoreConfig;
use neurocluster::encoder::{EncoderConfig, FeatureEncoder};
use neurocluster::lsh::LshConfig;
use neurocluster::quantizer::{QuantizerConfig, RegionQuantizer};
use neurocluster::resolver::{ClusterResolver, ResolverConfig};

fn words(n: usize) -> Vec<String> {
    const SYLLABLES: [&str; 12] = [
        "ka", "lo", "mi", "tren", "su", "vor", "pha", "de", "qui", "ngo", "ri", "sta",
    ];
    (0..n)
        .map(|i| {
            let a = SYLLABLES[i % SYLLABLES.len()];
            let b = SYLLABLES[(i / SYLLABLES.len()) % SYLLABLES.len()];
            let c = SYLLABLES[(i * 7 + 3) % SYLLABLES.len()];
            format!("{a}{b}{c}{i}")
        })
        .collect()
}

/// Benchmark encode() across encoder dimensions.
fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode");
    let inputs = words(256);

    for dim in [64usize, 128, 256].iter() {
        group.throughput(Throughput::Elements(inputs.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(dim), dim, |b, &dim| {
            let encoder = FeatureEncoder::new(EncoderConfig::default().with_dim(dim)).unwrap();
            b.iter(|| {
                for w in &inputs {
                    black_box(encoder.encode(w));
                }
            });
        });
    }

    group.finish();
}

/// Benchmark quantize() for both strategies.
fn bench_quantize(c: &mut Criterion) {
    let mut group = c.benchmark_group("quantize");
    let encoder = FeatureEncoder::default();
    let vectors: Vec<_> = words(256).iter().map(|w| encoder.encode(w)).collect();
    group.throughput(Throughput::Elements(vectors.len() as u64));

    let strategies = [
        ("lsh", QuantizerConfig::Lsh(LshConfig::default())),
        ("codebook", QuantizerConfig::default()),
    ];
    for (name, cfg) in strategies.iter() {
        let q = RegionQuantizer::new(cfg, encoder.dim()).unwrap();
        group.bench_function(BenchmarkId::new("quantize", name), |b| {
            b.iter(|| {
                for v in &vectors {
                    black_box(q.quantize(v).unwrap());
                }
            });
        });
        group.bench_function(BenchmarkId::new("nearby_8", name), |b| {
            b.iter(|| {
                for v in &vectors {
                    black_box(q.nearby_regions(v, 8).unwrap());
                }
            });
        });
    }

    group.finish();
}

/// Benchmark learn/query against a populated resolver.
fn bench_resolve(c: &mut Criterion) {
    let mut group = c.benchmark_group("resolve");
    let cfg = ResolverConfig::default().with_store(StoreConfig::default().with_partition_count(16));
    let resolver = ClusterResolver::in_memory(cfg).unwrap();
    let vocab = words(1000);
    for w in &vocab {
        resolver.learn_text(w, None).unwrap();
    }

    group.throughput(Throughput::Elements(1));
    group.bench_function("learn_existing", |b| {
        let mut i = 0;
        b.iter(|| {
            i = (i + 1) % vocab.len();
            black_box(resolver.learn_text(&vocab[i], None).unwrap())
        });
    });
    group.bench_function("query_top5", |b| {
        let mut i = 0;
        b.iter(|| {
            i = (i + 1) % vocab.len();
            black_box(resolver.query_text(&vocab[i], 5).unwrap())
        });
    });

    group.finish();
}

/// Benchmark a dirty checkpoint of every partition.
fn bench_persist(c: &mut Criterion) {
    let mut group = c.benchmark_group("persist");
    group.sample_size(10);

    for clusters in [500usize, 2000].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(clusters), clusters, |b, &clusters| {
            let dir = tempfile::tempdir().unwrap();
            let cfg = ResolverConfig::default().with_store(StoreConfig::default().with_partition_count(32));
            let (resolver, _) = ClusterResolver::open(dir.path(), cfg).unwrap();
            let mut ids = Vec::with_capacity(clusters);
            for w in words(clusters) {
                ids.push(resolver.learn_text(&w, None).unwrap().cluster_id);
            }
            let mut round = 0u32;
            b.iter(|| {
                round += 1;
                for id in ids.iter().step_by(7) {
                    resolver
                        .train_pattern(id, [(format!("f{round}"), 1.0)])
                        .unwrap();
                }
                black_box(resolver.persist_all().unwrap())
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_encode,
    bench_quantize,
    bench_resolve,
    bench_persist
);
criterion_main!(benches);
