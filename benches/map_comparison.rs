use core::hash::BuildHasher;
use core::hint::black_box;

use criterion::Criterion;
use criterion::Throughput;
use criterion::criterion_group;
use criterion::criterion_main;
use siphasher::sip::SipHasher;
use tagmap::FlatMap;
use tagmap::RobinMap;

#[derive(Clone, Default)]
struct SipState;

impl BuildHasher for SipState {
    type Hasher = SipHasher;

    fn build_hasher(&self) -> Self::Hasher {
        SipHasher::new()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct TestKey(String);

impl TestKey {
    fn new(key: u64) -> Self {
        black_box(TestKey(format!("key_{}", key)))
    }
}

const SIZES: &[usize] = &[
    ((1 << 10) as f32 * 0.45) as usize,
    ((1 << 15) as f32 * 0.45) as usize,
    ((1 << 19) as f32 * 0.45) as usize,
];

fn bench_insert_sequential(c: &mut Criterion) {
    let mut group = c.benchmark_group("insert_sequential");

    for size in SIZES.iter() {
        let items: Vec<(TestKey, u64)> = (0..*size)
            .map(|i| (TestKey::new(i as u64), i as u64))
            .collect();
        group.throughput(Throughput::Elements(*size as u64));

        group.bench_function(format!("flat_map/{}", size), |b| {
            b.iter(|| {
                let mut map: FlatMap<TestKey, u64, SipState> = FlatMap::new();
                for (key, value) in items.iter() {
                    map.insert(key.clone(), *value);
                }
                black_box(map)
            })
        });

        group.bench_function(format!("robin_map/{}", size), |b| {
            b.iter(|| {
                let mut map: RobinMap<TestKey, u64, SipState> = RobinMap::new();
                for (key, value) in items.iter() {
                    map.insert(key.clone(), *value);
                }
                black_box(map)
            })
        });

        group.bench_function(format!("hashbrown/{}", size), |b| {
            b.iter(|| {
                let mut map: hashbrown::HashMap<TestKey, u64, SipState> =
                    hashbrown::HashMap::with_hasher(SipState);
                for (key, value) in items.iter() {
                    map.insert(key.clone(), *value);
                }
                black_box(map)
            })
        });
    }

    group.finish();
}

fn bench_lookup_hit(c: &mut Criterion) {
    let mut group = c.benchmark_group("lookup_hit");

    for size in SIZES.iter() {
        let items: Vec<(TestKey, u64)> = (0..*size)
            .map(|i| (TestKey::new(i as u64), i as u64))
            .collect();
        group.throughput(Throughput::Elements(*size as u64));

        let mut flat: FlatMap<TestKey, u64, SipState> = FlatMap::new();
        let mut robin: RobinMap<TestKey, u64, SipState> = RobinMap::new();
        let mut brown: hashbrown::HashMap<TestKey, u64, SipState> =
            hashbrown::HashMap::with_hasher(SipState);
        for (key, value) in items.iter() {
            flat.insert(key.clone(), *value);
            robin.insert(key.clone(), *value);
            brown.insert(key.clone(), *value);
        }

        group.bench_function(format!("flat_map/{}", size), |b| {
            b.iter(|| {
                for (key, value) in items.iter() {
                    assert_eq!(flat.get(black_box(key)), Some(value));
                }
            })
        });

        group.bench_function(format!("robin_map/{}", size), |b| {
            b.iter(|| {
                for (key, value) in items.iter() {
                    assert_eq!(robin.get(black_box(key)), Some(value));
                }
            })
        });

        group.bench_function(format!("hashbrown/{}", size), |b| {
            b.iter(|| {
                for (key, value) in items.iter() {
                    assert_eq!(brown.get(black_box(key)), Some(value));
                }
            })
        });
    }

    group.finish();
}

fn bench_lookup_miss(c: &mut Criterion) {
    let mut group = c.benchmark_group("lookup_miss");

    for size in SIZES.iter() {
        let items: Vec<(TestKey, u64)> = (0..*size)
            .map(|i| (TestKey::new(i as u64), i as u64))
            .collect();
        let misses: Vec<TestKey> = (0..*size)
            .map(|i| TestKey::new((i + *size) as u64 | (1 << 40)))
            .collect();
        group.throughput(Throughput::Elements(*size as u64));

        let mut flat: FlatMap<TestKey, u64, SipState> = FlatMap::new();
        let mut robin: RobinMap<TestKey, u64, SipState> = RobinMap::new();
        let mut brown: hashbrown::HashMap<TestKey, u64, SipState> =
            hashbrown::HashMap::with_hasher(SipState);
        for (key, value) in items.iter() {
            flat.insert(key.clone(), *value);
            robin.insert(key.clone(), *value);
            brown.insert(key.clone(), *value);
        }

        group.bench_function(format!("flat_map/{}", size), |b| {
            b.iter(|| {
                for key in misses.iter() {
                    assert!(flat.get(black_box(key)).is_none());
                }
            })
        });

        group.bench_function(format!("robin_map/{}", size), |b| {
            b.iter(|| {
                for key in misses.iter() {
                    assert!(robin.get(black_box(key)).is_none());
                }
            })
        });

        group.bench_function(format!("hashbrown/{}", size), |b| {
            b.iter(|| {
                for key in misses.iter() {
                    assert!(brown.get(black_box(key)).is_none());
                }
            })
        });
    }

    group.finish();
}

fn bench_insert_remove_churn(c: &mut Criterion) {
    let mut group = c.benchmark_group("insert_remove_churn");

    for size in SIZES.iter().take(2) {
        let items: Vec<(TestKey, u64)> = (0..*size)
            .map(|i| (TestKey::new(i as u64), i as u64))
            .collect();
        group.throughput(Throughput::Elements(*size as u64));

        group.bench_function(format!("flat_map/{}", size), |b| {
            let mut map: FlatMap<TestKey, u64, SipState> = FlatMap::new();
            for (key, value) in items.iter() {
                map.insert(key.clone(), *value);
            }
            b.iter(|| {
                for (key, value) in items.iter() {
                    assert_eq!(map.remove(black_box(key)), Some(*value));
                    map.insert(key.clone(), *value);
                }
            })
        });

        group.bench_function(format!("robin_map/{}", size), |b| {
            let mut map: RobinMap<TestKey, u64, SipState> = RobinMap::new();
            for (key, value) in items.iter() {
                map.insert(key.clone(), *value);
            }
            b.iter(|| {
                for (key, value) in items.iter() {
                    assert_eq!(map.remove(black_box(key)), Some(*value));
                    map.insert(key.clone(), *value);
                }
            })
        });

        group.bench_function(format!("hashbrown/{}", size), |b| {
            let mut map: hashbrown::HashMap<TestKey, u64, SipState> =
                hashbrown::HashMap::with_hasher(SipState);
            for (key, value) in items.iter() {
                map.insert(key.clone(), *value);
            }
            b.iter(|| {
                for (key, value) in items.iter() {
                    assert_eq!(map.remove(black_box(key)), Some(*value));
                    map.insert(key.clone(), *value);
                }
            })
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_insert_sequential,
    bench_lookup_hit,
    bench_lookup_miss,
    bench_insert_remove_churn
);
criterion_main!(benches);
