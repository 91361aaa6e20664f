//! Criterion benchmarks for the claim index.

use std::hint::black_box;
use std::sync::Arc;

use criterion::{Criterion, criterion_group, criterion_main};
use factions_claims::ClaimIndex;
use factions_core::chunk::ChunkKey;
use factions_core::config::FactionsConfig;
use factions_core::test_utils::{RegistryFixture, player};
use factions_power::test_utils::LedgerFixture;

fn uncapped() -> FactionsConfig {
    let mut config = FactionsConfig::default();
    config.power.power_per_claim = 0.0;
    config.claims.max_claims = 10_000;
    config
}

fn setup() -> (RegistryFixture, LedgerFixture, Arc<ClaimIndex>) {
    let fx = RegistryFixture::with_config(uncapped());
    let power = LedgerFixture::with_config(uncapped());
    let index = Arc::new(ClaimIndex::new(fx.config.clone()));
    index.install(&fx.registry);
    for n in 1..=4 {
        fx.found(n, &format!("Bench{n}"));
    }
    (fx, power, index)
}

fn bench_claims(c: &mut Criterion) {
    let mut group = c.benchmark_group("claims");
    group.sample_size(20);

    // Claim a 32x32 block split between four factions.
    group.bench_function("claim_1024_chunks", |b| {
        b.iter(|| {
            let (fx, power, index) = setup();
            for x in 0..32 {
                for z in 0..32 {
                    let n = 1 + ((x + z) % 4) as u128;
                    index
                        .claim(&fx.registry, &power.ledger, player(n), ChunkKey::new("world", x, z))
                        .unwrap();
                }
            }
            black_box(index.len());
        });
    });

    // Owner lookups against a populated index.
    let (fx, power, index) = setup();
    for x in 0..32 {
        for z in 0..32 {
            index
                .claim(&fx.registry, &power.ledger, player(1), ChunkKey::new("world", x, z))
                .unwrap();
        }
    }
    group.bench_function("owner_lookup_2048", |b| {
        b.iter(|| {
            let mut owned = 0;
            for x in 0..64 {
                for z in 0..32 {
                    if index.owner(&ChunkKey::new("world", x, z)).is_some() {
                        owned += 1;
                    }
                }
            }
            black_box(owned)
        });
    });

    group.bench_function("verify_1024", |b| {
        b.iter(|| black_box(index.verify(&fx.registry).len()));
    });

    group.finish();
}

criterion_group!(benches, bench_claims);
criterion_main!(benches);
