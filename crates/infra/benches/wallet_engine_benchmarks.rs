use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use coffer_core::AccountId;
use coffer_infra::config::EngineConfig;
use coffer_infra::engine::WalletEngine;
use coffer_infra::store::InMemoryWalletStore;
use coffer_wallet::{CatalogItem, CatalogItemId};
use std::sync::Arc;
use tokio::runtime::Runtime;

const DEEP_POCKETS: i64 = 1_000_000_000_000;

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .enable_time()
        .build()
        .unwrap()
}

fn setup(rt: &Runtime) -> (Arc<WalletEngine<InMemoryWalletStore>>, AccountId) {
    let engine = Arc::new(WalletEngine::new(InMemoryWalletStore::new()));
    let account_id = AccountId::new();
    rt.block_on(engine.grant_initial_credit(account_id, DEEP_POCKETS))
        .unwrap();
    (engine, account_id)
}

fn bench_operation_latency(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("operation_latency");

    // Distinct catalog items, so the account's history grows with every iteration.
    group.bench_function("purchase_fresh_item", |b| {
        let (engine, account_id) = setup(&rt);
        let mut n: u64 = 0;
        b.iter(|| {
            n += 1;
            let item = CatalogItem::new(format!("cid_{n}"), "item", black_box(1));
            rt.block_on(engine.purchase(account_id, item)).unwrap();
        });
    });

    group.bench_function("purchase_then_refund", |b| {
        let (engine, account_id) = setup(&rt);
        let catalog = CatalogItemId::new("cid_cycle");
        b.iter(|| {
            rt.block_on(async {
                engine
                    .purchase(account_id, CatalogItem::new("cid_cycle", "item", black_box(10)))
                    .await
                    .unwrap();
                let owned = engine.find_active_item(account_id, &catalog).await.unwrap();
                engine.refund(account_id, owned.id, None).await.unwrap();
            });
        });
    });

    group.bench_function("get_balance", |b| {
        let (engine, account_id) = setup(&rt);
        b.iter(|| black_box(rt.block_on(engine.get_balance(account_id)).unwrap()));
    });

    group.finish();
}

fn bench_contended_purchases(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("contended_purchases");

    for writers in [1usize, 4, 16] {
        group.throughput(Throughput::Elements(writers as u64));
        group.bench_with_input(BenchmarkId::new("same_account", writers), &writers, |b, &writers| {
            let config = EngineConfig {
                max_attempts: 1_000,
                retry_backoff_ms: 0,
                ..EngineConfig::default()
            };
            let engine = Arc::new(WalletEngine::with_config(InMemoryWalletStore::new(), config));
            let account_id = AccountId::new();
            rt.block_on(engine.grant_initial_credit(account_id, DEEP_POCKETS))
                .unwrap();
            let mut round: u64 = 0;

            b.iter(|| {
                round += 1;
                rt.block_on(async {
                    let handles: Vec<_> = (0..writers)
                        .map(|w| {
                            let engine = engine.clone();
                            let item = CatalogItem::new(format!("cid_{round}_{w}"), "item", 1);
                            tokio::spawn(async move { engine.purchase(account_id, item).await })
                        })
                        .collect();
                    for handle in handles {
                        handle.await.unwrap().unwrap();
                    }
                });
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_operation_latency, bench_contended_purchases);
criterion_main!(benches);
