use criterion::{black_box, criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion, Throughput};

use chrono::{Duration, Utc};
use stockflow_core::{BranchId, OrgId, ProductId};
use stockflow_infra::catalog::ProductCatalog;
use stockflow_infra::lots::{consume_lots_fifo, restore_cost_lines, InMemoryLotStore, LotStore};
use stockflow_infra::stock_ledger::{InMemoryStockLedger, StockLedger};
use stockflow_infra::{FulfillmentService, LedgerConfig, LedgerStores, RetryPolicy};
use stockflow_inventory::{LotSource, NewLot, StockKey};
use stockflow_products::{CostingMethod, NewProduct, Product};
use stockflow_sales::{NewOrder, OrderLine};
use tokio::runtime::Runtime;

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .unwrap()
}

fn key() -> StockKey {
    StockKey::new(OrgId::new(), BranchId::new(), ProductId::new())
}

fn bench_reservation_churn(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("reservation_churn");
    group.throughput(Throughput::Elements(1));

    group.bench_function("reserve_release", |b| {
        let ledger = InMemoryStockLedger::new(5);
        let k = key();
        rt.block_on(ledger.adjust(k, 1_000)).unwrap();

        b.iter(|| {
            rt.block_on(async {
                ledger.reserve(k, black_box(3)).await.unwrap();
                ledger.release(k, black_box(3)).await.unwrap();
            })
        });
    });

    group.bench_function("reserve_commit_uncommit", |b| {
        let ledger = InMemoryStockLedger::new(5);
        let k = key();
        rt.block_on(ledger.adjust(k, 1_000)).unwrap();

        b.iter(|| {
            rt.block_on(async {
                ledger.reserve(k, black_box(2)).await.unwrap();
                ledger.commit(k, black_box(2)).await.unwrap();
                ledger.uncommit(k, black_box(2)).await.unwrap();
                ledger.release(k, black_box(2)).await.unwrap();
            })
        });
    });

    group.finish();
}

fn bench_fifo_consumption(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("fifo_consumption");
    let retry = RetryPolicy::default();

    for lots in [1usize, 10, 100].iter() {
        group.throughput(Throughput::Elements(*lots as u64));
        group.bench_with_input(BenchmarkId::new("consume_across_lots", lots), lots, |b, &n| {
            let store = InMemoryLotStore::new();
            let k = key();
            let base = Utc::now() - Duration::days(1);
            rt.block_on(async {
                for i in 0..n {
                    store
                        .create_lot(
                            NewLot::new(k, LotSource::Initial, 5, 100 + i as i64)
                                .received_at(base + Duration::seconds(i as i64)),
                        )
                        .await
                        .unwrap();
                }
            });
            let qty = (n as i64) * 5;

            b.iter(|| {
                rt.block_on(async {
                    let cogs = consume_lots_fifo(&store, k, black_box(qty), &retry).await.unwrap();
                    restore_cost_lines(&store, k.org_id, &cogs.cost_lines).await;
                    black_box(cogs.total_cogs)
                })
            });
        });
    }

    group.finish();
}

fn bench_commit_delivery(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("commit_delivery");

    for lines in [1usize, 5, 20].iter() {
        group.throughput(Throughput::Elements(*lines as u64));
        group.bench_with_input(BenchmarkId::new("order_lines", lines), lines, |b, &n| {
            let config = LedgerConfig::default();
            let stores = LedgerStores::in_memory(&config);
            let service = FulfillmentService::new(stores.clone(), &config);
            let org = OrgId::new();
            let branch = BranchId::new();

            let products: Vec<ProductId> = rt.block_on(async {
                let mut ids = Vec::with_capacity(n);
                for i in 0..n {
                    let product = Product::create(
                        NewProduct {
                            org_id: org,
                            sku: format!("BENCH-{i}"),
                            name: format!("Bench {i}"),
                            price: 500,
                            cost: 100,
                            costing_method: CostingMethod::Fifo,
                        },
                        Utc::now(),
                    )
                    .unwrap();
                    ids.push(stores.catalog.insert(product).await.unwrap().id);
                }
                ids
            });

            b.iter_batched(
                || {
                    rt.block_on(async {
                        for p in &products {
                            let k = StockKey::new(org, branch, *p);
                            stores
                                .lots
                                .create_lot(NewLot::new(k, LotSource::Initial, 2, 100))
                                .await
                                .unwrap();
                            stores.stock.adjust(k, 2).await.unwrap();
                        }
                        service
                            .create_order(NewOrder {
                                org_id: org,
                                branch_id: branch,
                                lines: products.iter().map(|p| OrderLine::new(*p, 2, 500)).collect(),
                                draft: false,
                            })
                            .await
                            .unwrap()
                    })
                },
                |order| {
                    rt.block_on(async {
                        black_box(service.commit_delivery(org, order.id).await.unwrap().cogs)
                    })
                },
                BatchSize::SmallInput,
            );
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_reservation_churn,
    bench_fifo_consumption,
    bench_commit_delivery
);
criterion_main!(benches);
