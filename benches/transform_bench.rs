use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use serde_json::json;
use std::time::Duration;

use queue_etl::config::{SandboxConfig, Transformation};
use queue_etl::transform::engine::TransformEngine;
use queue_etl::types::ChangeEvent;

const ORDER_SCRIPT: &str = r#"
let orderData = #{
    Id: id(this),
    OrderLinesCount: this.Lines.len(),
    TotalCost: 0.0
};
for line in this.Lines {
    orderData.TotalCost += line.PricePerUnit * line.Quantity;
}
loadToOrders(orderData);
"#;

fn order_event(lines: usize) -> ChangeEvent {
    let lines: Vec<_> = (0..lines)
        .map(|i| json!({ "Product": format!("products/{i}"), "PricePerUnit": 3.5, "Quantity": 2.0 }))
        .collect();
    ChangeEvent::put(1, "Orders", "orders/1-A", json!({ "Company": "companies/1", "Lines": lines }))
}

fn transform_benchmarks(c: &mut Criterion) {
    let mut group = c.benchmark_group("transform_run");
    group.measurement_time(Duration::from_secs(5));

    let transform = Transformation::new("orders", ["Orders"], ORDER_SCRIPT);
    let engine = TransformEngine::compile(&transform, &SandboxConfig::default()).unwrap();

    for lines in [1, 10, 100].iter() {
        let event = order_event(*lines);
        group.throughput(Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::new("order_lines", lines), &event, |b, event| {
            b.iter(|| black_box(engine.run(event).unwrap()))
        });
    }
    group.finish();

    c.bench_function("transform_compile", |b| {
        b.iter(|| black_box(TransformEngine::compile(&transform, &SandboxConfig::default()).unwrap()))
    });
}

criterion_group!(benches, transform_benchmarks);
criterion_main!(benches);
