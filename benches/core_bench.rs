//! Benchmarks for flotilla core operations.
//!
//! Run with: cargo bench
//!
//! Results include 95% confidence intervals via Criterion.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use flotilla::core::executor::line_diff;
use flotilla::core::merger::merge_documents;
use flotilla::core::types::Config;
use flotilla::core::value::Value;
use flotilla::template::{TemplateEngine, Vars};
use flotilla::transport::ProcessExecutor;
use std::fmt::Write;
use std::sync::Arc;

/// A config with `units` units in one group, each with a few values.
fn config_yaml(units: usize, replicas: usize) -> String {
    let mut yaml = String::from("global:\n  domain: example.com\ngroups:\n  site:\n");
    for i in 0..units {
        let _ = write!(
            yaml,
            "    unit-{i:04}:\n      chart: {{name: app, repository: \"https://charts.example.com\", version: 1.0.0}}\n      tags: [backend]\n      values:\n        replicas: {replicas}\n        host: \"unit-{i:04}.<% .Global.domain %>\"\n        resources: {{cpu: 100m, memory: 128Mi}}\n"
        );
    }
    yaml
}

fn bench_merge(c: &mut Criterion) {
    let mut group = c.benchmark_group("merge_layers");
    for units in [10, 100, 500] {
        let layers: Vec<Value> = [1, 2, 3]
            .iter()
            .map(|r| serde_yaml_ng::from_str(&config_yaml(units, *r)).unwrap())
            .collect();
        group.bench_with_input(BenchmarkId::from_parameter(units), &layers, |b, layers| {
            b.iter(|| {
                let merged = merge_documents(black_box(layers.clone())).unwrap();
                black_box(merged);
            });
        });
    }
    group.finish();
}

fn bench_yaml_decode(c: &mut Criterion) {
    let yaml = config_yaml(50, 2);
    c.bench_function("yaml_decode_config", |b| {
        b.iter(|| {
            let config: Config = serde_yaml_ng::from_str(black_box(&yaml)).unwrap();
            black_box(config);
        });
    });
}

fn bench_render(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let engine = TemplateEngine::new(dir.path(), Arc::new(ProcessExecutor));
    let vars = Vars::new();

    let mut group = c.benchmark_group("render_document");
    for units in [10, 100] {
        let yaml = config_yaml(units, 2);
        group.bench_with_input(BenchmarkId::from_parameter(units), &yaml, |b, yaml| {
            b.iter(|| {
                let out = engine.render_document(black_box(yaml), &vars).unwrap();
                black_box(out);
            });
        });
    }
    group.finish();
}

fn bench_line_diff(c: &mut Criterion) {
    let old = config_yaml(100, 1);
    let new = config_yaml(100, 2);
    c.bench_function("line_diff_manifest", |b| {
        b.iter(|| black_box(line_diff(black_box(&old), black_box(&new))));
    });
}

criterion_group!(benches, bench_merge, bench_yaml_decode, bench_render, bench_line_diff);
criterion_main!(benches);
