use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Runtime;
use turnstile_solver::page::{build_challenge_page, widget_markup};
use turnstile_solver::{
    parse_proxy_list, Config, MemoryBackend, ProxySpec, TaskId, TaskOutcome, TaskStore,
};

// Fast settings for all benchmarks
fn configure_fast_group(group: &mut criterion::BenchmarkGroup<criterion::measurement::WallTime>) {
    group.warm_up_time(Duration::from_millis(500));
    group.measurement_time(Duration::from_millis(500));
    group.sample_size(20);
}

fn benchmark_config_creation(c: &mut Criterion) {
    let mut group = c.benchmark_group("config");
    configure_fast_group(&mut group);

    group.bench_function("creation", |b| {
        b.iter(|| {
            let config = Config::default();
            black_box(config);
        });
    });

    group.bench_function("validation", |b| {
        let config = Config::default();
        b.iter(|| black_box(config.validate().is_ok()));
    });

    group.finish();
}

fn benchmark_proxy_parsing(c: &mut Criterion) {
    let mut group = c.benchmark_group("proxy_parsing");
    configure_fast_group(&mut group);

    let proxies = [
        "127.0.0.1:8080",
        "127.0.0.1:1080:socks5",
        "10.0.0.1:3128:user:pa:ss",
        "http://gate.example.net:9000:bob:hunter2",
        "not-a-proxy",
    ];

    group.bench_function("mixed_shapes", |b| {
        b.iter(|| {
            for raw in &proxies {
                black_box(ProxySpec::parse(black_box(raw)).is_ok());
            }
        });
    });

    let list: String = (0..500)
        .map(|i| format!("10.0.{}.{}:8080\n# comment\n\n", i / 256, i % 256))
        .collect();
    group.bench_function("proxy_list_500", |b| {
        b.iter(|| black_box(parse_proxy_list(black_box(&list))));
    });

    group.finish();
}

fn benchmark_page_building(c: &mut Criterion) {
    let mut group = c.benchmark_group("challenge_page");
    configure_fast_group(&mut group);

    group.bench_function("widget_markup", |b| {
        b.iter(|| black_box(widget_markup("0x4AAAAAAA", Some("login"), Some("cdata"))));
    });

    group.bench_function("full_page", |b| {
        b.iter(|| black_box(build_challenge_page("0x4AAAAAAA", Some("login"), None)));
    });

    group.finish();
}

fn benchmark_task_store(c: &mut Criterion) {
    let mut group = c.benchmark_group("task_store");
    configure_fast_group(&mut group);

    let rt = Runtime::new().expect("tokio runtime");

    group.bench_function("id_generation", |b| {
        b.iter(|| black_box(TaskId::generate()));
    });

    group.bench_function("create_complete_100", |b| {
        b.iter(|| {
            rt.block_on(async {
                let store = TaskStore::new(Arc::new(MemoryBackend::new()));
                for _ in 0..100 {
                    let id = TaskId::generate();
                    store.create(&id).await;
                    store
                        .complete(
                            &id,
                            TaskOutcome::Solved {
                                value: "0.token".to_string(),
                                elapsed: Duration::from_millis(4200),
                            },
                        )
                        .await;
                }
                black_box(store.counts())
            })
        });
    });

    group.finish();
}

criterion_group!(
    unit_benches,
    benchmark_config_creation,
    benchmark_proxy_parsing,
    benchmark_page_building,
    benchmark_task_store,
);

criterion_main!(unit_benches);
