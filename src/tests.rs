#[cfg(test)]
mod integration_tests {
    use crate::automation::mock::{ContextRecord, ScriptedProvider, WidgetScript};
    use crate::{
        load_config, router, AppState, BrowserPool, ChallengeSolver, Cli, Config,
        JsonFileBackend, MemoryBackend, PollingPolicy, TaskId, TaskRecord, TaskStatus, TaskStore,
    };
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use clap::Parser;
    use std::sync::Arc;
    use std::time::Duration;
    use tower::ServiceExt;

    fn fast_policy() -> PollingPolicy {
        PollingPolicy {
            read_timeout: Duration::from_millis(20),
            click_timeout: Duration::from_millis(20),
            retry_delay: Duration::from_millis(2),
            ..Default::default()
        }
    }

    async fn get_json(app: &axum::Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = app
            .clone()
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json = serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null);
        (status, json)
    }

    async fn wait_for(store: &TaskStore, ids: &[TaskId]) {
        for _ in 0..500 {
            if ids.iter().all(|id| !store.is_pending(id)) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("tasks still pending: {:?}", store.counts());
    }

    /// Largest number of contexts open at the same moment
    fn peak_overlap(contexts: &[ContextRecord]) -> usize {
        contexts
            .iter()
            .map(|sample| {
                contexts
                    .iter()
                    .filter(|c| {
                        c.opened_at <= sample.opened_at
                            && c.closed_at.map_or(true, |closed| closed > sample.opened_at)
                    })
                    .count()
            })
            .max()
            .unwrap_or(0)
    }

    #[tokio::test]
    async fn test_submit_poll_and_restart() {
        let dir = tempfile::tempdir().unwrap();
        let results_file = dir.path().join("results.json");

        let provider = ScriptedProvider::new(WidgetScript::solves_on(3, "0.integration"));
        let pool = BrowserPool::initialize(2, &provider).await.unwrap();
        let store = Arc::new(TaskStore::load(Arc::new(JsonFileBackend::new(&results_file))).await);
        let solver = Arc::new(ChallengeSolver::new(pool, store.clone()).with_policy(fast_policy()));
        let app = router(Arc::new(AppState::new(solver)));

        let mut ids = Vec::new();
        for _ in 0..3 {
            let (status, json) =
                get_json(&app, "/turnstile?url=https://example.com/login&sitekey=0x4AAA&cdata=c1")
                    .await;
            assert_eq!(status, StatusCode::ACCEPTED);
            ids.push(TaskId::from(json["task_id"].as_str().unwrap()));
        }
        wait_for(&store, &ids).await;

        for id in &ids {
            let (status, json) = get_json(&app, &format!("/result?id={id}")).await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(json["value"], "0.integration");
        }

        let (_, health) = get_json(&app, "/health").await;
        assert_eq!(health["tasks"]["solved"], 3);
        assert_eq!(health["pool"]["available"], 2);

        // A fresh store over the same file sees every result
        let reloaded = TaskStore::load(Arc::new(JsonFileBackend::new(&results_file))).await;
        assert_eq!(reloaded.len(), 3);
        for id in &ids {
            assert_eq!(reloaded.get(id), store.get(id));
        }

        for ctx in provider.journal.snapshot() {
            assert_eq!(ctx.routed[0].0, "https://example.com/login/");
            assert!(ctx.routed[0].1.contains(r#"data-cdata="c1""#));
        }
    }

    #[tokio::test]
    async fn test_pool_bounds_concurrent_solves() {
        let mut script = WidgetScript::solves_on(2, "t");
        script.read_latency = Duration::from_millis(10);
        let provider = ScriptedProvider::new(script);
        let pool = BrowserPool::initialize(2, &provider).await.unwrap();
        let store = Arc::new(TaskStore::new(Arc::new(MemoryBackend::new())));
        let solver = Arc::new(ChallengeSolver::new(pool, store.clone()).with_policy(fast_policy()));

        let mut handles = Vec::new();
        for _ in 0..6 {
            let id = TaskId::generate();
            store.create(&id).await;
            handles.push(solver.spawn(id, Default::default()));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let contexts = provider.journal.snapshot();
        assert_eq!(contexts.len(), 6);
        assert!(peak_overlap(&contexts) <= 2);
        assert_eq!(store.counts().solved, 6);

        let stats = solver.pool().get_stats().await;
        assert_eq!(stats.checked_out, 0);
        assert_eq!(stats.total_solves, 6);
    }

    #[tokio::test]
    async fn test_failed_and_solved_tasks_side_by_side() {
        let provider = ScriptedProvider::new(WidgetScript::never_solves());
        let pool = BrowserPool::initialize(1, &provider).await.unwrap();
        let store = Arc::new(TaskStore::new(Arc::new(MemoryBackend::new())));
        let solver = ChallengeSolver::new(pool, store.clone()).with_policy(fast_policy());

        let failed = TaskId::generate();
        store.create(&failed).await;
        let record = solver.solve(failed.clone(), Default::default()).await.unwrap();
        assert_eq!(record.status(), TaskStatus::Failed);

        // Solving an id that was never created leaves no pending entry to fall back on
        let stray = TaskId::generate();
        assert_eq!(solver.solve(stray.clone(), Default::default()).await, None);
        assert!(store.get(&stray).is_none());
        assert!(matches!(store.get(&failed), Some(TaskRecord::Failed { .. })));
    }

    #[tokio::test]
    async fn test_config_file_with_cli_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("solver.json");
        std::fs::write(
            &path,
            r#"{ "browser_pool_size": 2, "port": 8000, "proxy_file": "lists/p.txt", "debug": true }"#,
        )
        .unwrap();

        let cli = Cli::try_parse_from([
            "turnstile-solver",
            "--config",
            path.to_str().unwrap(),
            "--thread",
            "3",
            "--proxy",
        ])
        .unwrap();
        let config = load_config(&cli).await.unwrap();

        assert_eq!(config.browser_pool_size, 3);
        assert_eq!(config.port, 8000);
        assert!(config.proxy_support);
        assert_eq!(config.proxy_file, "lists/p.txt");
        // Verbose logging can come from the file alone
        assert!(config.debug);
    }

    #[tokio::test]
    async fn test_load_config_rejects_headless_without_user_agent() {
        let cli = Cli::try_parse_from(["turnstile-solver", "--headless"]).unwrap();
        let err = load_config(&cli).await.unwrap_err();
        assert!(err.to_string().contains("user agent"), "{err}");

        let cli = Cli::try_parse_from([
            "turnstile-solver",
            "--headless",
            "--useragent",
            "Mozilla/5.0 Chrome/126.0",
        ])
        .unwrap();
        let config = load_config(&cli).await.unwrap();
        assert!(config.headless);
        assert!(!config.debug);
    }

    #[tokio::test]
    async fn test_proxy_file_from_config() {
        let dir = tempfile::tempdir().unwrap();
        let proxy_file = dir.path().join("proxies.txt");
        std::fs::write(&proxy_file, "# pool\n5.6.7.8:1080:socks5\n").unwrap();

        let config = Config {
            proxy_support: true,
            proxy_file: proxy_file.to_string_lossy().into_owned(),
            user_agent: Some("Configured/1.0".to_string()),
            polling: fast_policy(),
            ..Default::default()
        };

        let provider = ScriptedProvider::new(WidgetScript::solves_on(1, "t"));
        let pool = BrowserPool::initialize(1, &provider).await.unwrap();
        let store = Arc::new(TaskStore::new(Arc::new(MemoryBackend::new())));
        let solver = ChallengeSolver::from_config(pool, store.clone(), &config);

        let id = TaskId::generate();
        store.create(&id).await;
        solver.solve(id, Default::default()).await;

        let options = &provider.journal.snapshot()[0].options;
        assert_eq!(options.proxy.as_ref().unwrap().server(), "socks5://5.6.7.8:1080");
        assert_eq!(options.user_agent.as_deref(), Some("Configured/1.0"));
    }

    // Needs a local Chromium; run with `--ignored`
    #[tokio::test]
    #[ignore]
    async fn test_chromium_context_lifecycle() {
        use crate::{ChromiumProvider, ContextOptions, SessionProvider};

        let config = Config {
            headless: true,
            user_agent: Some("Mozilla/5.0 (X11; Linux x86_64) Chrome/126.0".to_string()),
            ..Default::default()
        };
        let provider = ChromiumProvider::new(config);
        let session = match provider.launch(1).await {
            Ok(session) => session,
            Err(e) => {
                eprintln!("Chromium unavailable, skipping: {e}");
                return;
            }
        };

        let context = session.new_context(&ContextOptions::default()).await.unwrap();
        context
            .route_document(
                "https://example.com/",
                r#"<html><body><input name="marker" value="routed"></body></html>"#,
            )
            .await
            .unwrap();
        context.goto("https://example.com/").await.unwrap();
        let value = context
            .input_value("[name=marker]", Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(value, "routed");

        context.close().await.unwrap();
        session.shutdown().await;
    }
}
