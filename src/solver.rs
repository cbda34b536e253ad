//! Per-task solve protocol
//!
//! A solve moves through these stages, each logged at debug level with the
//! browser slot it runs on:
//!
//! ```text
//! Init -> ProxyResolved -> SessionConfigured -> PageLoaded -> Polling
//!      -> Solved | FallbackCheck -> Solved | Failed -> Released
//! ```
//!
//! The pool slot is released on every path, and every path that reaches a
//! configured session writes a final result to the [`TaskStore`].

use crate::metrics::{self, TokenPath};
use crate::page::{
    build_challenge_page, target_url_with_slash, RESPONSE_FIELD, WIDGET_SELECTOR, WINDOW_TOKEN,
};
use crate::{
    BrowserPool, Config, ContextOptions, PageContext, PollingPolicy, ProxyFile, ProxySource,
    ProxySpec, SolverError, TaskId, TaskOutcome, TaskRecord, TaskStore,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

/// Parameters of one submitted task
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SolveRequest {
    pub url: String,
    pub sitekey: String,
    pub action: Option<String>,
    pub cdata: Option<String>,
    pub proxy: Option<String>,
    pub user_agent: Option<String>,
}

/// Everything a solve needs, fixed before the browser is touched
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EffectiveRequestConfig {
    /// Request URL with a trailing `/`
    pub target_url: String,
    pub sitekey: String,
    pub action: Option<String>,
    pub cdata: Option<String>,
    pub proxy_source: ProxySource,
    /// `None` when no proxy was given or it failed to parse
    pub proxy: Option<ProxySpec>,
    pub user_agent: Option<String>,
}

impl EffectiveRequestConfig {
    pub fn context_options(&self) -> ContextOptions {
        ContextOptions {
            proxy: self.proxy.clone(),
            user_agent: self.user_agent.clone(),
        }
    }
}

pub struct ChallengeSolver {
    pool: BrowserPool,
    store: Arc<TaskStore>,
    proxy_file: Option<ProxyFile>,
    default_user_agent: Option<String>,
    policy: PollingPolicy,
}

impl ChallengeSolver {
    pub fn new(pool: BrowserPool, store: Arc<TaskStore>) -> Self {
        Self {
            pool,
            store,
            proxy_file: None,
            default_user_agent: None,
            policy: PollingPolicy::default(),
        }
    }

    pub fn from_config(pool: BrowserPool, store: Arc<TaskStore>, config: &Config) -> Self {
        Self::new(pool, store)
            .with_proxy_file(config.proxy_support.then(|| ProxyFile::new(&config.proxy_file)))
            .with_user_agent(config.user_agent.clone())
            .with_policy(config.polling.clone())
    }

    /// Proxy list consulted for tasks submitted without a proxy
    pub fn with_proxy_file(mut self, proxy_file: Option<ProxyFile>) -> Self {
        self.proxy_file = proxy_file;
        self
    }

    pub fn with_user_agent(mut self, user_agent: Option<String>) -> Self {
        self.default_user_agent = user_agent;
        self
    }

    pub fn with_policy(mut self, policy: PollingPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn pool(&self) -> &BrowserPool {
        &self.pool
    }

    pub fn store(&self) -> &Arc<TaskStore> {
        &self.store
    }

    /// Run [`solve`](Self::solve) in the background.
    pub fn spawn(self: &Arc<Self>, task_id: TaskId, request: SolveRequest) -> JoinHandle<()> {
        let solver = Arc::clone(self);
        tokio::spawn(async move {
            solver.solve(task_id, request).await;
        })
    }

    /// Fix proxy and user agent for a request.
    ///
    /// An explicit proxy wins over the proxy file, and a proxy that fails to
    /// parse means the task runs without one.
    pub async fn resolve(&self, request: &SolveRequest) -> EffectiveRequestConfig {
        let proxy_source =
            ProxySource::resolve(request.proxy.as_deref(), self.proxy_file.as_ref()).await;

        let proxy = match proxy_source.raw().map(ProxySpec::parse) {
            Some(Ok(spec)) => Some(spec),
            Some(Err(e)) => {
                metrics::record_proxy_format_error();
                warn!("{}, proceeding without proxy", e);
                None
            }
            None => None,
        };

        let user_agent = request
            .user_agent
            .clone()
            .filter(|ua| !ua.is_empty())
            .or_else(|| self.default_user_agent.clone());

        EffectiveRequestConfig {
            target_url: target_url_with_slash(&request.url),
            sitekey: request.sitekey.clone(),
            action: request.action.clone(),
            cdata: request.cdata.clone(),
            proxy_source,
            proxy,
            user_agent,
        }
    }

    /// Solve one task and return its final record.
    pub async fn solve(&self, task_id: TaskId, request: SolveRequest) -> Option<TaskRecord> {
        let slot = match self.pool.acquire().await {
            Ok(slot) => slot,
            Err(e) => {
                error!("Task {}: no browser available: {}", task_id, e);
                self.finish_failed(&task_id, Duration::ZERO, 0).await;
                return self.store.get(&task_id);
            }
        };
        let index = slot.index();
        debug!("Browser {}: Init task {}", index, task_id);

        let config = self.resolve(&request).await;
        match &config.proxy {
            Some(proxy) => debug!(
                "Browser {}: ProxyResolved {} ({:?})",
                index, proxy, config.proxy_source
            ),
            None => debug!("Browser {}: ProxyResolved without proxy", index),
        }
        if let Some(user_agent) = &config.user_agent {
            debug!("Browser {}: Using user agent: {}", index, user_agent);
        }

        match slot.session().new_context(&config.context_options()).await {
            Ok(page) => {
                let started = Instant::now();
                debug!(
                    "Browser {}: SessionConfigured, solving {} with sitekey {}",
                    index, config.target_url, config.sitekey
                );

                if let Err(e) = self.drive(page.as_ref(), &task_id, &config, index, started).await {
                    match &e {
                        SolverError::Solve(_) => debug!("Browser {}: {}", index, e),
                        _ => error!("Browser {}: Error solving Turnstile: {}", index, e),
                    }
                    self.finish_failed(&task_id, started.elapsed(), index).await;
                }

                debug!("Browser {}: Clearing page state", index);
                if let Err(e) = page.close().await {
                    debug!("Browser {}: context close failed: {}", index, e);
                }
            }
            Err(e) => {
                error!("Browser {}: could not open a browsing context: {}", index, e);
                self.finish_failed(&task_id, Duration::ZERO, index).await;
            }
        }

        self.pool.release(slot).await;
        debug!("Browser {}: Released", index);
        self.store.get(&task_id)
    }

    async fn drive(
        &self,
        page: &dyn PageContext,
        task_id: &TaskId,
        config: &EffectiveRequestConfig,
        index: usize,
        started: Instant,
    ) -> Result<(), SolverError> {
        let html = build_challenge_page(
            &config.sitekey,
            config.action.as_deref(),
            config.cdata.as_deref(),
        );
        page.route_document(&config.target_url, &html).await?;
        page.goto(&config.target_url).await?;
        page.wait_for_network_idle().await?;
        debug!("Browser {}: PageLoaded", index);

        page.set_style(WIDGET_SELECTOR, "width", &self.policy.widget_width)
            .await?;
        debug!("Browser {}: Polling", index);

        for attempt in 1..=self.policy.max_attempts {
            match page.input_value(RESPONSE_FIELD, self.policy.read_timeout).await {
                Ok(token) if token.is_empty() => {
                    debug!("Browser {}: Attempt {} - No Turnstile response yet", index, attempt);
                    match page.click(WIDGET_SELECTOR, self.policy.click_timeout).await {
                        Ok(()) => sleep(self.policy.retry_delay).await,
                        Err(e) => debug!("Browser {}: Attempt {} click failed: {}", index, attempt, e),
                    }
                }
                Ok(token) => {
                    self.finish_solved(task_id, token, started.elapsed(), TokenPath::ResponseField, index)
                        .await;
                    break;
                }
                Err(e) => debug!("Browser {}: Attempt {} read failed: {}", index, attempt, e),
            }
        }

        // Gate on the stored value, not on a local flag
        if self.store.is_pending(task_id) {
            debug!("Browser {}: FallbackCheck using {}", index, WINDOW_TOKEN);
            let token = page
                .evaluate_string(WINDOW_TOKEN)
                .await
                .map_err(|e| SolverError::Solve(format!("fallback check failed: {e}")))?
                .filter(|token| !token.is_empty())
                .ok_or_else(|| {
                    SolverError::Solve(format!(
                        "no token after {} attempts",
                        self.policy.max_attempts
                    ))
                })?;
            self.finish_solved(task_id, token, started.elapsed(), TokenPath::WindowToken, index)
                .await;
        }

        Ok(())
    }

    async fn finish_solved(
        &self,
        task_id: &TaskId,
        token: String,
        elapsed: Duration,
        path: TokenPath,
        index: usize,
    ) {
        let preview: String = token.chars().take(10).collect();
        info!(
            "Browser {}: Successfully solved captcha - {} in {:.3} Seconds{}",
            index,
            preview,
            elapsed.as_secs_f64(),
            if path == TokenPath::WindowToken { " (fallback)" } else { "" }
        );
        metrics::record_solved(elapsed, path);
        self.store
            .complete(task_id, TaskOutcome::Solved { value: token, elapsed })
            .await;
    }

    async fn finish_failed(&self, task_id: &TaskId, elapsed: Duration, index: usize) {
        warn!(
            "Browser {}: Error solving Turnstile in {:.3} Seconds",
            index,
            elapsed.as_secs_f64()
        );
        metrics::record_failed(elapsed);
        self.store
            .complete(task_id, TaskOutcome::Failed { elapsed })
            .await;
    }
}
