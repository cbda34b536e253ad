//! Chromium automation provider built on the DevTools protocol
//!
//! Every pool slot owns one launched browser. A solve gets its own browser
//! context, so proxies, cookies and storage never leak between tasks. Document
//! routing is done with `Fetch` interception: the paused request for the
//! routed URL is fulfilled with the synthetic page, every other request is let
//! through, and proxy auth challenges are answered with the context's
//! credentials.

use crate::{
    create_browser_config_with_instance_id, wait_until, BrowserSession, Config, ContextOptions,
    PageContext, SessionProvider, SolverError,
};
use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use chromiumoxide::browser::Browser;
use chromiumoxide::cdp::browser_protocol::browser::BrowserContextId;
use chromiumoxide::cdp::browser_protocol::fetch::{
    AuthChallengeResponse, AuthChallengeResponseResponse, ContinueRequestParams,
    ContinueWithAuthParams, EnableParams, EventAuthRequired, EventRequestPaused,
    FulfillRequestParams, HeaderEntry, RequestPattern,
};
use chromiumoxide::cdp::browser_protocol::network::SetUserAgentOverrideParams;
use chromiumoxide::cdp::browser_protocol::target::{
    CreateBrowserContextParams, CreateTargetParams, DisposeBrowserContextParams,
};
use chromiumoxide::Page;
use futures::StreamExt;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

const NETWORK_IDLE_QUIET: Duration = Duration::from_millis(500);
const NETWORK_IDLE_TIMEOUT: Duration = Duration::from_secs(10);
const NETWORK_IDLE_POLL: Duration = Duration::from_millis(250);
const ELEMENT_POLL: Duration = Duration::from_millis(100);

/// Launches one Chromium-family browser per pool slot
pub struct ChromiumProvider {
    config: Config,
}

impl ChromiumProvider {
    pub fn new(config: Config) -> Self {
        Self { config }
    }
}

#[async_trait]
impl SessionProvider for ChromiumProvider {
    async fn launch(&self, index: usize) -> Result<Box<dyn BrowserSession>, SolverError> {
        let browser_config = create_browser_config_with_instance_id(&self.config, index)?;

        let (browser, mut handler) = Browser::launch(browser_config)
            .await
            .map_err(|e| SolverError::Browser(format!("launch failed: {e}")))?;

        // The handler is a Stream and must be polled for the browser to make progress
        let handler_task = tokio::spawn(async move {
            loop {
                match handler.next().await {
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        debug!("Browser {} handler error: {}", index, e);
                    }
                    None => {
                        info!("Browser {} handler stream ended", index);
                        break;
                    }
                }
            }
        });

        Ok(Box::new(ChromiumSession {
            index,
            browser: Arc::new(Mutex::new(browser)),
            handler: handler_task,
        }))
    }
}

pub struct ChromiumSession {
    index: usize,
    browser: Arc<Mutex<Browser>>,
    handler: JoinHandle<()>,
}

#[async_trait]
impl BrowserSession for ChromiumSession {
    async fn new_context(
        &self,
        options: &ContextOptions,
    ) -> Result<Box<dyn PageContext>, SolverError> {
        let browser = self.browser.lock().await;

        let context_params = CreateBrowserContextParams {
            proxy_server: options.proxy.as_ref().map(|p| p.server()),
            ..Default::default()
        };
        let context_id = browser.execute(context_params).await?.result.browser_context_id;

        let mut target = CreateTargetParams::new("about:blank");
        target.browser_context_id = Some(context_id.clone());
        let page = match browser.new_page(target).await {
            Ok(page) => page,
            Err(e) => {
                if let Err(dispose_err) = browser
                    .execute(DisposeBrowserContextParams::new(context_id))
                    .await
                {
                    debug!("Browser {}: context dispose failed: {}", self.index, dispose_err);
                }
                return Err(e.into());
            }
        };
        drop(browser);

        let context = ChromiumContext {
            session: self.index,
            browser: self.browser.clone(),
            context_id,
            page,
            route: Arc::new(StdMutex::new(None)),
            listeners: Listeners::default(),
        };
        if let Err(e) = context.configure(options).await {
            warn!("Browser {}: context setup failed, tearing it down: {}", self.index, e);
            if let Err(close_err) = context.close().await {
                debug!("Browser {}: teardown failed: {}", self.index, close_err);
            }
            return Err(e);
        }

        debug!("Browser {} opened a new context", self.index);
        Ok(Box::new(context))
    }

    async fn shutdown(&self) {
        if let Err(e) = self.browser.lock().await.close().await {
            warn!("Error closing browser {}: {}", self.index, e);
        }
        self.handler.abort();
    }
}

/// A routed document: requests for `url` are answered with `html`
#[derive(Debug, Clone)]
struct DocumentRoute {
    url: String,
    html: String,
}

impl DocumentRoute {
    fn matches(&self, request_url: &str) -> bool {
        request_url.trim_end_matches('/') == self.url.trim_end_matches('/')
    }
}

/// Event listener tasks of one context, aborted on drop
#[derive(Default)]
struct Listeners(StdMutex<Vec<JoinHandle<()>>>);

impl Listeners {
    fn track(&self, task: JoinHandle<()>) {
        match self.0.lock() {
            Ok(mut tasks) => tasks.push(task),
            Err(_) => task.abort(),
        }
    }

    fn abort_all(&self) {
        if let Ok(mut tasks) = self.0.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
    }
}

impl Drop for Listeners {
    fn drop(&mut self) {
        self.abort_all();
    }
}

pub struct ChromiumContext {
    session: usize,
    browser: Arc<Mutex<Browser>>,
    context_id: BrowserContextId,
    page: Page,
    route: Arc<StdMutex<Option<DocumentRoute>>>,
    listeners: Listeners,
}

impl ChromiumContext {
    async fn configure(&self, options: &ContextOptions) -> Result<(), SolverError> {
        if let Some(user_agent) = &options.user_agent {
            self.page
                .execute(SetUserAgentOverrideParams::new(user_agent.clone()))
                .await?;
        }
        self.start_interception(options).await
    }

    async fn start_interception(&self, options: &ContextOptions) -> Result<(), SolverError> {
        let mut paused = self.page.event_listener::<EventRequestPaused>().await?;
        let page = self.page.clone();
        let route = self.route.clone();
        let paused_task = tokio::spawn(async move {
            while let Some(event) = paused.next().await {
                let routed = route
                    .lock()
                    .ok()
                    .and_then(|r| r.clone())
                    .filter(|r| r.matches(&event.request.url));

                let outcome = match routed {
                    Some(route) => match fulfill_params(&event, &route.html) {
                        Ok(params) => page.execute(params).await.map(|_| ()),
                        Err(e) => {
                            error!("Could not build response for {}: {}", route.url, e);
                            continue;
                        }
                    },
                    None => page
                        .execute(ContinueRequestParams::new(event.request_id.clone()))
                        .await
                        .map(|_| ()),
                };
                if let Err(e) = outcome {
                    debug!("Intercepted request for {} not resumed: {}", event.request.url, e);
                }
            }
        });
        self.listeners.track(paused_task);

        let credentials = options
            .proxy
            .as_ref()
            .and_then(|p| Some((p.username.clone()?, p.password.clone().unwrap_or_default())));

        if let Some((username, password)) = credentials.clone() {
            let mut challenges = self.page.event_listener::<EventAuthRequired>().await?;
            let page = self.page.clone();
            let auth_task = tokio::spawn(async move {
                while let Some(event) = challenges.next().await {
                    let response = AuthChallengeResponse {
                        response: AuthChallengeResponseResponse::ProvideCredentials,
                        username: Some(username.clone()),
                        password: Some(password.clone()),
                    };
                    let params = ContinueWithAuthParams::new(event.request_id.clone(), response);
                    if let Err(e) = page.execute(params).await {
                        debug!("Proxy auth challenge not answered: {}", e);
                    }
                }
            });
            self.listeners.track(auth_task);
        }

        let enable = EnableParams {
            patterns: Some(vec![RequestPattern {
                url_pattern: Some("*".to_string()),
                ..Default::default()
            }]),
            handle_auth_requests: Some(credentials.is_some()),
        };
        self.page.execute(enable).await?;
        Ok(())
    }

    async fn evaluate_json(&self, expression: &str) -> Result<serde_json::Value, SolverError> {
        let result = self.page.evaluate(expression).await?;
        Ok(result
            .into_value::<serde_json::Value>()
            .unwrap_or(serde_json::Value::Null))
    }
}

fn fulfill_params(event: &EventRequestPaused, html: &str) -> Result<FulfillRequestParams, String> {
    FulfillRequestParams::builder()
        .request_id(event.request_id.clone())
        .response_code(200)
        .response_header(HeaderEntry::new("Content-Type", "text/html; charset=utf-8"))
        .body(general_purpose::STANDARD.encode(html))
        .build()
}

/// `document.querySelector` call with the selector quoted as a JS string
fn query(selector: &str) -> String {
    let quoted = serde_json::to_string(selector).unwrap_or_else(|_| "\"\"".to_string());
    format!("document.querySelector({quoted})")
}

#[async_trait]
impl PageContext for ChromiumContext {
    async fn route_document(&self, url: &str, html: &str) -> Result<(), SolverError> {
        let mut route = self
            .route
            .lock()
            .map_err(|_| SolverError::Browser("route table poisoned".to_string()))?;
        *route = Some(DocumentRoute {
            url: url.to_string(),
            html: html.to_string(),
        });
        Ok(())
    }

    async fn goto(&self, url: &str) -> Result<(), SolverError> {
        self.page.goto(url).await?;
        Ok(())
    }

    async fn wait_for_network_idle(&self) -> Result<(), SolverError> {
        let start = Instant::now();
        let mut last_count = 0u64;
        let mut stable_since = Instant::now();

        while start.elapsed() < NETWORK_IDLE_TIMEOUT {
            let count = self
                .evaluate_json("performance.getEntriesByType('resource').length")
                .await?
                .as_u64()
                .unwrap_or(0);
            let complete = self
                .evaluate_json("document.readyState")
                .await?
                .as_str()
                .map(|s| s == "complete")
                .unwrap_or(false);

            if !complete || count != last_count {
                last_count = count;
                stable_since = Instant::now();
            } else if stable_since.elapsed() >= NETWORK_IDLE_QUIET {
                return Ok(());
            }
            sleep(NETWORK_IDLE_POLL).await;
        }

        debug!(
            "Browser {}: network still busy after {:?}, continuing",
            self.session, NETWORK_IDLE_TIMEOUT
        );
        Ok(())
    }

    async fn set_style(
        &self,
        selector: &str,
        property: &str,
        value: &str,
    ) -> Result<(), SolverError> {
        let property = serde_json::to_string(property)?;
        let value = serde_json::to_string(value)?;
        let applied = self
            .evaluate_json(&format!(
                "(() => {{ const el = {}; if (!el) return false; el.style.setProperty({property}, {value}); return true; }})()",
                query(selector)
            ))
            .await?;
        match applied.as_bool() {
            Some(true) => Ok(()),
            _ => Err(SolverError::ElementNotFound(selector.to_string())),
        }
    }

    async fn input_value(&self, selector: &str, limit: Duration) -> Result<String, SolverError> {
        let expression = format!(
            "(() => {{ const el = {}; return el ? el.value : null; }})()",
            query(selector)
        );
        let expression = expression.as_str();
        // A missing element evaluates to null and is polled again
        wait_until(limit, ELEMENT_POLL, move || async move {
            match self.evaluate_json(expression).await? {
                serde_json::Value::String(value) => Ok::<_, SolverError>(Some(value)),
                _ => Ok(None),
            }
        })
        .await
    }

    async fn click(&self, selector: &str, limit: Duration) -> Result<(), SolverError> {
        wait_until(limit, ELEMENT_POLL, move || async move {
            match self.page.find_element(selector).await {
                Ok(element) => {
                    element.click().await?;
                    Ok::<_, SolverError>(Some(()))
                }
                Err(_) => Ok(None),
            }
        })
        .await
    }

    async fn evaluate_string(&self, expression: &str) -> Result<Option<String>, SolverError> {
        Ok(self
            .evaluate_json(expression)
            .await?
            .as_str()
            .map(|s| s.to_string()))
    }

    async fn close(&self) -> Result<(), SolverError> {
        self.listeners.abort_all();
        if let Err(e) = self.page.clone().close().await {
            debug!("Browser {}: page close failed: {}", self.session, e);
        }
        self.browser
            .lock()
            .await
            .execute(DisposeBrowserContextParams::new(self.context_id.clone()))
            .await?;
        Ok(())
    }
}
