//! Page automation capability used by the solver
//!
//! A [`SessionProvider`] launches long-lived rendering sessions for the pool.
//! Each solve opens an isolated [`PageContext`] on its checked-out session and
//! closes it when done. Any engine that can intercept a navigation, query and
//! click DOM elements, and evaluate script can back these traits.

use crate::{ProxySpec, SolverError};
use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, timeout};

/// Options for a fresh isolated browsing context
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContextOptions {
    pub proxy: Option<ProxySpec>,
    pub user_agent: Option<String>,
}

#[async_trait]
pub trait SessionProvider: Send + Sync {
    /// Launch the session backing pool slot `index` (1-based).
    async fn launch(&self, index: usize) -> Result<Box<dyn BrowserSession>, SolverError>;
}

#[async_trait]
pub trait BrowserSession: Send + Sync {
    async fn new_context(
        &self,
        options: &ContextOptions,
    ) -> Result<Box<dyn PageContext>, SolverError>;

    async fn shutdown(&self);
}

#[async_trait]
pub trait PageContext: Send + Sync {
    /// Answer the next navigation to `url` with `html` instead of fetching it.
    async fn route_document(&self, url: &str, html: &str) -> Result<(), SolverError>;

    /// Navigate and return once the document has been parsed.
    async fn goto(&self, url: &str) -> Result<(), SolverError>;

    async fn wait_for_network_idle(&self) -> Result<(), SolverError>;

    async fn set_style(&self, selector: &str, property: &str, value: &str)
        -> Result<(), SolverError>;

    /// Current value of the input matching `selector`, waiting up to
    /// `timeout` for the element to be attached.
    async fn input_value(&self, selector: &str, timeout: Duration) -> Result<String, SolverError>;

    /// Click the element matching `selector`, waiting up to `timeout` for it.
    async fn click(&self, selector: &str, timeout: Duration) -> Result<(), SolverError>;

    /// Evaluate `expression` and return it when it is a string.
    async fn evaluate_string(&self, expression: &str) -> Result<Option<String>, SolverError>;

    async fn close(&self) -> Result<(), SolverError>;
}

/// Run `check` every `interval` until it yields a value.
///
/// `Ok(None)` means "not there yet". Errors from `check` end the wait at once.
/// The whole wait, including a check that hangs, is bounded by `limit` and
/// ends in [`SolverError::Timeout`].
pub async fn wait_until<T, F, Fut>(
    limit: Duration,
    interval: Duration,
    mut check: F,
) -> Result<T, SolverError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>, SolverError>>,
{
    timeout(limit, async {
        loop {
            if let Some(value) = check().await? {
                return Ok::<T, SolverError>(value);
            }
            sleep(interval).await;
        }
    })
    .await
    .map_err(|_| SolverError::Timeout(limit))?
}
