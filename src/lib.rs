//! # Turnstile Solver
//!
//! An HTTP task service that obtains Cloudflare Turnstile tokens with a pool of
//! Chromium-family browsers. A client submits a URL and site key, gets a task
//! id back at once, and polls for the token while a pooled browser renders a
//! synthetic page carrying the widget and waits for it to complete.
//!
//! ## Architecture
//!
//! | Component | Module | Role |
//! |-----------|--------|------|
//! | Proxy parsing | [`proxy`] | Proxy strings in four shapes, random pick from a proxy file |
//! | Automation | [`automation`] | Traits for sessions, contexts and page operations |
//! | Chromium | [`chromium`] | DevTools-protocol implementation of the automation traits |
//! | Browser pool | [`browser_pool`] | Fixed set of sessions handed out first come first served |
//! | Task store | [`task_store`] | Task results in memory, mirrored to `results.json` |
//! | Solver | [`solver`] | Per-task protocol: page, polling loop, fallback |
//! | API | [`server`] | `/turnstile`, `/result`, `/health`, `/metrics` |
//!
//! ## API
//!
//! | Endpoint | Success | Failure |
//! |----------|---------|---------|
//! | `GET /turnstile?url=..&sitekey=..[&action][&cdata][&proxy][&useragent]` | `202 {"task_id"}` | `400` missing or invalid parameters |
//! | `GET /result?id=..` | `200 {"value","elapsed_time"}`, or `200 CAPTCHA_NOT_READY` | `400` unknown id, `422` failed task |
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use turnstile_solver::{
//!     BrowserPool, ChallengeSolver, ChromiumProvider, Config, JsonFileBackend, SolveRequest,
//!     TaskId, TaskStore,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config {
//!         headless: true,
//!         user_agent: Some("Mozilla/5.0 (X11; Linux x86_64) Chrome/126.0".to_string()),
//!         ..Default::default()
//!     };
//!     config.validate()?;
//!     let provider = ChromiumProvider::new(config.clone());
//!     let pool = BrowserPool::initialize(config.browser_pool_size, &provider).await?;
//!     let store = Arc::new(TaskStore::load(Arc::new(JsonFileBackend::new("results.json"))).await);
//!     let solver = ChallengeSolver::from_config(pool, store.clone(), &config);
//!
//!     let id = TaskId::generate();
//!     store.create(&id).await;
//!     let record = solver
//!         .solve(
//!             id,
//!             SolveRequest {
//!                 url: "https://example.com".to_string(),
//!                 sitekey: "0x4AAAAAAA".to_string(),
//!                 ..Default::default()
//!             },
//!         )
//!         .await;
//!     println!("{record:?}");
//!     Ok(())
//! }
//! ```
//!
//! ## CLI Usage
//!
//! ```bash
//! turnstile-solver --headless --useragent "Mozilla/5.0 ..." --thread 4 --port 5000
//! turnstile-solver --config solver.json --proxy --proxy-file proxies.txt --metrics
//! ```

/// Page automation traits implemented by browser backends
pub mod automation;

/// Fixed-size pool of browser sessions
pub mod browser_pool;

/// Chromium backend over the DevTools protocol
pub mod chromium;

/// Command-line interface and logging setup
pub mod cli;

/// Configuration and browser launch settings
pub mod config;

/// Error types
pub mod error;

/// Prometheus-compatible counters, gauges and histograms
pub mod metrics;

/// Synthetic challenge page
pub mod page;

/// Proxy string parsing and proxy-file selection
pub mod proxy;

/// HTTP API
pub mod server;

/// Per-task solve protocol
pub mod solver;

/// Task results and their persistence
pub mod task_store;

#[cfg(test)]
mod tests;

pub use automation::*;
pub use browser_pool::*;
pub use chromium::*;
pub use cli::*;
pub use config::*;
pub use error::*;
pub use self::metrics::{install_prometheus, TokenPath};
pub use proxy::*;
pub use server::*;
pub use solver::*;
pub use task_store::*;
