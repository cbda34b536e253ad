//! Configuration management with serde serialization/deserialization
//!
//! This module holds the service configuration, the widget polling policy and
//! the helpers that turn them into Chromium launch settings.

use crate::SolverError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main configuration structure for the solver service
///
/// Every field can be set from a JSON config file and most can be overridden
/// on the command line.
///
/// # Examples
///
/// ```rust
/// use turnstile_solver::Config;
///
/// let config = Config {
///     browser_pool_size: 4,
///     headless: true,
///     ..Default::default()
/// };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Number of browser sessions launched at startup (default: 1)
    ///
    /// Each session serves one task at a time, so this is also the number of
    /// tasks solved concurrently.
    pub browser_pool_size: usize,

    /// Run browsers without a visible window (default: false)
    pub headless: bool,

    /// User agent applied to every task that does not bring its own
    pub user_agent: Option<String>,

    /// Chromium-family browser to launch (default: chromium)
    pub browser_type: BrowserType,

    /// Path to the browser executable (default: auto-detect)
    ///
    /// When unset, `chrome` and `msedge` are looked up at their usual
    /// install locations and `chromium` is left to auto-detection.
    pub chrome_path: Option<String>,

    /// Pick a random proxy from `proxy_file` for tasks without one (default: false)
    pub proxy_support: bool,

    /// Newline-separated proxy list (default: proxies.txt)
    pub proxy_file: String,

    /// Where task results are persisted (default: results.json)
    pub results_file: String,

    /// Address the HTTP server binds to (default: 127.0.0.1)
    pub host: String,

    /// Port the HTTP server listens on (default: 5000)
    pub port: u16,

    /// Verbose logging (default: false)
    pub debug: bool,

    /// Install the Prometheus recorder and serve `/metrics` (default: false)
    pub metrics: bool,

    /// Timing of the widget polling loop
    pub polling: PollingPolicy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            browser_pool_size: 1,
            headless: false,
            user_agent: None,
            browser_type: BrowserType::default(),
            chrome_path: None,
            proxy_support: false,
            proxy_file: "proxies.txt".to_string(),
            results_file: "results.json".to_string(),
            host: "127.0.0.1".to_string(),
            port: 5000,
            debug: false,
            metrics: false,
            polling: PollingPolicy::default(),
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), SolverError> {
        if self.browser_pool_size == 0 {
            return Err(SolverError::Configuration(
                "browser_pool_size must be greater than 0".to_string(),
            ));
        }

        if self.browser_pool_size > 64 {
            return Err(SolverError::Configuration(
                "browser_pool_size should not exceed 64".to_string(),
            ));
        }

        if self.host.trim().is_empty() {
            return Err(SolverError::Configuration("host must not be empty".to_string()));
        }

        if self.results_file.trim().is_empty() {
            return Err(SolverError::Configuration(
                "results_file must not be empty".to_string(),
            ));
        }

        // A headless Chromium advertises itself in its default User-Agent
        if self.headless && self.user_agent.as_deref().map_or(true, |ua| ua.trim().is_empty()) {
            return Err(SolverError::Configuration(
                "headless mode requires a user agent (--useragent or user_agent)".to_string(),
            ));
        }

        if self.proxy_support && self.proxy_file.trim().is_empty() {
            return Err(SolverError::Configuration(
                "proxy_file must be set when proxy support is enabled".to_string(),
            ));
        }

        self.polling.validate()
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Supported Chromium-family browsers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BrowserType {
    #[default]
    Chromium,
    Chrome,
    Msedge,
}

impl BrowserType {
    /// Usual executable location, if the browser has a fixed one
    pub fn default_executable(self) -> Option<&'static str> {
        match self {
            BrowserType::Chromium => None,
            BrowserType::Chrome => Some("/usr/bin/google-chrome"),
            BrowserType::Msedge => Some("/usr/bin/microsoft-edge"),
        }
    }
}

impl std::str::FromStr for BrowserType {
    type Err = SolverError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "chromium" => Ok(BrowserType::Chromium),
            "chrome" => Ok(BrowserType::Chrome),
            "msedge" => Ok(BrowserType::Msedge),
            other => Err(SolverError::Configuration(format!(
                "unsupported browser type: {other}"
            ))),
        }
    }
}

/// Timing of the widget polling loop
///
/// The defaults are the values the service runs with. Tests shorten them.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct PollingPolicy {
    /// Read attempts before falling back to the page-global token (default: 20)
    pub max_attempts: usize,

    /// Bound on each read of the response field (default: 2000 ms)
    #[serde(with = "millis")]
    pub read_timeout: Duration,

    /// Bound on each click of the widget (default: 1000 ms)
    #[serde(with = "millis")]
    pub click_timeout: Duration,

    /// Pause after a click (default: 500 ms)
    #[serde(with = "millis")]
    pub retry_delay: Duration,

    /// CSS width forced onto the widget container (default: 70px)
    pub widget_width: String,
}

impl Default for PollingPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 20,
            read_timeout: Duration::from_millis(2000),
            click_timeout: Duration::from_millis(1000),
            retry_delay: Duration::from_millis(500),
            widget_width: "70px".to_string(),
        }
    }
}

impl PollingPolicy {
    pub fn validate(&self) -> Result<(), SolverError> {
        if self.max_attempts == 0 {
            return Err(SolverError::Configuration(
                "polling.max_attempts must be greater than 0".to_string(),
            ));
        }
        if self.read_timeout.is_zero() || self.click_timeout.is_zero() {
            return Err(SolverError::Configuration(
                "polling timeouts must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

/// Generate browser command-line arguments for pool slot `instance_id`
///
/// Each slot gets its own profile directory and debugging port so several
/// browsers can run side by side.
///
/// # Examples
///
/// ```rust
/// use turnstile_solver::{Config, get_chrome_args_with_instance_id};
///
/// let config = Config { headless: true, ..Default::default() };
/// let args = get_chrome_args_with_instance_id(&config, 2);
/// assert!(args.iter().any(|a| a == "--headless"));
/// assert!(args.iter().any(|a| a == "--remote-debugging-port=9224"));
/// ```
pub fn get_chrome_args_with_instance_id(config: &Config, instance_id: usize) -> Vec<String> {
    let unique_id = format!("{}-{}", std::process::id(), instance_id);

    let mut args = vec![
        "--no-sandbox".to_string(),
        "--disable-dev-shm-usage".to_string(),
        "--disable-background-timer-throttling".to_string(),
        "--disable-backgrounding-occluded-windows".to_string(),
        "--disable-renderer-backgrounding".to_string(),
        "--disable-blink-features=AutomationControlled".to_string(),
        "--disable-features=TranslateUI".to_string(),
        "--disable-extensions".to_string(),
        "--disable-default-apps".to_string(),
        "--disable-sync".to_string(),
        "--no-first-run".to_string(),
        "--disable-process-singleton-dialog".to_string(),
        "--disable-features=ProcessSingleton".to_string(),
        format!("--user-data-dir=/tmp/turnstile-solver-{}", unique_id),
        format!("--remote-debugging-port={}", 9222 + instance_id),
        format!("--temp-dir=/tmp/turnstile-solver-temp-{}", unique_id),
    ];

    if config.headless {
        args.push("--headless".to_string());
        args.push("--disable-gpu".to_string());
    }

    if let Some(user_agent) = &config.user_agent {
        args.push(format!("--user-agent={user_agent}"));
    }

    args
}

pub fn create_browser_config_with_instance_id(
    config: &Config,
    instance_id: usize,
) -> Result<chromiumoxide::browser::BrowserConfig, SolverError> {
    use chromiumoxide::browser::BrowserConfig;

    let mut builder = BrowserConfig::builder()
        .window_size(1280, 800)
        .args(get_chrome_args_with_instance_id(config, instance_id));

    if !config.headless {
        builder = builder.with_head();
    }

    let executable = config
        .chrome_path
        .as_deref()
        .or_else(|| config.browser_type.default_executable());
    if let Some(path) = executable {
        builder = builder.chrome_executable(path);
    }

    builder.build().map_err(SolverError::Configuration)
}
