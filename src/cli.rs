use crate::{BrowserType, Config};
use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug, Default)]
#[command(name = "turnstile-solver")]
#[command(about = "Turnstile solver HTTP API backed by a pool of browsers")]
#[command(version)]
pub struct Cli {
    #[arg(long, help = "Configuration file path (JSON)")]
    pub config: Option<PathBuf>,

    #[arg(long, help = "Run the browsers headless (requires --useragent)")]
    pub headless: bool,

    #[arg(long, help = "Default User-Agent for tasks that do not set one")]
    pub useragent: Option<String>,

    #[arg(long, help = "Enable debug logging")]
    pub debug: bool,

    #[arg(
        long,
        alias = "browser_type",
        help = "Browser to launch (chromium, chrome, msedge)"
    )]
    pub browser_type: Option<BrowserType>,

    #[arg(long, help = "Number of browser instances")]
    pub thread: Option<usize>,

    #[arg(long, help = "Pick a random proxy from the proxy file for tasks without one")]
    pub proxy: bool,

    #[arg(long, help = "Address to bind the API to")]
    pub host: Option<String>,

    #[arg(long, help = "Port to bind the API to")]
    pub port: Option<u16>,

    #[arg(long, help = "Proxy list used with --proxy")]
    pub proxy_file: Option<String>,

    #[arg(long, help = "File task results are persisted to")]
    pub results_file: Option<String>,

    #[arg(long, help = "Browser executable path")]
    pub chrome_path: Option<String>,

    #[arg(long, help = "Serve Prometheus metrics on /metrics")]
    pub metrics: bool,
}

impl Cli {
    /// Apply command-line overrides on top of a loaded configuration.
    /// Switches only ever turn a setting on.
    pub fn apply(&self, config: &mut Config) {
        if self.headless {
            config.headless = true;
        }
        if self.debug {
            config.debug = true;
        }
        if self.proxy {
            config.proxy_support = true;
        }
        if self.metrics {
            config.metrics = true;
        }
        if let Some(user_agent) = &self.useragent {
            config.user_agent = Some(user_agent.clone());
        }
        if let Some(browser_type) = self.browser_type {
            config.browser_type = browser_type;
        }
        if let Some(thread) = self.thread {
            config.browser_pool_size = thread;
        }
        if let Some(host) = &self.host {
            config.host = host.clone();
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(proxy_file) = &self.proxy_file {
            config.proxy_file = proxy_file.clone();
        }
        if let Some(results_file) = &self.results_file {
            config.results_file = results_file.clone();
        }
        if let Some(chrome_path) = &self.chrome_path {
            config.chrome_path = Some(chrome_path.clone());
        }
    }
}

/// Read the JSON config file named by `--config` (or start from defaults),
/// apply the command-line overrides and validate the result.
pub async fn load_config(args: &Cli) -> anyhow::Result<Config> {
    let mut config = if let Some(config_path) = &args.config {
        let config_content = tokio::fs::read_to_string(config_path)
            .await
            .with_context(|| format!("failed to read {}", config_path.display()))?;
        serde_json::from_str(&config_content)
            .with_context(|| format!("invalid configuration in {}", config_path.display()))?
    } else {
        Config::default()
    };

    args.apply(&mut config);
    config.validate()?;
    Ok(config)
}

pub fn setup_logging(verbose: bool) -> anyhow::Result<()> {
    let level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to install log subscriber: {e}"))?;

    Ok(())
}
