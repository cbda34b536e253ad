use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;
use tracing::info;

pub const TASKS_SUBMITTED: &str = "solver_tasks_submitted_total";
pub const TASKS_SOLVED: &str = "solver_tasks_solved_total";
pub const TASKS_FAILED: &str = "solver_tasks_failed_total";
pub const SOLVE_SECONDS: &str = "solver_solve_seconds";
pub const POOL_CHECKED_OUT: &str = "solver_pool_checked_out";
pub const POOL_UTILIZATION: &str = "solver_pool_utilization_percent";
pub const PROXY_FORMAT_ERRORS: &str = "solver_proxy_format_errors_total";
pub const PERSISTENCE_ERRORS: &str = "solver_persistence_errors_total";

/// Which extraction path produced a token
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenPath {
    ResponseField,
    WindowToken,
}

impl TokenPath {
    fn label(self) -> &'static str {
        match self {
            TokenPath::ResponseField => "response_field",
            TokenPath::WindowToken => "window_token",
        }
    }
}

/// Install the global Prometheus recorder and return the handle used to
/// render `/metrics`.
pub fn install_prometheus() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    describe_metrics();
    info!("Prometheus metrics recorder installed");
    Ok(handle)
}

fn describe_metrics() {
    describe_counter!(TASKS_SUBMITTED, "Tasks accepted by the submit endpoint");
    describe_counter!(TASKS_SOLVED, "Tasks that produced a token, by extraction path");
    describe_counter!(TASKS_FAILED, "Tasks that ended with CAPTCHA_FAIL");
    describe_histogram!(SOLVE_SECONDS, "Time from session setup to result");
    describe_gauge!(POOL_CHECKED_OUT, "Browsers currently held by a solve");
    describe_gauge!(POOL_UTILIZATION, "Share of the pool in use");
    describe_counter!(PROXY_FORMAT_ERRORS, "Proxy strings that could not be parsed");
    describe_counter!(PERSISTENCE_ERRORS, "Failed writes of the result file");
}

pub fn record_submission() {
    counter!(TASKS_SUBMITTED).increment(1);
}

pub fn record_solved(elapsed: Duration, path: TokenPath) {
    counter!(TASKS_SOLVED, "path" => path.label()).increment(1);
    histogram!(SOLVE_SECONDS, "outcome" => "solved").record(elapsed.as_secs_f64());
}

pub fn record_failed(elapsed: Duration) {
    counter!(TASKS_FAILED).increment(1);
    histogram!(SOLVE_SECONDS, "outcome" => "failed").record(elapsed.as_secs_f64());
}

pub fn record_pool_usage(checked_out: usize, total: usize) {
    gauge!(POOL_CHECKED_OUT).set(checked_out as f64);
    if total > 0 {
        gauge!(POOL_UTILIZATION).set((checked_out as f64 / total as f64) * 100.0);
    }
}

pub fn record_proxy_format_error() {
    counter!(PROXY_FORMAT_ERRORS).increment(1);
}

pub fn record_persistence_error() {
    counter!(PERSISTENCE_ERRORS).increment(1);
}
