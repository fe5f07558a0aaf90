use metrics::{counter, histogram};
use tracing::trace;

// Recorded into the Prometheus recorder installed at startup; without one
// the macros are no-ops, which keeps unit tests free of global state.

pub fn api_call(endpoint: &'static str) {
    counter!("scout_api_calls_total", "endpoint" => endpoint).increment(1);
    trace!(target = "hermes.metrics", endpoint, "api_calls_total_inc");
}

pub fn item_excluded(stage: &'static str) {
    counter!("scout_items_excluded_total", "stage" => stage).increment(1);
}

pub fn match_found() {
    counter!("scout_matches_total").increment(1);
}

pub fn task_failed() {
    counter!("scout_tasks_failed_total").increment(1);
}

pub fn cycle_completed(elapsed_ms: u64) {
    counter!("scout_cycles_total").increment(1);
    histogram!("scout_cycle_duration_ms").record(elapsed_ms as f64);
    trace!(target = "hermes.metrics", elapsed_ms, "cycle_elapsed");
}
