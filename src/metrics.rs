use tracing::trace;

// Trace-based counters; the Prometheus recorder exposes whatever the
// exporter collects at /metrics.

pub fn inc_requests(route: &'static str) {
    trace!(target = "logistics_watch.metrics", route, "requests_total_inc");
}

pub fn stage_elapsed(stage: &'static str, elapsed_ms: u128) {
    trace!(
        target = "logistics_watch.metrics",
        stage,
        elapsed_ms = elapsed_ms as u64,
        "stage_elapsed"
    );
}

pub fn run_finished(has_changes: bool) {
    trace!(target = "logistics_watch.metrics", has_changes, "runs_total_inc");
}

pub fn messages_sent(count: usize) {
    trace!(
        target = "logistics_watch.metrics",
        count = count as u64,
        "messages_sent_total_add"
    );
}
