use tracing::trace;

// Counters are emitted as trace events; no recorder is installed.

pub fn inc_requests(route: &'static str) {
    trace!(
        target = "discovery.metrics",
        route = route,
        "requests_total_inc"
    );
}

pub fn stage_elapsed(stage: &'static str, elapsed_ms: u128) {
    trace!(
        target = "discovery.metrics",
        stage = stage,
        elapsed_ms = elapsed_ms as u64,
        "stage_elapsed"
    );
}

pub fn items_counted(stage: &'static str, count: usize) {
    trace!(
        target = "discovery.metrics",
        stage = stage,
        count = count as u64,
        "items_counted"
    );
}
