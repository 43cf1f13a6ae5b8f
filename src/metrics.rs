use ::metrics::{counter, histogram};
use tracing::trace;

// Every counter is recorded through the `metrics` facade, which the Prometheus
// recorder installed in `main` renders on `/metrics`, and mirrored as a trace event.

pub fn inc_requests(route: &'static str) {
    counter!("hermes_requests_total", "route" => route).increment(1);
    trace!(
        target = "hermes.metrics",
        route = route,
        "requests_total_inc"
    );
}

pub fn batch_processed(rows: usize, elapsed_ms: u128) {
    counter!("hermes_batches_processed_total").increment(1);
    histogram!("hermes_batch_duration_ms").record(elapsed_ms as f64);
    trace!(
        target = "hermes.metrics",
        rows = rows as u64,
        elapsed_ms = elapsed_ms as u64,
        "batch_processed"
    );
}

pub fn row_outcome(kind: &'static str) {
    counter!("hermes_row_outcomes_total", "kind" => kind).increment(1);
    trace!(target = "hermes.metrics", kind = kind, "row_outcome_inc");
}

pub fn transition(to: &'static str) {
    counter!("hermes_job_transitions_total", "to" => to).increment(1);
    trace!(target = "hermes.metrics", to = to, "job_transition_inc");
}

pub fn ingest_elapsed(rows: u64, batches: u64, elapsed_ms: u128) {
    histogram!("hermes_ingest_duration_ms").record(elapsed_ms as f64);
    counter!("hermes_ingested_rows_total").increment(rows);
    trace!(
        target = "hermes.metrics",
        rows = rows,
        batches = batches,
        elapsed_ms = elapsed_ms as u64,
        "ingest_elapsed"
    );
}
