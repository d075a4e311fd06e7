use crate::prelude::*;
use prometheus::{Encoder, Histogram, IntCounterVec, IntGauge, TextEncoder};

/// Process-wide Prometheus registrations exposed at `/metrics`, narrowed
/// to the counters this job model actually has.
#[derive(Clone)]
pub struct Metrics {
    jobs_total: IntCounterVec,
    jobs_in_flight: IntGauge,
    claim_latency_seconds: Histogram,
}

impl Metrics {
    pub fn new() -> Fallible<Self> {
        let jobs_total = prometheus::register_int_counter_vec!(
            prometheus::opts!("bisectbot_jobs_total", "jobs reaching a terminal status"),
            &["status"]
        )?;
        let jobs_in_flight = prometheus::register_int_gauge!(
            "bisectbot_jobs_in_flight",
            "jobs currently claimed by this instance"
        )?;
        let claim_latency_seconds = prometheus::register_histogram!(
            "bisectbot_claim_latency_seconds",
            "time between a job becoming pending and this instance claiming it",
            vec![0.05, 0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]
        )?;

        Ok(Metrics {
            jobs_total,
            jobs_in_flight,
            claim_latency_seconds,
        })
    }

    pub fn record_terminal(&self, status: &str) {
        self.jobs_total.with_label_values(&[status]).inc();
    }

    pub fn set_in_flight(&self, count: i64) {
        self.jobs_in_flight.set(count);
    }

    /// `latency` is the gap between a job's `created_at` and the moment
    /// this instance's claim query picked it up.
    pub fn observe_claim_latency(&self, latency: chrono::Duration) {
        let seconds = latency.num_milliseconds().max(0) as f64 / 1000.0;
        self.claim_latency_seconds.observe(seconds);
    }

    pub fn gather_text(&self) -> Fallible<Vec<u8>> {
        let mut buffer = Vec::new();
        let families = prometheus::gather();
        TextEncoder::new().encode(&families, &mut buffer)?;
        Ok(buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exposition_includes_registered_metrics() {
        let metrics = Metrics::new().unwrap();
        metrics.record_terminal("completed");
        metrics.set_in_flight(2);
        metrics.observe_claim_latency(chrono::Duration::milliseconds(250));
        let text = String::from_utf8(metrics.gather_text().unwrap()).unwrap();
        assert!(text.contains("bisectbot_jobs_total"));
        assert!(text.contains("bisectbot_jobs_in_flight"));
        assert!(text.contains("bisectbot_claim_latency_seconds"));
    }
}
