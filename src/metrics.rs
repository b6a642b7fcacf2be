//! Process-wide counters and a fixed-bucket latency histogram, exposed in
//! Prometheus text format.

use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use crate::error::ErrorKind;

/// Latency bucket upper bounds in milliseconds.  Completion calls dominate,
/// so the tail reaches well past a second.
const BUCKETS_MS: [u64; 12] = [5, 10, 25, 50, 100, 250, 500, 1000, 2500, 5000, 10000, 30000];

pub struct Metrics {
    requests_total: AtomicU64,
    success_total: AtomicU64,
    failures_total: [AtomicU64; ErrorKind::ALL.len()],
    hist_counts: [AtomicU64; BUCKETS_MS.len()],
    hist_sum_ms: AtomicU64,
    hist_count: AtomicU64,
    process_start_epoch: f64,
    process_start_instant: Instant,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        let start = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default();
        Self {
            requests_total: AtomicU64::new(0),
            success_total: AtomicU64::new(0),
            failures_total: Default::default(),
            hist_counts: Default::default(),
            hist_sum_ms: AtomicU64::new(0),
            hist_count: AtomicU64::new(0),
            process_start_epoch: start.as_secs_f64(),
            process_start_instant: Instant::now(),
        }
    }

    /// Record one finished request.  `failure` is `None` on success.
    pub fn observe(&self, failure: Option<ErrorKind>, latency_ms: u64) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
        match failure {
            None => self.success_total.fetch_add(1, Ordering::Relaxed),
            Some(kind) => self.failures_total[kind.index()].fetch_add(1, Ordering::Relaxed),
        };
        self.hist_sum_ms.fetch_add(latency_ms, Ordering::Relaxed);
        self.hist_count.fetch_add(1, Ordering::Relaxed);
        if let Some(idx) = BUCKETS_MS.iter().position(|ub| latency_ms <= *ub) {
            self.hist_counts[idx].fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn requests_total(&self) -> u64 {
        self.requests_total.load(Ordering::Relaxed)
    }

    pub fn failures(&self, kind: ErrorKind) -> u64 {
        self.failures_total[kind.index()].load(Ordering::Relaxed)
    }

    pub fn render(&self, audit_records: u64, audit_write_errors: u64) -> String {
        let mut buf = String::new();
        counter(
            &mut buf,
            "storygen_requests_total",
            "Generation requests handled",
            self.requests_total.load(Ordering::Relaxed),
        );
        counter(
            &mut buf,
            "storygen_success_total",
            "Generation requests that produced a result",
            self.success_total.load(Ordering::Relaxed),
        );
        writeln!(
            &mut buf,
            "# HELP storygen_failures_total Failed generation requests by kind\n# TYPE storygen_failures_total counter"
        )
        .ok();
        for kind in ErrorKind::ALL {
            writeln!(
                &mut buf,
                "storygen_failures_total{{kind=\"{}\"}} {}",
                kind.as_str(),
                self.failures(kind)
            )
            .ok();
        }
        counter(
            &mut buf,
            "storygen_audit_records_total",
            "Audit records written",
            audit_records,
        );
        counter(
            &mut buf,
            "storygen_audit_write_errors_total",
            "Audit record write failures",
            audit_write_errors,
        );

        writeln!(
            &mut buf,
            "# HELP storygen_request_latency_ms Request latency histogram milliseconds\n# TYPE storygen_request_latency_ms histogram"
        )
        .ok();
        let count = self.hist_count.load(Ordering::Relaxed);
        let mut cumulative: u64 = 0;
        for (i, ub) in BUCKETS_MS.iter().enumerate() {
            cumulative += self.hist_counts[i].load(Ordering::Relaxed);
            writeln!(
                &mut buf,
                "storygen_request_latency_ms_bucket{{le=\"{}\"}} {}",
                ub, cumulative
            )
            .ok();
        }
        writeln!(
            &mut buf,
            "storygen_request_latency_ms_bucket{{le=\"+Inf\"}} {}",
            count
        )
        .ok();
        writeln!(
            &mut buf,
            "storygen_request_latency_ms_sum {}",
            self.hist_sum_ms.load(Ordering::Relaxed)
        )
        .ok();
        writeln!(&mut buf, "storygen_request_latency_ms_count {}", count).ok();

        writeln!(
            &mut buf,
            "# HELP storygen_build_info Build information\n# TYPE storygen_build_info gauge"
        )
        .ok();
        writeln!(
            &mut buf,
            "storygen_build_info{{version=\"{}\"}} 1",
            env!("CARGO_PKG_VERSION")
        )
        .ok();
        writeln!(
            &mut buf,
            "# HELP storygen_process_start_time_seconds Process start time (Unix epoch seconds)\n# TYPE storygen_process_start_time_seconds gauge"
        )
        .ok();
        writeln!(
            &mut buf,
            "storygen_process_start_time_seconds {}",
            self.process_start_epoch
        )
        .ok();
        writeln!(
            &mut buf,
            "# HELP storygen_process_uptime_seconds Process uptime seconds\n# TYPE storygen_process_uptime_seconds gauge"
        )
        .ok();
        writeln!(
            &mut buf,
            "storygen_process_uptime_seconds {}",
            self.process_start_instant.elapsed().as_secs_f64()
        )
        .ok();
        buf
    }
}

fn counter(buf: &mut String, name: &str, help: &str, value: u64) {
    writeln!(buf, "# HELP {} {}\n# TYPE {} counter", name, help, name).ok();
    writeln!(buf, "{} {}", name, value).ok();
}
