//! Discovery Metrics
//!
//! Prometheus counters and histograms for discovery sessions and the
//! requests they issue. Each [`DiscoveryMetrics`] owns its own registry so
//! several managers (and tests) can coexist in one process.

use crate::error::Result;
use prometheus::{Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};

const NAMESPACE: &str = "sas_discovery";

#[derive(Clone)]
pub struct DiscoveryMetrics {
    registry: Registry,
    pub sessions_started: IntCounter,
    pub sessions_completed: IntCounter,
    pub sessions_failed: IntCounter,
    pub requests_issued: IntCounterVec,
    pub request_timeouts: IntCounter,
    pub quirk_retries: IntCounter,
    pub session_duration: Histogram,
}

impl DiscoveryMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let counter = |name: &str, help: &str| -> Result<IntCounter> {
            let c = IntCounter::with_opts(Opts::new(name, help).namespace(NAMESPACE))?;
            registry.register(Box::new(c.clone()))?;
            Ok(c)
        };

        let sessions_started = counter("sessions_started_total", "Discovery sessions started")?;
        let sessions_completed = counter("sessions_completed_total", "Discovery sessions committed")?;
        let sessions_failed = counter("sessions_failed_total", "Discovery sessions rolled back")?;
        let request_timeouts = counter("request_timeouts_total", "Requests that timed out")?;
        let quirk_retries = counter("quirk_retries_total", "Requests resubmitted by a vendor quirk")?;

        let requests_issued = IntCounterVec::new(
            Opts::new("requests_issued_total", "Requests issued by kind").namespace(NAMESPACE),
            &["kind"],
        )?;
        registry.register(Box::new(requests_issued.clone()))?;

        let session_duration = Histogram::with_opts(
            HistogramOpts::new("session_duration_seconds", "Wall time of a discovery session")
                .namespace(NAMESPACE)
                .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 15.0, 60.0]),
        )?;
        registry.register(Box::new(session_duration.clone()))?;

        Ok(Self {
            registry,
            sessions_started,
            sessions_completed,
            sessions_failed,
            requests_issued,
            request_timeouts,
            quirk_retries,
            session_duration,
        })
    }

    #[inline]
    pub fn record_request(&self, kind: &str) {
        self.requests_issued.with_label_values(&[kind]).inc();
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

impl std::fmt::Debug for DiscoveryMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscoveryMetrics")
            .field("sessions_started", &self.sessions_started.get())
            .field("sessions_completed", &self.sessions_completed.get())
            .field("sessions_failed", &self.sessions_failed.get())
            .finish()
    }
}

/// Render every metric in the Prometheus text format
pub fn gather_text(metrics: &DiscoveryMetrics) -> Result<String> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&metrics.registry.gather(), &mut buffer)?;
    Ok(String::from_utf8_lossy(&buffer).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gather_text_includes_counters() {
        let metrics = DiscoveryMetrics::new().unwrap();
        metrics.sessions_started.inc();
        metrics.record_request("report_general");
        metrics.record_request("report_general");

        let text = gather_text(&metrics).unwrap();
        assert!(text.contains("sas_discovery_sessions_started_total 1"));
        assert!(text.contains("sas_discovery_requests_issued_total{kind=\"report_general\"} 2"));
    }

    #[test]
    fn test_instances_are_independent() {
        let a = DiscoveryMetrics::new().unwrap();
        let b = DiscoveryMetrics::new().unwrap();
        a.request_timeouts.inc();
        assert_eq!(b.request_timeouts.get(), 0);
    }
}
