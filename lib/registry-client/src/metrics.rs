//! Prometheus metrics for registration and discovery

use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use registry_core::{RegistryError, Result};
use std::sync::Arc;

/// Counters for registry traffic. Clones share the same registry and metrics.
#[derive(Clone)]
pub struct RegistryMetrics {
    /// Registration attempts by outcome (success, failure)
    pub registrations_total: IntCounterVec,
    /// Heartbeats by outcome (success, not_found, failure)
    pub heartbeats_total: IntCounterVec,
    /// Deregistrations by outcome (success, failure)
    pub deregistrations_total: IntCounterVec,
    /// Requests that rotated to the next replica
    pub failovers_total: IntCounter,
    /// 1 while this instance is registered
    pub registered: IntGauge,
    /// Prometheus registry for metrics
    pub registry: Arc<Registry>,
}

impl RegistryMetrics {
    pub fn new() -> Result<Self> {
        Ok(Self::build()?)
    }

    fn build() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let registrations_total = IntCounterVec::new(
            Opts::new("registry_registrations_total", "Registration attempts by outcome"),
            &["outcome"],
        )?;

        let heartbeats_total = IntCounterVec::new(
            Opts::new("registry_heartbeats_total", "Heartbeats by outcome"),
            &["outcome"],
        )?;

        let deregistrations_total = IntCounterVec::new(
            Opts::new("registry_deregistrations_total", "Deregistrations by outcome"),
            &["outcome"],
        )?;

        let failovers_total = IntCounter::new(
            "registry_failovers_total",
            "Requests that rotated to the next registry replica",
        )?;

        let registered = IntGauge::new("registry_registered", "Whether this instance is registered")?;

        registry.register(Box::new(registrations_total.clone()))?;
        registry.register(Box::new(heartbeats_total.clone()))?;
        registry.register(Box::new(deregistrations_total.clone()))?;
        registry.register(Box::new(failovers_total.clone()))?;
        registry.register(Box::new(registered.clone()))?;

        Ok(Self {
            registrations_total,
            heartbeats_total,
            deregistrations_total,
            failovers_total,
            registered,
            registry,
        })
    }

    pub(crate) fn registration(&self, outcome: &str) {
        self.registrations_total.with_label_values(&[outcome]).inc();
    }

    pub(crate) fn heartbeat(&self, outcome: &str) {
        self.heartbeats_total.with_label_values(&[outcome]).inc();
    }

    pub(crate) fn deregistration(&self, outcome: &str) {
        self.deregistrations_total.with_label_values(&[outcome]).inc();
    }

    /// Gather all metrics in Prometheus text format
    pub fn gather(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = vec![];
        encoder.encode(&metric_families, &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| RegistryError::Metrics(prometheus::Error::Msg(e.to_string())))
    }
}
