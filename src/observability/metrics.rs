//! Prometheus counters for the session pipeline, rendered at `GET /metrics`.

use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};

/// Owns its registry so several instances (tests, embedded use) never collide.
pub struct SessionMetrics {
    registry: Registry,
    pub messages_received: IntCounter,
    pub messages_queued: IntCounter,
    pub messages_drained: IntCounter,
    /// Messages given up on after repeated engine faults.
    pub messages_dropped: IntCounter,
    pub cycles_started: IntCounter,
    pub cycles_completed: IntCounter,
    pub chained_cycles: IntCounter,
    pub chain_bound_stashes: IntCounter,
    pub lock_busy: IntCounter,
    pub lock_lost: IntCounter,
    /// Labelled by `kind`: error, panic or timeout.
    pub engine_faults: IntCounterVec,
    pub store_errors: IntCounter,
    pub degraded_loads: IntCounter,
    pub cycle_duration: Histogram,
}

fn counter(registry: &Registry, name: &str, help: &str) -> prometheus::Result<IntCounter> {
    let c = IntCounter::new(name, help)?;
    registry.register(Box::new(c.clone()))?;
    Ok(c)
}

impl SessionMetrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new_custom(Some("turnstile".into()), None)?;

        let engine_faults = IntCounterVec::new(
            Opts::new("engine_faults_total", "Reasoning steps that errored, panicked or timed out"),
            &["kind"],
        )?;
        registry.register(Box::new(engine_faults.clone()))?;

        let cycle_duration = Histogram::with_opts(
            HistogramOpts::new(
                "cycle_duration_seconds",
                "Wall time from lock acquisition to release",
            )
            .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0]),
        )?;
        registry.register(Box::new(cycle_duration.clone()))?;

        Ok(Self {
            messages_received: counter(&registry, "messages_received_total", "Inbound messages")?,
            messages_queued: counter(
                &registry,
                "messages_queued_total",
                "Messages queued behind a held session lock",
            )?,
            messages_drained: counter(
                &registry,
                "messages_drained_total",
                "Queued messages drained by the lock holder",
            )?,
            messages_dropped: counter(
                &registry,
                "messages_dropped_total",
                "Messages dropped after repeated engine faults",
            )?,
            cycles_started: counter(&registry, "cycles_started_total", "Reasoning cycles started")?,
            cycles_completed: counter(
                &registry,
                "cycles_completed_total",
                "Reasoning cycles persisted successfully",
            )?,
            chained_cycles: counter(
                &registry,
                "chained_cycles_total",
                "Extra cycles started for messages that arrived mid-cycle",
            )?,
            chain_bound_stashes: counter(
                &registry,
                "chain_bound_stashes_total",
                "Times the chained-cycle bound stashed messages for the next invocation",
            )?,
            lock_busy: counter(&registry, "lock_busy_total", "Lock attempts that found the session busy")?,
            lock_lost: counter(&registry, "lock_lost_total", "Cycles aborted because the lock was lost")?,
            engine_faults,
            store_errors: counter(&registry, "store_errors_total", "Cycles failed by the store")?,
            degraded_loads: counter(
                &registry,
                "degraded_loads_total",
                "Persistent loads that fell back to a default record",
            )?,
            cycle_duration,
            registry,
        })
    }

    /// Prometheus text exposition of every metric.
    pub fn render(&self) -> String {
        let mut buf = Vec::new();
        if let Err(e) = TextEncoder::new().encode(&self.registry.gather(), &mut buf) {
            tracing::warn!("failed to encode metrics: {e}");
            return String::new();
        }
        String::from_utf8(buf).unwrap_or_default()
    }
}
