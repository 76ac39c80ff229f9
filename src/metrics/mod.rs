use prometheus::{
    HistogramOpts, HistogramVec, IntCounter, IntCounterVec,
    IntGauge, Opts, Registry,
};

use crate::domain::order::Platform;

// ============================================================================
// Metrics Module - Prometheus metrics for observability
// ============================================================================
//
// Provides metrics for:
// - Webhook intake (accepted / rejected per platform)
// - Reconciliation throughput and latency by disposition
// - Store retry attempts and outcomes
// - Dead-letter volume
// - Live per-key queues in the dispatcher
//
// All metrics are registered with one Registry and scraped via /metrics
// ============================================================================

/// Central metrics registry for the entire application
pub struct Metrics {
    registry: Registry,

    // Webhook Intake Metrics
    pub webhooks_received: IntCounterVec,

    // Reconciliation Metrics
    pub events_reconciled: IntCounterVec,
    pub reconcile_duration: HistogramVec,

    // Retry Metrics
    pub retry_attempts_total: IntCounterVec,
    pub retry_success: IntCounterVec,
    pub retry_failure: IntCounterVec,

    // Dead Letter Metrics
    pub dead_letters_total: IntCounter,
    pub dead_letters_by_platform: IntCounterVec,

    // Dispatcher Metrics
    pub active_key_queues: IntGauge,
}

impl Metrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let webhooks_received = IntCounterVec::new(
            Opts::new("webhooks_received_total", "Inbound webhooks by platform and outcome"),
            &["platform", "outcome"],
        )?;
        registry.register(Box::new(webhooks_received.clone()))?;

        let events_reconciled = IntCounterVec::new(
            Opts::new("events_reconciled_total", "Events folded into orders, by disposition"),
            &["platform", "disposition"],
        )?;
        registry.register(Box::new(events_reconciled.clone()))?;

        let reconcile_duration = HistogramVec::new(
            HistogramOpts::new("reconcile_duration_seconds", "Time from dequeue to reconciled order")
                .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
            &["platform"],
        )?;
        registry.register(Box::new(reconcile_duration.clone()))?;

        let retry_attempts_total = IntCounterVec::new(
            Opts::new("retry_attempts_total", "Total retry attempts"),
            &["operation", "attempt"],
        )?;
        registry.register(Box::new(retry_attempts_total.clone()))?;

        let retry_success = IntCounterVec::new(
            Opts::new("retry_success_total", "Total successful retries"),
            &["operation"],
        )?;
        registry.register(Box::new(retry_success.clone()))?;

        let retry_failure = IntCounterVec::new(
            Opts::new("retry_failure_total", "Total failed retries after all attempts"),
            &["operation"],
        )?;
        registry.register(Box::new(retry_failure.clone()))?;

        let dead_letters_total = IntCounter::new(
            "dead_letters_total",
            "Total events moved to the dead letter queue",
        )?;
        registry.register(Box::new(dead_letters_total.clone()))?;

        let dead_letters_by_platform = IntCounterVec::new(
            Opts::new("dead_letters_by_platform_total", "Dead-lettered events by platform"),
            &["platform"],
        )?;
        registry.register(Box::new(dead_letters_by_platform.clone()))?;

        let active_key_queues = IntGauge::new(
            "dispatcher_active_key_queues",
            "Per-order queues currently held by the dispatcher",
        )?;
        registry.register(Box::new(active_key_queues.clone()))?;

        Ok(Self {
            registry,
            webhooks_received,
            events_reconciled,
            reconcile_duration,
            retry_attempts_total,
            retry_success,
            retry_failure,
            dead_letters_total,
            dead_letters_by_platform,
            active_key_queues,
        })
    }

    /// Get the Prometheus registry for exposing metrics via HTTP
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn record_webhook(&self, platform: Platform, outcome: &str) {
        self.webhooks_received.with_label_values(&[platform.as_str(), outcome]).inc();
    }

    pub fn record_reconciled(&self, platform: Platform, disposition: &str, duration_secs: f64) {
        self.events_reconciled.with_label_values(&[platform.as_str(), disposition]).inc();
        self.reconcile_duration.with_label_values(&[platform.as_str()]).observe(duration_secs);
    }

    /// Helper to record retry attempt
    pub fn record_retry_attempt(&self, operation: &str, attempt: u32) {
        self.retry_attempts_total.with_label_values(&[operation, &attempt.to_string()]).inc();
    }

    /// Helper to record retry outcome
    pub fn record_retry_outcome(&self, operation: &str, success: bool) {
        if success {
            self.retry_success.with_label_values(&[operation]).inc();
        } else {
            self.retry_failure.with_label_values(&[operation]).inc();
        }
    }

    pub fn record_dead_letter(&self, platform: Platform) {
        self.dead_letters_total.inc();
        self.dead_letters_by_platform.with_label_values(&[platform.as_str()]).inc();
    }

    pub fn set_active_key_queues(&self, count: usize) {
        self.active_key_queues.set(count as i64);
    }
}
