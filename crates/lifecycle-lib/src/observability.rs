//! Observability for the lifecycle agent
//!
//! - Prometheus metrics behind a cheap, cloneable [`LifecycleMetrics`] handle
//! - [`StructuredLogger`], the vocabulary of `event = "..."` log lines

use std::sync::OnceLock;

use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    register_int_gauge_vec, Histogram, IntCounter, IntCounterVec, IntGauge, IntGaugeVec,
};
use tracing::{info, warn};

use crate::actions::{ActionOutcome, ActionStatus};
use crate::lifecycle::{ClassificationResult, ClassifiedInstance, Verdict};

/// Run durations range from seconds to an hour on large clouds
const RUN_DURATION_BUCKETS: &[f64] = &[1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0, 1800.0, 3600.0];

static GLOBAL_METRICS: OnceLock<MetricsInner> = OnceLock::new();

struct MetricsInner {
    run_duration_seconds: Histogram,
    runs_total: IntCounterVec,
    instances_classified: IntGauge,
    verdicts: IntGaugeVec,
    failed_tenants: IntGauge,
    actions_total: IntCounterVec,
    provider_errors_total: IntCounterVec,
    notifications_sent_total: IntCounter,
    notifications_failed_total: IntCounter,
    last_success_timestamp: IntGauge,
}

impl MetricsInner {
    fn new() -> Self {
        Self {
            run_duration_seconds: register_histogram!(
                "lifecycle_run_duration_seconds",
                "Wall time of a complete lifecycle run",
                RUN_DURATION_BUCKETS.to_vec()
            )
            .expect("Failed to register run_duration_seconds"),

            runs_total: register_int_counter_vec!(
                "lifecycle_runs_total",
                "Lifecycle runs by outcome",
                &["outcome"]
            )
            .expect("Failed to register runs_total"),

            instances_classified: register_int_gauge!(
                "lifecycle_instances_classified",
                "Instances classified in the last run"
            )
            .expect("Failed to register instances_classified"),

            verdicts: register_int_gauge_vec!(
                "lifecycle_verdicts",
                "Instances per verdict in the last run",
                &["verdict"]
            )
            .expect("Failed to register verdicts"),

            failed_tenants: register_int_gauge!(
                "lifecycle_failed_tenants",
                "Tenants that could not be listed in the last run"
            )
            .expect("Failed to register failed_tenants"),

            actions_total: register_int_counter_vec!(
                "lifecycle_actions_total",
                "Shelve and delete attempts by outcome",
                &["action", "outcome"]
            )
            .expect("Failed to register actions_total"),

            provider_errors_total: register_int_counter_vec!(
                "lifecycle_provider_errors_total",
                "Cloud provider errors by kind",
                &["kind"]
            )
            .expect("Failed to register provider_errors_total"),

            notifications_sent_total: register_int_counter!(
                "lifecycle_notifications_sent_total",
                "Notifications delivered to the mail relay"
            )
            .expect("Failed to register notifications_sent_total"),

            notifications_failed_total: register_int_counter!(
                "lifecycle_notifications_failed_total",
                "Notifications the mail relay rejected"
            )
            .expect("Failed to register notifications_failed_total"),

            last_success_timestamp: register_int_gauge!(
                "lifecycle_last_success_timestamp_seconds",
                "Unix time of the last successful run"
            )
            .expect("Failed to register last_success_timestamp"),
        }
    }
}

/// Handle to the process-wide lifecycle metrics
///
/// Clones share the same registered metrics.
#[derive(Clone, Default)]
pub struct LifecycleMetrics {
    _private: (),
}

impl LifecycleMetrics {
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(MetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &'static MetricsInner {
        GLOBAL_METRICS.get_or_init(MetricsInner::new)
    }

    pub fn observe_run(&self, duration_secs: f64, success: bool) {
        let inner = self.inner();
        inner.run_duration_seconds.observe(duration_secs);
        inner
            .runs_total
            .with_label_values(&[if success { "success" } else { "failure" }])
            .inc();
    }

    /// Publish the verdict distribution of a run
    pub fn record_classification(&self, result: &ClassificationResult) {
        let inner = self.inner();
        inner
            .instances_classified
            .set(result.instances_classified as i64);
        for verdict in Verdict::ALL {
            inner
                .verdicts
                .with_label_values(&[verdict.as_str()])
                .set(result.count(verdict) as i64);
        }
        inner.failed_tenants.set(result.failed_tenants.len() as i64);
    }

    pub fn record_action(&self, outcome: &ActionOutcome) {
        self.inner()
            .actions_total
            .with_label_values(&[outcome.action.as_str(), outcome.status.label()])
            .inc();
    }

    pub fn inc_provider_errors(&self, kind: &str) {
        self.inner()
            .provider_errors_total
            .with_label_values(&[kind])
            .inc();
    }

    pub fn record_notifications(&self, sent: usize, failed: usize) {
        let inner = self.inner();
        inner.notifications_sent_total.inc_by(sent as u64);
        inner.notifications_failed_total.inc_by(failed as u64);
    }

    pub fn set_last_success(&self, timestamp: i64) {
        self.inner().last_success_timestamp.set(timestamp);
    }
}

/// Structured logger for lifecycle events
#[derive(Clone)]
pub struct StructuredLogger {
    agent_id: String,
}

impl StructuredLogger {
    pub fn new(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
        }
    }

    pub fn log_startup(&self, version: &str, dry_run: bool, interval_secs: u64) {
        info!(
            event = "agent_started",
            agent = %self.agent_id,
            agent_version = %version,
            dry_run = dry_run,
            interval_secs = interval_secs,
            "Lifecycle agent started"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "agent_shutdown",
            agent = %self.agent_id,
            reason = %reason,
            "Lifecycle agent shutting down"
        );
    }

    pub fn log_run_started(&self, dry_run: bool, tenants: usize) {
        info!(
            event = "run_started",
            agent = %self.agent_id,
            dry_run = dry_run,
            tenants = tenants,
            "Lifecycle run started"
        );
    }

    /// One line per flagged instance
    pub fn log_verdict(&self, classified: &ClassifiedInstance) {
        let snapshot = &classified.snapshot;
        info!(
            event = "instance_classified",
            agent = %self.agent_id,
            tenant = %snapshot.tenant,
            instance_id = %snapshot.id,
            instance_name = %snapshot.name,
            status = %snapshot.status,
            verdict = %classified.verdict,
            "Instance flagged"
        );
    }

    pub fn log_action(&self, outcome: &ActionOutcome) {
        match &outcome.status {
            ActionStatus::Failed(reason) => warn!(
                event = "action_failed",
                agent = %self.agent_id,
                tenant = %outcome.tenant,
                instance_id = %outcome.instance_id,
                action = %outcome.action,
                reason = %reason,
                "Lifecycle action failed"
            ),
            status => info!(
                event = "action_applied",
                agent = %self.agent_id,
                tenant = %outcome.tenant,
                instance_id = %outcome.instance_id,
                action = %outcome.action,
                outcome = status.label(),
                "Lifecycle action applied"
            ),
        }
    }

    pub fn log_tenants_without_address(&self, tenants: &[&str], default_email: Option<&str>) {
        if tenants.is_empty() {
            return;
        }
        warn!(
            event = "tenants_without_address",
            agent = %self.agent_id,
            tenants = ?tenants,
            default_email = ?default_email,
            "Tenants have no notification address, using the default"
        );
    }

    pub fn log_notifications(&self, sent: usize, failed: usize) {
        info!(
            event = "notifications_sent",
            agent = %self.agent_id,
            sent = sent,
            failed = failed,
            "Notifications delivered"
        );
    }

    pub fn log_run_finished(&self, result: &ClassificationResult, duration_secs: f64) {
        info!(
            event = "run_finished",
            agent = %self.agent_id,
            instances = result.instances_classified,
            shelve = result.count(Verdict::Shelve),
            shelve_warn = result.count(Verdict::ShelveWarn),
            delete = result.count(Verdict::Delete),
            delete_warn = result.count(Verdict::DeleteWarn),
            failed_tenants = result.failed_tenants.len(),
            duration_secs = duration_secs,
            "Lifecycle run finished"
        );
    }

    pub fn log_run_failed(&self, error: &anyhow::Error) {
        warn!(
            event = "run_failed",
            agent = %self.agent_id,
            error = %format!("{error:#}"),
            "Lifecycle run failed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_handles_share_registration() {
        let first = LifecycleMetrics::new();
        let second = first.clone();

        first.inc_provider_errors("auth");
        second.inc_provider_errors("auth");

        let families = prometheus::gather();
        let errors = families
            .iter()
            .find(|family| family.get_name() == "lifecycle_provider_errors_total")
            .expect("provider errors registered");
        assert!(errors.get_metric()[0].get_counter().get_value() >= 2.0);
    }

    #[test]
    fn test_record_classification() {
        let metrics = LifecycleMetrics::new();
        metrics.record_classification(&ClassificationResult::default());
        metrics.observe_run(1.5, true);
        metrics.set_last_success(1_700_000_000);

        let families = prometheus::gather();
        assert!(families
            .iter()
            .any(|family| family.get_name() == "lifecycle_verdicts"));
    }
}
