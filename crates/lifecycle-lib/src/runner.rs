//! One complete lifecycle run
//!
//! List tenants, classify the fleet, apply actions (unless dry-run) and
//! notify tenant owners. The run produces a serializable [`RunReport`].

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::actions::{ActionExecutor, ActionOutcome};
use crate::lifecycle::{classify_fleet, ClassificationResult, TenantFailure, Verdict, VmStatus};
use crate::notify::{
    action_message, deliver, DeliverySummary, Mailer, NotificationBuilder, DEFAULT_SUBJECT_PREFIX,
};
use crate::observability::{LifecycleMetrics, StructuredLogger};
use crate::provider::CloudProvider;
use crate::settings::LifecyclePolicy;

const DEFAULT_MAX_CONCURRENCY: usize = 8;

/// A flagged instance as reported to operators
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceReport {
    pub tenant: String,
    pub instance_id: String,
    pub instance_name: String,
    pub status: VmStatus,
    pub verdict: Verdict,
    pub message: String,
}

impl InstanceReport {
    /// Rows for every flagged instance, tenants in order
    pub fn from_result(result: &ClassificationResult, now: DateTime<Utc>) -> Vec<Self> {
        Verdict::ALL
            .iter()
            .filter_map(|verdict| result.bucket(*verdict))
            .flat_map(|bucket| bucket.values().flatten())
            .map(|classified| {
                let snapshot = &classified.snapshot;
                Self {
                    tenant: snapshot.tenant.clone(),
                    instance_id: snapshot.id.clone(),
                    instance_name: snapshot.name.clone(),
                    status: snapshot.status,
                    verdict: classified.verdict,
                    message: action_message(
                        snapshot,
                        classified.verdict,
                        &classified.settings,
                        now,
                    ),
                }
            })
            .collect()
    }
}

/// Summary of one lifecycle run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    /// The single "now" every verdict of the run was computed against
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub dry_run: bool,
    pub tenants: usize,
    pub instances_classified: usize,
    pub verdict_counts: BTreeMap<Verdict, usize>,
    pub instances: Vec<InstanceReport>,
    pub actions: Vec<ActionOutcome>,
    pub notifications: DeliverySummary,
    pub failed_tenants: Vec<TenantFailure>,
}

impl RunReport {
    pub fn failed_actions(&self) -> usize {
        self.actions
            .iter()
            .filter(|outcome| !outcome.status.is_success())
            .count()
    }

    pub fn count(&self, verdict: Verdict) -> usize {
        self.verdict_counts.get(&verdict).copied().unwrap_or(0)
    }
}

/// Drives lifecycle runs against one provider and policy
pub struct LifecycleRunner {
    provider: Arc<dyn CloudProvider>,
    policy: Arc<LifecyclePolicy>,
    mailer: Arc<dyn Mailer>,
    notifications: NotificationBuilder,
    metrics: LifecycleMetrics,
    logger: StructuredLogger,
    max_concurrency: usize,
}

impl LifecycleRunner {
    pub fn new(
        provider: Arc<dyn CloudProvider>,
        policy: Arc<LifecyclePolicy>,
        mailer: Arc<dyn Mailer>,
    ) -> Result<Self> {
        Ok(Self {
            provider,
            policy,
            mailer,
            notifications: NotificationBuilder::new(DEFAULT_SUBJECT_PREFIX)
                .context("Failed to build notification templates")?,
            metrics: LifecycleMetrics::new(),
            logger: StructuredLogger::new("lifecycle-agent"),
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
        })
    }

    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency;
        self
    }

    pub fn with_subject_prefix(mut self, prefix: impl Into<String>) -> Result<Self> {
        self.notifications =
            NotificationBuilder::new(prefix).context("Failed to build notification templates")?;
        Ok(self)
    }

    pub fn with_logger(mut self, logger: StructuredLogger) -> Self {
        self.logger = logger;
        self
    }

    pub fn policy(&self) -> &LifecyclePolicy {
        &self.policy
    }

    pub async fn run(&self, dry_run: bool) -> Result<RunReport> {
        self.run_at(Utc::now(), dry_run).await
    }

    /// Run with an explicit "now"
    pub async fn run_at(&self, now: DateTime<Utc>, dry_run: bool) -> Result<RunReport> {
        let started = Instant::now();
        let outcome = self.execute(now, dry_run).await;
        let elapsed = started.elapsed().as_secs_f64();

        self.metrics.observe_run(elapsed, outcome.is_ok());
        match &outcome {
            Ok(report) => self.metrics.set_last_success(report.finished_at.timestamp()),
            Err(e) => self.logger.log_run_failed(e),
        }
        outcome
    }

    async fn execute(&self, now: DateTime<Utc>, dry_run: bool) -> Result<RunReport> {
        let started = Instant::now();

        let tenants = match self.provider.list_tenants().await {
            Ok(tenants) => tenants,
            Err(e) => {
                self.metrics.inc_provider_errors(e.kind());
                return Err(e).context("Failed to list tenants");
            }
        };
        self.logger.log_run_started(dry_run, tenants.len());
        self.logger.log_tenants_without_address(
            &self.policy.tenants_without_address(&tenants),
            self.policy.default_email(),
        );

        let result = classify_fleet(
            Arc::clone(&self.provider),
            &tenants,
            Arc::clone(&self.policy),
            now,
            self.max_concurrency,
        )
        .await;
        for _ in &result.failed_tenants {
            self.metrics.inc_provider_errors("tenant_listing");
        }
        self.metrics.record_classification(&result);
        for verdict in [
            Verdict::Shelve,
            Verdict::ShelveWarn,
            Verdict::Delete,
            Verdict::DeleteWarn,
        ] {
            if let Some(bucket) = result.bucket(verdict) {
                bucket
                    .values()
                    .flatten()
                    .for_each(|classified| self.logger.log_verdict(classified));
            }
        }

        let actions = ActionExecutor::new(dry_run)
            .apply(self.provider.as_ref(), &result)
            .await;
        for outcome in &actions {
            self.metrics.record_action(outcome);
            self.logger.log_action(outcome);
        }

        let notifications = self
            .notifications
            .build(&result, &actions, &self.policy, now)
            .context("Failed to render notifications")?;
        let delivery = deliver(self.mailer.as_ref(), &notifications).await;
        self.metrics
            .record_notifications(delivery.sent, delivery.failed);
        self.logger.log_notifications(delivery.sent, delivery.failed);

        self.logger
            .log_run_finished(&result, started.elapsed().as_secs_f64());

        Ok(RunReport {
            started_at: now,
            finished_at: Utc::now(),
            dry_run,
            tenants: tenants.len(),
            instances_classified: result.instances_classified,
            verdict_counts: Verdict::ALL
                .iter()
                .map(|verdict| (*verdict, result.count(*verdict)))
                .collect(),
            instances: InstanceReport::from_result(&result, now),
            actions,
            notifications: delivery,
            failed_tenants: result.failed_tenants,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::ActionStatus;
    use crate::models::{ActionRecord, ServerRecord};
    use crate::notify::{Notification, NotifyError};
    use crate::provider::{FixtureProvider, RecordedCall};
    use crate::settings::{Threshold, ThresholdSettings};
    use async_trait::async_trait;
    use chrono::TimeZone;
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct RecordingMailer {
        sent: Mutex<Vec<Notification>>,
    }

    #[async_trait]
    impl Mailer for RecordingMailer {
        async fn send(&self, notification: &Notification) -> Result<(), NotifyError> {
            self.sent.lock().await.push(notification.clone());
            Ok(())
        }

        fn name(&self) -> &'static str {
            "recording"
        }
    }

    fn server(id: &str, vm_state: &str, action: &str, time: &str) -> ServerRecord {
        ServerRecord {
            id: id.to_string(),
            name: format!("vm-{id}"),
            vm_state: vm_state.to_string(),
            actions: vec![ActionRecord::new(action, time)],
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2000, 1, 10, 0, 0, 0).unwrap()
    }

    fn policy() -> Arc<LifecyclePolicy> {
        let settings = ThresholdSettings::new(
            Threshold::days(2.0).unwrap(),
            Threshold::days(3.0).unwrap(),
            Threshold::days(2.0).unwrap(),
            Threshold::days(3.0).unwrap(),
            Threshold::days(2.0).unwrap(),
            Threshold::days(3.0).unwrap(),
        )
        .unwrap();
        Arc::new(
            LifecyclePolicy::new(settings)
                .with_email_address("research", "research@example.com")
                .with_default_email("ops@example.com"),
        )
    }

    fn provider() -> Arc<FixtureProvider> {
        Arc::new(
            FixtureProvider::default()
                .with_tenant(
                    "research",
                    vec![
                        server("old", "active", "create", "2000-01-01T00:00:00"),
                        server("fresh", "active", "create", "2000-01-09T00:00:00"),
                        server("parked", "shelved_offloaded", "shelve", "1999-01-01T00:00:00"),
                    ],
                )
                .with_tenant(
                    "teaching",
                    vec![server("warn", "stopped", "stop", "2000-01-08T00:00:00")],
                )
                .with_tenant("broken", vec![])
                .with_failing_tenant("broken"),
        )
    }

    #[tokio::test]
    async fn test_dry_run_report() {
        let provider = provider();
        let mailer = Arc::new(RecordingMailer::default());
        let runner = LifecycleRunner::new(provider.clone(), policy(), mailer.clone()).unwrap();

        let report = runner.run_at(now(), true).await.unwrap();

        assert!(report.dry_run);
        assert_eq!(report.started_at, now());
        assert_eq!(report.tenants, 3);
        assert_eq!(report.instances_classified, 4);
        assert_eq!(report.count(Verdict::Shelve), 1);
        assert_eq!(report.count(Verdict::Delete), 1);
        assert_eq!(report.count(Verdict::ShelveWarn), 1);
        assert_eq!(report.count(Verdict::DoNothing), 1);
        assert_eq!(report.failed_tenants.len(), 1);
        assert_eq!(report.failed_tenants[0].tenant, "broken");

        assert_eq!(report.actions.len(), 2);
        assert!(report
            .actions
            .iter()
            .all(|outcome| outcome.status == ActionStatus::DryRun));
        assert!(provider.calls().await.is_empty());

        // research: shelve + delete; teaching: shelve warning to the default address
        let sent = mailer.sent.lock().await;
        assert_eq!(sent.len(), 3);
        assert_eq!(report.notifications.sent, 3);
        assert!(sent
            .iter()
            .any(|n| n.tenant == "teaching" && n.recipients == vec!["ops@example.com"]));
    }

    #[tokio::test]
    async fn test_live_run_calls_provider() {
        let provider = provider();
        let runner = LifecycleRunner::new(
            provider.clone(),
            policy(),
            Arc::new(RecordingMailer::default()),
        )
        .unwrap()
        .with_max_concurrency(1);

        let report = runner.run_at(now(), false).await.unwrap();

        assert_eq!(report.failed_actions(), 0);
        assert_eq!(
            provider.calls().await,
            vec![
                RecordedCall::Shelve {
                    tenant: "research".to_string(),
                    instance_id: "old".to_string()
                },
                RecordedCall::Delete {
                    tenant: "research".to_string(),
                    instance_id: "parked".to_string()
                },
            ]
        );

        let warn = report
            .instances
            .iter()
            .find(|row| row.instance_id == "warn")
            .unwrap();
        assert_eq!(
            warn.message,
            "Instance will be shelved in 1 days (it has been stopped for more than 2.0 days)"
        );
    }

    #[tokio::test]
    async fn test_tenant_listing_failure_is_fatal() {
        struct NoTenants;

        #[async_trait]
        impl CloudProvider for NoTenants {
            async fn list_tenants(&self) -> Result<Vec<String>, crate::provider::ProviderError> {
                Err(crate::provider::ProviderError::Unavailable("admin".to_string()))
            }
            async fn list_instances(
                &self,
                _tenant: &str,
            ) -> Result<Vec<ServerRecord>, crate::provider::ProviderError> {
                Ok(vec![])
            }
            async fn shelve(
                &self,
                _tenant: &str,
                _instance_id: &str,
            ) -> Result<(), crate::provider::ProviderError> {
                Ok(())
            }
            async fn delete(
                &self,
                _tenant: &str,
                _instance_id: &str,
            ) -> Result<(), crate::provider::ProviderError> {
                Ok(())
            }
        }

        let runner = LifecycleRunner::new(
            Arc::new(NoTenants),
            policy(),
            Arc::new(RecordingMailer::default()),
        )
        .unwrap();

        let err = runner.run_at(now(), true).await.unwrap_err();
        assert!(format!("{err:#}").contains("Failed to list tenants"));
    }

    #[test]
    fn test_report_json_round_trip() {
        let report = RunReport {
            started_at: now(),
            finished_at: now(),
            dry_run: true,
            tenants: 1,
            instances_classified: 1,
            verdict_counts: [(Verdict::Shelve, 1)].into_iter().collect(),
            instances: vec![],
            actions: vec![ActionOutcome {
                tenant: "t".to_string(),
                instance_id: "i".to_string(),
                instance_name: "n".to_string(),
                action: Verdict::Shelve,
                status: ActionStatus::DryRun,
            }],
            notifications: DeliverySummary::default(),
            failed_tenants: vec![],
        };

        let json = serde_json::to_string(&report).unwrap();
        assert!(json.contains("\"shelve\":1"));
        let parsed: RunReport = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, report);
    }
}
