//! Fleet classification driver
//!
//! Lists every tenant's instances through a [`CloudProvider`], resolves the
//! effective settings per instance and buckets the verdicts by tenant. One
//! tenant failing never stops the others.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, warn};

use super::state::InstanceSnapshot;
use super::verdict::{classify, Verdict};
use crate::models::ServerRecord;
use crate::provider::CloudProvider;
use crate::settings::{LifecyclePolicy, ThresholdSettings};

/// An instance together with its verdict and the settings that produced it
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassifiedInstance {
    pub snapshot: InstanceSnapshot,
    pub verdict: Verdict,
    pub settings: ThresholdSettings,
}

/// A tenant whose instances could not be listed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantFailure {
    pub tenant: String,
    pub reason: String,
}

/// Verdicts of one run, keyed by tenant
///
/// `DoNothing` instances are counted but not stored.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ClassificationResult {
    pub to_shelve: BTreeMap<String, Vec<ClassifiedInstance>>,
    pub to_delete: BTreeMap<String, Vec<ClassifiedInstance>>,
    pub shelve_warnings: BTreeMap<String, Vec<ClassifiedInstance>>,
    pub delete_warnings: BTreeMap<String, Vec<ClassifiedInstance>>,
    pub failed_tenants: Vec<TenantFailure>,
    pub tenants_classified: usize,
    pub instances_classified: usize,
}

impl ClassificationResult {
    /// Bucket holding a verdict, `None` for `DoNothing`
    pub fn bucket(&self, verdict: Verdict) -> Option<&BTreeMap<String, Vec<ClassifiedInstance>>> {
        match verdict {
            Verdict::Shelve => Some(&self.to_shelve),
            Verdict::Delete => Some(&self.to_delete),
            Verdict::ShelveWarn => Some(&self.shelve_warnings),
            Verdict::DeleteWarn => Some(&self.delete_warnings),
            Verdict::DoNothing => None,
        }
    }

    fn bucket_mut(
        &mut self,
        verdict: Verdict,
    ) -> Option<&mut BTreeMap<String, Vec<ClassifiedInstance>>> {
        match verdict {
            Verdict::Shelve => Some(&mut self.to_shelve),
            Verdict::Delete => Some(&mut self.to_delete),
            Verdict::ShelveWarn => Some(&mut self.shelve_warnings),
            Verdict::DeleteWarn => Some(&mut self.delete_warnings),
            Verdict::DoNothing => None,
        }
    }

    /// File one classified instance under its tenant
    pub fn insert(&mut self, classified: ClassifiedInstance) {
        self.instances_classified += 1;
        let tenant = classified.snapshot.tenant.clone();
        if let Some(bucket) = self.bucket_mut(classified.verdict) {
            bucket.entry(tenant).or_default().push(classified);
        }
    }

    /// Number of stored instances with the given verdict
    pub fn count(&self, verdict: Verdict) -> usize {
        match self.bucket(verdict) {
            Some(bucket) => bucket.values().map(Vec::len).sum(),
            None => self.instances_classified - self.flagged_count(),
        }
    }

    /// Instances with any verdict but `DoNothing`
    pub fn flagged_count(&self) -> usize {
        [
            &self.to_shelve,
            &self.to_delete,
            &self.shelve_warnings,
            &self.delete_warnings,
        ]
        .iter()
        .flat_map(|bucket| bucket.values())
        .map(Vec::len)
        .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.flagged_count() == 0
    }

    /// Tenants appearing in any bucket
    pub fn tenants(&self) -> Vec<&str> {
        let mut tenants: Vec<&str> = [
            &self.to_shelve,
            &self.to_delete,
            &self.shelve_warnings,
            &self.delete_warnings,
        ]
        .iter()
        .flat_map(|bucket| bucket.keys())
        .map(String::as_str)
        .collect();
        tenants.sort_unstable();
        tenants.dedup();
        tenants
    }

    fn merge(&mut self, other: ClassificationResult) {
        for verdict in Verdict::ALL {
            let (Some(source), Some(target)) = (other.bucket(verdict), self.bucket_mut(verdict))
            else {
                continue;
            };
            for (tenant, instances) in source {
                target
                    .entry(tenant.clone())
                    .or_default()
                    .extend(instances.iter().cloned());
            }
        }
        self.failed_tenants.extend(other.failed_tenants);
        self.tenants_classified += other.tenants_classified;
        self.instances_classified += other.instances_classified;
    }
}

/// Classify the listed instances of one tenant
pub fn classify_tenant(
    tenant: &str,
    records: Vec<ServerRecord>,
    policy: &LifecyclePolicy,
    now: DateTime<Utc>,
) -> ClassificationResult {
    let mut result = ClassificationResult {
        tenants_classified: 1,
        ..Default::default()
    };

    for record in records {
        let snapshot = InstanceSnapshot::from_record(tenant, record);
        let settings = *policy.effective_settings(tenant, &snapshot.id);
        let verdict = classify(&snapshot, &settings, now);

        debug!(
            tenant = %tenant,
            instance_id = %snapshot.id,
            status = %snapshot.status,
            verdict = %verdict,
            "Classified instance"
        );

        result.insert(ClassifiedInstance {
            snapshot,
            verdict,
            settings,
        });
    }

    result
}

/// Classify every instance of `tenants`
///
/// At most `max_concurrency` tenants are listed at once. `now` is used for
/// every verdict of the run.
pub async fn classify_fleet(
    provider: Arc<dyn CloudProvider>,
    tenants: &[String],
    policy: Arc<LifecyclePolicy>,
    now: DateTime<Utc>,
    max_concurrency: usize,
) -> ClassificationResult {
    let semaphore = Arc::new(Semaphore::new(max_concurrency.max(1)));
    let mut tasks = JoinSet::new();
    let mut task_tenants = HashMap::with_capacity(tenants.len());

    for tenant in tenants {
        let tenant = tenant.clone();
        let provider = Arc::clone(&provider);
        let policy = Arc::clone(&policy);
        let semaphore = Arc::clone(&semaphore);

        let task_tenant = tenant.clone();
        let handle = tasks.spawn(async move {
            let listing = match semaphore.acquire_owned().await {
                Ok(_permit) => provider.list_instances(&tenant).await,
                Err(_) => return (tenant, Err("worker pool closed".to_string())),
            };
            let outcome = listing
                .map(|records| classify_tenant(&tenant, records, &policy, now))
                .map_err(|e| e.to_string());
            (tenant, outcome)
        });
        task_tenants.insert(handle.id(), task_tenant);
    }

    let mut result = ClassificationResult::default();
    while let Some(joined) = tasks.join_next_with_id().await {
        match joined {
            Ok((_, (_, Ok(partial)))) => result.merge(partial),
            Ok((_, (tenant, Err(reason)))) => {
                warn!(
                    tenant = %tenant,
                    error = %reason,
                    "Failed to list instances, tenant skipped"
                );
                result.failed_tenants.push(TenantFailure { tenant, reason });
            }
            Err(e) => {
                let tenant = task_tenants.remove(&e.id()).unwrap_or_default();
                error!(tenant = %tenant, error = %e, "Classification task panicked");
                result.failed_tenants.push(TenantFailure {
                    tenant,
                    reason: format!("classification task failed: {e}"),
                });
            }
        }
    }

    // Completion order is arbitrary; keep the output stable
    result.failed_tenants.sort_by(|a, b| a.tenant.cmp(&b.tenant));
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ActionRecord;
    use crate::provider::{FixtureProvider, ProviderError};
    use crate::settings::Threshold;
    use chrono::TimeZone;

    fn at(year: i32, month: u32, day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(year, month, day, 0, 0, 0).unwrap()
    }

    fn server(id: &str, vm_state: &str, action: &str, when: DateTime<Utc>) -> ServerRecord {
        ServerRecord {
            id: id.to_string(),
            name: format!("vm-{id}"),
            vm_state: vm_state.to_string(),
            actions: vec![ActionRecord::new(action, when.to_rfc3339())],
        }
    }

    fn policy() -> LifecyclePolicy {
        let global = ThresholdSettings::new(
            Threshold::days(2.0).unwrap(),
            Threshold::days(3.0).unwrap(),
            Threshold::days(2.0).unwrap(),
            Threshold::days(3.0).unwrap(),
            Threshold::days(2.0).unwrap(),
            Threshold::days(3.0).unwrap(),
        )
        .unwrap();
        LifecyclePolicy::new(global)
            .with_tenant_override("lenient", ThresholdSettings::disabled())
            .with_instance_override(
                "strict-1",
                ThresholdSettings::new(
                    Threshold::days(0.0).unwrap(),
                    Threshold::days(0.5).unwrap(),
                    Threshold::Never,
                    Threshold::Never,
                    Threshold::Never,
                    Threshold::Never,
                )
                .unwrap(),
            )
    }

    fn fleet() -> FixtureProvider {
        FixtureProvider::default()
            .with_tenant(
                "research",
                vec![
                    server("fresh", "active", "create", at(2000, 1, 9)),
                    server("warn", "active", "create", at(2000, 1, 8)),
                    server("old", "active", "create", at(2000, 1, 1)),
                    server("parked", "shelved_offloaded", "shelve", at(1999, 12, 1)),
                    server("parking", "shelved_offloaded", "shelve", at(2000, 1, 8)),
                ],
            )
            .with_tenant(
                "lenient",
                vec![
                    server("ancient", "active", "create", at(1990, 1, 1)),
                    server("strict-1", "active", "create", at(2000, 1, 9)),
                ],
            )
    }

    fn ids(bucket: &BTreeMap<String, Vec<ClassifiedInstance>>, tenant: &str) -> Vec<String> {
        bucket
            .get(tenant)
            .map(|instances| instances.iter().map(|c| c.snapshot.id.clone()).collect())
            .unwrap_or_default()
    }

    #[tokio::test]
    async fn test_classify_fleet_buckets() {
        let provider: Arc<dyn CloudProvider> = Arc::new(fleet());
        let tenants = vec!["research".to_string(), "lenient".to_string()];
        let now = at(2000, 1, 10);

        let result = classify_fleet(provider, &tenants, Arc::new(policy()), now, 2).await;

        assert_eq!(ids(&result.to_shelve, "research"), vec!["old"]);
        assert_eq!(ids(&result.shelve_warnings, "research"), vec!["warn"]);
        assert_eq!(ids(&result.to_delete, "research"), vec!["parked"]);
        assert_eq!(ids(&result.delete_warnings, "research"), vec!["parking"]);

        // Tenant override disables "ancient", instance override wins for "strict-1"
        assert_eq!(ids(&result.to_shelve, "lenient"), vec!["strict-1"]);
        assert_eq!(result.count(Verdict::DoNothing), 2);
        assert_eq!(result.instances_classified, 7);
        assert_eq!(result.tenants_classified, 2);
        assert!(result.failed_tenants.is_empty());
    }

    #[tokio::test]
    async fn test_failed_tenant_does_not_abort_others() {
        let provider: Arc<dyn CloudProvider> = Arc::new(fleet().with_failing_tenant("lenient"));
        let tenants = vec!["research".to_string(), "lenient".to_string()];

        let result =
            classify_fleet(provider, &tenants, Arc::new(policy()), at(2000, 1, 10), 1).await;

        assert_eq!(result.failed_tenants.len(), 1);
        assert_eq!(result.failed_tenants[0].tenant, "lenient");
        assert_eq!(ids(&result.to_shelve, "research"), vec!["old"]);
        assert!(!result.to_shelve.contains_key("lenient"));
        assert_eq!(result.tenants_classified, 1);
    }

    /// Panics while listing one tenant, delegates the rest
    struct PanickingProvider {
        inner: FixtureProvider,
        tenant: &'static str,
    }

    #[async_trait::async_trait]
    impl CloudProvider for PanickingProvider {
        async fn list_tenants(&self) -> Result<Vec<String>, ProviderError> {
            self.inner.list_tenants().await
        }

        async fn list_instances(&self, tenant: &str) -> Result<Vec<ServerRecord>, ProviderError> {
            if tenant == self.tenant {
                panic!("listing {tenant} blew up");
            }
            self.inner.list_instances(tenant).await
        }

        async fn shelve(&self, tenant: &str, instance_id: &str) -> Result<(), ProviderError> {
            self.inner.shelve(tenant, instance_id).await
        }

        async fn delete(&self, tenant: &str, instance_id: &str) -> Result<(), ProviderError> {
            self.inner.delete(tenant, instance_id).await
        }
    }

    #[tokio::test]
    async fn test_panicking_tenant_is_reported_as_failed() {
        let provider: Arc<dyn CloudProvider> = Arc::new(PanickingProvider {
            inner: fleet(),
            tenant: "lenient",
        });
        let tenants = vec!["research".to_string(), "lenient".to_string()];

        let result =
            classify_fleet(provider, &tenants, Arc::new(policy()), at(2000, 1, 10), 2).await;

        assert_eq!(result.failed_tenants.len(), 1);
        assert_eq!(result.failed_tenants[0].tenant, "lenient");
        assert!(result.failed_tenants[0].reason.contains("classification task failed"));
        assert_eq!(ids(&result.to_shelve, "research"), vec!["old"]);
        assert_eq!(result.tenants_classified, 1);
    }

    #[tokio::test]
    async fn test_classification_is_idempotent() {
        let provider: Arc<dyn CloudProvider> = Arc::new(fleet());
        let tenants = vec!["research".to_string(), "lenient".to_string()];
        let policy = Arc::new(policy());
        let now = at(2000, 1, 10);

        let first = classify_fleet(Arc::clone(&provider), &tenants, Arc::clone(&policy), now, 4).await;
        let second = classify_fleet(provider, &tenants, policy, now, 1).await;

        assert_eq!(first, second);
    }

    #[test]
    fn test_each_instance_lands_in_one_bucket() {
        let records = vec![
            server("a", "active", "create", at(1990, 1, 1)),
            server("b", "shelved_offloaded", "shelve", at(1990, 1, 1)),
            server("c", "stopped", "stop", at(1990, 1, 1)),
        ];
        let result = classify_tenant("research", records, &policy(), at(2000, 1, 10));

        assert_eq!(result.flagged_count(), 3);
        assert_eq!(result.count(Verdict::Shelve), 2);
        assert_eq!(result.count(Verdict::Delete), 1);
        assert_eq!(result.count(Verdict::ShelveWarn), 0);
        assert_eq!(result.tenants(), vec!["research"]);
    }

    #[test]
    fn test_empty_tenant() {
        let result = classify_tenant("empty", vec![], &policy(), at(2000, 1, 10));
        assert!(result.is_empty());
        assert_eq!(result.instances_classified, 0);
    }
}
