//! Action channel
//!
//! Applies the shelve/delete verdicts of a [`ClassificationResult`] through a
//! [`CloudProvider`]. In dry-run mode nothing is sent to the provider and
//! every action reports [`ActionStatus::DryRun`].

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::lifecycle::{ClassificationResult, ClassifiedInstance, Verdict};
use crate::provider::CloudProvider;

/// Result of one shelve/delete attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum ActionStatus {
    Done,
    DryRun,
    Failed(String),
}

impl ActionStatus {
    /// Dry runs count as successful
    pub fn is_success(&self) -> bool {
        !matches!(self, ActionStatus::Failed(_))
    }

    /// Metric label
    pub fn label(&self) -> &'static str {
        match self {
            ActionStatus::Done => "done",
            ActionStatus::DryRun => "dry_run",
            ActionStatus::Failed(_) => "failed",
        }
    }
}

impl fmt::Display for ActionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActionStatus::Done => write!(f, "Success"),
            ActionStatus::DryRun => write!(f, "Success (dry run)"),
            ActionStatus::Failed(reason) => write!(f, "Failed: {}", reason),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionOutcome {
    pub tenant: String,
    pub instance_id: String,
    pub instance_name: String,
    pub action: Verdict,
    #[serde(flatten)]
    pub status: ActionStatus,
}

/// Applies action verdicts
#[derive(Debug, Clone, Copy)]
pub struct ActionExecutor {
    dry_run: bool,
}

impl ActionExecutor {
    pub fn new(dry_run: bool) -> Self {
        Self { dry_run }
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    /// Shelve every `to_shelve` instance, then delete every `to_delete` one
    ///
    /// A failed call is recorded and the remaining actions still run.
    pub async fn apply(
        &self,
        provider: &dyn CloudProvider,
        result: &ClassificationResult,
    ) -> Vec<ActionOutcome> {
        let mut outcomes = Vec::new();

        for (verdict, bucket) in [
            (Verdict::Shelve, &result.to_shelve),
            (Verdict::Delete, &result.to_delete),
        ] {
            for instances in bucket.values() {
                for instance in instances {
                    outcomes.push(self.apply_one(provider, instance, verdict).await);
                }
            }
        }

        outcomes
    }

    async fn apply_one(
        &self,
        provider: &dyn CloudProvider,
        instance: &ClassifiedInstance,
        verdict: Verdict,
    ) -> ActionOutcome {
        let snapshot = &instance.snapshot;

        let status = if self.dry_run {
            info!(
                tenant = %snapshot.tenant,
                instance_id = %snapshot.id,
                action = %verdict,
                "Dry run, skipping provider call"
            );
            ActionStatus::DryRun
        } else {
            let call = match verdict {
                Verdict::Delete => provider.delete(&snapshot.tenant, &snapshot.id).await,
                _ => provider.shelve(&snapshot.tenant, &snapshot.id).await,
            };
            match call {
                Ok(()) => ActionStatus::Done,
                Err(e) => {
                    warn!(
                        tenant = %snapshot.tenant,
                        instance_id = %snapshot.id,
                        action = %verdict,
                        error = %e,
                        "Lifecycle action failed"
                    );
                    ActionStatus::Failed(e.to_string())
                }
            }
        };

        ActionOutcome {
            tenant: snapshot.tenant.clone(),
            instance_id: snapshot.id.clone(),
            instance_name: snapshot.name.clone(),
            action: verdict,
            status,
        }
    }
}
