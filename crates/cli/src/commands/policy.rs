//! Policy document validation

use std::path::Path;

use anyhow::{Context, Result};
use lifecycle_lib::{LifecyclePolicy, ThresholdSettings};
use serde_json::json;
use tabled::Tabled;

use crate::output::{print_info, print_json, print_success, print_table, print_warning, OutputFormat};

/// Thresholds of one scope, in days
#[derive(Tabled)]
struct ScopeRow {
    #[tabled(rename = "Scope")]
    scope: String,
    #[tabled(rename = "Running warn")]
    shelve_running_warning: String,
    #[tabled(rename = "Running shelve")]
    shelve_running: String,
    #[tabled(rename = "Stopped warn")]
    shelve_stopped_warning: String,
    #[tabled(rename = "Stopped shelve")]
    shelve_stopped: String,
    #[tabled(rename = "Delete warn")]
    delete_warning: String,
    #[tabled(rename = "Delete")]
    delete_shelved: String,
}

impl ScopeRow {
    fn new(scope: String, settings: &ThresholdSettings) -> Self {
        Self {
            scope,
            shelve_running_warning: settings.shelve_running_warning().in_days(),
            shelve_running: settings.shelve_running().in_days(),
            shelve_stopped_warning: settings.shelve_stopped_warning().in_days(),
            shelve_stopped: settings.shelve_stopped().in_days(),
            delete_warning: settings.delete_warning().in_days(),
            delete_shelved: settings.delete_shelved().in_days(),
        }
    }
}

/// Global row first, then tenant and instance overrides in name order
fn scope_rows(policy: &LifecyclePolicy) -> Vec<ScopeRow> {
    let mut tenants: Vec<_> = policy.tenant_overrides().collect();
    tenants.sort_by(|a, b| a.0.cmp(b.0));
    let mut instances: Vec<_> = policy.instance_overrides().collect();
    instances.sort_by(|a, b| a.0.cmp(b.0));

    std::iter::once(ScopeRow::new("global".to_string(), policy.global()))
        .chain(
            tenants
                .into_iter()
                .map(|(tenant, settings)| ScopeRow::new(format!("tenant {tenant}"), settings)),
        )
        .chain(instances.into_iter().map(|(instance_id, settings)| {
            ScopeRow::new(format!("instance {instance_id}"), settings)
        }))
        .collect()
}

/// Load a policy, failing on the first invalid row, and print what it says
pub fn check_policy(
    path: &Path,
    tenant: Option<&str>,
    instance_id: Option<&str>,
    format: OutputFormat,
) -> Result<()> {
    let policy = LifecyclePolicy::load(path)
        .with_context(|| format!("Policy {} is invalid", path.display()))?;

    let effective = (tenant.is_some() || instance_id.is_some()).then(|| {
        policy.effective_settings(tenant.unwrap_or_default(), instance_id.unwrap_or_default())
    });

    if let OutputFormat::Json = format {
        return print_json(&json!({
            "policy": policy,
            "effective": effective,
            "recipient": tenant.and_then(|t| policy.recipient(t)),
        }));
    }

    print_success(&format!("Policy {} is valid", path.display()));
    println!();
    print_table(scope_rows(&policy), "No scopes defined");

    match policy.default_email() {
        Some(email) => print_info(&format!("Default notification address: {}", email)),
        None => print_warning("No default notification address; tenants without one get no mail"),
    }

    if let Some(settings) = effective {
        let scope = match (tenant, instance_id) {
            (Some(tenant), Some(instance_id)) => format!("{tenant}/{instance_id}"),
            (Some(tenant), None) => tenant.to_string(),
            (None, Some(instance_id)) => instance_id.to_string(),
            (None, None) => String::new(),
        };
        println!();
        print_info(&format!("Effective thresholds for {scope} (days)"));
        print_table(vec![ScopeRow::new(scope, settings)], "");

        if let Some(tenant) = tenant {
            match policy.recipient(tenant) {
                Some(email) => print_info(&format!("Notifications for {tenant} go to {email}")),
                None => print_warning(&format!("Tenant {tenant} has no notification address")),
            }
        }
    }

    Ok(())
}
