//! Lifecycle policy document
//!
//! The policy is read from a TOML/YAML/JSON file through the `config` crate.
//! It carries the global thresholds, tenant and instance overrides and the
//! tenant notification addresses.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use super::threshold::{SettingsError, ThresholdRow, ThresholdSettings};

/// Errors raised while loading a policy
#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("failed to read policy from {path}: {source}")]
    Load {
        path: String,
        #[source]
        source: config::ConfigError,
    },
    #[error("invalid global settings: {0}")]
    Global(#[source] SettingsError),
    #[error("invalid settings for tenant {tenant}: {source}")]
    Tenant {
        tenant: String,
        #[source]
        source: SettingsError,
    },
    #[error("invalid settings for instance {instance_id}: {source}")]
    Instance {
        instance_id: String,
        #[source]
        source: SettingsError,
    },
}

/// Per-tenant override row
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TenantSettingsRow {
    #[serde(default, alias = "project_name")]
    pub tenant: String,
    #[serde(flatten)]
    pub thresholds: ThresholdRow,
}

/// Per-instance override row
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstanceSettingsRow {
    #[serde(default)]
    pub instance_id: String,
    #[serde(flatten)]
    pub thresholds: ThresholdRow,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailRow {
    #[serde(alias = "tenant_name")]
    pub tenant: String,
    #[serde(alias = "email_address")]
    pub email: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotificationRows {
    #[serde(default)]
    pub default_email: Option<String>,
    #[serde(default)]
    pub email_addresses: Vec<EmailRow>,
}

/// The policy document as written on disk
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyDocument {
    pub global: ThresholdRow,
    #[serde(default)]
    pub tenant_settings: Vec<TenantSettingsRow>,
    #[serde(default)]
    pub instance_settings: Vec<InstanceSettingsRow>,
    #[serde(default)]
    pub notifications: NotificationRows,
}

/// Validated lifecycle policy
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LifecyclePolicy {
    global: ThresholdSettings,
    tenants: HashMap<String, ThresholdSettings>,
    instances: HashMap<String, ThresholdSettings>,
    email_addresses: HashMap<String, String>,
    default_email: Option<String>,
}

impl LifecyclePolicy {
    /// Create a policy with only global defaults
    pub fn new(global: ThresholdSettings) -> Self {
        Self {
            global,
            tenants: HashMap::new(),
            instances: HashMap::new(),
            email_addresses: HashMap::new(),
            default_email: None,
        }
    }

    pub fn with_tenant_override(mut self, tenant: impl Into<String>, settings: ThresholdSettings) -> Self {
        self.tenants.insert(tenant.into(), settings);
        self
    }

    pub fn with_instance_override(
        mut self,
        instance_id: impl Into<String>,
        settings: ThresholdSettings,
    ) -> Self {
        self.instances.insert(instance_id.into(), settings);
        self
    }

    pub fn with_email_address(mut self, tenant: impl Into<String>, email: impl Into<String>) -> Self {
        self.email_addresses.insert(tenant.into(), email.into());
        self
    }

    pub fn with_default_email(mut self, email: impl Into<String>) -> Self {
        self.default_email = Some(email.into());
        self
    }

    /// Load and validate a policy file; the format follows the file extension
    pub fn load(path: &Path) -> Result<Self, PolicyError> {
        let document: PolicyDocument = config::Config::builder()
            .add_source(config::File::from(path))
            .build()
            .and_then(|config| config.try_deserialize())
            .map_err(|source| PolicyError::Load {
                path: path.display().to_string(),
                source,
            })?;

        Self::from_document(document)
    }

    /// Validate every row of a policy document
    ///
    /// Rows with a blank tenant or instance id are skipped.
    pub fn from_document(document: PolicyDocument) -> Result<Self, PolicyError> {
        let global = ThresholdSettings::from_row(&document.global).map_err(PolicyError::Global)?;
        let mut policy = Self::new(global);

        for row in document.tenant_settings {
            let tenant = row.tenant.trim();
            if tenant.is_empty() {
                debug!("Skipping tenant settings row without a tenant");
                continue;
            }
            let settings =
                ThresholdSettings::from_row(&row.thresholds).map_err(|source| PolicyError::Tenant {
                    tenant: tenant.to_string(),
                    source,
                })?;
            policy.tenants.insert(tenant.to_string(), settings);
        }

        for row in document.instance_settings {
            let instance_id = row.instance_id.trim();
            if instance_id.is_empty() {
                debug!("Skipping instance settings row without an instance id");
                continue;
            }
            let settings = ThresholdSettings::from_row(&row.thresholds).map_err(|source| {
                PolicyError::Instance {
                    instance_id: instance_id.to_string(),
                    source,
                }
            })?;
            policy.instances.insert(instance_id.to_string(), settings);
        }

        for row in document.notifications.email_addresses {
            policy.email_addresses.insert(row.tenant, row.email);
        }
        policy.default_email = document
            .notifications
            .default_email
            .filter(|email| !email.trim().is_empty());

        Ok(policy)
    }

    pub fn global(&self) -> &ThresholdSettings {
        &self.global
    }

    pub fn tenant_override(&self, tenant: &str) -> Option<&ThresholdSettings> {
        self.tenants.get(tenant)
    }

    pub fn instance_override(&self, instance_id: &str) -> Option<&ThresholdSettings> {
        self.instances.get(instance_id)
    }

    /// Settings for one instance: instance override, then tenant override,
    /// then the global default
    pub fn effective_settings(&self, tenant: &str, instance_id: &str) -> &ThresholdSettings {
        self.instances
            .get(instance_id)
            .or_else(|| self.tenants.get(tenant))
            .unwrap_or(&self.global)
    }

    pub fn default_email(&self) -> Option<&str> {
        self.default_email.as_deref()
    }

    /// Address that receives a tenant's notifications
    pub fn recipient(&self, tenant: &str) -> Option<&str> {
        self.email_addresses
            .get(tenant)
            .map(String::as_str)
            .or(self.default_email.as_deref())
    }

    /// Tenants that have no address of their own
    pub fn tenants_without_address<'a>(&self, tenants: &'a [String]) -> Vec<&'a str> {
        tenants
            .iter()
            .filter(|tenant| !self.email_addresses.contains_key(tenant.as_str()))
            .map(String::as_str)
            .collect()
    }

    pub fn tenant_overrides(&self) -> impl Iterator<Item = (&String, &ThresholdSettings)> {
        self.tenants.iter()
    }

    pub fn instance_overrides(&self) -> impl Iterator<Item = (&String, &ThresholdSettings)> {
        self.instances.iter()
    }
}
