//! In-memory provider backed by a fleet description

use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use super::{CloudProvider, ProviderError};
use crate::models::ServerRecord;

/// Fleet description, as stored in a JSON fixture file
///
/// ```json
/// {"tenants": {"research": [{"id": "i-1", "name": "vm", "vm_state": "active", "actions": []}]}}
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FixtureFleet {
    #[serde(default)]
    pub tenants: BTreeMap<String, Vec<ServerRecord>>,
}

/// A lifecycle call received by the fixture provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordedCall {
    Shelve { tenant: String, instance_id: String },
    Delete { tenant: String, instance_id: String },
}

/// Provider that serves a fixed fleet and records lifecycle calls
#[derive(Debug, Default)]
pub struct FixtureProvider {
    fleet: FixtureFleet,
    failing_tenants: HashSet<String>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl FixtureProvider {
    pub fn new(fleet: FixtureFleet) -> Self {
        Self {
            fleet,
            failing_tenants: HashSet::new(),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Load a fleet from a JSON file
    pub fn from_file(path: &Path) -> Result<Self, ProviderError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ProviderError::Fixture(format!("{}: {}", path.display(), e)))?;
        let fleet: FixtureFleet = serde_json::from_str(&raw)
            .map_err(|e| ProviderError::Fixture(format!("{}: {}", path.display(), e)))?;
        Ok(Self::new(fleet))
    }

    pub fn with_tenant(mut self, tenant: impl Into<String>, servers: Vec<ServerRecord>) -> Self {
        self.fleet.tenants.insert(tenant.into(), servers);
        self
    }

    /// Make every call for `tenant` fail with [`ProviderError::Unavailable`]
    pub fn with_failing_tenant(mut self, tenant: impl Into<String>) -> Self {
        self.failing_tenants.insert(tenant.into());
        self
    }

    pub fn fleet(&self) -> &FixtureFleet {
        &self.fleet
    }

    /// Lifecycle calls received so far, in order
    pub async fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().await.clone()
    }

    fn check_tenant(&self, tenant: &str) -> Result<&[ServerRecord], ProviderError> {
        if self.failing_tenants.contains(tenant) {
            return Err(ProviderError::Unavailable(tenant.to_string()));
        }
        Ok(self
            .fleet
            .tenants
            .get(tenant)
            .map(Vec::as_slice)
            .unwrap_or_default())
    }

    fn check_instance(&self, tenant: &str, instance_id: &str) -> Result<(), ProviderError> {
        let servers = self.check_tenant(tenant)?;
        if servers.iter().any(|server| server.id == instance_id) {
            Ok(())
        } else {
            Err(ProviderError::NotFound {
                tenant: tenant.to_string(),
                instance_id: instance_id.to_string(),
            })
        }
    }
}

#[async_trait]
impl CloudProvider for FixtureProvider {
    async fn list_tenants(&self) -> Result<Vec<String>, ProviderError> {
        Ok(self.fleet.tenants.keys().cloned().collect())
    }

    async fn list_instances(&self, tenant: &str) -> Result<Vec<ServerRecord>, ProviderError> {
        self.check_tenant(tenant).map(<[ServerRecord]>::to_vec)
    }

    async fn shelve(&self, tenant: &str, instance_id: &str) -> Result<(), ProviderError> {
        self.check_instance(tenant, instance_id)?;
        self.calls.lock().await.push(RecordedCall::Shelve {
            tenant: tenant.to_string(),
            instance_id: instance_id.to_string(),
        });
        Ok(())
    }

    async fn delete(&self, tenant: &str, instance_id: &str) -> Result<(), ProviderError> {
        self.check_instance(tenant, instance_id)?;
        self.calls.lock().await.push(RecordedCall::Delete {
            tenant: tenant.to_string(),
            instance_id: instance_id.to_string(),
        });
        Ok(())
    }
}
