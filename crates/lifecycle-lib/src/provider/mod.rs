//! Cloud provider collaborators
//!
//! The lifecycle engine only sees the [`CloudProvider`] trait. Two
//! implementations ship with the crate:
//! - [`OpenStackProvider`]: Keystone v3 + Nova over HTTP
//! - [`FixtureProvider`]: an in-memory fleet for offline classification and tests

mod fixture;
mod openstack;

use async_trait::async_trait;
use thiserror::Error;

use crate::models::ServerRecord;

pub use fixture::{FixtureFleet, FixtureProvider, RecordedCall};
pub use openstack::{OpenStackConfig, OpenStackProvider};

/// Errors raised by provider calls
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("authentication failed for project {project}: {reason}")]
    Auth { project: String, reason: String },

    #[error("no {service} endpoint in the service catalog of project {project}")]
    MissingEndpoint { service: String, project: String },

    #[error("request to {url} returned {status}: {body}")]
    Status {
        url: String,
        status: u16,
        body: String,
    },

    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),

    #[error("tenant {0} is unavailable")]
    Unavailable(String),

    #[error("instance {instance_id} not found in tenant {tenant}")]
    NotFound { tenant: String, instance_id: String },

    #[error("failed to read fixture: {0}")]
    Fixture(String),
}

impl ProviderError {
    /// Short label used as a metric dimension
    pub fn kind(&self) -> &'static str {
        match self {
            ProviderError::Auth { .. } => "auth",
            ProviderError::MissingEndpoint { .. } => "catalog",
            ProviderError::Status { .. } => "status",
            ProviderError::Http(_) => "http",
            ProviderError::Url(_) => "url",
            ProviderError::Unavailable(_) => "unavailable",
            ProviderError::NotFound { .. } => "not_found",
            ProviderError::Fixture(_) => "fixture",
        }
    }
}

/// Listing and lifecycle operations of a cloud
#[async_trait]
pub trait CloudProvider: Send + Sync {
    /// Names of every tenant the service account can see
    async fn list_tenants(&self) -> Result<Vec<String>, ProviderError>;

    /// Instances of one tenant, each with its action log
    async fn list_instances(&self, tenant: &str) -> Result<Vec<ServerRecord>, ProviderError>;

    async fn shelve(&self, tenant: &str, instance_id: &str) -> Result<(), ProviderError>;

    async fn delete(&self, tenant: &str, instance_id: &str) -> Result<(), ProviderError>;
}
