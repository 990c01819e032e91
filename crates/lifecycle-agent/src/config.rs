//! Agent configuration

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Result};
use lifecycle_lib::notify::DEFAULT_SUBJECT_PREFIX;
use lifecycle_lib::provider::OpenStackConfig;
use serde::Deserialize;

const ENV_PREFIX: &str = "LIFECYCLE";

/// Agent configuration
///
/// Read from `LIFECYCLE_*` environment variables; nested sections use `__`,
/// e.g. `LIFECYCLE_OPENSTACK__AUTH_URL`.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Name used in structured logs
    #[serde(default = "default_agent_id")]
    pub agent_id: String,

    /// API server port for health, metrics and reports
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    #[serde(default = "default_run_interval")]
    pub run_interval_secs: u64,

    /// Run once at startup instead of waiting a full interval
    #[serde(default = "default_true")]
    pub run_on_start: bool,

    /// Scheduled runs only report and notify unless this is false
    #[serde(default = "default_true")]
    pub dry_run: bool,

    /// Tenants listed in parallel
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    #[serde(default = "default_policy_path")]
    pub policy_path: PathBuf,

    #[serde(default = "default_subject_prefix")]
    pub subject_prefix: String,

    #[serde(default)]
    pub openstack: OpenStackSettings,

    #[serde(default)]
    pub mail: MailSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OpenStackSettings {
    #[serde(default)]
    pub auth_url: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub main_project: String,
    #[serde(default = "default_domain")]
    pub user_domain: String,
    #[serde(default = "default_domain")]
    pub project_domain: String,
    #[serde(default)]
    pub region: Option<String>,
}

impl Default for OpenStackSettings {
    fn default() -> Self {
        Self {
            auth_url: String::new(),
            username: String::new(),
            password: String::new(),
            main_project: String::new(),
            user_domain: default_domain(),
            project_domain: default_domain(),
            region: None,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MailSettings {
    /// Mail relay endpoint; notifications are only logged without one
    #[serde(default)]
    pub relay_url: Option<String>,
    #[serde(default)]
    pub source_email: Option<String>,
}

fn default_agent_id() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "lifecycle-agent".to_string())
}

fn default_api_port() -> u16 {
    8080
}

fn default_run_interval() -> u64 {
    24 * 60 * 60
}

fn default_true() -> bool {
    true
}

fn default_max_concurrency() -> usize {
    8
}

fn default_request_timeout() -> u64 {
    30
}

fn default_policy_path() -> PathBuf {
    PathBuf::from("/etc/lifecycle/policy.toml")
}

fn default_subject_prefix() -> String {
    DEFAULT_SUBJECT_PREFIX.to_string()
}

fn default_domain() -> String {
    "Default".to_string()
}

fn is_blank(value: &str) -> bool {
    value.trim().is_empty()
}

impl AgentConfig {
    /// Load configuration from the environment
    pub fn load() -> Result<Self> {
        Self::from_environment(config::Environment::with_prefix(ENV_PREFIX))
    }

    pub(crate) fn from_environment(environment: config::Environment) -> Result<Self> {
        let config = config::Config::builder()
            // Values stay strings; numeric fields are converted on deserialize
            .add_source(environment.prefix_separator("_").separator("__"))
            .build()?;

        Ok(config.try_deserialize()?)
    }

    /// Fails listing every missing required setting
    pub fn validate(&self) -> Result<()> {
        let mut missing = Vec::new();

        let openstack = [
            ("OPENSTACK__AUTH_URL", &self.openstack.auth_url),
            ("OPENSTACK__USERNAME", &self.openstack.username),
            ("OPENSTACK__PASSWORD", &self.openstack.password),
            ("OPENSTACK__MAIN_PROJECT", &self.openstack.main_project),
        ];
        for (name, value) in openstack {
            if is_blank(value) {
                missing.push(format!("{ENV_PREFIX}_{name}"));
            }
        }

        let relay_configured = self
            .mail
            .relay_url
            .as_deref()
            .is_some_and(|url| !is_blank(url));
        let source_missing = self
            .mail
            .source_email
            .as_deref()
            .map_or(true, is_blank);
        if relay_configured && source_missing {
            missing.push(format!("{ENV_PREFIX}_MAIL__SOURCE_EMAIL"));
        }

        if self.run_interval_secs == 0 {
            bail!("{ENV_PREFIX}_RUN_INTERVAL_SECS must be greater than zero");
        }
        if !missing.is_empty() {
            bail!("Missing required settings: {}", missing.join(", "));
        }
        Ok(())
    }

    pub fn run_interval(&self) -> Duration {
        Duration::from_secs(self.run_interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn openstack_config(&self) -> OpenStackConfig {
        OpenStackConfig {
            auth_url: self.openstack.auth_url.clone(),
            username: self.openstack.username.clone(),
            password: self.openstack.password.clone(),
            user_domain: self.openstack.user_domain.clone(),
            project_domain: self.openstack.project_domain.clone(),
            main_project: self.openstack.main_project.clone(),
            region: self.openstack.region.clone(),
            request_timeout: self.request_timeout(),
        }
    }

    /// Relay URL and sender, when mail delivery is configured
    pub fn mail_relay(&self) -> Option<(&str, &str)> {
        let relay_url = self.mail.relay_url.as_deref().filter(|url| !is_blank(url))?;
        let source = self.mail.source_email.as_deref()?;
        Some((relay_url, source))
    }
}
