//! Offline classification of a fleet description

use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use lifecycle_lib::{
    lifecycle::parse_timestamp, notify::LogMailer, provider::FixtureProvider, LifecyclePolicy,
    LifecycleRunner, RunReport,
};

use super::report::{render_report, ReportFilter};
use crate::output::OutputFormat;

/// `--now` accepts RFC 3339 or the provider's naive timestamps
pub fn parse_now(raw: Option<&str>) -> Result<DateTime<Utc>> {
    match raw {
        None => Ok(Utc::now()),
        Some(raw) => parse_timestamp(raw).ok_or_else(|| anyhow!("Invalid timestamp '{}'", raw)),
    }
}

/// Dry-run the lifecycle over a fleet fixture; nothing is contacted
pub async fn classify_fleet_file(
    policy_path: &Path,
    fleet_path: &Path,
    now: DateTime<Utc>,
) -> Result<RunReport> {
    let policy = LifecyclePolicy::load(policy_path)
        .with_context(|| format!("Failed to load policy {}", policy_path.display()))?;
    let provider = FixtureProvider::from_file(fleet_path)?;

    let runner = LifecycleRunner::new(Arc::new(provider), Arc::new(policy), Arc::new(LogMailer))?;
    runner.run_at(now, true).await
}

pub async fn classify(
    policy_path: &Path,
    fleet_path: &Path,
    now: Option<&str>,
    filter: &ReportFilter,
    format: OutputFormat,
) -> Result<()> {
    let now = parse_now(now)?;
    let report = classify_fleet_file(policy_path, fleet_path, now).await?;
    render_report(&report, filter, format)
}
