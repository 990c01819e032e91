//! Scheduled and on-demand lifecycle runs
//!
//! [`RunLoop`] fires a run every interval and whenever a [`RunTrigger`]
//! asks for one. Completed reports are published to a [`ReportStore`].

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot, RwLock};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{info, warn};

use crate::health::{components, HealthRegistry};
use crate::runner::{LifecycleRunner, RunReport};

/// Latest completed run, shared with the API
#[derive(Debug, Clone, Default)]
pub struct ReportStore {
    latest: Arc<RwLock<Option<RunReport>>>,
}

impl ReportStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn latest(&self) -> Option<RunReport> {
        self.latest.read().await.clone()
    }

    pub async fn publish(&self, report: RunReport) {
        *self.latest.write().await = Some(report);
    }
}

#[derive(Debug, Clone)]
pub struct ScheduleConfig {
    pub interval: Duration,
    /// Default dry-run mode for scheduled runs
    pub dry_run: bool,
    /// Run immediately at startup instead of waiting one interval
    pub run_on_start: bool,
    pub trigger_buffer: usize,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(24 * 60 * 60),
            dry_run: true,
            run_on_start: true,
            trigger_buffer: 8,
        }
    }
}

/// Body of a manual run request
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct RunRequest {
    /// Overrides the configured dry-run mode for this run only
    #[serde(default)]
    pub dry_run: Option<bool>,
}

#[derive(Debug, Error)]
pub enum TriggerError {
    #[error("run loop is not running")]
    Closed,
    #[error("run failed: {0}")]
    Failed(String),
}

struct PendingRun {
    request: RunRequest,
    respond: oneshot::Sender<Result<RunReport, String>>,
}

/// Handle for requesting runs out of schedule
#[derive(Clone)]
pub struct RunTrigger {
    tx: mpsc::Sender<PendingRun>,
}

impl RunTrigger {
    /// Request a run and wait for its report
    pub async fn run(&self, request: RunRequest) -> Result<RunReport, TriggerError> {
        let (respond, response) = oneshot::channel();
        self.tx
            .send(PendingRun { request, respond })
            .await
            .map_err(|_| TriggerError::Closed)?;

        response
            .await
            .map_err(|_| TriggerError::Closed)?
            .map_err(TriggerError::Failed)
    }
}

/// Interval loop around a [`LifecycleRunner`]
pub struct RunLoop {
    runner: Arc<LifecycleRunner>,
    config: ScheduleConfig,
    health: HealthRegistry,
    reports: ReportStore,
    triggers: mpsc::Receiver<PendingRun>,
}

impl RunLoop {
    pub fn new(
        runner: Arc<LifecycleRunner>,
        config: ScheduleConfig,
        health: HealthRegistry,
        reports: ReportStore,
    ) -> (Self, RunTrigger) {
        let (tx, triggers) = mpsc::channel(config.trigger_buffer.max(1));

        let run_loop = Self {
            runner,
            config,
            health,
            reports,
            triggers,
        };

        (run_loop, RunTrigger { tx })
    }

    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            dry_run = self.config.dry_run,
            "Starting lifecycle run loop"
        );

        let mut ticker = interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        if !self.config.run_on_start {
            // The first tick of an interval completes immediately
            ticker.tick().await;
        }

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let dry_run = self.config.dry_run;
                    let _ = self.run_once(dry_run).await;
                }
                Some(pending) = self.triggers.recv() => {
                    let dry_run = pending.request.dry_run.unwrap_or(self.config.dry_run);
                    info!(dry_run = dry_run, "Manual lifecycle run requested");
                    let outcome = self.run_once(dry_run).await;
                    if pending.respond.send(outcome).is_err() {
                        warn!("Run requester went away before the report was ready");
                    }
                }
                _ = shutdown.recv() => {
                    info!("Shutting down lifecycle run loop");
                    break;
                }
            }
        }
    }

    async fn run_once(&self, dry_run: bool) -> Result<RunReport, String> {
        match self.runner.run(dry_run).await {
            Ok(report) => {
                self.record_health(&report).await;
                self.reports.publish(report.clone()).await;
                Ok(report)
            }
            Err(e) => {
                let message = format!("{e:#}");
                self.health
                    .set_unhealthy(components::PROVIDER, message.clone())
                    .await;
                Err(message)
            }
        }
    }

    async fn record_health(&self, report: &RunReport) {
        if report.failed_tenants.is_empty() {
            self.health.set_healthy(components::PROVIDER).await;
        } else {
            self.health
                .set_degraded(
                    components::PROVIDER,
                    format!("{} tenants could not be listed", report.failed_tenants.len()),
                )
                .await;
        }

        if report.notifications.failed == 0 {
            self.health.set_healthy(components::NOTIFIER).await;
        } else {
            self.health
                .set_degraded(
                    components::NOTIFIER,
                    format!("{} notifications failed", report.notifications.failed),
                )
                .await;
        }
    }
}
