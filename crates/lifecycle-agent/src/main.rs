//! Lifecycle agent
//!
//! Runs the instance lifecycle on a schedule: classifies every tenant's
//! instances, shelves or deletes them (unless dry-run) and notifies owners.

use std::sync::Arc;

use anyhow::{Context, Result};
use lifecycle_agent::{api, config::AgentConfig};
use lifecycle_lib::{
    health::HealthRegistry,
    notify::{HttpMailer, LogMailer, Mailer},
    observability::{LifecycleMetrics, StructuredLogger},
    provider::OpenStackProvider,
    runner::LifecycleRunner,
    schedule::{ReportStore, RunLoop, ScheduleConfig},
    settings::LifecyclePolicy,
};
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting lifecycle-agent");

    let config = AgentConfig::load().context("Failed to load agent configuration")?;
    config.validate()?;
    info!(agent_id = %config.agent_id, policy = %config.policy_path.display(), "Agent configured");

    let health_registry = HealthRegistry::with_components().await;

    let policy = LifecyclePolicy::load(&config.policy_path)
        .with_context(|| format!("Failed to load policy {}", config.policy_path.display()))?;

    let metrics = LifecycleMetrics::new();
    let logger = StructuredLogger::new(&config.agent_id);
    logger.log_startup(AGENT_VERSION, config.dry_run, config.run_interval_secs);

    let provider = OpenStackProvider::new(config.openstack_config())
        .context("Failed to create OpenStack client")?;
    let mailer: Arc<dyn Mailer> = match config.mail_relay() {
        Some((relay_url, source)) => Arc::new(
            HttpMailer::new(relay_url, source, config.request_timeout())
                .context("Failed to create mail relay client")?,
        ),
        None => {
            warn!("No mail relay configured, notifications will only be logged");
            Arc::new(LogMailer)
        }
    };

    let runner = LifecycleRunner::new(Arc::new(provider), Arc::new(policy), mailer)?
        .with_max_concurrency(config.max_concurrency)
        .with_subject_prefix(config.subject_prefix.clone())?
        .with_logger(logger.clone());

    let reports = ReportStore::new();
    let (run_loop, trigger) = RunLoop::new(
        Arc::new(runner),
        ScheduleConfig {
            interval: config.run_interval(),
            dry_run: config.dry_run,
            run_on_start: config.run_on_start,
            ..Default::default()
        },
        health_registry.clone(),
        reports.clone(),
    );

    let app_state = Arc::new(api::AppState::new(
        health_registry.clone(),
        metrics,
        reports,
        trigger,
    ));

    health_registry.set_ready(true).await;

    let (shutdown_tx, _) = broadcast::channel(1);
    let loop_handle = tokio::spawn(run_loop.run(shutdown_tx.subscribe()));
    let api_handle = tokio::spawn(api::serve(
        config.api_port,
        app_state,
        shutdown_tx.subscribe(),
    ));

    tokio::signal::ctrl_c().await?;
    logger.log_shutdown("SIGINT received");
    let _ = shutdown_tx.send(());

    if let Err(e) = loop_handle.await {
        warn!(error = %e, "Run loop terminated abnormally");
    }
    match api_handle.await {
        Ok(Err(e)) => warn!(error = %e, "API server stopped with an error"),
        Err(e) => warn!(error = %e, "API server terminated abnormally"),
        Ok(Ok(())) => {}
    }

    info!("Shutdown complete");
    Ok(())
}
