//! Run reports: fetching the latest one and triggering runs

use anyhow::{anyhow, Result};
use lifecycle_lib::{
    actions::{ActionOutcome, ActionStatus},
    lifecycle::Verdict,
    runner::InstanceReport,
    RunReport,
};
use tabled::Tabled;

use crate::client::ApiClient;
use crate::output::{
    color_status, color_verdict, print_info, print_json, print_success, print_table,
    print_warning, OutputFormat,
};

#[derive(Tabled)]
struct InstanceRow {
    #[tabled(rename = "Tenant")]
    tenant: String,
    #[tabled(rename = "Instance")]
    instance: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Verdict")]
    verdict: String,
    #[tabled(rename = "Details")]
    details: String,
}

#[derive(Tabled)]
struct ActionRow {
    #[tabled(rename = "Tenant")]
    tenant: String,
    #[tabled(rename = "Instance")]
    instance: String,
    #[tabled(rename = "Action")]
    action: String,
    #[tabled(rename = "Outcome")]
    outcome: String,
}

/// Restricts which instances of a report are shown
#[derive(Debug, Clone, Default)]
pub struct ReportFilter {
    pub tenant: Option<String>,
    pub verdict: Option<Verdict>,
}

impl ReportFilter {
    fn matches(&self, tenant: &str, verdict: Verdict) -> bool {
        self.tenant.as_deref().map_or(true, |t| t == tenant)
            && self.verdict.map_or(true, |v| v == verdict)
    }

    fn apply(&self, report: &RunReport) -> RunReport {
        let mut filtered = report.clone();
        filtered
            .instances
            .retain(|row| self.matches(&row.tenant, row.verdict));
        filtered
            .actions
            .retain(|outcome| self.matches(&outcome.tenant, outcome.action));
        filtered
    }
}

/// Parse a verdict name such as `shelve_warn`
pub fn parse_verdict(raw: &str) -> Result<Verdict> {
    Verdict::ALL
        .into_iter()
        .find(|verdict| verdict.as_str() == raw.trim().to_lowercase())
        .ok_or_else(|| {
            let names: Vec<_> = Verdict::ALL.iter().map(Verdict::as_str).collect();
            anyhow!("Unknown verdict '{}', expected one of: {}", raw, names.join(", "))
        })
}

fn instance_row(row: &InstanceReport) -> InstanceRow {
    InstanceRow {
        tenant: row.tenant.clone(),
        instance: format!("{} ({})", row.instance_name, row.instance_id),
        status: row.status.to_string(),
        verdict: color_verdict(row.verdict),
        details: row.message.clone(),
    }
}

fn action_row(outcome: &ActionOutcome) -> ActionRow {
    ActionRow {
        tenant: outcome.tenant.clone(),
        instance: format!("{} ({})", outcome.instance_name, outcome.instance_id),
        action: color_verdict(outcome.action),
        outcome: match &outcome.status {
            ActionStatus::Failed(reason) => format!("{}: {}", color_status("failed"), reason),
            status => color_status(status.label()),
        },
    }
}

/// Print a report as tables, or as JSON
pub fn render_report(report: &RunReport, filter: &ReportFilter, format: OutputFormat) -> Result<()> {
    let report = filter.apply(report);

    if let OutputFormat::Json = format {
        return print_json(&report);
    }

    let mode = if report.dry_run { "dry run" } else { "live" };
    print_info(&format!(
        "Run at {} ({}): {} tenants, {} instances classified",
        report.started_at.to_rfc3339(),
        mode,
        report.tenants,
        report.instances_classified
    ));
    let counts: Vec<String> = [
        Verdict::Shelve,
        Verdict::ShelveWarn,
        Verdict::Delete,
        Verdict::DeleteWarn,
    ]
    .iter()
    .map(|verdict| format!("{} {}", verdict.as_str(), report.count(*verdict)))
    .collect();
    println!("{}\n", counts.join(" | "));

    print_table(
        report.instances.iter().map(instance_row).collect(),
        "No flagged instances",
    );

    if !report.actions.is_empty() {
        println!();
        print_table(report.actions.iter().map(action_row).collect(), "No actions");
    }

    println!(
        "\nNotifications: {} sent, {} failed",
        report.notifications.sent, report.notifications.failed
    );
    for failure in &report.failed_tenants {
        print_warning(&format!(
            "Tenant {} skipped: {}",
            failure.tenant, failure.reason
        ));
    }

    Ok(())
}

/// Show the agent's latest report
pub async fn show_report(client: &ApiClient, filter: &ReportFilter, format: OutputFormat) -> Result<()> {
    let report: RunReport = client.get("api/v1/report").await?;
    render_report(&report, filter, format)
}

/// Ask the agent to run now; `None` keeps its configured mode
pub async fn trigger_run(client: &ApiClient, dry_run: Option<bool>, format: OutputFormat) -> Result<()> {
    let query: Vec<(&str, String)> = dry_run
        .map(|dry_run| vec![("dry_run", dry_run.to_string())])
        .unwrap_or_default();

    let report: RunReport = client.post("api/v1/runs", &query).await?;

    if let OutputFormat::Table = format {
        print_success("Lifecycle run completed");
    }
    render_report(&report, &ReportFilter::default(), format)?;

    let failed = report.failed_actions();
    if failed > 0 {
        return Err(anyhow!("{} actions failed", failed));
    }
    Ok(())
}
