//! Agent health and readiness

use anyhow::Result;
use chrono::{TimeZone, Utc};
use lifecycle_lib::health::{ComponentStatus, HealthResponse, ReadinessResponse};
use serde_json::json;
use tabled::Tabled;

use crate::client::ApiClient;
use crate::output::{color_status, print_json, print_success, print_table, print_warning, OutputFormat};

#[derive(Tabled)]
struct ComponentRow {
    #[tabled(rename = "Component")]
    name: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Message")]
    message: String,
    #[tabled(rename = "Last check")]
    last_check: String,
}

fn status_label(status: ComponentStatus) -> &'static str {
    match status {
        ComponentStatus::Healthy => "healthy",
        ComponentStatus::Degraded => "degraded",
        ComponentStatus::Unhealthy => "unhealthy",
    }
}

fn format_timestamp(timestamp: i64) -> String {
    Utc.timestamp_opt(timestamp, 0)
        .single()
        .map(|at| at.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "-".to_string())
}

pub async fn show_status(client: &ApiClient, format: OutputFormat) -> Result<()> {
    let health: HealthResponse = client.probe("healthz").await?;
    let readiness: ReadinessResponse = client.probe("readyz").await?;

    if let OutputFormat::Json = format {
        return print_json(&json!({ "health": health, "readiness": readiness }));
    }

    let overall = status_label(health.status);
    match health.status {
        ComponentStatus::Healthy => print_success(&format!("Agent is {}", color_status(overall))),
        _ => print_warning(&format!("Agent is {}", color_status(overall))),
    }
    match readiness.reason {
        None => print_success("Agent is ready"),
        Some(reason) => print_warning(&format!("Agent is not ready: {}", reason)),
    }
    println!();

    let rows = health
        .components
        .iter()
        .map(|(name, component)| ComponentRow {
            name: name.clone(),
            status: color_status(status_label(component.status)),
            message: component.message.clone().unwrap_or_default(),
            last_check: format_timestamp(component.last_check_timestamp),
        })
        .collect();
    print_table(rows, "No components registered");

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_timestamp() {
        assert_eq!(format_timestamp(0), "1970-01-01 00:00:00");
        assert_eq!(format_timestamp(i64::MAX), "-");
    }
}
