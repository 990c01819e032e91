//! Per-instance notification messages

use chrono::{DateTime, Utc};

use crate::lifecycle::{InstanceSnapshot, Since, Verdict, VmStatus};
use crate::settings::{Threshold, ThresholdSettings};

/// Whole days left until `since + threshold`, never negative
///
/// `None` when either side is unknown.
pub fn days_remaining(since: Since, threshold: Threshold, now: DateTime<Utc>) -> Option<i64> {
    let Since::At(since) = since else {
        return match since {
            Since::Indefinite if threshold.as_duration().is_some() => Some(0),
            _ => None,
        };
    };
    let duration = chrono::Duration::from_std(threshold.as_duration()?).ok()?;
    let deadline = since.checked_add_signed(duration)?;

    Some((deadline - now).num_days().max(0))
}

/// Explanation of a verdict for the tenant owner
///
/// Empty for `DoNothing`.
pub fn action_message(
    snapshot: &InstanceSnapshot,
    verdict: Verdict,
    settings: &ThresholdSettings,
    now: DateTime<Utc>,
) -> String {
    match verdict {
        Verdict::Shelve => {
            let days = if snapshot.status == VmStatus::Stopped {
                settings.shelve_stopped().in_days()
            } else {
                settings.shelve_running().in_days()
            };
            format!(
                "Instance has been {} for more than {} days",
                snapshot.status, days
            )
        }
        Verdict::Delete => format!(
            "Instance has been shelved for more than {} days",
            settings.delete_shelved().in_days()
        ),
        Verdict::ShelveWarn => {
            let (since, action, warning) = if snapshot.status == VmStatus::Stopped {
                (
                    snapshot.stopped_since(),
                    settings.shelve_stopped(),
                    settings.shelve_stopped_warning(),
                )
            } else {
                (
                    snapshot.running_since(),
                    settings.shelve_running(),
                    settings.shelve_running_warning(),
                )
            };
            warning_message("shelved", snapshot.status, since, action, warning, now)
        }
        Verdict::DeleteWarn => warning_message(
            "deleted",
            snapshot.status,
            snapshot.shelved_since(),
            settings.delete_shelved(),
            settings.delete_warning(),
            now,
        ),
        Verdict::DoNothing => String::new(),
    }
}

fn warning_message(
    outcome: &str,
    status: VmStatus,
    since: Since,
    action: Threshold,
    warning: Threshold,
    now: DateTime<Utc>,
) -> String {
    let remaining = days_remaining(since, action, now)
        .map(|days| days.to_string())
        .unwrap_or_else(|| "an unknown number of".to_string());

    format!(
        "Instance will be {} in {} days (it has been {} for more than {} days)",
        outcome,
        remaining,
        status,
        warning.in_days()
    )
}
