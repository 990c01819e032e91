//! Verdict engine

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::state::InstanceSnapshot;
use crate::settings::ThresholdSettings;

/// Outcome of classifying one instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    DoNothing,
    ShelveWarn,
    Shelve,
    DeleteWarn,
    Delete,
}

impl Verdict {
    pub const ALL: [Verdict; 5] = [
        Verdict::DoNothing,
        Verdict::ShelveWarn,
        Verdict::Shelve,
        Verdict::DeleteWarn,
        Verdict::Delete,
    ];

    /// Whether the verdict triggers a provider call
    pub fn is_action(&self) -> bool {
        matches!(self, Verdict::Shelve | Verdict::Delete)
    }

    pub fn is_warning(&self) -> bool {
        matches!(self, Verdict::ShelveWarn | Verdict::DeleteWarn)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::DoNothing => "do_nothing",
            Verdict::ShelveWarn => "shelve_warn",
            Verdict::Shelve => "shelve",
            Verdict::DeleteWarn => "delete_warn",
            Verdict::Delete => "delete",
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decide what should happen to an instance
///
/// Checks run action-first: an instance past both its warning and its action
/// threshold is acted upon, not warned.
pub fn classify(
    snapshot: &InstanceSnapshot,
    settings: &ThresholdSettings,
    now: DateTime<Utc>,
) -> Verdict {
    if settings.should_shelve(snapshot, now) {
        Verdict::Shelve
    } else if settings.should_shelve_warn(snapshot, now) {
        Verdict::ShelveWarn
    } else if settings.should_delete(snapshot, now) {
        Verdict::Delete
    } else if settings.should_delete_warn(snapshot, now) {
        Verdict::DeleteWarn
    } else {
        Verdict::DoNothing
    }
}
