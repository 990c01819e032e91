//! Time thresholds for the shelve/delete lifecycle
//!
//! A [`ThresholdSettings`] value holds three warning/action pairs. It is
//! validated once at construction and never mutated afterwards.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};
use thiserror::Error;

use crate::lifecycle::{InstanceSnapshot, Since};

const SECONDS_PER_DAY: f64 = 86_400.0;

/// Errors raised while building threshold settings
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SettingsError {
    #[error("{warning} ({warning_value}) is later than {action} ({action_value})")]
    WarningAfterAction {
        warning: &'static str,
        action: &'static str,
        warning_value: Threshold,
        action_value: Threshold,
    },
    #[error("invalid value {value:?} for {field}")]
    InvalidCell { field: &'static str, value: String },
}

/// How long an instance may stay in a state before a check fires
///
/// `Never` orders after every finite duration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Threshold {
    After(Duration),
    Never,
}

impl Threshold {
    /// Threshold of a number of days; negative or NaN input is rejected
    pub fn days(days: f64) -> Result<Self, SettingsError> {
        Self::from_secs_f64("days", days * SECONDS_PER_DAY)
    }

    /// Build a threshold from floating-point seconds
    ///
    /// Positive infinity and durations too large to represent mean `Never`.
    pub fn from_secs_f64(field: &'static str, secs: f64) -> Result<Self, SettingsError> {
        if secs.is_nan() || secs < 0.0 {
            return Err(SettingsError::InvalidCell {
                field,
                value: secs.to_string(),
            });
        }
        Ok(Duration::try_from_secs_f64(secs)
            .map(Self::After)
            .unwrap_or(Self::Never))
    }

    /// Parse a configuration cell; a missing or blank cell means `Never`
    pub fn from_cell(field: &'static str, cell: Option<&Cell>) -> Result<Self, SettingsError> {
        match cell {
            None => Ok(Self::Never),
            Some(Cell::Seconds(secs)) => Self::from_secs_f64(field, *secs),
            Some(Cell::Text(text)) => {
                let text = text.trim();
                if text.is_empty() {
                    return Ok(Self::Never);
                }
                let secs = text.parse::<f64>().map_err(|_| SettingsError::InvalidCell {
                    field,
                    value: text.to_string(),
                })?;
                Self::from_secs_f64(field, secs)
            }
        }
    }

    pub fn as_duration(&self) -> Option<Duration> {
        match self {
            Self::After(duration) => Some(*duration),
            Self::Never => None,
        }
    }

    /// Threshold expressed in days with one decimal (e.g. `"1.0"`)
    pub fn in_days(&self) -> String {
        match self {
            Self::After(duration) => format!("{:.1}", duration.as_secs_f64() / SECONDS_PER_DAY),
            Self::Never => "never".to_string(),
        }
    }
}

impl fmt::Display for Threshold {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::After(duration) => write!(f, "{}s", duration.as_secs_f64()),
            Self::Never => write!(f, "never"),
        }
    }
}

impl Serialize for Threshold {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::After(duration) => serializer.serialize_f64(duration.as_secs_f64()),
            Self::Never => serializer.serialize_none(),
        }
    }
}

/// Whether more time than `threshold` has passed since `since`
///
/// Not-applicable timestamps and `Never` thresholds never fire; an
/// indefinitely old timestamp always does.
pub fn is_above_threshold(since: Since, threshold: Threshold, now: DateTime<Utc>) -> bool {
    let Threshold::After(limit) = threshold else {
        return false;
    };

    match since {
        Since::NotApplicable => false,
        Since::Indefinite => true,
        Since::At(at) => now
            .signed_duration_since(at)
            .to_std()
            .map(|age| age >= limit)
            .unwrap_or(false),
    }
}

/// A raw configuration value: seconds as a number or as text
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Cell {
    Seconds(f64),
    Text(String),
}

impl From<f64> for Cell {
    fn from(secs: f64) -> Self {
        Self::Seconds(secs)
    }
}

impl From<&str> for Cell {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

/// One row of threshold cells, as found in a policy document
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ThresholdRow {
    #[serde(default, alias = "shelve_running_warning_threshold")]
    pub shelve_running_warning: Option<Cell>,
    #[serde(default, alias = "shelve_running_threshold")]
    pub shelve_running: Option<Cell>,
    #[serde(default, alias = "shelve_stopped_warning_threshold")]
    pub shelve_stopped_warning: Option<Cell>,
    #[serde(default, alias = "shelve_stopped_threshold")]
    pub shelve_stopped: Option<Cell>,
    #[serde(default, alias = "delete_warning_threshold")]
    pub delete_warning: Option<Cell>,
    #[serde(default, alias = "delete_shelved_threshold")]
    pub delete_shelved: Option<Cell>,
}

/// Validated thresholds for one scope (global, tenant or instance)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ThresholdSettings {
    shelve_running_warning: Threshold,
    shelve_running: Threshold,
    shelve_stopped_warning: Threshold,
    shelve_stopped: Threshold,
    delete_warning: Threshold,
    delete_shelved: Threshold,
}

impl ThresholdSettings {
    /// Create settings, rejecting any warning that would fire after its action
    pub fn new(
        shelve_running_warning: Threshold,
        shelve_running: Threshold,
        shelve_stopped_warning: Threshold,
        shelve_stopped: Threshold,
        delete_warning: Threshold,
        delete_shelved: Threshold,
    ) -> Result<Self, SettingsError> {
        let pairs = [
            (
                "shelve_running_warning",
                shelve_running_warning,
                "shelve_running",
                shelve_running,
            ),
            (
                "shelve_stopped_warning",
                shelve_stopped_warning,
                "shelve_stopped",
                shelve_stopped,
            ),
            (
                "delete_warning",
                delete_warning,
                "delete_shelved",
                delete_shelved,
            ),
        ];

        for (warning, warning_value, action, action_value) in pairs {
            if warning_value > action_value {
                return Err(SettingsError::WarningAfterAction {
                    warning,
                    action,
                    warning_value,
                    action_value,
                });
            }
        }

        Ok(Self {
            shelve_running_warning,
            shelve_running,
            shelve_stopped_warning,
            shelve_stopped,
            delete_warning,
            delete_shelved,
        })
    }

    /// Settings where nothing ever fires
    pub fn disabled() -> Self {
        Self {
            shelve_running_warning: Threshold::Never,
            shelve_running: Threshold::Never,
            shelve_stopped_warning: Threshold::Never,
            shelve_stopped: Threshold::Never,
            delete_warning: Threshold::Never,
            delete_shelved: Threshold::Never,
        }
    }

    pub fn from_row(row: &ThresholdRow) -> Result<Self, SettingsError> {
        Self::new(
            Threshold::from_cell("shelve_running_warning", row.shelve_running_warning.as_ref())?,
            Threshold::from_cell("shelve_running", row.shelve_running.as_ref())?,
            Threshold::from_cell("shelve_stopped_warning", row.shelve_stopped_warning.as_ref())?,
            Threshold::from_cell("shelve_stopped", row.shelve_stopped.as_ref())?,
            Threshold::from_cell("delete_warning", row.delete_warning.as_ref())?,
            Threshold::from_cell("delete_shelved", row.delete_shelved.as_ref())?,
        )
    }

    pub fn shelve_running_warning(&self) -> Threshold {
        self.shelve_running_warning
    }

    pub fn shelve_running(&self) -> Threshold {
        self.shelve_running
    }

    pub fn shelve_stopped_warning(&self) -> Threshold {
        self.shelve_stopped_warning
    }

    pub fn shelve_stopped(&self) -> Threshold {
        self.shelve_stopped
    }

    pub fn delete_warning(&self) -> Threshold {
        self.delete_warning
    }

    pub fn delete_shelved(&self) -> Threshold {
        self.delete_shelved
    }

    /// Running or stopped for longer than the shelve threshold
    pub fn should_shelve(&self, snapshot: &InstanceSnapshot, now: DateTime<Utc>) -> bool {
        is_above_threshold(snapshot.running_since(), self.shelve_running, now)
            || is_above_threshold(snapshot.stopped_since(), self.shelve_stopped, now)
    }

    /// Running or stopped for longer than the shelve warning threshold
    pub fn should_shelve_warn(&self, snapshot: &InstanceSnapshot, now: DateTime<Utc>) -> bool {
        is_above_threshold(snapshot.running_since(), self.shelve_running_warning, now)
            || is_above_threshold(snapshot.stopped_since(), self.shelve_stopped_warning, now)
    }

    /// Shelved for longer than the delete threshold
    pub fn should_delete(&self, snapshot: &InstanceSnapshot, now: DateTime<Utc>) -> bool {
        is_above_threshold(snapshot.shelved_since(), self.delete_shelved, now)
    }

    /// Shelved for longer than the delete warning threshold
    pub fn should_delete_warn(&self, snapshot: &InstanceSnapshot, now: DateTime<Utc>) -> bool {
        is_above_threshold(snapshot.shelved_since(), self.delete_warning, now)
    }
}
