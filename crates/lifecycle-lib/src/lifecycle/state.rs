//! Instance state reader
//!
//! Derives how long an instance has been running, stopped or shelved by
//! replaying its action log against a fixed transition table.

use std::fmt;

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::models::{ActionRecord, ServerRecord};

/// vm_state values that count as running
const RUNNING_VM_STATES: &[&str] = &["active", "building", "paused", "resized"];
/// vm_state values that count as stopped
const STOPPED_VM_STATES: &[&str] = &["stopped", "suspended"];
/// vm_state values that count as shelved
const SHELVED_VM_STATES: &[&str] = &["shelved_offloaded"];

const TO_RUNNING_ACTIONS: &[&str] = &[
    "create", "rebuild", "resume", "start", "os-start", "unpause", "unshelve",
];
const TO_SHELVED_ACTIONS: &[&str] = &["shelve", "shelveOffload"];
// Snapshots (`createImage`) and `backup` leave the power state alone and
// are deliberately absent from every table.
const TO_STOPPED_ACTIONS: &[&str] = &["stop", "os-stop", "suspend", "pause"];

/// Observed state bucket of an instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VmStatus {
    Running,
    Stopped,
    Shelved,
    Unknown,
}

impl VmStatus {
    /// Bucket a raw provider vm_state
    pub fn from_vm_state(vm_state: &str) -> Self {
        let vm_state = vm_state.trim().to_ascii_lowercase();
        if RUNNING_VM_STATES.contains(&vm_state.as_str()) {
            VmStatus::Running
        } else if STOPPED_VM_STATES.contains(&vm_state.as_str()) {
            VmStatus::Stopped
        } else if SHELVED_VM_STATES.contains(&vm_state.as_str()) {
            VmStatus::Shelved
        } else {
            VmStatus::Unknown
        }
    }
}

impl fmt::Display for VmStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmStatus::Running => write!(f, "running"),
            VmStatus::Stopped => write!(f, "stopped"),
            VmStatus::Shelved => write!(f, "shelved"),
            VmStatus::Unknown => write!(f, "unknown"),
        }
    }
}

/// Effect of an action on the instance's state bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transition {
    ToRunning,
    ToShelved,
    ToStopped,
    NoChange,
}

impl Transition {
    /// Look an action name up in the transition table
    pub fn of(action: &str) -> Self {
        if TO_RUNNING_ACTIONS.contains(&action) {
            Transition::ToRunning
        } else if TO_SHELVED_ACTIONS.contains(&action) {
            Transition::ToShelved
        } else if TO_STOPPED_ACTIONS.contains(&action) {
            Transition::ToStopped
        } else {
            Transition::NoChange
        }
    }

    /// The transition that leads into a status bucket
    fn into_status(status: VmStatus) -> Option<Self> {
        match status {
            VmStatus::Running => Some(Transition::ToRunning),
            VmStatus::Stopped => Some(Transition::ToStopped),
            VmStatus::Shelved => Some(Transition::ToShelved),
            VmStatus::Unknown => None,
        }
    }
}

/// When an instance entered its current state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "at", rename_all = "snake_case")]
pub enum Since {
    /// The instance is not in the queried state, or has no action log
    NotApplicable,
    /// The transition into the state happened at this time
    At(DateTime<Utc>),
    /// The log has no matching transition; treated as older than any threshold
    Indefinite,
}

/// Parse a provider timestamp
///
/// Accepts RFC 3339 and the naive ISO-8601 form the compute API returns,
/// which is read as UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }

    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(raw, format).ok())
        .map(|naive| Utc.from_utc_datetime(&naive))
}

/// One parsed action log entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceAction {
    pub name: String,
    /// `None` when the provider timestamp could not be parsed
    pub started_at: Option<DateTime<Utc>>,
    pub transition: Transition,
}

impl From<ActionRecord> for InstanceAction {
    fn from(record: ActionRecord) -> Self {
        let started_at = parse_timestamp(&record.start_time);
        if started_at.is_none() {
            warn!(
                action = %record.action,
                start_time = %record.start_time,
                "Unparseable action timestamp"
            );
        }

        Self {
            transition: Transition::of(&record.action),
            name: record.action,
            started_at,
        }
    }
}

/// Classification input for one instance, rebuilt every run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceSnapshot {
    pub id: String,
    pub name: String,
    pub tenant: String,
    pub raw_status: String,
    pub status: VmStatus,
    /// Action log, newest first; entries without a timestamp come last
    pub actions: Vec<InstanceAction>,
    running_since: Since,
    stopped_since: Since,
    shelved_since: Since,
}

impl InstanceSnapshot {
    /// Map a provider server record into a snapshot
    pub fn from_record(tenant: impl Into<String>, record: ServerRecord) -> Self {
        let status = VmStatus::from_vm_state(&record.vm_state);
        let mut actions: Vec<InstanceAction> =
            record.actions.into_iter().map(InstanceAction::from).collect();
        actions.sort_by(|a, b| b.started_at.cmp(&a.started_at));

        let mut snapshot = Self {
            id: record.id,
            name: record.name,
            tenant: tenant.into(),
            raw_status: record.vm_state,
            status,
            actions,
            running_since: Since::NotApplicable,
            stopped_since: Since::NotApplicable,
            shelved_since: Since::NotApplicable,
        };

        snapshot.running_since = snapshot.derive_since(VmStatus::Running);
        snapshot.stopped_since = snapshot.derive_since(VmStatus::Stopped);
        snapshot.shelved_since = snapshot.derive_since(VmStatus::Shelved);
        snapshot
    }

    pub fn running_since(&self) -> Since {
        self.running_since
    }

    pub fn stopped_since(&self) -> Since {
        self.stopped_since
    }

    pub fn shelved_since(&self) -> Since {
        self.shelved_since
    }

    /// The "since" value of whatever bucket the instance is currently in
    pub fn since_for_status(&self) -> Since {
        match self.status {
            VmStatus::Running => self.running_since,
            VmStatus::Stopped => self.stopped_since,
            VmStatus::Shelved => self.shelved_since,
            VmStatus::Unknown => Since::NotApplicable,
        }
    }

    pub fn is_running(&self) -> bool {
        self.status == VmStatus::Running
    }

    pub fn is_stopped(&self) -> bool {
        self.status == VmStatus::Stopped
    }

    pub fn is_shelved(&self) -> bool {
        self.status == VmStatus::Shelved
    }

    fn derive_since(&self, target: VmStatus) -> Since {
        if self.actions.is_empty() || self.status != target {
            return Since::NotApplicable;
        }
        let Some(wanted) = Transition::into_status(target) else {
            return Since::NotApplicable;
        };

        match self.actions.iter().find(|action| action.transition == wanted) {
            Some(InstanceAction {
                started_at: Some(at),
                ..
            }) => Since::At(*at),
            Some(action) => {
                warn!(
                    tenant = %self.tenant,
                    instance_id = %self.id,
                    action = %action.name,
                    "Transition has no usable timestamp, treating instance as indefinitely {}",
                    target
                );
                Since::Indefinite
            }
            None => {
                warn!(
                    tenant = %self.tenant,
                    instance_id = %self.id,
                    status = %target,
                    actions = self.actions.len(),
                    "Action log has no transition into the current status"
                );
                Since::Indefinite
            }
        }
    }
}

impl fmt::Display for InstanceSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(year: i32, month: u32, day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(year, month, day, 0, 0, 0).unwrap()
    }

    fn iso(year: i32, month: u32, day: u32) -> String {
        at(year, month, day).naive_utc().format("%Y-%m-%dT%H:%M:%S").to_string()
    }

    fn snapshot(vm_state: &str, actions: Vec<ActionRecord>) -> InstanceSnapshot {
        InstanceSnapshot::from_record(
            "tenant",
            ServerRecord {
                id: "i-1".to_string(),
                name: "vm-1".to_string(),
                vm_state: vm_state.to_string(),
                actions,
            },
        )
    }

    #[test]
    fn test_vm_status_buckets() {
        assert_eq!(VmStatus::from_vm_state("active"), VmStatus::Running);
        assert_eq!(VmStatus::from_vm_state("building"), VmStatus::Running);
        assert_eq!(VmStatus::from_vm_state("PAUSED"), VmStatus::Running);
        assert_eq!(VmStatus::from_vm_state("resized"), VmStatus::Running);
        assert_eq!(VmStatus::from_vm_state("stopped"), VmStatus::Stopped);
        assert_eq!(VmStatus::from_vm_state("suspended"), VmStatus::Stopped);
        assert_eq!(VmStatus::from_vm_state("shelved_offloaded"), VmStatus::Shelved);
        assert_eq!(VmStatus::from_vm_state("say_what?"), VmStatus::Unknown);
    }

    #[test]
    fn test_transition_table() {
        assert_eq!(Transition::of("create"), Transition::ToRunning);
        assert_eq!(Transition::of("unshelve"), Transition::ToRunning);
        assert_eq!(Transition::of("shelve"), Transition::ToShelved);
        assert_eq!(Transition::of("shelveOffload"), Transition::ToShelved);
        assert_eq!(Transition::of("suspend"), Transition::ToStopped);
        assert_eq!(Transition::of("os-stop"), Transition::ToStopped);
        assert_eq!(Transition::of("createImage"), Transition::NoChange);
        assert_eq!(Transition::of("backup"), Transition::NoChange);
        assert_eq!(Transition::of("random_action"), Transition::NoChange);
    }

    #[test]
    fn test_parse_timestamp_formats() {
        let expected = at(1990, 1, 1);
        assert_eq!(parse_timestamp("1990-01-01T00:00:00"), Some(expected));
        assert_eq!(parse_timestamp("1990-01-01T00:00:00.000000"), Some(expected));
        assert_eq!(parse_timestamp("1990-01-01T00:00:00Z"), Some(expected));
        assert_eq!(parse_timestamp("1990-01-01T02:00:00+02:00"), Some(expected));
        assert_eq!(parse_timestamp("1990-01-01 00:00:00"), Some(expected));
        assert_eq!(parse_timestamp("yesterday"), None);
    }

    #[test]
    fn test_no_actions_log_is_not_applicable() {
        for vm_state in ["active", "stopped", "shelved_offloaded"] {
            let snap = snapshot(vm_state, vec![]);
            assert_eq!(snap.running_since(), Since::NotApplicable);
            assert_eq!(snap.stopped_since(), Since::NotApplicable);
            assert_eq!(snap.shelved_since(), Since::NotApplicable);
        }
    }

    #[test]
    fn test_wrong_status_is_not_applicable() {
        let actions = vec![ActionRecord::new("random_action", iso(1990, 1, 1))];

        let running = snapshot("active", actions.clone());
        assert_eq!(running.stopped_since(), Since::NotApplicable);
        assert_eq!(running.shelved_since(), Since::NotApplicable);

        let stopped = snapshot("stopped", actions.clone());
        assert_eq!(stopped.running_since(), Since::NotApplicable);

        let unknown = snapshot("error", actions);
        assert_eq!(unknown.since_for_status(), Since::NotApplicable);
    }

    #[test]
    fn test_no_corresponding_action_is_indefinite() {
        let running = snapshot("active", vec![ActionRecord::new("shelve", iso(1990, 1, 1))]);
        assert_eq!(running.running_since(), Since::Indefinite);

        let stopped = snapshot("stopped", vec![ActionRecord::new("unpause", iso(1990, 1, 1))]);
        assert_eq!(stopped.stopped_since(), Since::Indefinite);

        let shelved = snapshot(
            "shelved_offloaded",
            vec![ActionRecord::new("unpause", iso(1990, 1, 1))],
        );
        assert_eq!(shelved.shelved_since(), Since::Indefinite);
    }

    #[test]
    fn test_running_since_finds_latest_start() {
        let snap = snapshot(
            "active",
            vec![
                ActionRecord::new("create", iso(1991, 1, 1)),
                ActionRecord::new("os-start", iso(1994, 1, 1)),
                ActionRecord::new("os-stop", iso(1993, 1, 1)),
                ActionRecord::new("createImage", iso(1995, 1, 1)),
            ],
        );
        assert_eq!(snap.running_since(), Since::At(at(1994, 1, 1)));
        assert_eq!(snap.since_for_status(), Since::At(at(1994, 1, 1)));
    }

    #[test]
    fn test_stopped_since_finds_latest_stop() {
        let snap = snapshot(
            "suspended",
            vec![
                ActionRecord::new("create", iso(1991, 1, 1)),
                ActionRecord::new("suspend", iso(1993, 1, 1)),
                ActionRecord::new("resume", iso(1992, 1, 1)),
            ],
        );
        assert_eq!(snap.stopped_since(), Since::At(at(1993, 1, 1)));
    }

    #[test]
    fn test_shelved_since_scans_newest_first() {
        // Provider order is not chronological
        let snap = snapshot(
            "shelved_offloaded",
            vec![
                ActionRecord::new("pause", iso(1993, 1, 1)),
                ActionRecord::new("shelve", iso(1992, 1, 1)),
                ActionRecord::new("pause", iso(1995, 1, 1)),
                ActionRecord::new("shelve", iso(1994, 1, 1)),
                ActionRecord::new("create", iso(1991, 1, 1)),
            ],
        );

        assert_eq!(snap.shelved_since(), Since::At(at(1994, 1, 1)));
        assert_eq!(snap.actions[0].name, "pause");
        assert_eq!(snap.actions[0].started_at, Some(at(1995, 1, 1)));
        assert_eq!(snap.actions[4].name, "create");
    }

    #[test]
    fn test_unparseable_matching_timestamp_is_indefinite() {
        let snap = snapshot("active", vec![ActionRecord::new("create", "not-a-date")]);
        assert_eq!(snap.running_since(), Since::Indefinite);
    }

    #[test]
    fn test_unparseable_entries_sort_last() {
        let snap = snapshot(
            "active",
            vec![
                ActionRecord::new("create", "garbage"),
                ActionRecord::new("os-start", iso(1994, 1, 1)),
            ],
        );
        assert_eq!(snap.actions[1].name, "create");
        assert_eq!(snap.running_since(), Since::At(at(1994, 1, 1)));
    }

    #[test]
    fn test_status_predicates() {
        assert!(snapshot("active", vec![]).is_running());
        assert!(!snapshot("stopped", vec![]).is_running());
        assert!(snapshot("stopped", vec![]).is_stopped());
        assert!(!snapshot("active", vec![]).is_stopped());
        assert!(snapshot("shelved_offloaded", vec![]).is_shelved());
        assert!(!snapshot("active", vec![]).is_shelved());
    }
}
