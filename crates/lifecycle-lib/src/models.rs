//! Provider-facing data models
//!
//! These mirror what the compute API reports and carry raw strings. Parsing
//! into typed state happens in [`crate::lifecycle::InstanceSnapshot`].

use serde::{Deserialize, Serialize};

/// A server as listed by the compute API
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerRecord {
    pub id: String,
    pub name: String,
    /// Raw vm_state string (e.g. `active`, `shelved_offloaded`)
    pub vm_state: String,
    /// Action log in whatever order the provider returned it
    #[serde(default)]
    pub actions: Vec<ActionRecord>,
}

/// One entry of a server's action log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRecord {
    pub action: String,
    pub start_time: String,
}

impl ActionRecord {
    pub fn new(action: impl Into<String>, start_time: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            start_time: start_time.into(),
        }
    }
}
