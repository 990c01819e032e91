//! Instance lifecycle classification
//!
//! This module provides:
//! - State inference from an instance's action log ([`InstanceSnapshot`])
//! - The verdict engine ([`classify`])
//! - The fleet-wide classification driver ([`classify_fleet`])

mod driver;
mod state;
mod verdict;

pub use driver::{
    classify_fleet, classify_tenant, ClassificationResult, ClassifiedInstance, TenantFailure,
};
pub use state::{parse_timestamp, InstanceAction, InstanceSnapshot, Since, Transition, VmStatus};
pub use verdict::{classify, Verdict};
