//! Library for the instance lifecycle agent
//!
//! This crate provides the core functionality for:
//! - Threshold settings and the lifecycle policy document
//! - Inferring instance state from the provider's action log
//! - Classifying instances into shelve/delete verdicts
//! - Acting on verdicts and notifying tenant owners
//! - Scheduled runs, health checks and observability

pub mod actions;
pub mod health;
pub mod lifecycle;
pub mod models;
pub mod notify;
pub mod observability;
pub mod provider;
pub mod runner;
pub mod schedule;
pub mod settings;

pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use lifecycle::{
    classify, classify_fleet, ClassificationResult, ClassifiedInstance, InstanceSnapshot, Since,
    Verdict, VmStatus,
};
pub use models::*;
pub use observability::{LifecycleMetrics, StructuredLogger};
pub use runner::{LifecycleRunner, RunReport};
pub use schedule::{ReportStore, RunLoop, RunRequest, RunTrigger, ScheduleConfig};
pub use settings::{LifecyclePolicy, Threshold, ThresholdSettings};
