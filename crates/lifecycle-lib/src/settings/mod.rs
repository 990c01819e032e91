//! Lifecycle settings
//!
//! - [`ThresholdSettings`]: the six time thresholds that apply to one scope
//! - [`LifecyclePolicy`]: global defaults, tenant and instance overrides and
//!   the notification address book, loaded from a policy document

mod policy;
mod threshold;

pub use policy::{
    EmailRow, InstanceSettingsRow, LifecyclePolicy, NotificationRows, PolicyDocument, PolicyError,
    TenantSettingsRow,
};
pub use threshold::{
    is_above_threshold, Cell, SettingsError, Threshold, ThresholdRow, ThresholdSettings,
};
