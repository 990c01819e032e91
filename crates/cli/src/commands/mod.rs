pub mod classify;
pub mod policy;
pub mod report;
pub mod status;
