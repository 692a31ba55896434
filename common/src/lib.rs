//! Shared pieces for the livecap recorder: configuration, naming and
//! segmentation rules, and the session summary type.

pub mod config;
pub mod filename;
pub mod protocol;
pub mod segment;
