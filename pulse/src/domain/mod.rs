//! Domain model for pulse
//!
//! Core newtypes and error enums shared by the collectors and the CLI.

pub mod errors;
pub mod types;

pub use types::{Duration, Pid, StackId, Tid};

pub use errors::{CollectError, ProfilerError};
