//! Structured error types for pulse
//!
//! Using thiserror for automatic Display implementation and error chaining.

use super::types::{Pid, StackId};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProfilerError {
    #[error("Failed to load eBPF program: {0}")]
    EbpfLoadFailed(String),

    #[error("Process {0} not found")]
    ProcessNotFound(Pid),

    #[error(
        "Sample frequency {0} Hz is outside 1..={max} Hz",
        max = pulse_common::MAX_SAMPLE_FREQUENCY_HZ
    )]
    InvalidFrequency(u64),

    #[error("No thread of process {0} accepted a perf event")]
    NoThreadsAttached(Pid),

    #[error("Failed to attach {probe} to {binary}: {error}")]
    ProbeAttachFailed { probe: String, binary: String, error: String },

    #[error("{0} map not found in eBPF object")]
    MapNotFound(&'static str),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Aya(#[from] aya::EbpfError),

    #[error(transparent)]
    Map(#[from] aya::maps::MapError),

    #[error(transparent)]
    Program(#[from] aya::programs::ProgramError),
}

#[derive(Error, Debug)]
pub enum CollectError {
    #[error("Truncated {kind} record: {len} bytes")]
    TruncatedRecord { kind: &'static str, len: usize },

    #[error("Unknown event type {0}")]
    UnknownEventType(u8),

    #[error("Stack {0} not found in stack trace map")]
    MissingStack(StackId),

    #[error(transparent)]
    Map(#[from] aya::maps::MapError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profiler_error_display() {
        let err = ProfilerError::ProcessNotFound(Pid(1234));
        assert_eq!(err.to_string(), "Process PID:1234 not found");
    }

    #[test]
    fn test_probe_attach_error() {
        let err = ProfilerError::ProbeAttachFailed {
            probe: "probe_exit".to_string(),
            binary: "/usr/bin/my-app".to_string(),
            error: "symbol not found".to_string(),
        };
        assert!(err.to_string().contains("probe_exit"));
        assert!(err.to_string().contains("/usr/bin/my-app"));
    }

    #[test]
    fn test_invalid_frequency_names_limit() {
        let err = ProfilerError::InvalidFrequency(5000);
        assert_eq!(err.to_string(), "Sample frequency 5000 Hz is outside 1..=1000 Hz");
    }

    #[test]
    fn test_collect_error_display() {
        let err = CollectError::TruncatedRecord { kind: "timing", len: 12 };
        assert_eq!(err.to_string(), "Truncated timing record: 12 bytes");
        assert_eq!(
            CollectError::MissingStack(StackId(7)).to_string(),
            "Stack stack#7 not found in stack trace map"
        );
    }
}
