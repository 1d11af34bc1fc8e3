//! Thread enumeration
//!
//! Perf events in per-thread scope only watch the thread they were opened
//! for, so the sampler needs every TID of the target up front.

use anyhow::{Context, Result};
use std::fs;

use crate::domain::{Pid, Tid};

/// A thread of the target process
#[derive(Debug, Clone)]
pub struct ThreadInfo {
    pub tid: Tid,
    pub comm: String,
}

/// List threads by reading /proc/pid/task/*/comm
///
/// Threads that exit while the directory is being read are skipped.
///
/// # Errors
/// Returns an error if /proc/pid/task cannot be read
pub fn list_threads(pid: Pid) -> Result<Vec<ThreadInfo>> {
    let task_dir = format!("/proc/{}/task", pid.0);
    let entries = fs::read_dir(&task_dir).context(format!("Failed to read {task_dir}"))?;

    let mut threads: Vec<ThreadInfo> = entries
        .filter_map(|entry| {
            let entry = entry.ok()?;
            let tid = entry.file_name().to_string_lossy().parse::<u32>().ok()?;
            let comm = fs::read_to_string(format!("/proc/{}/task/{}/comm", pid.0, tid))
                .map(|c| c.trim().to_string())
                .unwrap_or_default();
            Some(ThreadInfo { tid: Tid(tid), comm })
        })
        .collect();

    threads.sort_by_key(|t| t.tid);
    Ok(threads)
}
